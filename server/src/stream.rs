use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use pi_rover_common::frame::BOUNDARY;
use tracing::{debug, trace};

use crate::context::AppContext;

static CLIENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Logs when a streaming client goes away and its body is dropped.
struct ClientGuard {
    id: u64,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        debug!(client = self.id, "video client disconnected");
    }
}

/// GET /video_feed: endless multipart MJPEG stream of the newest frames.
pub async fn video_feed(State(ctx): State<Arc<AppContext>>) -> Response {
    let subscriber = ctx.relay.subscribe();
    let guard = ClientGuard {
        id: CLIENT_COUNTER.fetch_add(1, Ordering::Relaxed),
    };
    debug!(client = guard.id, "video client connected");

    let parts = subscriber
        .into_stream()
        .map(move |frame| {
            trace!(client = guard.id, seq = frame.seq, age_ms = frame.age_ms(), "sending frame");
            Ok::<_, Infallible>(frame.multipart_part())
        })
        .take_until(ctx.shutdown_signal());

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
            ),
            (header::CACHE_CONTROL, "no-cache, private".to_string()),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}
