use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use pi_rover_common::frame::FrameRelay;
use pi_rover_common::motor::{MotorDriver, Speed};
use tokio::sync::watch;

/// Everything request handlers need, built once at startup.
pub struct AppContext {
    pub relay: Arc<FrameRelay>,
    /// `None` when the chassis is not fitted.
    pub motors: Option<Arc<dyn MotorDriver>>,
    pub qr_enabled: bool,
    pub camera_model: String,
    /// Speed used by drive commands that do not carry their own.
    default_speed: AtomicU8,
    /// Flips to `true` when the server is shutting down.
    shutdown: watch::Receiver<bool>,
}

impl AppContext {
    pub fn new(
        relay: Arc<FrameRelay>,
        motors: Option<Arc<dyn MotorDriver>>,
        qr_enabled: bool,
        camera_model: String,
        default_speed: Speed,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            relay,
            motors,
            qr_enabled,
            camera_model,
            default_speed: AtomicU8::new(default_speed.percent()),
            shutdown,
        }
    }

    pub fn default_speed(&self) -> Speed {
        Speed::from(self.default_speed.load(Ordering::Relaxed))
    }

    pub fn set_default_speed(&self, speed: Speed) {
        self.default_speed.store(speed.percent(), Ordering::Relaxed);
    }

    /// Resolves once shutdown has been signalled.
    pub fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.clone();
        async move {
            let _ = rx.wait_for(|stopping| *stopping).await;
        }
    }
}
