use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use futures_util::Stream;
use tokio::sync::Notify;

/// Multipart boundary used by the streaming endpoint.
pub const BOUNDARY: &str = "FRAME";

/// One encoded (JPEG) video frame as handed over by the camera.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub captured_at_ms: i64,
    /// Relay version at which this frame was published. Starts at 1.
    pub seq: u64,
}

impl EncodedFrame {
    /// Encode as one part of a `multipart/x-mixed-replace` body:
    ///   --FRAME\r\n
    ///   Content-Type: image/jpeg\r\n\r\n
    ///   <jpeg bytes>\r\n
    pub fn multipart_part(&self) -> Bytes {
        let header = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
        let mut buf = BytesMut::with_capacity(header.len() + self.data.len() + 2);
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.data);
        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// Milliseconds elapsed since the frame was captured.
    pub fn age_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.captured_at_ms
    }
}

#[derive(Default)]
struct Slot {
    frame: Option<EncodedFrame>,
    version: u64,
}

/// Single-slot, overwrite-on-publish mailbox between the camera and the
/// HTTP streams.
///
/// The producer overwrites the slot and wakes every waiter; each consumer
/// remembers the version it last saw and waits for a newer one. Unread
/// frames are dropped, so a slow consumer skips ahead instead of queueing.
/// The relay keeps no per-consumer state.
#[derive(Default)]
pub struct FrameRelay {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl FrameRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `data` as the newest frame and wake all waiting consumers.
    /// Returns the version assigned to the frame.
    pub fn publish(&self, data: impl Into<Bytes>) -> u64 {
        let version = {
            let mut slot = self.lock();
            slot.version += 1;
            slot.frame = Some(EncodedFrame {
                data: data.into(),
                captured_at_ms: Utc::now().timestamp_millis(),
                seq: slot.version,
            });
            slot.version
        };
        self.notify.notify_waiters();
        version
    }

    /// Newest frame, if any, without waiting.
    pub fn latest(&self) -> Option<EncodedFrame> {
        self.lock().frame.clone()
    }

    /// Number of frames published so far.
    #[cfg(test)]
    fn version(&self) -> u64 {
        self.lock().version
    }

    fn newer_than(&self, last_seen: u64) -> Option<EncodedFrame> {
        let slot = self.lock();
        if slot.version > last_seen {
            slot.frame.clone()
        } else {
            None
        }
    }

    /// Wait until a frame newer than `last_seen` has been published and
    /// return it. Pass `0` when nothing has been seen yet.
    pub async fn next_frame(&self, last_seen: u64) -> EncodedFrame {
        loop {
            // Register interest before checking the slot so a publish that
            // lands in between still wakes us.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();

            if let Some(frame) = self.newer_than(last_seen) {
                return frame;
            }
            notified.await;
        }
    }

    /// Create a consumer cursor that starts with nothing seen.
    pub fn subscribe(self: &Arc<Self>) -> FrameSubscriber {
        FrameSubscriber {
            relay: Arc::clone(self),
            last_seen: 0,
        }
    }
}

/// A consumer's position in the relay. Owned by the consumer; dropping it
/// is all the cleanup a disconnecting client needs.
pub struct FrameSubscriber {
    relay: Arc<FrameRelay>,
    last_seen: u64,
}

impl FrameSubscriber {
    pub async fn next_frame(&mut self) -> EncodedFrame {
        let frame = self.relay.next_frame(self.last_seen).await;
        self.last_seen = frame.seq;
        frame
    }

    #[cfg(test)]
    fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Endless stream of successively newer frames.
    pub fn into_stream(self) -> impl Stream<Item = EncodedFrame> + Send + 'static {
        futures_util::stream::unfold(self, |mut sub| async move {
            let frame = sub.next_frame().await;
            Some((frame, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);
    const SHORT: Duration = Duration::from_millis(100);

    #[test]
    fn multipart_part_layout() {
        let frame = EncodedFrame {
            data: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
            captured_at_ms: 0,
            seq: 1,
        };
        let part = frame.multipart_part();
        let mut expected = b"--FRAME\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(&part[..], &expected[..]);
    }

    #[test]
    fn age_counts_from_capture_time() {
        let relay = FrameRelay::new();
        relay.publish(vec![1u8]);
        let mut frame = relay.latest().unwrap();
        assert!((0..1000).contains(&frame.age_ms()));

        frame.captured_at_ms -= 5_000;
        assert!(frame.age_ms() >= 5_000);
    }

    #[test]
    fn publish_without_consumers_returns() {
        let relay = FrameRelay::new();
        assert_eq!(relay.publish(vec![1u8]), 1);
        assert_eq!(relay.publish(vec![2u8]), 2);
        assert_eq!(relay.version(), 2);
        assert_eq!(&relay.latest().unwrap().data[..], &[2u8]);
    }

    #[tokio::test]
    async fn fresh_subscriber_gets_current_frame() {
        let relay = Arc::new(FrameRelay::new());
        relay.publish(Bytes::from_static(b"F"));
        let mut sub = relay.subscribe();
        let frame = timeout(WAIT, sub.next_frame()).await.unwrap();
        assert_eq!(&frame.data[..], b"F");
        assert_eq!(sub.last_seen(), 1);
    }

    #[tokio::test]
    async fn freshness_after_older_frame() {
        let relay = Arc::new(FrameRelay::new());
        let mut sub = relay.subscribe();
        relay.publish(Bytes::from_static(b"old"));
        assert_eq!(&sub.next_frame().await.data[..], b"old");

        relay.publish(Bytes::from_static(b"F"));
        let frame = timeout(WAIT, sub.next_frame()).await.unwrap();
        assert_eq!(&frame.data[..], b"F");
    }

    #[tokio::test]
    async fn no_duplicate_delivery() {
        let relay = Arc::new(FrameRelay::new());
        let mut sub = relay.subscribe();
        relay.publish(Bytes::from_static(b"F"));
        sub.next_frame().await;

        assert!(timeout(SHORT, sub.next_frame()).await.is_err());
    }

    #[tokio::test]
    async fn drop_under_load_delivers_newest() {
        let relay = Arc::new(FrameRelay::new());
        let mut sub = relay.subscribe();
        relay.publish(Bytes::from_static(b"F1"));
        relay.publish(Bytes::from_static(b"F2"));

        let frame = timeout(WAIT, sub.next_frame()).await.unwrap();
        assert_eq!(&frame.data[..], b"F2");
        assert!(timeout(SHORT, sub.next_frame()).await.is_err());
    }

    #[tokio::test]
    async fn fan_out_to_waiting_consumers() {
        let relay = Arc::new(FrameRelay::new());
        let mut a = relay.subscribe();
        let mut b = relay.subscribe();
        let ta = tokio::spawn(async move { a.next_frame().await });
        let tb = tokio::spawn(async move { b.next_frame().await });

        // Let both consumers park before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        relay.publish(Bytes::from_static(b"F"));

        let fa = timeout(WAIT, ta).await.unwrap().unwrap();
        let fb = timeout(WAIT, tb).await.unwrap().unwrap();
        assert_eq!(&fa.data[..], b"F");
        assert_eq!(fa.seq, fb.seq);
        assert_eq!(fa.data, fb.data);
    }

    #[tokio::test]
    async fn publish_is_bounded_with_many_waiters() {
        let relay = Arc::new(FrameRelay::new());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let mut sub = relay.subscribe();
            handles.push(tokio::spawn(async move { sub.next_frame().await }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        relay.publish(Bytes::from_static(b"F"));
        assert!(started.elapsed() < Duration::from_millis(100));

        for handle in handles {
            let frame = timeout(WAIT, handle).await.unwrap().unwrap();
            assert_eq!(frame.seq, 1);
        }
    }

    #[tokio::test]
    async fn sequence_is_observed_in_order_and_ends_at_last() {
        let relay = Arc::new(FrameRelay::new());
        let sub = relay.subscribe();
        let consumer = tokio::spawn(async move {
            let mut stream = Box::pin(sub.into_stream());
            let mut seen = Vec::new();
            while let Some(frame) = stream.next().await {
                seen.push(frame.data.clone());
                if &frame.data[..] == b"C" {
                    break;
                }
            }
            seen
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        for name in [&b"A"[..], b"B", b"C"] {
            relay.publish(Bytes::copy_from_slice(name));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let seen = timeout(WAIT, consumer).await.unwrap().unwrap();
        assert_eq!(seen.last().map(|b| &b[..]), Some(&b"C"[..]));
        let order: Vec<&[u8]> = vec![b"A", b"B", b"C"];
        let positions: Vec<usize> = seen
            .iter()
            .map(|f| order.iter().position(|o| *o == &f[..]).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn dropped_subscriber_leaves_relay_usable() {
        let relay = Arc::new(FrameRelay::new());
        let waiting = {
            let mut sub = relay.subscribe();
            tokio::spawn(async move { sub.next_frame().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiting.abort();

        relay.publish(Bytes::from_static(b"F"));
        let mut fresh = relay.subscribe();
        let frame = timeout(WAIT, fresh.next_frame()).await.unwrap();
        assert_eq!(&frame.data[..], b"F");
    }
}
