//! Streaming pad: fan-out of a service's output to its subscribers.
//!
//! The pad itself lives inside the service's stream-locked state. Every
//! subscriber owns a bounded broadcast channel, so delivery never waits on a
//! slow consumer: a receiver that falls behind skips the oldest messages and
//! the skipped count is added up when it next receives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::es::{Component, StreamType};
use crate::service::StreamingStatus;

/// Default per-subscriber queue length.
pub const DEFAULT_QUEUE_LEN: usize = 1024;

/// Component list sent when a stream starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStart {
    pub service: String,
    pub pcr_pid: u16,
    pub pmt_pid: u16,
    pub components: Vec<Component>,
}

/// One reassembled elementary stream packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsPacket {
    pub pid: u16,
    pub stream_type: StreamType,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    /// Whole PES packet.
    pub data: Bytes,
}

/// Why a stream stopped (or never started).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// The subscriber unsubscribed.
    Unsubscribed,
    /// The service was stopped.
    ServiceStopped,
    /// The service was deleted.
    ServiceDeleted,
    /// The service is being restarted.
    Restart,
    /// No instance could deliver the service.
    NoServiceAvailable,
    /// The selected instance failed to start.
    StartFailed,
    /// A heavier subscription took over the instance.
    Preempted,
    NoInput,
    NoDescrambler,
    NoAccess,
}

/// Messages delivered through the pad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamingMessage {
    Start(Arc<StreamStart>),
    Packet(Arc<EsPacket>),
    /// Descrambled raw TS, only for passthrough subscribers.
    Mpegts(Bytes),
    ServiceStatus(StreamingStatus),
    Stop(StopReason),
    NoStart(StopReason),
}

/// Bounded drop-oldest queue for one subscriber.
///
/// Capacity is rounded up to a power of two by the channel.
#[derive(Debug)]
pub struct SubscriberQueue {
    id: u64,
    name: String,
    passthrough: bool,
    /// Dropped on close; the receiver then drains what is left.
    tx: Mutex<Option<broadcast::Sender<StreamingMessage>>>,
    rx: Mutex<broadcast::Receiver<StreamingMessage>>,
    /// Wakes a receiver blocked in `recv_timeout`. Paired with `rx`.
    ready: Condvar,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

impl SubscriberQueue {
    pub fn new(id: u64, name: impl Into<String>, capacity: usize, passthrough: bool) -> Arc<Self> {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            id,
            name: name.into(),
            passthrough,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            ready: Condvar::new(),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// Enqueue without blocking. A full queue overwrites its oldest
    /// message.
    pub fn push(&self, msg: StreamingMessage) {
        {
            let tx = self.tx.lock();
            let Some(tx) = tx.as_ref() else {
                return;
            };
            if tx.send(msg).is_ok() {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.wake();
    }

    fn wake(&self) {
        // Serialize with a receiver between its empty check and its wait.
        drop(self.rx.lock());
        self.ready.notify_all();
    }

    fn next(&self, rx: &mut broadcast::Receiver<StreamingMessage>) -> Result<StreamingMessage, TryRecvError> {
        loop {
            match rx.try_recv() {
                Err(TryRecvError::Lagged(skipped)) => {
                    let total = self.dropped.fetch_add(skipped, Ordering::Relaxed) + skipped;
                    warn!(
                        "[Pad] subscriber '{}' lagged, skipped {} messages ({} total)",
                        self.name, skipped, total
                    );
                }
                other => return other,
            }
        }
    }

    /// Block up to `timeout` for the next message. Returns `None` on
    /// timeout, or once the queue is closed and drained.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<StreamingMessage> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.rx.lock();
        loop {
            match self.next(&mut rx) {
                Ok(msg) => return Some(msg),
                Err(TryRecvError::Empty) => {
                    if self.ready.wait_until(&mut rx, deadline).timed_out() {
                        return self.next(&mut rx).ok();
                    }
                }
                Err(_) => return None,
            }
        }
    }

    pub fn try_recv(&self) -> Option<StreamingMessage> {
        let mut rx = self.rx.lock();
        self.next(&mut rx).ok()
    }

    /// Close the queue; pending messages can still be drained.
    pub fn close(&self) {
        self.tx.lock().take();
        self.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Messages waiting, counting ones already overwritten but not yet
    /// reported as skipped.
    pub fn len(&self) -> usize {
        self.rx.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.lock().is_empty()
    }

    /// Messages skipped because the subscriber fell behind. Counted as the
    /// subscriber receives.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Messages accepted into the queue, including ones later dropped.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

/// Fan-out point of a service.
#[derive(Debug, Default)]
pub struct StreamingPad {
    targets: Vec<Arc<SubscriberQueue>>,
}

impl StreamingPad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, target: Arc<SubscriberQueue>) {
        if self.targets.iter().any(|t| t.id() == target.id()) {
            return;
        }
        trace!("[Pad] attach '{}' (#{})", target.name(), target.id());
        self.targets.push(target);
    }

    pub fn detach(&mut self, id: u64) -> Option<Arc<SubscriberQueue>> {
        let idx = self.targets.iter().position(|t| t.id() == id)?;
        let target = self.targets.remove(idx);
        trace!("[Pad] detach '{}' (#{})", target.name(), target.id());
        Some(target)
    }

    /// Hand `msg` to every attached subscriber.
    pub fn deliver(&self, msg: StreamingMessage) {
        if let Some((last, rest)) = self.targets.split_last() {
            for target in rest {
                target.push(msg.clone());
            }
            last.push(msg);
        }
    }

    /// Hand raw TS to passthrough subscribers only.
    pub fn deliver_mpegts(&self, data: Bytes) {
        for target in self.targets.iter().filter(|t| t.is_passthrough()) {
            target.push(StreamingMessage::Mpegts(data.clone()));
        }
    }

    pub fn has_passthrough(&self) -> bool {
        self.targets.iter().any(|t| t.is_passthrough())
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Detach everything, sending `Stop` first.
    pub fn stop_all(&mut self, reason: StopReason) {
        for target in self.targets.drain(..) {
            target.push(StreamingMessage::Stop(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(bits: u32) -> StreamingMessage {
        StreamingMessage::ServiceStatus(StreamingStatus::from_bits(bits))
    }

    #[test]
    fn test_deliver_to_all_subscribers() {
        let mut pad = StreamingPad::new();
        let a = SubscriberQueue::new(1, "a", 8, false);
        let b = SubscriberQueue::new(2, "b", 8, true);
        pad.attach(a.clone());
        pad.attach(b.clone());
        pad.attach(a.clone());
        assert_eq!(pad.len(), 2);

        pad.deliver(status(0x8));
        pad.deliver_mpegts(Bytes::from_static(&[0x47; 188]));

        assert_eq!(a.try_recv(), Some(status(0x8)));
        assert_eq!(a.try_recv(), None);
        assert_eq!(b.try_recv(), Some(status(0x8)));
        assert!(matches!(b.try_recv(), Some(StreamingMessage::Mpegts(_))));
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let q = SubscriberQueue::new(1, "slow", 4, false);
        for bits in 1..=6u32 {
            q.push(status(bits));
        }
        assert_eq!(q.delivered(), 6);
        assert_eq!(q.dropped(), 0);
        assert_eq!(q.try_recv(), Some(status(3)));
        assert_eq!(q.dropped(), 2);
        for bits in 4..=6u32 {
            assert_eq!(q.try_recv(), Some(status(bits)));
        }
        assert_eq!(q.try_recv(), None);
    }

    #[test]
    fn test_close_keeps_pending_messages() {
        let q = SubscriberQueue::new(1, "closing", 8, false);
        q.push(status(0x1));
        q.close();
        q.push(status(0x2));
        assert!(q.is_closed());
        assert_eq!(q.delivered(), 1);
        assert_eq!(q.recv_timeout(Duration::from_secs(1)), Some(status(0x1)));
        assert_eq!(q.recv_timeout(Duration::from_secs(1)), None);
    }

    #[test]
    fn test_detach_stops_delivery() {
        let mut pad = StreamingPad::new();
        let a = SubscriberQueue::new(7, "a", 8, false);
        pad.attach(a.clone());
        assert!(pad.detach(7).is_some());
        pad.deliver(status(0x1));
        assert!(a.is_empty());
        assert!(pad.detach(7).is_none());
    }

    #[test]
    fn test_recv_timeout_wakes_on_push() {
        let q = SubscriberQueue::new(1, "waiter", 8, false);
        let producer = {
            let q = q.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                q.push(StreamingMessage::Stop(StopReason::ServiceStopped));
            })
        };
        let msg = q.recv_timeout(Duration::from_secs(5));
        assert_eq!(msg, Some(StreamingMessage::Stop(StopReason::ServiceStopped)));
        producer.join().unwrap();

        assert_eq!(q.recv_timeout(Duration::from_millis(10)), None);
    }
}
