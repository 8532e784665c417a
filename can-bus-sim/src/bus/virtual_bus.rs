//! In-process loopback bus
//!
//! Every frame sent on a [`VirtualBus`] is received back by the same bus,
//! which lets the scheduler and the decode loop run against each other
//! without hardware. Injector handles feed additional frames from outside.
//!
//! The receive queue is bounded. When nobody drains it (for example while
//! only the scheduler runs) a looped-back frame that finds the queue full
//! is dropped and counted, as a controller drops frames on receive overrun.

use crate::bus::BusSession;
use crate::types::{CanFrame, Result, SimError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

/// Frames held for `receive` before loopback frames are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Loopback bus backed by a bounded tokio channel
pub struct VirtualBus {
    tx: mpsc::Sender<CanFrame>,
    rx: Mutex<mpsc::Receiver<CanFrame>>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    /// Per-send latency in microseconds
    send_delay_us: AtomicU64,
    fail_sends: AtomicBool,
}

/// Handle that pushes frames into a [`VirtualBus`] receive queue
#[derive(Clone)]
pub struct VirtualBusInjector {
    tx: mpsc::Sender<CanFrame>,
}

impl VirtualBusInjector {
    /// Queue a frame for `receive`; fails if the receive queue is full
    pub fn inject(&self, frame: CanFrame) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SimError::transport("virtual bus receive queue full"),
            TrySendError::Closed(_) => SimError::transport("virtual bus closed"),
        })
    }
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus whose receive queue holds at most `capacity` frames
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            send_delay_us: AtomicU64::new(0),
            fail_sends: AtomicBool::new(false),
        }
    }

    pub fn injector(&self) -> VirtualBusInjector {
        VirtualBusInjector {
            tx: self.tx.clone(),
        }
    }

    /// Number of frames accepted by `send`
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Looped-back frames discarded because the receive queue was full
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Frames waiting for `receive`
    pub fn queued_frames(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Make every send take `delay` before completing (simulated bus load)
    pub fn set_send_delay(&self, delay: Duration) {
        self.send_delay_us
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    /// Make sends fail with a transport error until reset
    pub fn set_send_failure(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusSession for VirtualBus {
    async fn send(&self, frame: &CanFrame) -> Result<()> {
        let delay = self.send_delay_us.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_micros(delay)).await;
        }
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(SimError::transport("virtual bus send disabled"));
        }

        // The frame is on the bus even when the loopback copy is dropped
        match self.tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("Virtual bus receive queue full, dropping 0x{:X}", frame.can_id);
            }
            Err(TrySendError::Closed(_)) => {
                return Err(SimError::transport("virtual bus closed"));
            }
        }
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn receive(&self) -> Result<CanFrame> {
        // mpsc::recv is cancel-safe, and so is waiting for the lock
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| SimError::transport("virtual bus closed"))
    }

    fn name(&self) -> &str {
        crate::bus::VIRTUAL_INTERFACE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback() {
        let bus = VirtualBus::new();
        bus.send(&CanFrame::new(0x123, vec![1, 2, 3])).await.unwrap();

        let frame = bus.receive().await.unwrap();
        assert_eq!(frame.can_id, 0x123);
        assert_eq!(frame.data, vec![1, 2, 3]);
        assert_eq!(bus.frames_sent(), 1);
    }

    #[tokio::test]
    async fn test_injected_frames_are_received_in_order() {
        let bus = VirtualBus::new();
        let injector = bus.injector();
        injector.inject(CanFrame::new(0x1, vec![])).unwrap();
        injector.inject(CanFrame::new(0x2, vec![])).unwrap();

        assert_eq!(bus.receive().await.unwrap().can_id, 0x1);
        assert_eq!(bus.receive().await.unwrap().can_id, 0x2);
        assert_eq!(bus.frames_sent(), 0);
    }

    #[tokio::test]
    async fn test_send_failure() {
        let bus = VirtualBus::new();
        bus.set_send_failure(true);
        let result = bus.send(&CanFrame::new(0x1, vec![])).await;
        assert!(matches!(result, Err(SimError::Transport(_))));

        bus.set_send_failure(false);
        assert!(bus.send(&CanFrame::new(0x1, vec![])).await.is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_drops_loopback_frames() {
        let bus = VirtualBus::with_capacity(2);
        for id in 1..=3 {
            bus.send(&CanFrame::new(id, vec![])).await.unwrap();
        }
        assert_eq!(bus.frames_sent(), 3);
        assert_eq!(bus.frames_dropped(), 1);
        assert_eq!(bus.queued_frames(), 2);
        assert!(matches!(
            bus.injector().inject(CanFrame::new(0x4, vec![])),
            Err(SimError::Transport(_))
        ));

        assert_eq!(bus.receive().await.unwrap().can_id, 1);
        assert_eq!(bus.receive().await.unwrap().can_id, 2);
        assert_eq!(bus.queued_frames(), 0);

        // Draining makes room again
        bus.send(&CanFrame::new(0x5, vec![])).await.unwrap();
        assert_eq!(bus.receive().await.unwrap().can_id, 0x5);
        assert_eq!(bus.frames_dropped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_is_cancellable() {
        let bus = VirtualBus::new();
        let result =
            tokio::time::timeout(Duration::from_millis(50), bus.receive()).await;
        assert!(result.is_err());

        // A frame sent after the cancelled wait is still delivered
        bus.send(&CanFrame::new(0x7, vec![])).await.unwrap();
        assert_eq!(bus.receive().await.unwrap().can_id, 0x7);
    }
}
