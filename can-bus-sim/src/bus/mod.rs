//! Bus session boundary
//!
//! The decode loop and the cyclic scheduler only talk to the bus through the
//! [`BusSession`] trait. Two sessions are provided: an in-process loopback
//! bus and, behind the `socketcan` feature, a Linux SocketCAN interface.

use crate::types::{CanFrame, Result};
use async_trait::async_trait;

pub mod virtual_bus;

#[cfg(feature = "socketcan")]
pub mod socketcan;

pub use virtual_bus::{VirtualBus, VirtualBusInjector};

#[cfg(feature = "socketcan")]
pub use self::socketcan::SocketCanSession;

/// Interface name that selects the in-process loopback bus
pub const VIRTUAL_INTERFACE: &str = "virtual";

/// Frame transport shared by the decode loop and the scheduler
///
/// Implementations must allow concurrent callers: `send` may be called from
/// the scheduler while the decode loop waits in `receive`.
#[async_trait]
pub trait BusSession: Send + Sync {
    /// Transmit one frame
    ///
    /// Fails with [`SimError::Transport`](crate::SimError::Transport).
    async fn send(&self, frame: &CanFrame) -> Result<()>;

    /// Wait for the next frame
    ///
    /// Must be cancel-safe: dropping the returned future before it completes
    /// must not lose a frame.
    async fn receive(&self) -> Result<CanFrame>;

    /// Human-readable session name for logs
    fn name(&self) -> &str;
}
