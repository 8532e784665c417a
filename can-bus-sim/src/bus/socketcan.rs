//! SocketCAN bus session (Linux)
//!
//! Opens a raw CAN socket in non-blocking mode and polls it for frames, so a
//! pending receive can be dropped at any poll boundary. Socket access is
//! serialised through a mutex, which makes the session safe for a scheduler
//! and a decode loop sharing it.

use crate::bus::BusSession;
use crate::types::{CanFrame, Result, SimError, MAX_EXTENDED_ID, MAX_STANDARD_ID};
use async_trait::async_trait;
use chrono::Utc;
use socketcan::{
    CanFrame as SocketFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket, StandardId,
};
use std::io::ErrorKind;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Largest payload of a classic CAN frame
const CLASSIC_PAYLOAD: usize = 8;

pub struct SocketCanSession {
    interface: String,
    socket: Mutex<CanSocket>,
    rx_poll_interval: Duration,
}

impl SocketCanSession {
    /// Open `interface` (e.g. `can0`, `vcan0`)
    pub fn open(interface: &str, rx_poll_interval: Duration) -> Result<Self> {
        log::info!("Opening CAN socket on interface: {}", interface);

        let socket = CanSocket::open(interface).map_err(|e| {
            SimError::Transport(format!("Failed to open CAN socket on {}: {}", interface, e))
        })?;
        socket.set_nonblocking(true).map_err(|e| {
            SimError::Transport(format!("Failed to set non-blocking mode: {}", e))
        })?;

        log::info!(
            "CAN socket opened on {} (rx_poll_interval={}ms)",
            interface,
            rx_poll_interval.as_millis()
        );

        Ok(Self {
            interface: interface.to_string(),
            socket: Mutex::new(socket),
            rx_poll_interval,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, CanSocket>> {
        self.socket
            .lock()
            .map_err(|_| SimError::transport("CAN socket lock poisoned"))
    }
}

/// Build a classic data frame for the socket
fn to_socket_frame(frame: &CanFrame) -> Result<SocketFrame> {
    if frame.data.len() > CLASSIC_PAYLOAD {
        return Err(SimError::Transport(format!(
            "Frame 0x{:X} has {} bytes, classic CAN carries at most {}",
            frame.can_id,
            frame.data.len(),
            CLASSIC_PAYLOAD
        )));
    }

    let id = if frame.is_extended {
        ExtendedId::new(frame.can_id).map(Id::Extended)
    } else {
        u16::try_from(frame.can_id)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    }
    .ok_or_else(|| {
        SimError::Transport(format!(
            "CAN ID 0x{:X} does not fit a {} identifier (max 0x{:X})",
            frame.can_id,
            if frame.is_extended { "29-bit" } else { "11-bit" },
            if frame.is_extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID }
        ))
    })?;

    <SocketFrame as EmbeddedFrame>::new(id, &frame.data)
        .ok_or_else(|| SimError::Transport(format!("Cannot build frame 0x{:X}", frame.can_id)))
}

#[async_trait]
impl BusSession for SocketCanSession {
    async fn send(&self, frame: &CanFrame) -> Result<()> {
        let out = to_socket_frame(frame)?;

        loop {
            let result = {
                let socket = self.lock()?;
                socket.write_frame(&out)
            };
            match result {
                Ok(()) => return Ok(()),
                // TX queue full, retry after the poll interval
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    tokio::time::sleep(self.rx_poll_interval).await;
                }
                Err(e) => {
                    return Err(SimError::Transport(format!(
                        "CAN write error on {}: {}",
                        self.interface, e
                    )))
                }
            }
        }
    }

    async fn receive(&self) -> Result<CanFrame> {
        let mut interval = tokio::time::interval(self.rx_poll_interval);

        loop {
            interval.tick().await;

            let result = {
                let socket = self.lock()?;
                socket.read_frame()
            };
            match result {
                Ok(frame) => {
                    // Remote and error frames carry no signal data
                    if !matches!(frame, SocketFrame::Data(_)) {
                        log::trace!("Ignoring non-data frame 0x{:X}", Frame::raw_id(&frame));
                        continue;
                    }
                    return Ok(CanFrame {
                        can_id: Frame::raw_id(&frame),
                        data: EmbeddedFrame::data(&frame).to_vec(),
                        is_extended: EmbeddedFrame::is_extended(&frame),
                        timestamp: Utc::now(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => {
                    return Err(SimError::Transport(format!(
                        "CAN read error on {}: {}",
                        self.interface, e
                    )))
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.interface
    }
}
