//! Decode loop
//!
//! Receives frames from a bus session, decodes them against the catalog and
//! hands the results to an event sink until shutdown is requested. No single
//! frame or transport failure ends the loop.

use crate::bus::BusSession;
use crate::config::SimulatorConfig;
use crate::shutdown::{self, ShutdownReceiver};
use crate::signals::Catalog;
use crate::sink::EventSink;
use crate::types::{BusEvent, CanFrame, DecodedMessage, SimError};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Pause after a failed receive before trying again
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Counters reported when the loop stops
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    pub frames_received: u64,
    pub messages_decoded: u64,
    pub unknown_frames: u64,
    pub dropped_frames: u64,
    pub filtered_frames: u64,
    pub transport_errors: u64,
}

pub struct DecodeLoop<B: BusSession + ?Sized, S: EventSink> {
    catalog: Arc<Catalog>,
    bus: Arc<B>,
    sink: S,
    config: SimulatorConfig,
    stats: DecodeStats,
}

impl<B: BusSession + ?Sized, S: EventSink> DecodeLoop<B, S> {
    pub fn new(catalog: Arc<Catalog>, bus: Arc<B>, sink: S, config: SimulatorConfig) -> Self {
        Self {
            catalog,
            bus,
            sink,
            config,
            stats: DecodeStats::default(),
        }
    }

    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Decode one received frame and emit the matching event
    ///
    /// Returns the decoded message on success. Unknown ids and malformed
    /// frames are reported to the sink and yield `None`.
    pub fn process_frame(&mut self, frame: &CanFrame) -> Option<DecodedMessage> {
        self.stats.frames_received += 1;

        if !self.config.should_process_message(frame.can_id) {
            self.stats.filtered_frames += 1;
            return None;
        }

        match self.catalog.decode(frame.can_id, frame.is_extended, &frame.data) {
            Ok(decoded) => {
                self.stats.messages_decoded += 1;
                log::debug!(
                    "Decoded {} (ID: 0x{:X}, {} signals)",
                    decoded.message_name,
                    frame.can_id,
                    decoded.signals.len()
                );
                self.sink.emit(&BusEvent::Decoded {
                    timestamp: frame.timestamp,
                    frame_id: frame.can_id,
                    message_name: decoded.message_name.clone(),
                    signals: decoded.signals.clone(),
                    data: frame.data.clone(),
                    range_violations: decoded.range_violations.clone(),
                });
                Some(decoded)
            }
            Err(SimError::UnknownFrame(can_id)) => {
                self.stats.unknown_frames += 1;
                log::trace!("No message definition for CAN ID 0x{:X}", can_id);
                self.sink.emit(&BusEvent::UnknownFrame {
                    timestamp: frame.timestamp,
                    frame_id: can_id,
                    data: frame.data.clone(),
                });
                None
            }
            Err(e) => {
                self.stats.dropped_frames += 1;
                log::warn!("Dropping frame 0x{:X}: {}", frame.can_id, e);
                self.sink.emit(&BusEvent::FrameDropped {
                    timestamp: frame.timestamp,
                    frame_id: frame.can_id,
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    /// Run until shutdown is requested
    ///
    /// Shutdown interrupts a pending receive. A frame already received is
    /// decoded and emitted before the loop exits.
    pub async fn run(&mut self, mut shutdown: ShutdownReceiver) -> DecodeStats {
        log::info!("Decode loop started on {}", self.bus.name());

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown::requested(&mut shutdown) => break,
                received = self.bus.receive() => received,
            };

            match received {
                Ok(frame) => {
                    self.process_frame(&frame);
                }
                Err(e) => {
                    self.stats.transport_errors += 1;
                    log::error!("Receive failed on {}: {}", self.bus.name(), e);
                    self.sink.emit(&BusEvent::TransportFailure {
                        timestamp: Utc::now(),
                        frame_id: None,
                        reason: e.to_string(),
                    });

                    let retry_at = Instant::now() + RECEIVE_RETRY_DELAY;
                    if !shutdown::sleep_until(&mut shutdown, retry_at).await {
                        break;
                    }
                }
            }
        }

        log::info!(
            "Decode loop stopped: {} frames received, {} decoded, {} unknown",
            self.stats.frames_received,
            self.stats.messages_decoded,
            self.stats.unknown_frames
        );
        self.stats.clone()
    }
}
