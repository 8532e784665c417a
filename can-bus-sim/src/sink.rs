//! Event sinks
//!
//! The decode loop and the scheduler hand every [`BusEvent`] to an
//! [`EventSink`]. Sinks decide how (and whether) to present them.

use crate::types::{hex_string, BusEvent};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Consumer of decode and transmit records
pub trait EventSink: Send {
    fn emit(&mut self, event: &BusEvent);
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn emit(&mut self, event: &BusEvent) {
        (**self).emit(event)
    }
}

/// Writes one line per event through the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&mut self, event: &BusEvent) {
        match event {
            BusEvent::Decoded {
                frame_id,
                message_name,
                signals,
                ..
            } => {
                let values: Vec<String> = signals
                    .iter()
                    .map(|s| format!("{}={}", s.name, s.value))
                    .collect();
                log::info!("RX 0x{:X} {} {}", frame_id, message_name, values.join(" "));
            }
            BusEvent::Transmitted {
                frame_id,
                message_name,
                values,
                data,
                ..
            } => {
                log::info!(
                    "TX 0x{:X} {} {:?} [{}]",
                    frame_id,
                    message_name,
                    values,
                    hex_string(data)
                );
            }
            BusEvent::UnknownFrame { frame_id, data, .. } => {
                log::debug!("RX 0x{:X} (unknown) [{}]", frame_id, hex_string(data));
            }
            BusEvent::FrameDropped {
                frame_id, reason, ..
            } => {
                log::warn!("Dropped frame 0x{:X}: {}", frame_id, reason);
            }
            BusEvent::TransportFailure { reason, .. } => {
                log::error!("Transport failure: {}", reason);
            }
        }
    }
}

/// Serialises each event as one JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&mut self, event: &BusEvent) {
        let result = serde_json::to_writer(&mut self.writer, event)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush());

        if let Err(e) = result {
            log::error!("Failed to write event: {}", e);
        }
    }
}

/// Keeps every event in a shared buffer
///
/// Clones share the same buffer, so a test can keep one handle while the
/// loop owns another.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<BusEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything collected so far
    pub fn events(&self) -> Vec<BusEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.events.lock() {
            Ok(events) => events.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for CollectingSink {
    fn emit(&mut self, event: &BusEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}
