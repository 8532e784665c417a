//! Core types for the CAN bus simulator library
//!
//! This module defines the raw frame type exchanged with a bus session, the
//! error type shared by every component, and the records the decode loop and
//! the cyclic scheduler hand to an event sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Timestamp type used throughout the simulator
pub type Timestamp = DateTime<Utc>;

/// Result type for simulator operations
pub type Result<T> = std::result::Result<T, SimError>;

/// Physical values keyed by signal name
///
/// A `BTreeMap` keeps log lines and JSON output in a stable order.
pub type SignalValues = BTreeMap<String, f64>;

/// Largest 11-bit identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest 29-bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Raw CAN frame as sent to or received from a bus session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanFrame {
    /// CAN arbitration ID (11-bit or 29-bit)
    pub can_id: u32,
    /// Frame data bytes (0-8 bytes for classic CAN, up to 64 for CAN-FD)
    pub data: Vec<u8>,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    /// Capture time for received frames, creation time for outgoing ones
    pub timestamp: Timestamp,
}

impl CanFrame {
    /// Create a frame stamped with the current time
    ///
    /// Identifiers above the 11-bit range are flagged as extended.
    pub fn new(can_id: u32, data: Vec<u8>) -> Self {
        Self {
            can_id,
            data,
            is_extended: can_id > MAX_STANDARD_ID,
            timestamp: Utc::now(),
        }
    }

    /// Builder method: force the extended-id flag
    pub fn with_extended(mut self, is_extended: bool) -> Self {
        self.is_extended = is_extended;
        self
    }

    /// Builder method: override the capture timestamp
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// Data bytes as upper-case hex without separators (e.g. `E803`)
    pub fn data_hex(&self) -> String {
        hex_string(&self.data)
    }
}

/// Format bytes as contiguous upper-case hex
pub fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Errors raised by the codec, the catalog and the bus sessions
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Unknown frame: CAN ID 0x{0:X}")]
    UnknownFrame(u32),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Truncated frame for message '{message}': {actual} bytes received, {required} required")]
    TruncatedFrame {
        message: String,
        actual: usize,
        required: usize,
    },

    #[error("Missing value for signal '{signal}' of message '{message}'")]
    MissingSignal { message: String, signal: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid signal definition: {0}")]
    InvalidSignalDefinition(String),

    #[error("Invalid message definition: {0}")]
    InvalidMessageDefinition(String),

    #[error("Failed to parse DBC file: {0}")]
    DbcParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SimError {
    /// Build a transport error from any displayable cause
    pub fn transport(cause: impl fmt::Display) -> Self {
        SimError::Transport(cause.to_string())
    }
}

/// A physical value that falls outside its signal's declared bounds
///
/// Informational only: decoded values are reported, never corrected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeViolation {
    pub signal: String,
    pub value: f64,
    pub minimum: f64,
    pub maximum: f64,
}

impl fmt::Display for RangeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} = {} outside [{}, {}]",
            self.signal, self.value, self.minimum, self.maximum
        )
    }
}

/// A decoded signal with its current value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedSignal {
    /// Signal name from the catalog
    pub name: String,
    /// Physical value after scaling and offset
    pub value: f64,
    /// Engineering unit (e.g., "km/h", "°C", "V")
    pub unit: Option<String>,
    /// Label from the signal's choices, if the raw value has one
    pub value_description: Option<String>,
    /// Extracted bit pattern before interpretation (useful for debugging)
    pub raw_value: u64,
}

/// All signals of one frame, decoded against its message definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedMessage {
    pub frame_id: u32,
    pub message_name: String,
    pub signals: Vec<DecodedSignal>,
    /// Values outside their declared bounds (not clamped)
    pub range_violations: Vec<RangeViolation>,
}

impl DecodedMessage {
    /// Physical value of one signal
    pub fn get(&self, signal_name: &str) -> Option<f64> {
        self.signals
            .iter()
            .find(|s| s.name == signal_name)
            .map(|s| s.value)
    }

    /// Mapping of signal name to physical value
    pub fn values(&self) -> SignalValues {
        self.signals
            .iter()
            .map(|s| (s.name.clone(), s.value))
            .collect()
    }
}

/// Records handed to an [`EventSink`](crate::sink::EventSink)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    /// A received frame decoded against the catalog
    Decoded {
        timestamp: Timestamp,
        frame_id: u32,
        message_name: String,
        signals: Vec<DecodedSignal>,
        data: Vec<u8>,
        range_violations: Vec<RangeViolation>,
    },

    /// A frame produced by the cyclic scheduler and accepted by the bus
    Transmitted {
        timestamp: Timestamp,
        frame_id: u32,
        message_name: String,
        values: SignalValues,
        data: Vec<u8>,
        /// 1-based fire counter of this message
        cycle: u64,
        /// Scheduled deadline of this fire, relative to scheduler start
        scheduled_at: Duration,
        range_violations: Vec<RangeViolation>,
    },

    /// A received frame whose id has no catalog entry
    UnknownFrame {
        timestamp: Timestamp,
        frame_id: u32,
        data: Vec<u8>,
    },

    /// A received frame that matched a message but could not be decoded
    FrameDropped {
        timestamp: Timestamp,
        frame_id: u32,
        reason: String,
    },

    /// A send or receive failure reported by the bus session
    TransportFailure {
        timestamp: Timestamp,
        frame_id: Option<u32>,
        reason: String,
    },
}

impl BusEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> Timestamp {
        match self {
            BusEvent::Decoded { timestamp, .. } => *timestamp,
            BusEvent::Transmitted { timestamp, .. } => *timestamp,
            BusEvent::UnknownFrame { timestamp, .. } => *timestamp,
            BusEvent::FrameDropped { timestamp, .. } => *timestamp,
            BusEvent::TransportFailure { timestamp, .. } => *timestamp,
        }
    }

    /// Get the CAN ID of this event (if applicable)
    pub fn frame_id(&self) -> Option<u32> {
        match self {
            BusEvent::Decoded { frame_id, .. } => Some(*frame_id),
            BusEvent::Transmitted { frame_id, .. } => Some(*frame_id),
            BusEvent::UnknownFrame { frame_id, .. } => Some(*frame_id),
            BusEvent::FrameDropped { frame_id, .. } => Some(*frame_id),
            BusEvent::TransportFailure { frame_id, .. } => *frame_id,
        }
    }
}
