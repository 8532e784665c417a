//! Message catalog
//!
//! Holds the message and signal definitions from one or more DBC files.
//! A [`Catalog`] is validated once at construction and is read-only for the
//! rest of the process, so it can be shared behind an `Arc` by the decode
//! loop and the scheduler without locking.

use crate::codec::{self, SignalLayout};
use crate::types::{DecodedMessage, RangeViolation, Result, SignalValues, SimError};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

/// A complete CAN message definition
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDefinition {
    /// CAN message ID (without the DBC extended-id flag)
    pub id: u32,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Transmission period; `None` means the message is not sent periodically
    pub cycle_time_ms: Option<u64>,
    /// True if the ID is a 29-bit identifier
    pub is_extended: bool,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this message
    pub signals: Vec<SignalDefinition>,
    /// Source file (DBC filename)
    pub source: String,
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Start bit in the CAN frame (LSB for Intel, MSB for Motorola)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// How the extracted bits are interpreted
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "°C", "V")
    pub unit: Option<String>,
    /// Value table for enum-like values (raw_value -> description)
    pub value_table: Option<BTreeMap<i64, String>>,
    /// Free-text comment from the definition file
    pub comment: Option<String>,
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Unsigned integer
    Unsigned,
    /// Two's-complement signed integer
    Signed,
    /// IEEE-754 single precision (32 bits)
    Float32,
    /// IEEE-754 double precision (64 bits)
    Float64,
}

impl ValueType {
    pub fn is_float(&self) -> bool {
        matches!(self, ValueType::Float32 | ValueType::Float64)
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, ValueType::Signed)
    }
}

impl SignalDefinition {
    /// Create an unsigned, unscaled signal with an empty range
    ///
    /// Use the `with_*` builder methods to fill in the remaining properties.
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16, byte_order: ByteOrder) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
            value_table: None,
            comment: None,
        }
    }

    /// Builder method: set the value type
    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Builder method: set factor and offset
    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    /// Builder method: set the physical range
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Builder method: set the engineering unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Builder method: add a value description
    pub fn with_choice(mut self, raw: i64, label: impl Into<String>) -> Self {
        self.value_table
            .get_or_insert_with(BTreeMap::new)
            .insert(raw, label.into());
        self
    }

    /// Bit layout of this signal inside a frame
    pub fn layout(&self) -> SignalLayout {
        SignalLayout::for_signal(self)
    }

    /// Smallest and largest raw integer representable by the signal's bits
    ///
    /// Float signals report the range of their integer bit pattern, which is
    /// only meaningful for display.
    pub fn raw_range(&self) -> (f64, f64) {
        let bits = self.length.clamp(1, 64) as i32;
        if self.value_type.is_signed() {
            let half = 2f64.powi(bits - 1);
            (-half, half - 1.0)
        } else {
            (0.0, 2f64.powi(bits) - 1.0)
        }
    }

    /// Physical range covered by every raw integer the signal can carry
    pub fn representable_range(&self) -> (f64, f64) {
        let (raw_min, raw_max) = self.raw_range();
        let a = raw_min * self.factor + self.offset;
        let b = raw_max * self.factor + self.offset;
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Report a physical value outside `[min, max]`
    pub fn check_range(&self, value: f64) -> Option<RangeViolation> {
        if value < self.min || value > self.max || value.is_nan() {
            Some(RangeViolation {
                signal: self.name.clone(),
                value,
                minimum: self.min,
                maximum: self.max,
            })
        } else {
            None
        }
    }

    /// Label for a raw integer value, if the value table has one
    pub fn describe(&self, raw_value: i64) -> Option<&str> {
        self.value_table
            .as_ref()
            .and_then(|table| table.get(&raw_value))
            .map(String::as_str)
    }

    /// Check the definition against a message of `message_size` bytes
    pub fn validate(&self, message_size: usize) -> Result<()> {
        if self.length == 0 || self.length > 64 {
            return Err(SimError::InvalidSignalDefinition(format!(
                "Signal '{}' has bit length {} (expected 1..=64)",
                self.name, self.length
            )));
        }
        match self.value_type {
            ValueType::Float32 if self.length != 32 => {
                return Err(SimError::InvalidSignalDefinition(format!(
                    "Float signal '{}' must be 32 bits, got {}",
                    self.name, self.length
                )));
            }
            ValueType::Float64 if self.length != 64 => {
                return Err(SimError::InvalidSignalDefinition(format!(
                    "Double signal '{}' must be 64 bits, got {}",
                    self.name, self.length
                )));
            }
            _ => {}
        }
        if self.factor == 0.0 || !self.factor.is_finite() || !self.offset.is_finite() {
            return Err(SimError::InvalidSignalDefinition(format!(
                "Signal '{}' has invalid scaling (factor {}, offset {})",
                self.name, self.factor, self.offset
            )));
        }
        if !self.min.is_finite() || !self.max.is_finite() || self.min > self.max {
            return Err(SimError::InvalidSignalDefinition(format!(
                "Signal '{}' has minimum {} above maximum {}",
                self.name, self.min, self.max
            )));
        }

        let required = self.layout().required_bytes();
        if required > message_size {
            return Err(SimError::InvalidSignalDefinition(format!(
                "Signal '{}' needs {} bytes but message is {} bytes",
                self.name, required, message_size
            )));
        }
        Ok(())
    }
}

impl MessageDefinition {
    /// Create an empty, non-periodic message
    pub fn new(id: u32, name: impl Into<String>, size: usize) -> Self {
        Self {
            id,
            name: name.into(),
            size,
            cycle_time_ms: None,
            is_extended: id > crate::types::MAX_STANDARD_ID,
            sender: None,
            signals: Vec::new(),
            source: String::new(),
        }
    }

    /// Builder method: set the transmission period
    pub fn with_cycle_time(mut self, cycle_time_ms: u64) -> Self {
        self.cycle_time_ms = Some(cycle_time_ms);
        self
    }

    /// Builder method: append a signal
    pub fn with_signal(mut self, signal: SignalDefinition) -> Self {
        self.signals.push(signal);
        self
    }

    /// Look up a signal by name
    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Transmission period as a `Duration`
    pub fn cycle_time(&self) -> Option<Duration> {
        self.cycle_time_ms.map(Duration::from_millis)
    }

    /// Number of bytes a received frame must carry to be decoded
    pub fn required_bytes(&self) -> usize {
        self.signals
            .iter()
            .map(|s| s.layout().required_bytes())
            .max()
            .unwrap_or(0)
            .max(self.size)
    }

    /// Values in `values` that lie outside their signal's bounds
    pub fn range_violations(&self, values: &SignalValues) -> Vec<RangeViolation> {
        self.signals
            .iter()
            .filter_map(|signal| {
                values
                    .get(&signal.name)
                    .and_then(|value| signal.check_range(*value))
            })
            .collect()
    }

    /// Check signal definitions, name uniqueness and bit overlap
    pub fn validate(&self) -> Result<()> {
        let max_id = if self.is_extended {
            crate::types::MAX_EXTENDED_ID
        } else {
            crate::types::MAX_STANDARD_ID
        };
        if self.id > max_id {
            return Err(SimError::InvalidMessageDefinition(format!(
                "Message '{}' has ID 0x{:X} outside the {} range",
                self.name,
                self.id,
                if self.is_extended { "29-bit" } else { "11-bit" }
            )));
        }
        if self.size > codec::MAX_PAYLOAD {
            return Err(SimError::InvalidMessageDefinition(format!(
                "Message '{}' is {} bytes, transport maximum is {}",
                self.name,
                self.size,
                codec::MAX_PAYLOAD
            )));
        }

        // Owner of every frame bit, indexed byte * 8 + bit
        let mut owners: Vec<Option<usize>> = vec![None; self.size * 8];

        for (idx, signal) in self.signals.iter().enumerate() {
            signal.validate(self.size)?;

            if self.signals[..idx].iter().any(|s| s.name == signal.name) {
                return Err(SimError::InvalidMessageDefinition(format!(
                    "Message '{}' defines signal '{}' twice",
                    self.name, signal.name
                )));
            }

            for span in signal.layout().spans() {
                for bit in span.bit_offset..span.bit_offset + span.num_bits {
                    let slot = &mut owners[span.byte_index * 8 + bit as usize];
                    if let Some(other) = *slot {
                        return Err(SimError::InvalidMessageDefinition(format!(
                            "Signals '{}' and '{}' of message '{}' overlap at byte {} bit {}",
                            self.signals[other].name, signal.name, self.name, span.byte_index, bit
                        )));
                    }
                    *slot = Some(idx);
                }
            }
        }
        Ok(())
    }
}

/// The validated, read-only message catalog
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    messages: Vec<MessageDefinition>,
    /// Key: (CAN ID, extended flag), Value: index into `messages`
    by_id: HashMap<(u32, bool), usize>,
    /// Key: message name, Value: index into `messages`
    by_name: HashMap<String, usize>,
}

impl Catalog {
    /// Validate and index a set of message definitions
    pub fn new(messages: Vec<MessageDefinition>) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(messages.len());
        let mut by_name = HashMap::with_capacity(messages.len());

        for (idx, message) in messages.iter().enumerate() {
            message.validate()?;

            if by_id.insert((message.id, message.is_extended), idx).is_some() {
                return Err(SimError::InvalidMessageDefinition(format!(
                    "Duplicate {} CAN ID 0x{:X} ({})",
                    if message.is_extended { "29-bit" } else { "11-bit" },
                    message.id,
                    message.name
                )));
            }
            if by_name.insert(message.name.clone(), idx).is_some() {
                return Err(SimError::InvalidMessageDefinition(format!(
                    "Duplicate message name '{}'",
                    message.name
                )));
            }
        }

        Ok(Self {
            messages,
            by_id,
            by_name,
        })
    }

    /// Get a message definition by CAN ID
    ///
    /// An 11-bit and a 29-bit identifier with the same value are different
    /// messages.
    pub fn get_message(&self, can_id: u32, is_extended: bool) -> Option<&MessageDefinition> {
        self.by_id
            .get(&(can_id, is_extended))
            .map(|idx| &self.messages[*idx])
    }

    /// Get a message definition by name
    pub fn get_message_by_name(&self, message_name: &str) -> Option<&MessageDefinition> {
        self.by_name.get(message_name).map(|idx| &self.messages[*idx])
    }

    /// All messages, in definition order
    pub fn messages(&self) -> &[MessageDefinition] {
        &self.messages
    }

    /// Messages that declare a transmission period
    pub fn periodic_messages(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.messages.iter().filter(|m| m.cycle_time_ms.is_some())
    }

    /// Find all messages containing a specific signal name
    pub fn find_signal(&self, signal_name: &str) -> Vec<(u32, &SignalDefinition)> {
        self.messages
            .iter()
            .filter_map(|msg| msg.signal(signal_name).map(|sig| (msg.id, sig)))
            .collect()
    }

    /// Decode a frame payload, looking its message up by CAN ID
    pub fn decode(&self, can_id: u32, is_extended: bool, data: &[u8]) -> Result<DecodedMessage> {
        let message = self
            .get_message(can_id, is_extended)
            .ok_or(SimError::UnknownFrame(can_id))?;
        codec::decode_message(message, data)
    }

    /// Encode physical values, looking the message up by name
    pub fn encode(&self, message_name: &str, values: &SignalValues) -> Result<Vec<u8>> {
        let message = self
            .get_message_by_name(message_name)
            .ok_or_else(|| SimError::UnknownMessage(message_name.to_string()))?;
        codec::encode_message(message, values)
    }

    /// Get catalog statistics
    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.iter().map(|m| m.signals.len()).sum(),
            num_periodic: self.periodic_messages().count(),
        }
    }

    /// Get all CAN IDs in the catalog, sorted
    pub fn get_all_can_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.by_id.keys().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Catalog statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
    /// Messages with a transmission period
    pub num_periodic: usize,
}

/// Collects message definitions from several sources before validation
///
/// When two sources define the same CAN ID (with the same extended flag)
/// or the same message name, the first
/// definition wins and the later one is skipped with a warning.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    messages: Vec<MessageDefinition>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message definition
    pub fn add_message(&mut self, message: MessageDefinition) {
        if let Some(existing) = self
            .messages
            .iter()
            .find(|m| {
                (m.id == message.id && m.is_extended == message.is_extended)
                    || m.name == message.name
            })
        {
            log::warn!(
                "Skipping message {} (ID 0x{:X}) from {}: already defined as {} (ID 0x{:X}) in {}",
                message.name,
                message.id,
                message.source,
                existing.name,
                existing.id,
                existing.source
            );
            return;
        }
        self.messages.push(message);
    }

    /// Load a DBC file and add its definitions
    pub fn add_dbc(&mut self, path: &Path) -> Result<()> {
        log::info!("Loading DBC file: {:?}", path);

        let messages = crate::signals::dbc::parse_dbc_file(path)?;
        for message in messages {
            self.add_message(message);
        }

        log::info!("DBC file loaded successfully: {:?}", path);
        Ok(())
    }

    /// Validate everything collected so far
    pub fn build(self) -> Result<Catalog> {
        Catalog::new(self.messages)
    }
}
