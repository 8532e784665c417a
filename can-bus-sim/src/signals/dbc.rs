//! DBC file loader
//!
//! Parses Vector DBC files with the `can-dbc` crate and converts them into
//! catalog message definitions.

use crate::signals::catalog::{ByteOrder, MessageDefinition, SignalDefinition, ValueType};
use crate::types::{Result, SimError};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Message attribute carrying the transmission period in milliseconds
const CYCLE_TIME_ATTRIBUTE: &str = "GenMsgCycleTime";

/// Flag set on DBC message IDs that are 29-bit identifiers
const DBC_EXTENDED_FLAG: u32 = 0x8000_0000;

/// Parse a DBC file and return message definitions
pub fn parse_dbc_file(path: &Path) -> Result<Vec<MessageDefinition>> {
    log::info!("Parsing DBC file: {:?}", path);

    // Read the DBC file as bytes first (handle non-UTF8 encodings)
    let bytes = std::fs::read(path).map_err(|e| {
        SimError::DbcParseError(format!("Failed to read file {:?}: {}", path, e))
    })?;

    let source_filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.dbc")
        .to_string();

    parse_dbc_bytes(&bytes, &source_filename)
}

/// Parse DBC content held in memory
///
/// `source` is recorded on every message for diagnostics.
pub fn parse_dbc_bytes(bytes: &[u8], source: &str) -> Result<Vec<MessageDefinition>> {
    // Latin-1 fallback keeps Windows-1252 comments and units readable
    let dbc_content = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            log::warn!("DBC file {} is not UTF-8, trying Latin-1 encoding", source);
            bytes.iter().map(|&b| b as char).collect()
        }
    };

    let dbc = can_dbc::DBC::from_slice(dbc_content.as_bytes()).map_err(|e| {
        SimError::DbcParseError(format!("Failed to parse DBC file {}: {:?}", source, e))
    })?;

    let cycle_times = collect_cycle_times(&dbc);

    let mut messages = Vec::new();
    for dbc_msg in dbc.messages() {
        messages.push(convert_message(&dbc, dbc_msg, &cycle_times, source));
    }

    log::info!("Parsed {} messages from {}", messages.len(), source);

    Ok(messages)
}

/// Read `GenMsgCycleTime` values, keyed by raw DBC message ID
fn collect_cycle_times(dbc: &can_dbc::DBC) -> HashMap<u32, u64> {
    let mut cycle_times = HashMap::new();

    for attribute in dbc.attribute_values() {
        if attribute.attribute_name() != CYCLE_TIME_ATTRIBUTE {
            continue;
        }
        if let can_dbc::AttributeValuedForObjectType::MessageDefinitionAttributeValue(
            message_id,
            Some(value),
        ) = attribute.attribute_value()
        {
            let cycle_time = match value {
                can_dbc::AttributeValue::AttributeValueU64(v) => Some(*v),
                can_dbc::AttributeValue::AttributeValueI64(v) => u64::try_from(*v).ok(),
                can_dbc::AttributeValue::AttributeValueF64(v) if *v >= 0.0 => Some(v.round() as u64),
                _ => None,
            };
            // A period of zero means "not cyclic"
            if let Some(ms) = cycle_time.filter(|ms| *ms > 0) {
                cycle_times.insert(message_id.0, ms);
            }
        }
    }

    cycle_times
}

/// Convert a can-dbc message to our MessageDefinition
fn convert_message(
    dbc: &can_dbc::DBC,
    dbc_msg: &can_dbc::Message,
    cycle_times: &HashMap<u32, u64>,
    source: &str,
) -> MessageDefinition {
    let raw_id = dbc_msg.message_id().0;
    let mut signals = Vec::new();

    for dbc_sig in dbc_msg.signals() {
        let keep = matches!(
            dbc_sig.multiplexer_indicator(),
            can_dbc::MultiplexIndicator::Plain | can_dbc::MultiplexIndicator::Multiplexor
        );
        if !keep {
            log::warn!(
                "Dropping multiplexed signal {}.{}: overlapping signals are not supported",
                dbc_msg.message_name(),
                dbc_sig.name()
            );
            continue;
        }
        signals.push(convert_signal(dbc, dbc_msg.message_id(), dbc_sig));
    }

    MessageDefinition {
        id: raw_id & !DBC_EXTENDED_FLAG,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        cycle_time_ms: cycle_times.get(&raw_id).copied(),
        is_extended: raw_id & DBC_EXTENDED_FLAG != 0,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        source: source.to_string(),
    }
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(
    dbc: &can_dbc::DBC,
    message_id: &can_dbc::MessageId,
    dbc_sig: &can_dbc::Signal,
) -> SignalDefinition {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let extended_type = dbc.extended_value_type_for_signal(message_id.clone(), dbc_sig.name());
    let value_type = match extended_type {
        Some(can_dbc::SignalExtendedValueType::IEEEfloat32Bit) => ValueType::Float32,
        Some(can_dbc::SignalExtendedValueType::IEEEdouble64bit) => ValueType::Float64,
        _ => match *dbc_sig.value_type() {
            can_dbc::ValueType::Signed => ValueType::Signed,
            can_dbc::ValueType::Unsigned => ValueType::Unsigned,
        },
    };

    let value_table = dbc
        .value_descriptions_for_signal(message_id.clone(), dbc_sig.name())
        .map(|descriptions| {
            descriptions
                .iter()
                .map(|d| (*d.a() as i64, d.b().to_string()))
                .collect::<BTreeMap<i64, String>>()
        })
        .filter(|table| !table.is_empty());

    let mut signal = SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        value_table,
        comment: dbc
            .signal_comment(message_id.clone(), dbc_sig.name())
            .map(str::to_string),
    };

    // [0|0] in a DBC means "no range given"
    if signal.min == 0.0 && signal.max == 0.0 && !signal.value_type.is_float() {
        let (min, max) = signal.representable_range();
        signal.min = min;
        signal.max = max;
    }

    signal
}
