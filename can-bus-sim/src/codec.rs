//! Signal codec
//!
//! Extracts signal values from raw CAN frames and packs physical values back
//! into frame bytes. Handles bit placement for both byte orders, sign
//! extension, IEEE floats and physical value conversion.
//!
//! Bit placement for a signal is described once by a [`SignalLayout`] and the
//! same layout drives both directions, so extraction and packing are inverses
//! by construction.

use crate::signals::catalog::{ByteOrder, MessageDefinition, SignalDefinition, ValueType};
use crate::types::{DecodedMessage, DecodedSignal, Result, SignalValues, SimError};

/// Largest payload accepted by any transport (CAN-FD)
pub const MAX_PAYLOAD: usize = 64;

/// One contiguous run of signal bits within a single frame byte
///
/// Take `num_bits` bits starting at `bit_offset` (0 = LSB) of
/// `data[byte_index]` and place them at `value_shift` in the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSpan {
    pub byte_index: usize,
    /// Lowest bit position within the byte (0..=7)
    pub bit_offset: u8,
    /// Consecutive bits in this span (1..=8)
    pub num_bits: u8,
    /// Left shift of these bits inside the raw value
    pub value_shift: u8,
}

impl BitSpan {
    fn mask(&self) -> u8 {
        ((1u16 << self.num_bits) - 1) as u8
    }
}

/// Placement of a signal's bits in the frame data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalLayout {
    spans: Vec<BitSpan>,
    length: u16,
}

impl SignalLayout {
    /// Compute the layout for a start bit, length and byte order
    ///
    /// Bits are numbered `byte * 8 + bit`, bit 0 being the LSB of a byte.
    /// Intel signals start at their LSB and walk upward through the byte, then
    /// continue at bit 0 of the next byte. Motorola signals start at their MSB
    /// and walk downward through the byte, then continue at bit 7 of the next
    /// byte.
    pub fn new(start_bit: u16, length: u16, byte_order: ByteOrder) -> Self {
        let length = length.min(64);
        let mut spans = Vec::with_capacity(9);
        let mut byte_index = (start_bit / 8) as usize;
        let mut bit_index = (start_bit % 8) as u8;
        let mut remaining = length as u8;

        match byte_order {
            ByteOrder::BigEndian => {
                while remaining > 0 {
                    let num_bits = (bit_index + 1).min(remaining);
                    remaining -= num_bits;
                    spans.push(BitSpan {
                        byte_index,
                        bit_offset: bit_index + 1 - num_bits,
                        num_bits,
                        value_shift: remaining,
                    });
                    byte_index += 1;
                    bit_index = 7;
                }
            }
            ByteOrder::LittleEndian => {
                let mut value_shift = 0u8;
                while remaining > 0 {
                    let num_bits = (8 - bit_index).min(remaining);
                    spans.push(BitSpan {
                        byte_index,
                        bit_offset: bit_index,
                        num_bits,
                        value_shift,
                    });
                    value_shift += num_bits;
                    remaining -= num_bits;
                    byte_index += 1;
                    bit_index = 0;
                }
            }
        }

        Self { spans, length }
    }

    pub fn for_signal(signal: &SignalDefinition) -> Self {
        Self::new(signal.start_bit, signal.length, signal.byte_order)
    }

    pub fn spans(&self) -> &[BitSpan] {
        &self.spans
    }

    /// Frame length needed to hold the highest byte this signal touches
    pub fn required_bytes(&self) -> usize {
        self.spans
            .iter()
            .map(|span| span.byte_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// Extract the raw bit pattern
    ///
    /// `data` must be at least [`required_bytes`](Self::required_bytes) long.
    pub fn extract(&self, data: &[u8]) -> u64 {
        let mut result: u64 = 0;
        for span in &self.spans {
            let bits = (data[span.byte_index] >> span.bit_offset) & span.mask();
            result |= (bits as u64) << span.value_shift;
        }
        result
    }

    /// Pack a raw bit pattern, truncated to the signal length
    ///
    /// Target bits are cleared before writing so that several signals can be
    /// placed into the same buffer.
    pub fn pack(&self, data: &mut [u8], raw: u64) {
        let raw = raw & length_mask(self.length);
        for span in &self.spans {
            let mask = span.mask();
            let bits = ((raw >> span.value_shift) as u8) & mask;
            data[span.byte_index] &= !(mask << span.bit_offset);
            data[span.byte_index] |= bits << span.bit_offset;
        }
    }
}

/// Mask with the low `length` bits set
fn length_mask(length: u16) -> u64 {
    if length >= 64 {
        u64::MAX
    } else {
        (1u64 << length) - 1
    }
}

/// Sign-extend a value from N bits to 64 bits
///
/// If the value's MSB is 1, fill the upper bits with 1s. A zero-length
/// signal carries no bits and reads as 0.
fn sign_extend(value: u64, bit_length: u16) -> i64 {
    if bit_length == 0 {
        return 0;
    }
    if bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if (value & sign_bit) != 0 {
        let mask = !0u64 << bit_length;
        (value | mask) as i64
    } else {
        value as i64
    }
}

/// Reject bit lengths a frame cannot carry
///
/// Signals from a [`Catalog`](crate::Catalog) are already validated; this
/// covers definitions passed to the codec directly.
fn check_length(signal: &SignalDefinition) -> Result<()> {
    if signal.length == 0 || signal.length > 64 {
        return Err(SimError::InvalidSignalDefinition(format!(
            "Signal '{}' has bit length {} (expected 1..=64)",
            signal.name, signal.length
        )));
    }
    Ok(())
}

/// Extract a signal's raw bit pattern from frame data
pub fn extract_raw(data: &[u8], signal: &SignalDefinition) -> Result<u64> {
    check_length(signal)?;
    let layout = signal.layout();
    let required = layout.required_bytes();
    if data.len() < required {
        return Err(SimError::TruncatedFrame {
            message: signal.name.clone(),
            actual: data.len(),
            required,
        });
    }
    Ok(layout.extract(data))
}

/// Place a raw bit pattern into frame data at the signal's position
pub fn pack_raw(data: &mut [u8], signal: &SignalDefinition, raw: u64) -> Result<()> {
    check_length(signal)?;
    let layout = signal.layout();
    let required = layout.required_bytes();
    if data.len() < required {
        return Err(SimError::TruncatedFrame {
            message: signal.name.clone(),
            actual: data.len(),
            required,
        });
    }
    layout.pack(data, raw);
    Ok(())
}

/// Convert a raw bit pattern to a physical value
///
/// Returns the physical value and, for integer signals, the interpreted raw
/// integer used for value-table lookups.
pub fn raw_to_physical(signal: &SignalDefinition, raw: u64) -> (f64, Option<i64>) {
    let (value, integer) = match signal.value_type {
        ValueType::Unsigned => (raw as f64, Some(raw as i64)),
        ValueType::Signed => {
            let v = sign_extend(raw, signal.length);
            (v as f64, Some(v))
        }
        ValueType::Float32 => (f32::from_bits(raw as u32) as f64, None),
        ValueType::Float64 => (f64::from_bits(raw), None),
    };
    (value * signal.factor + signal.offset, integer)
}

/// Convert a physical value to the raw bit pattern to place in a frame
///
/// Integer signals are rounded to the nearest raw code and wrapped to the
/// signal length; no clamping is applied.
pub fn physical_to_raw(signal: &SignalDefinition, physical: f64) -> u64 {
    let scaled = (physical - signal.offset) / signal.factor;
    let raw = match signal.value_type {
        ValueType::Float32 => (scaled as f32).to_bits() as u64,
        ValueType::Float64 => scaled.to_bits(),
        ValueType::Signed => scaled.round() as i64 as u64,
        ValueType::Unsigned => {
            let rounded = scaled.round();
            if rounded < 0.0 {
                rounded as i64 as u64
            } else {
                rounded as u64
            }
        }
    };
    raw & length_mask(signal.length)
}

/// Decode a single signal from CAN frame data
pub fn decode_signal(data: &[u8], signal: &SignalDefinition) -> Result<DecodedSignal> {
    let raw_value = extract_raw(data, signal)?;
    let (value, integer) = raw_to_physical(signal, raw_value);

    Ok(DecodedSignal {
        name: signal.name.clone(),
        value,
        unit: signal.unit.clone(),
        value_description: integer
            .and_then(|raw| signal.describe(raw))
            .map(str::to_string),
        raw_value,
    })
}

/// Decode every signal of a message from CAN frame data
///
/// Values outside their declared bounds are reported in
/// `range_violations`, not clamped.
pub fn decode_message(message: &MessageDefinition, data: &[u8]) -> Result<DecodedMessage> {
    let required = message.required_bytes();
    if data.len() < required {
        return Err(SimError::TruncatedFrame {
            message: message.name.clone(),
            actual: data.len(),
            required,
        });
    }

    let mut signals = Vec::with_capacity(message.signals.len());
    let mut range_violations = Vec::new();

    for signal in &message.signals {
        let decoded = decode_signal(data, signal)?;
        if let Some(violation) = signal.check_range(decoded.value) {
            log::warn!("{} (0x{:X}): {}", message.name, message.id, violation);
            range_violations.push(violation);
        }
        signals.push(decoded);
    }

    Ok(DecodedMessage {
        frame_id: message.id,
        message_name: message.name.clone(),
        signals,
        range_violations,
    })
}

/// Encode physical values into a zero-initialised frame of the message size
///
/// Every signal of the message must have a value; missing values fail with
/// [`SimError::MissingSignal`]. Extra entries in `values` are ignored.
pub fn encode_message(message: &MessageDefinition, values: &SignalValues) -> Result<Vec<u8>> {
    let mut data = vec![0u8; message.size];

    for signal in &message.signals {
        let physical = values
            .get(&signal.name)
            .ok_or_else(|| SimError::MissingSignal {
                message: message.name.clone(),
                signal: signal.name.clone(),
            })?;

        let raw = physical_to_raw(signal, *physical);
        pack_raw(&mut data, signal, raw)?;
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(data: &[u8], start_bit: u16, length: u16, order: ByteOrder) -> u64 {
        SignalLayout::new(start_bit, length, order).extract(data)
    }

    #[test]
    fn test_extract_little_endian_simple() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract(&data, 0, 8, ByteOrder::LittleEndian), 0xAB);
    }

    #[test]
    fn test_extract_little_endian_cross_byte() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract(&data, 0, 16, ByteOrder::LittleEndian), 0xCDAB);
        // Bits 4..16: high nibble of byte 0, all of byte 1
        assert_eq!(extract(&data, 4, 12, ByteOrder::LittleEndian), 0xCDA);
    }

    #[test]
    fn test_extract_big_endian_simple() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract(&data, 7, 8, ByteOrder::BigEndian), 0xAB);
    }

    #[test]
    fn test_extract_big_endian_cross_byte() {
        let data = vec![0x12, 0x34, 0x56];
        assert_eq!(extract(&data, 7, 16, ByteOrder::BigEndian), 0x1234);
        // MSB at bit 3 of byte 0: low nibble of byte 0, then byte 1
        let data = vec![0xAB, 0xCD];
        assert_eq!(extract(&data, 3, 12, ByteOrder::BigEndian), 0xBCD);
    }

    #[test]
    fn test_big_endian_layout_spans() {
        let layout = SignalLayout::new(3, 12, ByteOrder::BigEndian);
        assert_eq!(
            layout.spans(),
            &[
                BitSpan { byte_index: 0, bit_offset: 0, num_bits: 4, value_shift: 8 },
                BitSpan { byte_index: 1, bit_offset: 0, num_bits: 8, value_shift: 0 },
            ]
        );
        assert_eq!(layout.required_bytes(), 2);
    }

    #[test]
    fn test_pack_preserves_neighbours() {
        let mut data = vec![0xFF, 0xFF];
        SignalLayout::new(4, 8, ByteOrder::LittleEndian).pack(&mut data, 0x00);
        assert_eq!(data, vec![0x0F, 0xF0]);
    }

    #[test]
    fn test_pack_wraps_to_length() {
        let mut data = vec![0x00, 0x00];
        // 0x1FF does not fit in 8 bits; only 0xFF must land, byte 1 untouched
        SignalLayout::new(0, 8, ByteOrder::LittleEndian).pack(&mut data, 0x1FF);
        assert_eq!(data, vec![0xFF, 0x00]);
    }

    #[test]
    fn test_sign_extend_positive() {
        assert_eq!(sign_extend(0x7F, 8), 127);
    }

    #[test]
    fn test_sign_extend_negative() {
        assert_eq!(sign_extend(0xFF, 8), -1);
    }

    #[test]
    fn test_sign_extend_negative_16bit() {
        assert_eq!(sign_extend(0x8000, 16), -32768);
    }

    #[test]
    fn test_unvalidated_bit_length_is_an_error() {
        let empty = SignalDefinition::new("Empty", 0, 0, ByteOrder::LittleEndian)
            .with_value_type(ValueType::Signed);
        let wide = SignalDefinition::new("Wide", 0, 65, ByteOrder::LittleEndian);
        let mut data = vec![0xFFu8; 9];

        assert!(matches!(
            extract_raw(&data, &empty),
            Err(SimError::InvalidSignalDefinition(_))
        ));
        assert!(matches!(
            pack_raw(&mut data, &wide, 1),
            Err(SimError::InvalidSignalDefinition(_))
        ));
        assert!(matches!(
            decode_signal(&data, &empty),
            Err(SimError::InvalidSignalDefinition(_))
        ));
        assert_eq!(raw_to_physical(&empty, 0xFF), (0.0, Some(0)));
        assert_eq!(sign_extend(0x1, 0), 0);
    }

    #[test]
    fn test_speed_example() {
        let speed = SignalDefinition::new("Speed", 0, 16, ByteOrder::LittleEndian)
            .with_scaling(0.1, 0.0)
            .with_range(0.0, 250.0);
        let message = MessageDefinition::new(0x100, "Vehicle", 2).with_signal(speed);

        let values = SignalValues::from([("Speed".to_string(), 100.0)]);
        let data = encode_message(&message, &values).unwrap();
        assert_eq!(data, vec![0xE8, 0x03]);

        let decoded = decode_message(&message, &[0xE8, 0x03]).unwrap();
        assert!((decoded.get("Speed").unwrap() - 100.0).abs() < 1e-9);
        assert!(decoded.range_violations.is_empty());
    }

    #[test]
    fn test_signed_scaled_roundtrip() {
        let temp = SignalDefinition::new("Temp", 23, 12, ByteOrder::BigEndian)
            .with_value_type(ValueType::Signed)
            .with_scaling(0.25, -10.0)
            .with_range(-500.0, 500.0);
        let message = MessageDefinition::new(0x101, "Climate", 4).with_signal(temp);

        let values = SignalValues::from([("Temp".to_string(), -42.75)]);
        let data = encode_message(&message, &values).unwrap();
        let decoded = decode_message(&message, &data).unwrap();
        assert_eq!(decoded.get("Temp"), Some(-42.75));
        // raw = (-42.75 + 10) / 0.25 = -131
        assert_eq!(decoded.signals[0].raw_value, (-131i64 as u64) & 0xFFF);
    }

    #[test]
    fn test_float_signals() {
        let f32_sig = SignalDefinition::new("Pressure", 0, 32, ByteOrder::LittleEndian)
            .with_value_type(ValueType::Float32)
            .with_range(-1e6, 1e6);
        let f64_sig = SignalDefinition::new("Position", 7, 64, ByteOrder::BigEndian)
            .with_value_type(ValueType::Float64)
            .with_scaling(2.0, 1.0)
            .with_range(-1e9, 1e9);

        let mut data = vec![0u8; 8];
        pack_raw(&mut data, &f32_sig, physical_to_raw(&f32_sig, 1013.25)).unwrap();
        assert_eq!(data[..4], 1013.25f32.to_le_bytes());
        assert_eq!(raw_to_physical(&f32_sig, extract_raw(&data, &f32_sig).unwrap()).0, 1013.25);

        let mut data = vec![0u8; 8];
        pack_raw(&mut data, &f64_sig, physical_to_raw(&f64_sig, 12345.5)).unwrap();
        assert_eq!(data, 6172.25f64.to_be_bytes().to_vec());
        assert_eq!(raw_to_physical(&f64_sig, extract_raw(&data, &f64_sig).unwrap()).0, 12345.5);
    }

    #[test]
    fn test_value_description() {
        let gear = SignalDefinition::new("Gear", 0, 3, ByteOrder::LittleEndian)
            .with_range(0.0, 7.0)
            .with_choice(2, "Neutral");
        let decoded = decode_signal(&[0x02], &gear).unwrap();
        assert_eq!(decoded.value_description.as_deref(), Some("Neutral"));
    }

    #[test]
    fn test_decode_reports_out_of_range() {
        let level = SignalDefinition::new("Level", 0, 8, ByteOrder::LittleEndian)
            .with_range(0.0, 100.0);
        let message = MessageDefinition::new(0x1, "Tank", 1).with_signal(level);

        let decoded = decode_message(&message, &[200]).unwrap();
        assert_eq!(decoded.get("Level"), Some(200.0));
        assert_eq!(decoded.range_violations.len(), 1);
        assert_eq!(decoded.range_violations[0].value, 200.0);
    }

    #[test]
    fn test_truncated_frame() {
        let message = MessageDefinition::new(0x1, "Wide", 4)
            .with_signal(SignalDefinition::new("A", 0, 16, ByteOrder::LittleEndian));

        match decode_message(&message, &[0x01, 0x02]) {
            Err(SimError::TruncatedFrame { actual, required, .. }) => {
                assert_eq!(actual, 2);
                assert_eq!(required, 4);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_signal() {
        let message = MessageDefinition::new(0x1, "Pair", 2)
            .with_signal(SignalDefinition::new("A", 0, 8, ByteOrder::LittleEndian).with_range(0.0, 255.0))
            .with_signal(SignalDefinition::new("B", 8, 8, ByteOrder::LittleEndian).with_range(0.0, 255.0));

        let values = SignalValues::from([("A".to_string(), 1.0)]);
        match encode_message(&message, &values) {
            Err(SimError::MissingSignal { signal, .. }) => assert_eq!(signal, "B"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
