//! Console output
//!
//! Catalog listing for `show` and the line-oriented console sink used by
//! `decode`, `generate` and `simulate`.

use can_bus_sim::types::hex_string;
use can_bus_sim::{BusEvent, ByteOrder, Catalog, DecodedSignal, EventSink, SignalValues};
use std::io::{self, Write};

/// Print every message of the catalog with all signal attributes
pub fn write_catalog<W: Write>(out: &mut W, catalog: &Catalog) -> io::Result<()> {
    for message in catalog.messages() {
        let timing = match message.cycle_time_ms {
            Some(ms) => ms.to_string(),
            None => "none".to_string(),
        };
        writeln!(
            out,
            "0x{:x} - {} ({} Bytes - timing: {} ms):",
            message.id, message.name, message.size, timing
        )?;

        for signal in &message.signals {
            writeln!(
                out,
                "\t{} ({})",
                signal.name,
                signal.comment.as_deref().unwrap_or("none")
            )?;
            writeln!(out, "\t\tSTART: {}", signal.start_bit)?;
            writeln!(out, "\t\tLENGTH [bit]: {}", signal.length)?;
            let byte_order = match signal.byte_order {
                ByteOrder::LittleEndian => "little_endian",
                ByteOrder::BigEndian => "big_endian",
            };
            writeln!(out, "\t\tBO: {}", byte_order)?;
            writeln!(out, "\t\tIS SIGNED: {}", signal.value_type.is_signed())?;
            writeln!(out, "\t\tIS FLOAT: {}", signal.value_type.is_float())?;
            writeln!(out, "\t\tSCALE: {}", signal.factor)?;
            writeln!(out, "\t\tOFFSET: {}", signal.offset)?;
            writeln!(out, "\t\tMINIMUM: {}", signal.min)?;
            writeln!(out, "\t\tMAXIMUM: {}", signal.max)?;
            writeln!(out, "\t\tUNIT: {}", signal.unit.as_deref().unwrap_or("none"))?;

            let choices = match &signal.value_table {
                Some(table) => {
                    let entries: Vec<String> = table
                        .iter()
                        .map(|(raw, label)| format!("{}: '{}'", raw, label))
                        .collect();
                    format!("{{{}}}", entries.join(", "))
                }
                None => "none".to_string(),
            };
            writeln!(out, "\t\tCHOICES: {}", choices)?;
        }
    }
    Ok(())
}

fn format_signals(signals: &[DecodedSignal]) -> String {
    let entries: Vec<String> = signals
        .iter()
        .map(|s| match &s.value_description {
            Some(label) => format!("{}: '{}'", s.name, label),
            None => format!("{}: {}", s.name, s.value),
        })
        .collect();
    format!("{{{}}}", entries.join(", "))
}

fn format_values(values: &SignalValues) -> String {
    let entries: Vec<String> = values
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value))
        .collect();
    format!("{{{}}}", entries.join(", "))
}

/// Prints decode and transmit events as plain text lines
pub struct ConsoleSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }

    fn write_event(&mut self, event: &BusEvent) -> io::Result<()> {
        match event {
            BusEvent::Decoded {
                timestamp,
                frame_id,
                signals,
                ..
            } => writeln!(
                self.out,
                "{} - 0x{:x} {}",
                timestamp.format("%Y-%m-%d %H:%M:%S%.6f"),
                frame_id,
                format_signals(signals)
            ),
            BusEvent::Transmitted {
                frame_id,
                values,
                data,
                ..
            } => writeln!(
                self.out,
                "actual data: {} - message: 0x{:x} {}",
                format_values(values),
                frame_id,
                hex_string(data)
            ),
            BusEvent::UnknownFrame {
                timestamp,
                frame_id,
                data,
            } => writeln!(
                self.out,
                "{} - 0x{:x} unknown frame {}",
                timestamp.format("%Y-%m-%d %H:%M:%S%.6f"),
                frame_id,
                hex_string(data)
            ),
            // Failures are already reported through the log
            BusEvent::FrameDropped { .. } | BusEvent::TransportFailure { .. } => Ok(()),
        }?;
        self.out.flush()
    }
}

impl<W: Write + Send> EventSink for ConsoleSink<W> {
    fn emit(&mut self, event: &BusEvent) {
        if let Err(e) = self.write_event(event) {
            log::error!("Failed to write to console: {}", e);
        }
    }
}
