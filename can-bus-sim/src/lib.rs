//! CAN Bus Simulator Library
//!
//! Decodes and synthesizes CAN traffic described by a message catalog
//! (typically loaded from DBC files).
//!
//! # Architecture
//!
//! - [`signals`]: message/signal model, the validated [`Catalog`] and DBC loading
//! - [`codec`]: bit-exact signal extraction and packing for both byte orders
//! - [`generator`]: bounded random-walk values for synthetic traffic
//! - [`scheduler`]: per-message cyclic transmission on a shared deadline queue
//! - [`decode_loop`]: receive, decode and report frames
//! - [`bus`]: the [`BusSession`] boundary plus loopback and SocketCAN sessions
//! - [`sink`]: consumers for the events both loops produce
//!
//! The catalog is built once and shared read-only (`Arc<Catalog>`) by every
//! component. Both loops stop cooperatively through a [`shutdown`] flag.
//!
//! The library does NOT:
//! - Parse command-line arguments or configuration files
//! - Format console output
//! - Install signal handlers
//!
//! All of that is in the application layer (can-bus-cli).
//!
//! # Example Usage
//!
//! ```no_run
//! use can_bus_sim::{shutdown, CatalogBuilder, CyclicScheduler, LogSink, SimulatorConfig, VirtualBus};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> can_bus_sim::Result<()> {
//! let mut builder = CatalogBuilder::new();
//! builder.add_dbc(Path::new("powertrain.dbc"))?;
//! let catalog = Arc::new(builder.build()?);
//!
//! let config = SimulatorConfig::new().with_max_step(5.0);
//! let bus = Arc::new(VirtualBus::new());
//! let (stop, stop_rx) = shutdown::channel();
//!
//! let mut scheduler = CyclicScheduler::new(catalog, bus, LogSink, &config);
//! let stats = scheduler.run(stop_rx).await;
//! println!("sent {} frames", stats.frames_sent);
//! # drop(stop);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod codec;
pub mod config;
pub mod decode_loop;
pub mod generator;
pub mod scheduler;
pub mod shutdown;
pub mod signals;
pub mod sink;
pub mod types;

// Re-export main types for convenience
pub use bus::{BusSession, VirtualBus, VirtualBusInjector, VIRTUAL_INTERFACE};
pub use config::{MissedDeadlinePolicy, SimulatorConfig};
pub use decode_loop::{DecodeLoop, DecodeStats};
pub use generator::{GeneratorState, LiveValueGenerator};
pub use scheduler::{CyclicScheduler, MessageState, SchedulerStats};
pub use signals::{
    ByteOrder, Catalog, CatalogBuilder, CatalogStats, MessageDefinition, SignalDefinition,
    ValueType,
};
pub use sink::{CollectingSink, EventSink, JsonLinesSink, LogSink};
pub use types::{
    BusEvent, CanFrame, DecodedMessage, DecodedSignal, RangeViolation, Result, SignalValues,
    SimError, Timestamp,
};

#[cfg(feature = "socketcan")]
pub use bus::SocketCanSession;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: an empty catalog decodes nothing
        let catalog = CatalogBuilder::new().build().unwrap();
        let stats = catalog.stats();
        assert_eq!(stats.num_messages, 0);
        assert!(matches!(
            catalog.decode(0x123, false, &[]),
            Err(SimError::UnknownFrame(0x123))
        ));
    }
}
