//! Message catalog and DBC loading
//!
//! This module contains the message/signal model, the validated catalog
//! built from it, and the DBC converter that feeds the catalog.

pub mod catalog;
pub mod dbc;

// Re-export key types for convenience
pub use catalog::{
    ByteOrder, Catalog, CatalogBuilder, CatalogStats, MessageDefinition, SignalDefinition,
    ValueType,
};
