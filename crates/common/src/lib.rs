//! Shared configuration, error types, and observability primitives for brook crates.
//!
//! Architecture role:
//! - defines engine configuration passed across layers
//! - provides common [`BrookError`] / [`Result`] contracts
//! - hosts the memory budget pool consulted by pipeline breakers
//! - hosts node-level metrics counters
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`memory`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;

pub use config::EngineConfig;
pub use error::{BrookError, Result};
pub use memory::{MemoryPool, MemoryPressure, MemoryPressureSignal, MemoryReservation};
pub use metrics::{MetricsRegistry, global_metrics};
