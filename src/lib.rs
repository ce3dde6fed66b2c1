//! Storage and query engine for timestamped energy meter readings.
//!
//! Sources (physical meters, or virtual groupings of them) and their sensor
//! data live in a pluggable durable backend behind a write-back cache.
//! Queries interpolate between readings to answer for arbitrary timestamps:
//! instantaneous power, energy over an interval, and the carbon emitted
//! producing that energy, with virtual sources aggregating their leaves.
//!
//! [`MeterStore`] is the entry point; configure it from the environment via
//! [`StoreConfig::from_env`] or construct a [`StoreConfig`] directly.

pub mod aggregate;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod straddle;

pub use aggregate::{CarbonReading, EnergyReading, PowerReading};
pub use backend::{create_backend, MemoryBackend, PgBackend, SensorDataRef, StorageBackend};
pub use cache::EphemeralCache;
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use manager::MeterStore;
pub use model::{Properties, SensorData, SensorDataStraddle, Source, StraddleList};
