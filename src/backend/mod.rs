use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{StoreConfig, BACKEND_MEMORY, BACKEND_POSTGRES};
use crate::error::StoreResult;
use crate::model::{SensorData, Source};

pub mod memory;
pub mod postgres;

pub use memory::MemoryBackend;
pub use postgres::PgBackend;

/// Lightweight index entry for a stored reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDataRef {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub tool: String,
}

impl From<&SensorData> for SensorDataRef {
    fn from(data: &SensorData) -> Self {
        Self {
            source: data.source_name().to_string(),
            timestamp: data.timestamp,
            tool: data.tool.clone(),
        }
    }
}

/// Durable storage contract for sources and sensor data.
///
/// Every implementation honors identical external behavior: insert-if-absent
/// stores report duplicates as `Ok(false)`, lookups report absence as
/// `Ok(None)`, and ranged index queries treat bounds as inclusive and reject
/// `start > end` with `StoreError::BadInterval`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Prepares backend state; `wipe` discards all existing data first.
    async fn initialize(&self, wipe: bool) -> StoreResult<()>;

    /// Insert-if-absent unless `overwrite`, which replaces unconditionally.
    async fn store_source(&self, source: &Source, overwrite: bool) -> StoreResult<bool>;

    async fn get_source(&self, name: &str) -> StoreResult<Option<Source>>;

    /// All sources, sorted ascending by name.
    async fn get_sources(&self) -> StoreResult<Vec<Source>>;

    /// Removes the source and cascades deletion of all its sensor data.
    async fn delete_source(&self, name: &str) -> StoreResult<bool>;

    async fn store_sensor_data(&self, data: &SensorData) -> StoreResult<bool>;

    async fn get_sensor_data(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<Option<SensorData>>;

    async fn has_sensor_data(&self, source: &str, timestamp: DateTime<Utc>) -> StoreResult<bool> {
        Ok(self.get_sensor_data(source, timestamp).await?.is_some())
    }

    async fn delete_sensor_data(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn delete_all_sensor_data(&self, source: &str) -> StoreResult<bool>;

    /// Index entries sorted ascending by timestamp.
    async fn get_sensor_data_index(&self, source: &str) -> StoreResult<Vec<SensorDataRef>>;

    /// Ranged index with inclusive bounds.
    async fn get_sensor_data_index_range(
        &self,
        source: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorDataRef>>;

    /// Full records in the inclusive range, sorted ascending by timestamp.
    async fn get_sensor_datas(
        &self,
        source: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorData>>;

    /// Every record for the source, sorted ascending by timestamp.
    async fn get_all_sensor_datas(&self, source: &str) -> StoreResult<Vec<SensorData>>;

    /// Latest reading; absent for virtual or unknown sources.
    async fn get_latest_non_virtual_sensor_data(
        &self,
        source: &str,
    ) -> StoreResult<Option<SensorData>>;

    /// Housekeeping hook; a no-op is valid for backends that need none.
    async fn perform_maintenance(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Index-building hook; a no-op is valid for backends that need none.
    async fn index_tables(&self) -> StoreResult<()> {
        Ok(())
    }
}

type BackendFactory = fn(&StoreConfig) -> Result<Arc<dyn StorageBackend>>;

/// Explicit registry mapping configuration strings to backend factories,
/// resolved once at startup.
const REGISTRY: &[(&str, BackendFactory)] = &[
    (BACKEND_MEMORY, make_memory as BackendFactory),
    (BACKEND_POSTGRES, make_postgres as BackendFactory),
];

fn make_memory(_config: &StoreConfig) -> Result<Arc<dyn StorageBackend>> {
    Ok(Arc::new(MemoryBackend::new()))
}

fn make_postgres(config: &StoreConfig) -> Result<Arc<dyn StorageBackend>> {
    let url = config
        .database_url
        .as_deref()
        .context("a database URL is required for the postgres backend")?;
    Ok(Arc::new(PgBackend::connect_lazy(url)?))
}

pub fn create_backend(config: &StoreConfig) -> Result<Arc<dyn StorageBackend>> {
    let name = config.backend.trim().to_lowercase();
    for (key, factory) in REGISTRY {
        if *key == name {
            return factory(config);
        }
    }
    anyhow::bail!("unknown storage backend {name:?} (expected one of: memory, postgres)")
}
