use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::backend::{SensorDataRef, StorageBackend};
use crate::error::{StoreError, StoreResult};
use crate::model::{SensorData, Source};

/// In-process backend over concurrent maps. Sensor data is sharded per
/// source, so writers for unrelated sources never serialize against each
/// other; within one source the per-entry `BTreeMap` keeps readings sorted
/// by timestamp for index and straddle scans.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    sources: DashMap<String, Source>,
    data: DashMap<String, BTreeMap<DateTime<Utc>, SensorData>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn initialize(&self, wipe: bool) -> StoreResult<()> {
        if wipe {
            self.sources.clear();
            self.data.clear();
        }
        Ok(())
    }

    async fn store_source(&self, source: &Source, overwrite: bool) -> StoreResult<bool> {
        if overwrite {
            self.sources.insert(source.name.clone(), source.clone());
            return Ok(true);
        }
        match self.sources.entry(source.name.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(source.clone());
                Ok(true)
            }
        }
    }

    async fn get_source(&self, name: &str) -> StoreResult<Option<Source>> {
        Ok(self.sources.get(name).map(|entry| entry.value().clone()))
    }

    async fn get_sources(&self) -> StoreResult<Vec<Source>> {
        let mut sources: Vec<Source> = self
            .sources
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    async fn delete_source(&self, name: &str) -> StoreResult<bool> {
        let existed = self.sources.remove(name).is_some();
        self.data.remove(name);
        Ok(existed)
    }

    async fn store_sensor_data(&self, data: &SensorData) -> StoreResult<bool> {
        let mut per_source = self.data.entry(data.source_name().to_string()).or_default();
        if per_source.contains_key(&data.timestamp) {
            return Ok(false);
        }
        per_source.insert(data.timestamp, data.clone());
        Ok(true)
    }

    async fn get_sensor_data(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<Option<SensorData>> {
        Ok(self
            .data
            .get(source)
            .and_then(|per_source| per_source.get(&timestamp).cloned()))
    }

    async fn delete_sensor_data(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let Some(mut per_source) = self.data.get_mut(source) else {
            return Ok(false);
        };
        Ok(per_source.remove(&timestamp).is_some())
    }

    async fn delete_all_sensor_data(&self, source: &str) -> StoreResult<bool> {
        Ok(self
            .data
            .remove(source)
            .is_some_and(|(_, per_source)| !per_source.is_empty()))
    }

    async fn get_sensor_data_index(&self, source: &str) -> StoreResult<Vec<SensorDataRef>> {
        Ok(self
            .data
            .get(source)
            .map(|per_source| per_source.values().map(SensorDataRef::from).collect())
            .unwrap_or_default())
    }

    async fn get_sensor_data_index_range(
        &self,
        source: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorDataRef>> {
        if start > end {
            return Err(StoreError::BadInterval { start, end });
        }
        Ok(self
            .data
            .get(source)
            .map(|per_source| {
                per_source
                    .range(start..=end)
                    .map(|(_, data)| SensorDataRef::from(data))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_sensor_datas(
        &self,
        source: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorData>> {
        if start > end {
            return Err(StoreError::BadInterval { start, end });
        }
        Ok(self
            .data
            .get(source)
            .map(|per_source| {
                per_source
                    .range(start..=end)
                    .map(|(_, data)| data.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_all_sensor_datas(&self, source: &str) -> StoreResult<Vec<SensorData>> {
        Ok(self
            .data
            .get(source)
            .map(|per_source| per_source.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_latest_non_virtual_sensor_data(
        &self,
        source: &str,
    ) -> StoreResult<Option<SensorData>> {
        let Some(entry) = self.sources.get(source) else {
            return Ok(None);
        };
        if entry.value().virtual_ {
            return Ok(None);
        }
        drop(entry);
        Ok(self
            .data
            .get(source)
            .and_then(|per_source| per_source.values().next_back().cloned()))
    }
}
