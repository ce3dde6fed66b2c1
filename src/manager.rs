use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::aggregate::{self, CarbonReading, EnergyReading, PowerReading};
use crate::backend::{create_backend, SensorDataRef, StorageBackend};
use crate::cache::EphemeralCache;
use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::model::{SensorData, SensorDataStraddle, Source, StraddleList};
use crate::straddle;

/// Facade over the durable backend and the write-back cache.
///
/// Writes land in the cache first and reach the backend according to the
/// per-source checkpoint policy; reads merge both layers, with cached
/// entries taking precedence at equal timestamps.
pub struct MeterStore {
    backend: Arc<dyn StorageBackend>,
    cache: EphemeralCache,
    config: StoreConfig,
}

impl MeterStore {
    /// Resolves the configured backend, initializes it (wiping first when
    /// configured to), and wraps it with a fresh cache.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let backend = create_backend(&config)?;
        backend.initialize(config.wipe_on_start).await?;
        Ok(Self::with_backend(backend, config))
    }

    /// Wraps an already-constructed backend. The caller is responsible for
    /// any initialization the backend needs.
    pub fn with_backend(backend: Arc<dyn StorageBackend>, config: StoreConfig) -> Self {
        let cache = EphemeralCache::new(config.cache_window_minutes);
        Self {
            backend,
            cache,
            config,
        }
    }

    pub async fn store_source(&self, source: &Source, overwrite: bool) -> StoreResult<bool> {
        self.backend.store_source(source, overwrite).await
    }

    pub async fn get_source(&self, name: &str) -> StoreResult<Option<Source>> {
        self.backend.get_source(name).await
    }

    pub async fn get_sources(&self) -> StoreResult<Vec<Source>> {
        self.backend.get_sources().await
    }

    /// Deletes the source, its cached and durable sensor data, and its
    /// checkpoint.
    pub async fn delete_source(&self, name: &str) -> StoreResult<bool> {
        self.cache.purge_source(name);
        self.backend.delete_source(name).await
    }

    /// Write path. The reading always lands in the cache; it also reaches
    /// the backend when the source's checkpoint policy calls for it. A
    /// duplicate in either layer leaves the store unchanged and reports
    /// `Ok(false)`.
    pub async fn store_sensor_data(&self, data: &SensorData) -> StoreResult<bool> {
        if !self.cache.store_sensor_data(data, 0) {
            return Ok(false);
        }

        let source = data.source_name();
        let frequency = match self.backend.get_source(source).await? {
            Some(s) => s
                .cache_checkpoint_interval()
                .unwrap_or(self.config.checkpoint_interval_minutes),
            None => self.config.checkpoint_interval_minutes,
        };

        if self.cache.should_persist(source, data.timestamp, frequency) {
            if !self.backend.store_sensor_data(data).await? {
                // Already durable; undo the cache insert so the stored
                // record stays authoritative.
                self.cache.delete_sensor_data(source, data.timestamp);
                return Ok(false);
            }
            self.cache.record_checkpoint(source, data.timestamp);
            debug!(source, timestamp = %data.timestamp, "persisted sensor data");
        }
        Ok(true)
    }

    pub async fn get_sensor_data(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<Option<SensorData>> {
        if let Some(data) = self.cache.get_sensor_data(source, timestamp) {
            return Ok(Some(data));
        }
        self.backend.get_sensor_data(source, timestamp).await
    }

    pub async fn has_sensor_data(&self, source: &str, timestamp: DateTime<Utc>) -> StoreResult<bool> {
        if self.cache.has_sensor_data(source, timestamp) {
            return Ok(true);
        }
        self.backend.has_sensor_data(source, timestamp).await
    }

    /// Deletes from both layers; reports whether either held the reading.
    pub async fn delete_sensor_data(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let cached = self.cache.delete_sensor_data(source, timestamp);
        let durable = self.backend.delete_sensor_data(source, timestamp).await?;
        Ok(cached || durable)
    }

    pub async fn delete_all_sensor_data(&self, source: &str) -> StoreResult<bool> {
        self.cache.delete_all_sensor_data(source);
        self.backend.delete_all_sensor_data(source).await
    }

    /// Merged index, sorted ascending by timestamp.
    pub async fn get_sensor_data_index(&self, source: &str) -> StoreResult<Vec<SensorDataRef>> {
        let durable = self.backend.get_sensor_data_index(source).await?;
        let cached = self.cache.get_sensor_data_index(source);
        Ok(merge_by_timestamp(durable, cached, |r| r.timestamp))
    }

    /// Merged index over the inclusive range.
    pub async fn get_sensor_data_index_range(
        &self,
        source: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorDataRef>> {
        let durable = self
            .backend
            .get_sensor_data_index_range(source, start, end)
            .await?;
        let cached = self.cache.get_sensor_data_index_range(source, start, end)?;
        Ok(merge_by_timestamp(durable, cached, |r| r.timestamp))
    }

    /// Merged full records over the inclusive range.
    pub async fn get_sensor_datas(
        &self,
        source: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorData>> {
        let durable = self.backend.get_sensor_datas(source, start, end).await?;
        let cached = self.cache.get_sensor_datas(source, start, end)?;
        Ok(merge_by_timestamp(durable, cached, |d| d.timestamp))
    }

    /// Every record for the source across both layers, sorted ascending.
    pub async fn get_all_sensor_datas(&self, source: &str) -> StoreResult<Vec<SensorData>> {
        let durable = self.backend.get_all_sensor_datas(source).await?;
        let cached = self.cache.get_all_sensor_datas(source);
        Ok(merge_by_timestamp(durable, cached, |d| d.timestamp))
    }

    /// Latest reading across both layers; absent for virtual or unknown
    /// sources.
    pub async fn get_latest_sensor_data(&self, source: &str) -> StoreResult<Option<SensorData>> {
        let durable = self.backend.get_latest_non_virtual_sensor_data(source).await?;
        if durable.is_none() {
            // The backend also vetoes virtual and unknown sources.
            let eligible = self
                .backend
                .get_source(source)
                .await?
                .is_some_and(|s| !s.virtual_);
            if !eligible {
                return Ok(None);
            }
        }
        let cached = self.cache.get_latest_sensor_data(source);
        Ok(match (durable, cached) {
            (Some(d), Some(c)) => Some(if c.timestamp >= d.timestamp { c } else { d }),
            (Some(d), None) => Some(d),
            (None, cached) => cached,
        })
    }

    pub fn last_checkpoint(&self, source: &str) -> Option<DateTime<Utc>> {
        self.cache.last_checkpoint(source)
    }

    /// Prunes expired cache entries and runs the backend's housekeeping.
    pub async fn perform_maintenance(&self) -> StoreResult<()> {
        self.cache.prune_expired();
        self.backend.perform_maintenance().await
    }

    pub async fn index_tables(&self) -> StoreResult<()> {
        self.backend.index_tables().await
    }

    /// Every source reachable below a virtual source, depth first.
    pub async fn get_all_subsources(&self, source: &Source) -> StoreResult<Vec<Source>> {
        straddle::get_all_subsources(self, source).await
    }

    /// The non-virtual leaves below a source.
    pub async fn get_all_non_virtual_subsources(
        &self,
        source: &Source,
    ) -> StoreResult<Vec<Source>> {
        straddle::get_all_non_virtual_subsources(self, source).await
    }

    pub async fn get_straddle(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<Option<SensorDataStraddle>> {
        straddle::get_straddle(self, source, timestamp).await
    }

    pub async fn get_straddle_list(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<Option<Vec<SensorDataStraddle>>> {
        straddle::get_straddle_list(self, source, timestamp).await
    }

    pub async fn get_straddle_lists(
        &self,
        source: &str,
        timestamps: &[DateTime<Utc>],
    ) -> StoreResult<Option<Vec<StraddleList>>> {
        straddle::get_straddle_lists(self, source, timestamps).await
    }

    pub async fn get_straddle_list_of_lists(
        &self,
        source: &str,
        timestamps: &[DateTime<Utc>],
    ) -> StoreResult<Option<Vec<Vec<SensorDataStraddle>>>> {
        straddle::get_straddle_list_of_lists(self, source, timestamps).await
    }

    pub async fn get_power(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<Option<PowerReading>> {
        aggregate::get_power(self, source, timestamp).await
    }

    pub async fn get_energy(
        &self,
        source: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sampling_interval_minutes: i64,
    ) -> StoreResult<Option<EnergyReading>> {
        aggregate::get_energy(self, source, start, end, sampling_interval_minutes).await
    }

    pub async fn get_carbon(
        &self,
        source: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sampling_interval_minutes: i64,
    ) -> StoreResult<Option<CarbonReading>> {
        aggregate::get_carbon(self, source, start, end, sampling_interval_minutes).await
    }
}

/// Merges the two layers keyed by timestamp, cache entries winning ties.
fn merge_by_timestamp<T>(
    durable: Vec<T>,
    cached: Vec<T>,
    key: impl Fn(&T) -> DateTime<Utc>,
) -> Vec<T> {
    let mut merged: BTreeMap<DateTime<Utc>, T> = BTreeMap::new();
    for item in durable.into_iter().chain(cached) {
        merged.insert(key(&item), item);
    }
    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::model::{PROP_CACHE_CHECKPOINT_INTERVAL, PROP_POWER_CONSUMED};
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 0)
            .single()
            .expect("timestamp")
    }

    fn reading(source: &str, minute: u32, power: f64) -> SensorData {
        SensorData::new(source, ts(minute), "test-meter").with_f64(PROP_POWER_CONSUMED, power)
    }

    fn store_over(backend: Arc<MemoryBackend>) -> MeterStore {
        MeterStore::with_backend(backend, StoreConfig::memory())
    }

    #[tokio::test]
    async fn open_resolves_the_configured_backend() {
        let store = MeterStore::open(StoreConfig::memory()).await.expect("open");
        assert!(store.get_sources().await.expect("sources").is_empty());
    }

    #[tokio::test]
    async fn checkpoint_policy_throttles_backend_writes() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(backend.clone());
        let source = Source::new("meter-a", "owner", true)
            .with_f64(PROP_CACHE_CHECKPOINT_INTERVAL, 10.0);
        store.store_source(&source, false).await.expect("source");

        for minute in [0u32, 5, 12] {
            assert!(store
                .store_sensor_data(&reading("meter-a", minute, 1.0))
                .await
                .expect("store"));
        }

        // Only the checkpoint writes reached the backend.
        let durable = backend
            .get_sensor_data_index("meter-a")
            .await
            .expect("index");
        let durable_ts: Vec<_> = durable.iter().map(|r| r.timestamp).collect();
        assert_eq!(durable_ts, vec![ts(0), ts(12)]);
        assert_eq!(store.last_checkpoint("meter-a"), Some(ts(12)));

        // The merged view still exposes all three readings.
        let merged = store
            .get_sensor_data_index("meter-a")
            .await
            .expect("merged");
        assert_eq!(merged.len(), 3);
        for minute in [0u32, 5, 12] {
            assert!(store
                .has_sensor_data("meter-a", ts(minute))
                .await
                .expect("has"));
        }
    }

    #[tokio::test]
    async fn duplicate_writes_are_rejected_without_side_effects() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(backend.clone());
        store
            .store_source(&Source::new("meter-a", "owner", true), false)
            .await
            .expect("source");

        let data = reading("meter-a", 0, 100.0);
        assert!(store.store_sensor_data(&data).await.expect("first"));
        assert!(!store.store_sensor_data(&data).await.expect("second"));

        let fetched = store
            .get_sensor_data("meter-a", ts(0))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched.power_consumed(), Some(100.0));
    }

    #[tokio::test]
    async fn durable_duplicates_roll_the_cache_entry_back() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(backend.clone());
        store
            .store_source(&Source::new("meter-a", "owner", true), false)
            .await
            .expect("source");

        // Seed the backend directly, as if an earlier cache generation had
        // persisted this reading.
        let original = reading("meter-a", 0, 100.0);
        assert!(backend.store_sensor_data(&original).await.expect("seed"));

        let replay = reading("meter-a", 0, 999.0);
        assert!(!store.store_sensor_data(&replay).await.expect("replay"));
        let fetched = store
            .get_sensor_data("meter-a", ts(0))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched.power_consumed(), Some(100.0));
    }

    #[tokio::test]
    async fn merged_reads_prefer_cached_entries() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(backend.clone());

        assert!(backend
            .store_sensor_data(&reading("meter-a", 0, 1.0))
            .await
            .expect("durable"));
        assert!(store
            .store_sensor_data(&reading("meter-a", 5, 2.0))
            .await
            .expect("cached"));

        let all = store.get_all_sensor_datas("meter-a").await.expect("all");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].timestamp, ts(0));
        assert_eq!(all[1].timestamp, ts(5));

        let ranged = store
            .get_sensor_datas("meter-a", ts(0), ts(5))
            .await
            .expect("ranged");
        assert_eq!(ranged.len(), 2);

        let ranged_index = store
            .get_sensor_data_index_range("meter-a", ts(1), ts(5))
            .await
            .expect("index range");
        assert_eq!(ranged_index.len(), 1);
        assert_eq!(ranged_index[0].timestamp, ts(5));
    }

    #[tokio::test]
    async fn latest_spans_both_layers_and_skips_virtual_sources() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(backend.clone());
        store
            .store_source(&Source::new("meter-a", "owner", true), false)
            .await
            .expect("meter");
        store
            .store_source(
                &Source::new_virtual("campus", "owner", true, vec!["meter-a".to_string()]),
                false,
            )
            .await
            .expect("virtual");

        assert!(backend
            .store_sensor_data(&reading("meter-a", 0, 1.0))
            .await
            .expect("durable"));
        assert!(store
            .store_sensor_data(&reading("meter-a", 5, 2.0))
            .await
            .expect("cached"));

        let latest = store
            .get_latest_sensor_data("meter-a")
            .await
            .expect("latest")
            .expect("present");
        assert_eq!(latest.timestamp, ts(5));

        assert!(store
            .get_latest_sensor_data("campus")
            .await
            .expect("virtual latest")
            .is_none());
        assert!(store
            .get_latest_sensor_data("missing")
            .await
            .expect("unknown latest")
            .is_none());
    }

    #[tokio::test]
    async fn deleting_a_source_purges_both_layers() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(backend.clone());
        store
            .store_source(&Source::new("meter-a", "owner", true), false)
            .await
            .expect("source");
        assert!(store
            .store_sensor_data(&reading("meter-a", 0, 1.0))
            .await
            .expect("store"));

        assert!(store.delete_source("meter-a").await.expect("delete"));
        assert!(store
            .get_sensor_data_index("meter-a")
            .await
            .expect("index")
            .is_empty());
        assert!(store.last_checkpoint("meter-a").is_none());
    }

    #[tokio::test]
    async fn explicit_deletes_reach_both_layers() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(backend.clone());
        store
            .store_source(&Source::new("meter-a", "owner", true), false)
            .await
            .expect("source");
        assert!(store
            .store_sensor_data(&reading("meter-a", 0, 1.0))
            .await
            .expect("store"));

        assert!(store
            .delete_sensor_data("meter-a", ts(0))
            .await
            .expect("delete"));
        assert!(!store
            .has_sensor_data("meter-a", ts(0))
            .await
            .expect("has"));
        assert!(!backend
            .has_sensor_data("meter-a", ts(0))
            .await
            .expect("backend has"));
        assert!(!store
            .delete_sensor_data("meter-a", ts(0))
            .await
            .expect("redelete"));
    }

    #[tokio::test]
    async fn maintenance_runs_without_error() {
        let store = store_over(Arc::new(MemoryBackend::new()));
        store.perform_maintenance().await.expect("maintenance");
        store.index_tables().await.expect("index tables");
    }
}
