use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::backend::SensorDataRef;
use crate::error::{StoreError, StoreResult};
use crate::model::SensorData;

#[derive(Debug, Clone)]
struct CachedEntry {
    data: SensorData,
    expires_at: DateTime<Utc>,
}

impl CachedEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Write-back cache for recent sensor data, plus the per-source checkpoint
/// timestamps that drive the persistence policy.
///
/// Entries expire after their window; expired entries are invisible to every
/// read and physically removed by `prune_expired`. Readings are sharded per
/// source so unrelated sources never contend.
///
/// Time is an explicit argument on the `_at` variants; the public wrappers
/// pass `Utc::now()`.
#[derive(Debug)]
pub struct EphemeralCache {
    default_window: Duration,
    entries: DashMap<String, BTreeMap<DateTime<Utc>, CachedEntry>>,
    checkpoints: DashMap<String, DateTime<Utc>>,
}

impl EphemeralCache {
    pub fn new(default_window_minutes: i64) -> Self {
        Self {
            default_window: Duration::minutes(default_window_minutes.max(1)),
            entries: DashMap::new(),
            checkpoints: DashMap::new(),
        }
    }

    fn window(&self, window_minutes: i64) -> Duration {
        if window_minutes > 0 {
            Duration::minutes(window_minutes)
        } else {
            self.default_window
        }
    }

    /// Insert-if-absent. A live entry at the key fails the store; an expired
    /// leftover at the key is replaced.
    pub fn store_sensor_data(&self, data: &SensorData, window_minutes: i64) -> bool {
        self.store_sensor_data_at(data, window_minutes, Utc::now())
    }

    pub(crate) fn store_sensor_data_at(
        &self,
        data: &SensorData,
        window_minutes: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let mut per_source = self.entries.entry(data.source_name().to_string()).or_default();
        if per_source
            .get(&data.timestamp)
            .is_some_and(|entry| entry.is_live(now))
        {
            return false;
        }
        per_source.insert(
            data.timestamp,
            CachedEntry {
                data: data.clone(),
                expires_at: now + self.window(window_minutes),
            },
        );
        true
    }

    /// Whether a write at `timestamp` must also reach the durable backend.
    ///
    /// In order: a non-positive frequency always persists; a source with no
    /// prior checkpoint persists (bootstraps the checkpoint); retroactive
    /// data older than the last checkpoint always flows through; otherwise
    /// the write persists only once the checkpoint window has elapsed.
    pub fn should_persist(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
        checkpoint_frequency_minutes: i64,
    ) -> bool {
        if checkpoint_frequency_minutes <= 0 {
            return true;
        }
        let Some(checkpoint) = self.checkpoints.get(source) else {
            return true;
        };
        if timestamp < *checkpoint {
            return true;
        }
        timestamp >= *checkpoint + Duration::minutes(checkpoint_frequency_minutes)
    }

    /// Records a durable write. Monotonic: retroactive writes never move the
    /// checkpoint backwards.
    pub fn record_checkpoint(&self, source: &str, timestamp: DateTime<Utc>) {
        self.checkpoints
            .entry(source.to_string())
            .and_modify(|current| {
                if timestamp > *current {
                    *current = timestamp;
                }
            })
            .or_insert(timestamp);
    }

    /// Maintenance accessor for a source's last checkpoint timestamp.
    pub fn last_checkpoint(&self, source: &str) -> Option<DateTime<Utc>> {
        self.checkpoints.get(source).map(|entry| *entry)
    }

    pub fn get_sensor_data(&self, source: &str, timestamp: DateTime<Utc>) -> Option<SensorData> {
        self.get_sensor_data_at(source, timestamp, Utc::now())
    }

    pub(crate) fn get_sensor_data_at(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<SensorData> {
        self.entries.get(source).and_then(|per_source| {
            per_source
                .get(&timestamp)
                .filter(|entry| entry.is_live(now))
                .map(|entry| entry.data.clone())
        })
    }

    pub fn has_sensor_data(&self, source: &str, timestamp: DateTime<Utc>) -> bool {
        self.get_sensor_data(source, timestamp).is_some()
    }

    pub fn get_sensor_data_index(&self, source: &str) -> Vec<SensorDataRef> {
        let now = Utc::now();
        self.entries
            .get(source)
            .map(|per_source| {
                per_source
                    .values()
                    .filter(|entry| entry.is_live(now))
                    .map(|entry| SensorDataRef::from(&entry.data))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_sensor_data_index_range(
        &self,
        source: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorDataRef>> {
        if start > end {
            return Err(StoreError::BadInterval { start, end });
        }
        let now = Utc::now();
        Ok(self
            .entries
            .get(source)
            .map(|per_source| {
                per_source
                    .range(start..=end)
                    .filter(|(_, entry)| entry.is_live(now))
                    .map(|(_, entry)| SensorDataRef::from(&entry.data))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn get_sensor_datas(
        &self,
        source: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<SensorData>> {
        if start > end {
            return Err(StoreError::BadInterval { start, end });
        }
        let now = Utc::now();
        Ok(self
            .entries
            .get(source)
            .map(|per_source| {
                per_source
                    .range(start..=end)
                    .filter(|(_, entry)| entry.is_live(now))
                    .map(|(_, entry)| entry.data.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn get_all_sensor_datas(&self, source: &str) -> Vec<SensorData> {
        let now = Utc::now();
        self.entries
            .get(source)
            .map(|per_source| {
                per_source
                    .values()
                    .filter(|entry| entry.is_live(now))
                    .map(|entry| entry.data.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_latest_sensor_data(&self, source: &str) -> Option<SensorData> {
        let now = Utc::now();
        self.entries.get(source).and_then(|per_source| {
            per_source
                .values()
                .rev()
                .find(|entry| entry.is_live(now))
                .map(|entry| entry.data.clone())
        })
    }

    /// Explicit deletes purge immediately rather than waiting for expiry.
    /// Reports whether a live entry was removed.
    pub fn delete_sensor_data(&self, source: &str, timestamp: DateTime<Utc>) -> bool {
        let now = Utc::now();
        let Some(mut per_source) = self.entries.get_mut(source) else {
            return false;
        };
        per_source
            .remove(&timestamp)
            .is_some_and(|entry| entry.is_live(now))
    }

    pub fn delete_all_sensor_data(&self, source: &str) {
        self.entries.remove(source);
    }

    /// Removes the source's cached data and its checkpoint. Used when the
    /// source itself is deleted.
    pub fn purge_source(&self, source: &str) {
        self.entries.remove(source);
        self.checkpoints.remove(source);
    }

    pub fn prune_expired(&self) {
        self.prune_expired_at(Utc::now());
    }

    pub(crate) fn prune_expired_at(&self, now: DateTime<Utc>) {
        self.entries.retain(|_, per_source| {
            per_source.retain(|_, entry| entry.is_live(now));
            !per_source.is_empty()
        });
    }

    pub fn wipe(&self) {
        self.entries.clear();
        self.checkpoints.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 0)
            .single()
            .expect("timestamp")
    }

    fn reading(minute: u32) -> SensorData {
        SensorData::new("meter-a", ts(minute), "test-meter")
            .with_f64(crate::model::PROP_POWER_CONSUMED, minute as f64)
    }

    #[test]
    fn duplicate_live_entries_are_rejected() {
        let cache = EphemeralCache::new(60);
        let now = ts(0);
        assert!(cache.store_sensor_data_at(&reading(0), 0, now));
        assert!(!cache.store_sensor_data_at(&reading(0), 0, now));
    }

    #[test]
    fn expired_entries_are_invisible_and_replaceable() {
        let cache = EphemeralCache::new(60);
        let written_at = ts(0);
        assert!(cache.store_sensor_data_at(&reading(0), 5, written_at));

        let before_expiry = ts(4);
        assert!(cache
            .get_sensor_data_at("meter-a", ts(0), before_expiry)
            .is_some());

        let after_expiry = ts(10);
        assert!(cache
            .get_sensor_data_at("meter-a", ts(0), after_expiry)
            .is_none());
        // The slot is free again once the original entry has expired.
        assert!(cache.store_sensor_data_at(&reading(0), 5, after_expiry));
    }

    #[test]
    fn prune_drops_expired_entries() {
        let cache = EphemeralCache::new(60);
        cache.store_sensor_data_at(&reading(0), 5, ts(0));
        cache.store_sensor_data_at(&reading(30), 60, ts(30));

        cache.prune_expired_at(ts(31));
        assert!(cache
            .get_sensor_data_at("meter-a", ts(0), ts(31))
            .is_none());
        assert!(cache
            .get_sensor_data_at("meter-a", ts(30), ts(31))
            .is_some());
    }

    #[test]
    fn should_persist_policy_rules() {
        let cache = EphemeralCache::new(60);

        // Non-positive frequency always persists.
        cache.record_checkpoint("meter-a", ts(10));
        assert!(cache.should_persist("meter-a", ts(11), 0));
        assert!(cache.should_persist("meter-a", ts(11), -5));

        // No prior checkpoint bootstraps.
        assert!(cache.should_persist("meter-b", ts(0), 10));

        // Retroactive data always flows through.
        assert!(cache.should_persist("meter-a", ts(5), 10));

        // Within the window: held back; at/after the window edge: persisted.
        assert!(!cache.should_persist("meter-a", ts(15), 10));
        assert!(cache.should_persist("meter-a", ts(20), 10));
        assert!(cache.should_persist("meter-a", ts(25), 10));
    }

    #[test]
    fn checkpoints_never_move_backwards() {
        let cache = EphemeralCache::new(60);
        cache.record_checkpoint("meter-a", ts(20));
        cache.record_checkpoint("meter-a", ts(5));
        assert_eq!(cache.last_checkpoint("meter-a"), Some(ts(20)));
    }

    #[test]
    fn explicit_delete_purges_immediately() {
        let cache = EphemeralCache::new(60);
        cache.store_sensor_data(&reading(0), 0);
        assert!(cache.delete_sensor_data("meter-a", ts(0)));
        assert!(!cache.has_sensor_data("meter-a", ts(0)));
        assert!(!cache.delete_sensor_data("meter-a", ts(0)));
    }

    #[test]
    fn index_and_latest_reads() {
        let cache = EphemeralCache::new(60);
        for minute in [30u32, 5, 50] {
            cache.store_sensor_data(&reading(minute), 0);
        }

        let index = cache.get_sensor_data_index("meter-a");
        let timestamps: Vec<_> = index.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![ts(5), ts(30), ts(50)]);

        let ranged = cache
            .get_sensor_data_index_range("meter-a", ts(5), ts(30))
            .expect("range");
        assert_eq!(ranged.len(), 2);
        assert!(cache
            .get_sensor_data_index_range("meter-a", ts(30), ts(5))
            .is_err());

        let latest = cache.get_latest_sensor_data("meter-a").expect("latest");
        assert_eq!(latest.timestamp, ts(50));
    }
}
