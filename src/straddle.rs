use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::manager::MeterStore;
use crate::model::{source_name_of, SensorData, SensorDataStraddle, Source, StraddleList};

/// Scans ascending readings for the bracketing pair around `timestamp`.
/// An exact match short-circuits to a degenerate straddle; a timestamp
/// outside the observed range yields `None` (no extrapolation).
pub fn straddle_in(datas: &[SensorData], timestamp: DateTime<Utc>) -> Option<SensorDataStraddle> {
    let mut before: Option<&SensorData> = None;
    for data in datas {
        if data.timestamp == timestamp {
            return Some(SensorDataStraddle::degenerate(data.clone()));
        }
        if data.timestamp < timestamp {
            before = Some(data);
        } else {
            let before = before?;
            return SensorDataStraddle::new(timestamp, before.clone(), data.clone()).ok();
        }
    }
    None
}

/// Straddle for a non-virtual source over the merged cache+backend view.
/// Absent for virtual, unknown, or empty sources.
pub async fn get_straddle(
    store: &MeterStore,
    source_name: &str,
    timestamp: DateTime<Utc>,
) -> StoreResult<Option<SensorDataStraddle>> {
    let Some(source) = store.get_source(source_name).await? else {
        return Ok(None);
    };
    if source.virtual_ {
        return Ok(None);
    }
    let datas = store.get_all_sensor_datas(source_name).await?;
    Ok(straddle_in(&datas, timestamp))
}

enum Frame {
    Enter(String),
    Exit(String),
}

/// Resolves every source reachable below `root` through subsource
/// references, in depth-first reference order. Absent references are
/// skipped; a source appearing under two branches is resolved once; a
/// reference back onto the expansion path is a `SourceCycle` error.
pub async fn get_all_subsources(store: &MeterStore, root: &Source) -> StoreResult<Vec<Source>> {
    let mut resolved = Vec::new();
    let mut done: HashSet<String> = HashSet::new();
    let mut on_path: HashSet<String> = HashSet::new();
    on_path.insert(root.name.clone());

    let mut stack: Vec<Frame> = root
        .subsources
        .iter()
        .rev()
        .map(|reference| Frame::Enter(source_name_of(reference).to_string()))
        .collect();

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Exit(name) => {
                on_path.remove(&name);
            }
            Frame::Enter(name) => {
                if on_path.contains(&name) {
                    return Err(StoreError::SourceCycle(name));
                }
                if !done.insert(name.clone()) {
                    continue;
                }
                let Some(source) = store.get_source(&name).await? else {
                    continue;
                };
                if source.virtual_ {
                    on_path.insert(name.clone());
                    stack.push(Frame::Exit(name));
                    for reference in source.subsources.iter().rev() {
                        stack.push(Frame::Enter(source_name_of(reference).to_string()));
                    }
                }
                resolved.push(source);
            }
        }
    }

    Ok(resolved)
}

/// The non-virtual leaves below a source. A non-virtual source is its own
/// single leaf.
pub async fn get_all_non_virtual_subsources(
    store: &MeterStore,
    source: &Source,
) -> StoreResult<Vec<Source>> {
    if !source.virtual_ {
        return Ok(vec![source.clone()]);
    }
    let all = get_all_subsources(store, source).await?;
    Ok(all.into_iter().filter(|s| !s.virtual_).collect())
}

/// One straddle per non-virtual leaf at `timestamp`. All-or-nothing: if any
/// leaf lacks a bracket, the whole result is absent.
pub async fn get_straddle_list(
    store: &MeterStore,
    source_name: &str,
    timestamp: DateTime<Utc>,
) -> StoreResult<Option<Vec<SensorDataStraddle>>> {
    let Some(source) = store.get_source(source_name).await? else {
        return Ok(None);
    };
    let leaves = get_all_non_virtual_subsources(store, &source).await?;
    if leaves.is_empty() {
        return Ok(None);
    }

    let mut straddles = Vec::with_capacity(leaves.len());
    for leaf in &leaves {
        let datas = store.get_all_sensor_datas(&leaf.name).await?;
        match straddle_in(&datas, timestamp) {
            Some(straddle) => straddles.push(straddle),
            None => return Ok(None),
        }
    }
    Ok(Some(straddles))
}

/// One `StraddleList` per non-virtual leaf covering every requested
/// timestamp, with the same all-or-nothing rule as `get_straddle_list`.
pub async fn get_straddle_lists(
    store: &MeterStore,
    source_name: &str,
    timestamps: &[DateTime<Utc>],
) -> StoreResult<Option<Vec<StraddleList>>> {
    if timestamps.is_empty() {
        return Ok(None);
    }
    let Some(source) = store.get_source(source_name).await? else {
        return Ok(None);
    };
    let leaves = get_all_non_virtual_subsources(store, &source).await?;
    if leaves.is_empty() {
        return Ok(None);
    }

    let mut lists = Vec::with_capacity(leaves.len());
    for leaf in &leaves {
        let datas = store.get_all_sensor_datas(&leaf.name).await?;
        let mut straddles = Vec::with_capacity(timestamps.len());
        for &timestamp in timestamps {
            match straddle_in(&datas, timestamp) {
                Some(straddle) => straddles.push(straddle),
                None => return Ok(None),
            }
        }
        lists.push(StraddleList {
            source: leaf.name.clone(),
            straddles,
        });
    }
    Ok(Some(lists))
}

/// The same batched straddles grouped the other way: one inner list per
/// requested timestamp, holding that instant's straddle for every
/// non-virtual leaf. Same all-or-nothing rule as `get_straddle_lists`.
pub async fn get_straddle_list_of_lists(
    store: &MeterStore,
    source_name: &str,
    timestamps: &[DateTime<Utc>],
) -> StoreResult<Option<Vec<Vec<SensorDataStraddle>>>> {
    let Some(lists) = get_straddle_lists(store, source_name, timestamps).await? else {
        return Ok(None);
    };

    let mut grouped: Vec<Vec<SensorDataStraddle>> = timestamps
        .iter()
        .map(|_| Vec::with_capacity(lists.len()))
        .collect();
    for list in lists {
        for (slot, straddle) in grouped.iter_mut().zip(list.straddles) {
            slot.push(straddle);
        }
    }
    Ok(Some(grouped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::StoreConfig;
    use crate::model::PROP_POWER_CONSUMED;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, secs)
            .single()
            .expect("timestamp")
    }

    fn test_store() -> MeterStore {
        MeterStore::with_backend(Arc::new(MemoryBackend::new()), StoreConfig::memory())
    }

    async fn seed_meter(store: &MeterStore, name: &str, readings: &[(u32, f64)]) {
        store
            .store_source(&Source::new(name, "owner", true), false)
            .await
            .expect("source");
        for &(secs, power) in readings {
            let data =
                SensorData::new(name, ts(secs), "test-meter").with_f64(PROP_POWER_CONSUMED, power);
            assert!(store.store_sensor_data(&data).await.expect("data"));
        }
    }

    #[test]
    fn straddle_in_finds_brackets_and_exact_matches() {
        let datas = vec![
            SensorData::new("m", ts(0), "t").with_f64(PROP_POWER_CONSUMED, 100.0),
            SensorData::new("m", ts(50), "t").with_f64(PROP_POWER_CONSUMED, 200.0),
        ];

        let bracket = straddle_in(&datas, ts(25)).expect("bracket");
        assert_eq!(bracket.before.timestamp, ts(0));
        assert_eq!(bracket.after.timestamp, ts(50));

        let exact = straddle_in(&datas, ts(50)).expect("exact");
        assert!(exact.is_degenerate());

        assert!(straddle_in(&datas, ts(51)).is_none());
        assert!(straddle_in(&[], ts(25)).is_none());
    }

    #[tokio::test]
    async fn straddle_is_absent_outside_the_observed_range() {
        let store = test_store();
        seed_meter(&store, "meter-a", &[(10, 100.0), (50, 200.0)]).await;

        assert!(store
            .get_straddle("meter-a", ts(5))
            .await
            .expect("early")
            .is_none());
        assert!(store
            .get_straddle("meter-a", ts(55))
            .await
            .expect("late")
            .is_none());
        assert!(store
            .get_straddle("meter-a", ts(30))
            .await
            .expect("inside")
            .is_some());
    }

    #[tokio::test]
    async fn straddle_is_absent_for_virtual_and_unknown_sources() {
        let store = test_store();
        store
            .store_source(
                &Source::new_virtual("campus", "owner", true, vec!["meter-a".to_string()]),
                false,
            )
            .await
            .expect("virtual");

        assert!(store
            .get_straddle("campus", ts(0))
            .await
            .expect("virtual straddle")
            .is_none());
        assert!(store
            .get_straddle("missing", ts(0))
            .await
            .expect("unknown straddle")
            .is_none());
    }

    #[tokio::test]
    async fn nested_virtual_sources_expand_to_leaves() {
        let store = test_store();
        seed_meter(&store, "meter-a", &[(0, 100.0), (50, 200.0)]).await;
        seed_meter(&store, "meter-b", &[(0, 10.0), (50, 20.0)]).await;
        store
            .store_source(
                &Source::new_virtual("floor", "owner", true, vec!["meter-b".to_string()]),
                false,
            )
            .await
            .expect("floor");
        store
            .store_source(
                &Source::new_virtual(
                    "campus",
                    "owner",
                    true,
                    vec!["meter-a".to_string(), "floor".to_string()],
                ),
                false,
            )
            .await
            .expect("campus");

        let campus = store
            .get_source("campus")
            .await
            .expect("get")
            .expect("present");
        let leaves = get_all_non_virtual_subsources(&store, &campus)
            .await
            .expect("leaves");
        let names: Vec<_> = leaves.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["meter-a", "meter-b"]);

        let straddles = store
            .get_straddle_list("campus", ts(25))
            .await
            .expect("list")
            .expect("present");
        assert_eq!(straddles.len(), 2);
    }

    #[tokio::test]
    async fn absent_subsource_references_are_skipped() {
        let store = test_store();
        seed_meter(&store, "meter-a", &[(0, 100.0), (50, 200.0)]).await;
        store
            .store_source(
                &Source::new_virtual(
                    "campus",
                    "owner",
                    true,
                    vec!["meter-a".to_string(), "ghost".to_string()],
                ),
                false,
            )
            .await
            .expect("campus");

        let campus = store
            .get_source("campus")
            .await
            .expect("get")
            .expect("present");
        let leaves = get_all_non_virtual_subsources(&store, &campus)
            .await
            .expect("leaves");
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].name, "meter-a");
    }

    #[tokio::test]
    async fn straddle_list_is_all_or_nothing() {
        let store = test_store();
        seed_meter(&store, "meter-a", &[(0, 100.0), (50, 200.0)]).await;
        // meter-b has no data bracketing ts(25).
        seed_meter(&store, "meter-b", &[(40, 10.0), (50, 20.0)]).await;
        store
            .store_source(
                &Source::new_virtual(
                    "campus",
                    "owner",
                    true,
                    vec!["meter-a".to_string(), "meter-b".to_string()],
                ),
                false,
            )
            .await
            .expect("campus");

        assert!(store
            .get_straddle_list("campus", ts(25))
            .await
            .expect("list")
            .is_none());
        assert!(store
            .get_straddle_list("campus", ts(45))
            .await
            .expect("list")
            .is_some());
    }

    #[tokio::test]
    async fn batched_straddle_lists_cover_all_timestamps() {
        let store = test_store();
        seed_meter(&store, "meter-a", &[(0, 100.0), (30, 150.0), (50, 200.0)]).await;
        store
            .store_source(
                &Source::new_virtual("campus", "owner", true, vec!["meter-a".to_string()]),
                false,
            )
            .await
            .expect("campus");

        let lists = store
            .get_straddle_lists("campus", &[ts(10), ts(30), ts(40)])
            .await
            .expect("lists")
            .expect("present");
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].source, "meter-a");
        assert_eq!(lists[0].straddles.len(), 3);
        assert!(lists[0].straddles[1].is_degenerate());

        // One timestamp out of range voids the batch.
        assert!(store
            .get_straddle_lists("campus", &[ts(10), ts(55)])
            .await
            .expect("lists")
            .is_none());
    }

    #[tokio::test]
    async fn timestamp_grouped_straddles_cover_all_leaves() {
        let store = test_store();
        seed_meter(&store, "meter-a", &[(0, 100.0), (50, 200.0)]).await;
        seed_meter(&store, "meter-b", &[(0, 10.0), (30, 15.0), (50, 20.0)]).await;
        store
            .store_source(
                &Source::new_virtual(
                    "campus",
                    "owner",
                    true,
                    vec!["meter-a".to_string(), "meter-b".to_string()],
                ),
                false,
            )
            .await
            .expect("campus");

        let grouped = store
            .get_straddle_list_of_lists("campus", &[ts(10), ts(30)])
            .await
            .expect("grouped")
            .expect("present");
        assert_eq!(grouped.len(), 2);
        for per_timestamp in &grouped {
            assert_eq!(per_timestamp.len(), 2);
        }
        assert_eq!(grouped[0][0].timestamp, ts(10));
        assert_eq!(grouped[0][1].timestamp, ts(10));
        assert_eq!(grouped[1][0].timestamp, ts(30));
        // meter-b has an exact reading at the second timestamp; meter-a does
        // not, so only its straddle is degenerate there.
        assert!(grouped[1][1].is_degenerate());
        assert!(!grouped[1][0].is_degenerate());

        // One timestamp out of range voids the whole batch.
        assert!(store
            .get_straddle_list_of_lists("campus", &[ts(10), ts(55)])
            .await
            .expect("grouped")
            .is_none());
    }

    #[tokio::test]
    async fn cyclic_composition_is_an_error() {
        let store = test_store();
        store
            .store_source(
                &Source::new_virtual("a", "owner", true, vec!["b".to_string()]),
                false,
            )
            .await
            .expect("a");
        store
            .store_source(
                &Source::new_virtual("b", "owner", true, vec!["a".to_string()]),
                false,
            )
            .await
            .expect("b");

        let a = store.get_source("a").await.expect("get").expect("present");
        let err = get_all_subsources(&store, &a).await.expect_err("cycle");
        assert!(matches!(err, StoreError::SourceCycle(_)));
    }

    #[tokio::test]
    async fn diamond_composition_counts_each_leaf_once() {
        let store = test_store();
        seed_meter(&store, "meter-a", &[(0, 100.0), (50, 200.0)]).await;
        store
            .store_source(
                &Source::new_virtual("left", "owner", true, vec!["meter-a".to_string()]),
                false,
            )
            .await
            .expect("left");
        store
            .store_source(
                &Source::new_virtual("right", "owner", true, vec!["meter-a".to_string()]),
                false,
            )
            .await
            .expect("right");
        store
            .store_source(
                &Source::new_virtual(
                    "top",
                    "owner",
                    true,
                    vec!["left".to_string(), "right".to_string()],
                ),
                false,
            )
            .await
            .expect("top");

        let top = store
            .get_source("top")
            .await
            .expect("get")
            .expect("present");
        let leaves = get_all_non_virtual_subsources(&store, &top)
            .await
            .expect("leaves");
        assert_eq!(leaves.len(), 1);
    }
}
