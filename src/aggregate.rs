use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::{StoreError, StoreResult};
use crate::manager::MeterStore;
use crate::model::{
    SensorDataStraddle, Source, PROP_ENERGY_CONSUMED_TO_DATE, PROP_ENERGY_GENERATED_TO_DATE,
    PROP_POWER_CONSUMED, PROP_POWER_GENERATED,
};
use crate::straddle::{get_all_non_virtual_subsources, get_straddle_list, straddle_in};

/// Instantaneous power at a point in time, in watts. `interpolated` is set
/// unless every contributing reading landed exactly on the requested
/// timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerReading {
    pub consumed_w: f64,
    pub generated_w: f64,
    pub interpolated: bool,
}

/// Energy over an interval, in watt-hours.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyReading {
    pub consumed_wh: f64,
    pub generated_wh: f64,
    pub interpolated: bool,
}

/// Carbon emitted over an interval, in lbs CO2.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CarbonReading {
    pub emitted_lbs: f64,
    pub interpolated: bool,
}

/// Power at `timestamp`, summed across the source's non-virtual leaves.
/// Absent when the source is unknown or any leaf lacks a bracket.
pub async fn get_power(
    store: &MeterStore,
    source_name: &str,
    timestamp: DateTime<Utc>,
) -> StoreResult<Option<PowerReading>> {
    let Some(straddles) = get_straddle_list(store, source_name, timestamp).await? else {
        return Ok(None);
    };

    let mut reading = PowerReading {
        consumed_w: 0.0,
        generated_w: 0.0,
        interpolated: false,
    };
    for straddle in &straddles {
        reading.consumed_w += straddle.interpolate(PROP_POWER_CONSUMED).unwrap_or(0.0);
        reading.generated_w += straddle.interpolate(PROP_POWER_GENERATED).unwrap_or(0.0);
        reading.interpolated |= !straddle.is_degenerate();
    }
    Ok(Some(reading))
}

/// Energy over `[start, end]`, summed across the source's non-virtual
/// leaves. Leaves that export lifetime energy counters are measured by
/// counter difference; the rest are numerically integrated from power
/// samples taken every `sampling_interval_minutes` (0 divides the range
/// into ten steps). Absent when the source is unknown or any leaf cannot
/// cover the interval.
pub async fn get_energy(
    store: &MeterStore,
    source_name: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    sampling_interval_minutes: i64,
) -> StoreResult<Option<EnergyReading>> {
    if start > end {
        return Err(StoreError::BadInterval { start, end });
    }
    let range_minutes = (end - start).num_minutes();
    if sampling_interval_minutes > range_minutes {
        return Err(StoreError::IntervalTooWide {
            interval_minutes: sampling_interval_minutes,
        });
    }

    let Some(source) = store.get_source(source_name).await? else {
        return Ok(None);
    };
    let leaves = get_all_non_virtual_subsources(store, &source).await?;
    if leaves.is_empty() {
        return Ok(None);
    }

    let mut total = EnergyReading {
        consumed_wh: 0.0,
        generated_wh: 0.0,
        interpolated: false,
    };
    for leaf in &leaves {
        let Some(reading) =
            leaf_energy(store, leaf, start, end, sampling_interval_minutes).await?
        else {
            return Ok(None);
        };
        total.consumed_wh += reading.consumed_wh;
        total.generated_wh += reading.generated_wh;
        total.interpolated |= reading.interpolated;
    }
    Ok(Some(total))
}

/// Carbon emitted over `[start, end]`: each leaf's generated energy times
/// its configured carbon intensity (lbs CO2 per MWh). Absent when the
/// source is unknown, any leaf cannot cover the interval, or any leaf lacks
/// a carbon intensity.
pub async fn get_carbon(
    store: &MeterStore,
    source_name: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    sampling_interval_minutes: i64,
) -> StoreResult<Option<CarbonReading>> {
    if start > end {
        return Err(StoreError::BadInterval { start, end });
    }
    let range_minutes = (end - start).num_minutes();
    if sampling_interval_minutes > range_minutes {
        return Err(StoreError::IntervalTooWide {
            interval_minutes: sampling_interval_minutes,
        });
    }

    let Some(source) = store.get_source(source_name).await? else {
        return Ok(None);
    };
    let leaves = get_all_non_virtual_subsources(store, &source).await?;
    if leaves.is_empty() {
        return Ok(None);
    }

    let mut total = CarbonReading {
        emitted_lbs: 0.0,
        interpolated: false,
    };
    for leaf in &leaves {
        let Some(intensity) = leaf.carbon_intensity() else {
            return Ok(None);
        };
        let Some(energy) =
            leaf_energy(store, leaf, start, end, sampling_interval_minutes).await?
        else {
            return Ok(None);
        };
        total.emitted_lbs += energy.generated_wh / 1_000_000.0 * intensity;
        total.interpolated |= energy.interpolated;
    }
    Ok(Some(total))
}

async fn leaf_energy(
    store: &MeterStore,
    leaf: &Source,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    sampling_interval_minutes: i64,
) -> StoreResult<Option<EnergyReading>> {
    let datas = store.get_all_sensor_datas(&leaf.name).await?;
    let Some(start_straddle) = straddle_in(&datas, start) else {
        return Ok(None);
    };
    let Some(end_straddle) = straddle_in(&datas, end) else {
        return Ok(None);
    };

    if leaf.supports_energy_counters() {
        return counter_energy(&leaf.name, &start_straddle, &end_straddle);
    }

    let timestamps = sample_timestamps(start, end, sampling_interval_minutes);
    let mut straddles = Vec::with_capacity(timestamps.len());
    for &timestamp in &timestamps {
        match straddle_in(&datas, timestamp) {
            Some(straddle) => straddles.push(straddle),
            None => return Ok(None),
        }
    }
    Ok(Some(integrate_power(&timestamps, &straddles)))
}

/// Energy as the difference of lifetime counters interpolated at the
/// interval endpoints. A counter that decreases across the interval is a
/// hardware fault and reported as `CounterRollover` rather than folded into
/// a negative energy.
fn counter_energy(
    source: &str,
    start_straddle: &SensorDataStraddle,
    end_straddle: &SensorDataStraddle,
) -> StoreResult<Option<EnergyReading>> {
    let consumed = counter_delta(source, start_straddle, end_straddle, PROP_ENERGY_CONSUMED_TO_DATE)?;
    let generated =
        counter_delta(source, start_straddle, end_straddle, PROP_ENERGY_GENERATED_TO_DATE)?;
    if consumed.is_none() && generated.is_none() {
        return Ok(None);
    }
    Ok(Some(EnergyReading {
        consumed_wh: consumed.unwrap_or(0.0),
        generated_wh: generated.unwrap_or(0.0),
        interpolated: !(start_straddle.is_degenerate() && end_straddle.is_degenerate()),
    }))
}

fn counter_delta(
    source: &str,
    start_straddle: &SensorDataStraddle,
    end_straddle: &SensorDataStraddle,
    key: &str,
) -> StoreResult<Option<f64>> {
    let (Some(at_start), Some(at_end)) =
        (start_straddle.interpolate(key), end_straddle.interpolate(key))
    else {
        return Ok(None);
    };
    if at_end < at_start {
        return Err(StoreError::CounterRollover {
            source: source.to_string(),
            start: start_straddle.timestamp,
            end: end_straddle.timestamp,
        });
    }
    Ok(Some(at_end - at_start))
}

/// Sample points covering `[start, end]`, always including both endpoints.
/// A zero interval divides the range into ten equal steps.
pub(crate) fn sample_timestamps(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval_minutes: i64,
) -> Vec<DateTime<Utc>> {
    let step = if interval_minutes > 0 {
        Duration::minutes(interval_minutes)
    } else {
        (end - start) / 10
    };
    if step <= Duration::zero() {
        return vec![start, end];
    }

    let mut timestamps = Vec::new();
    let mut t = start;
    while t < end {
        timestamps.push(t);
        t += step;
    }
    timestamps.push(end);
    timestamps
}

/// Trapezoidal integration of interpolated power across the sample points.
fn integrate_power(
    timestamps: &[DateTime<Utc>],
    straddles: &[SensorDataStraddle],
) -> EnergyReading {
    let mut reading = EnergyReading {
        consumed_wh: 0.0,
        generated_wh: 0.0,
        interpolated: false,
    };
    for window in 0..timestamps.len().saturating_sub(1) {
        let dt_hours =
            (timestamps[window + 1] - timestamps[window]).num_milliseconds() as f64 / 3_600_000.0;
        let (left, right) = (&straddles[window], &straddles[window + 1]);
        let consumed_left = left.interpolate(PROP_POWER_CONSUMED).unwrap_or(0.0);
        let consumed_right = right.interpolate(PROP_POWER_CONSUMED).unwrap_or(0.0);
        let generated_left = left.interpolate(PROP_POWER_GENERATED).unwrap_or(0.0);
        let generated_right = right.interpolate(PROP_POWER_GENERATED).unwrap_or(0.0);
        reading.consumed_wh += (consumed_left + consumed_right) / 2.0 * dt_hours;
        reading.generated_wh += (generated_left + generated_right) / 2.0 * dt_hours;
    }
    reading.interpolated = straddles.iter().any(|s| !s.is_degenerate());
    reading
}
