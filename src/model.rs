use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{StoreError, StoreResult};

pub const PROP_CARBON_INTENSITY: &str = "carbonIntensity";
pub const PROP_SUPPORTS_ENERGY_COUNTERS: &str = "supportsEnergyCounters";
pub const PROP_CACHE_CHECKPOINT_INTERVAL: &str = "cacheCheckpointInterval";
pub const PROP_UPDATE_INTERVAL: &str = "updateInterval";

pub const PROP_POWER_CONSUMED: &str = "powerConsumed";
pub const PROP_POWER_GENERATED: &str = "powerGenerated";
pub const PROP_ENERGY_CONSUMED_TO_DATE: &str = "energyConsumedToDate";
pub const PROP_ENERGY_GENERATED_TO_DATE: &str = "energyGeneratedToDate";

/// Derives the plain source name from a source reference, which may be a
/// bare name or a URI ending in the name.
pub fn source_name_of(reference: &str) -> &str {
    reference
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(reference)
}

/// Free-form key/value bag attached to sources and sensor data.
///
/// Numeric values may arrive as JSON numbers or as numeric strings; meter
/// polling tools serialize both, so the typed getters accept either.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(Map<String, JsonValue>);

impl Properties {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    pub fn set_f64(&mut self, key: &str, value: f64) {
        self.0.insert(key.to_string(), JsonValue::from(value));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.0.insert(key.to_string(), JsonValue::Bool(value));
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.0
            .insert(key.to_string(), JsonValue::String(value.to_string()));
    }

    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.0
    }
}

/// A named origin of energy readings. Virtual sources aggregate other
/// sources and carry no sensor data of their own; non-virtual sources are
/// physical meters and never have subsources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub owner: String,
    pub public: bool,
    #[serde(rename = "virtual")]
    pub virtual_: bool,
    #[serde(default)]
    pub subsources: Vec<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl Source {
    pub fn new(name: &str, owner: &str, public: bool) -> Self {
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            public,
            virtual_: false,
            subsources: Vec::new(),
            properties: Properties::new(),
        }
    }

    pub fn new_virtual(name: &str, owner: &str, public: bool, subsources: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            public,
            virtual_: true,
            subsources,
            properties: Properties::new(),
        }
    }

    pub fn with_f64(mut self, key: &str, value: f64) -> Self {
        self.properties.set_f64(key, value);
        self
    }

    pub fn with_bool(mut self, key: &str, value: bool) -> Self {
        self.properties.set_bool(key, value);
        self
    }

    /// Carbon intensity in lbs CO2 per MWh generated.
    pub fn carbon_intensity(&self) -> Option<f64> {
        self.properties.get_f64(PROP_CARBON_INTENSITY)
    }

    pub fn supports_energy_counters(&self) -> bool {
        self.properties
            .get_bool(PROP_SUPPORTS_ENERGY_COUNTERS)
            .unwrap_or(false)
    }

    /// Per-source checkpoint frequency in minutes, when configured.
    pub fn cache_checkpoint_interval(&self) -> Option<i64> {
        self.properties
            .get_f64(PROP_CACHE_CHECKPOINT_INTERVAL)
            .map(|v| v as i64)
    }

    /// Expected seconds between readings, when configured.
    pub fn update_interval(&self) -> Option<i64> {
        self.properties.get_f64(PROP_UPDATE_INTERVAL).map(|v| v as i64)
    }
}

/// One timestamped reading from a non-virtual source. Keyed by
/// (source, timestamp); immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    #[serde(default)]
    pub properties: Properties,
}

impl SensorData {
    pub fn new(source: &str, timestamp: DateTime<Utc>, tool: &str) -> Self {
        Self {
            source: source.to_string(),
            timestamp,
            tool: tool.to_string(),
            properties: Properties::new(),
        }
    }

    pub fn with_f64(mut self, key: &str, value: f64) -> Self {
        self.properties.set_f64(key, value);
        self
    }

    /// Plain source name behind this reading's source reference.
    pub fn source_name(&self) -> &str {
        source_name_of(&self.source)
    }

    pub fn power_consumed(&self) -> Option<f64> {
        self.properties.get_f64(PROP_POWER_CONSUMED)
    }

    pub fn power_generated(&self) -> Option<f64> {
        self.properties.get_f64(PROP_POWER_GENERATED)
    }
}

/// A pair of readings bracketing a timestamp of interest, used for linear
/// interpolation. `before.timestamp <= timestamp <= after.timestamp` always
/// holds; `before == after` marks an exact match.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDataStraddle {
    pub timestamp: DateTime<Utc>,
    pub before: SensorData,
    pub after: SensorData,
}

impl SensorDataStraddle {
    pub fn new(
        timestamp: DateTime<Utc>,
        before: SensorData,
        after: SensorData,
    ) -> StoreResult<Self> {
        if before.timestamp > after.timestamp
            || timestamp < before.timestamp
            || timestamp > after.timestamp
        {
            return Err(StoreError::InvalidStraddle { timestamp });
        }
        Ok(Self {
            timestamp,
            before,
            after,
        })
    }

    /// Straddle for an exact reading at the requested timestamp.
    pub fn degenerate(data: SensorData) -> Self {
        Self {
            timestamp: data.timestamp,
            before: data.clone(),
            after: data,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.before.timestamp == self.after.timestamp
    }

    /// Fractional position of the timestamp inside the bracket.
    fn fraction(&self) -> f64 {
        let span = (self.after.timestamp - self.before.timestamp).num_milliseconds();
        if span == 0 {
            return 0.0;
        }
        (self.timestamp - self.before.timestamp).num_milliseconds() as f64 / span as f64
    }

    /// Linearly interpolates a numeric property across the bracket. Returns
    /// `None` when either side lacks the property.
    pub fn interpolate(&self, key: &str) -> Option<f64> {
        let before = self.before.properties.get_f64(key)?;
        if self.is_degenerate() {
            return Some(before);
        }
        let after = self.after.properties.get_f64(key)?;
        Some(before + self.fraction() * (after - before))
    }
}

/// A source paired with one straddle per requested timestamp, in request
/// order. Used by the batched interpolation queries.
#[derive(Debug, Clone, PartialEq)]
pub struct StraddleList {
    pub source: String,
    pub straddles: Vec<SensorDataStraddle>,
}
