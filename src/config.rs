use anyhow::Result;

pub const BACKEND_MEMORY: &str = "memory";
pub const BACKEND_POSTGRES: &str = "postgres";

const DEFAULT_CACHE_WINDOW_MINUTES: i64 = 60;
const DEFAULT_CHECKPOINT_INTERVAL_MINUTES: i64 = 10;

/// Runtime configuration for the store, resolved once at startup.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Storage backend name, resolved through the backend registry.
    pub backend: String,
    /// Connection string for SQL-backed backends.
    pub database_url: Option<String>,
    /// Discard all persisted data during initialization.
    pub wipe_on_start: bool,
    /// Default time-to-live for cached sensor data, in minutes.
    pub cache_window_minutes: i64,
    /// Default checkpoint frequency for the write-back policy, in minutes.
    /// A source's `cacheCheckpointInterval` property overrides this.
    pub checkpoint_interval_minutes: i64,
}

impl StoreConfig {
    /// In-process configuration with no external dependencies.
    pub fn memory() -> Self {
        Self {
            backend: BACKEND_MEMORY.to_string(),
            database_url: None,
            wipe_on_start: false,
            cache_window_minutes: DEFAULT_CACHE_WINDOW_MINUTES,
            checkpoint_interval_minutes: DEFAULT_CHECKPOINT_INTERVAL_MINUTES,
        }
    }

    pub fn from_env() -> Result<Self> {
        let backend = env_string("METERSTORE_BACKEND", BACKEND_MEMORY).to_lowercase();
        let database_url =
            env_optional_string("METERSTORE_DATABASE_URL").map(normalize_database_url);
        if backend == BACKEND_POSTGRES && database_url.is_none() {
            anyhow::bail!(
                "METERSTORE_DATABASE_URL must be set when METERSTORE_BACKEND=postgres"
            );
        }

        let wipe_on_start = env_bool("METERSTORE_WIPE_ON_START", false);
        let cache_window_minutes =
            env_i64("METERSTORE_CACHE_WINDOW_MINUTES", DEFAULT_CACHE_WINDOW_MINUTES).max(1);
        let checkpoint_interval_minutes = env_i64(
            "METERSTORE_CHECKPOINT_INTERVAL_MINUTES",
            DEFAULT_CHECKPOINT_INTERVAL_MINUTES,
        );

        Ok(Self {
            backend,
            database_url,
            wipe_on_start,
            cache_window_minutes,
            checkpoint_interval_minutes,
        })
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::memory()
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key)
        .ok()
        .map(|value| value.trim().to_lowercase())
    {
        Some(value) if value == "1" || value == "true" || value == "yes" => true,
        Some(value) if value == "0" || value == "false" || value == "no" => false,
        _ => default,
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
