use chrono::{DateTime, Utc};

/// Errors surfaced by the storage and aggregation layers.
///
/// Expected absence (unknown source, no bracketing data, unpopulated ranges)
/// is `Ok(None)`, and duplicate-key stores are `Ok(false)`; only caller
/// misuse and backend faults become errors.
///
/// `Display`/`Error` are implemented by hand because the `CounterRollover`
/// variant carries a meter-source *name* in a field called `source`, which
/// thiserror's derive would otherwise treat as an error-source chain.
#[derive(Debug)]
pub enum StoreError {
    BadInterval {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    IntervalTooWide {
        interval_minutes: i64,
    },

    SourceCycle(String),

    CounterRollover {
        source: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    InvalidStraddle {
        timestamp: DateTime<Utc>,
    },

    Backend(sqlx::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::BadInterval { start, end } => {
                write!(f, "bad interval: start {start} is after end {end}")
            }
            StoreError::IntervalTooWide { interval_minutes } => write!(
                f,
                "sampling interval of {interval_minutes} minutes exceeds the requested range"
            ),
            StoreError::SourceCycle(source) => {
                write!(f, "virtual source cycle detected at {source}")
            }
            StoreError::CounterRollover { source, start, end } => write!(
                f,
                "energy counter rollover on source {source} between {start} and {end}"
            ),
            StoreError::InvalidStraddle { timestamp } => {
                write!(f, "straddle bracket does not contain timestamp {timestamp}")
            }
            StoreError::Backend(err) => write!(f, "backend failure: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
