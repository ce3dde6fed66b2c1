use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use std::time::Duration;

use crate::backend::{SensorDataRef, StorageBackend};
use crate::error::{StoreError, StoreResult};
use crate::model::{Properties, SensorData, Source};

/// Postgres-backed storage. Insert-if-absent is delegated to the database
/// via `ON CONFLICT DO NOTHING`, so concurrent writers for the same key are
/// serialized by the unique constraint rather than any in-process lock.
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(8))
            .connect_lazy(database_url)
            .with_context(|| format!("Failed to create lazy database pool for {database_url}"))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn trace_err(op: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| {
        tracing::warn!(error = %err, op, "postgres backend operation failed");
        StoreError::Backend(err)
    }
}

#[derive(sqlx::FromRow)]
struct SourceRow {
    name: String,
    owner_ref: String,
    is_public: bool,
    is_virtual: bool,
    subsources: SqlJson<Vec<String>>,
    properties: SqlJson<Properties>,
}

impl From<SourceRow> for Source {
    fn from(row: SourceRow) -> Self {
        Source {
            name: row.name,
            owner: row.owner_ref,
            public: row.is_public,
            virtual_: row.is_virtual,
            subsources: row.subsources.0,
            properties: row.properties.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SensorDataRow {
    source: String,
    ts: DateTime<Utc>,
    tool: String,
    properties: SqlJson<Properties>,
}

impl From<SensorDataRow> for SensorData {
    fn from(row: SensorDataRow) -> Self {
        SensorData {
            source: row.source,
            timestamp: row.ts,
            tool: row.tool,
            properties: row.properties.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SensorDataRefRow {
    source: String,
    ts: DateTime<Utc>,
    tool: String,
}

impl From<SensorDataRefRow> for SensorDataRef {
    fn from(row: SensorDataRefRow) -> Self {
        SensorDataRef {
            source: row.source,
            timestamp: row.ts,
            tool: row.tool,
        }
    }
}

#[async_trait]
impl StorageBackend for PgBackend {
    async fn initialize(&self, wipe: bool) -> StoreResult<()> {
        if wipe {
            sqlx::query("DROP TABLE IF EXISTS sensor_data")
                .execute(&self.pool)
                .await
                .map_err(trace_err("initialize"))?;
            sqlx::query("DROP TABLE IF EXISTS sources")
                .execute(&self.pool)
                .await
                .map_err(trace_err("initialize"))?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                name text PRIMARY KEY,
                owner_ref text NOT NULL DEFAULT '',
                is_public boolean NOT NULL DEFAULT false,
                is_virtual boolean NOT NULL DEFAULT false,
                subsources jsonb NOT NULL DEFAULT '[]'::jsonb,
                properties jsonb NOT NULL DEFAULT '{}'::jsonb,
                created_at timestamptz NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(trace_err("initialize"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensor_data (
                source text NOT NULL,
                ts timestamptz NOT NULL,
                tool text NOT NULL DEFAULT '',
                properties jsonb NOT NULL DEFAULT '{}'::jsonb,
                PRIMARY KEY (source, ts)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(trace_err("initialize"))?;

        Ok(())
    }

    async fn store_source(&self, source: &Source, overwrite: bool) -> StoreResult<bool> {
        let conflict_action = if overwrite {
            r#"
            ON CONFLICT (name) DO UPDATE
              SET owner_ref = EXCLUDED.owner_ref,
                  is_public = EXCLUDED.is_public,
                  is_virtual = EXCLUDED.is_virtual,
                  subsources = EXCLUDED.subsources,
                  properties = EXCLUDED.properties
            "#
        } else {
            "ON CONFLICT (name) DO NOTHING"
        };
        let query = format!(
            r#"
            INSERT INTO sources (name, owner_ref, is_public, is_virtual, subsources, properties)
            VALUES ($1, $2, $3, $4, $5, $6)
            {conflict_action}
            "#,
        );

        let result = sqlx::query(&query)
            .bind(&source.name)
            .bind(&source.owner)
            .bind(source.public)
            .bind(source.virtual_)
            .bind(SqlJson(&source.subsources))
            .bind(SqlJson(&source.properties))
            .execute(&self.pool)
            .await
            .map_err(trace_err("store_source"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_source(&self, name: &str) -> StoreResult<Option<Source>> {
        let row: Option<SourceRow> = sqlx::query_as(
            "SELECT name, owner_ref, is_public, is_virtual, subsources, properties
             FROM sources WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(trace_err("get_source"))?;

        Ok(row.map(Source::from))
    }

    async fn get_sources(&self) -> StoreResult<Vec<Source>> {
        let rows: Vec<SourceRow> = sqlx::query_as(
            "SELECT name, owner_ref, is_public, is_virtual, subsources, properties
             FROM sources ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(trace_err("get_sources"))?;

        Ok(rows.into_iter().map(Source::from).collect())
    }

    async fn delete_source(&self, name: &str) -> StoreResult<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(trace_err("delete_source"))?;
        sqlx::query("DELETE FROM sensor_data WHERE source = $1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(trace_err("delete_source"))?;
        let result = sqlx::query("DELETE FROM sources WHERE name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(trace_err("delete_source"))?;
        tx.commit().await.map_err(trace_err("delete_source"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn store_sensor_data(&self, data: &SensorData) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sensor_data (source, ts, tool, properties)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source, ts) DO NOTHING
            "#,
        )
        .bind(data.source_name())
        .bind(data.timestamp)
        .bind(&data.tool)
        .bind(SqlJson(&data.properties))
        .execute(&self.pool)
        .await
        .map_err(trace_err("store_sensor_data"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_sensor_data(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<Option<SensorData>> {
        let row: Option<SensorDataRow> = sqlx::query_as(
            "SELECT source, ts, tool, properties FROM sensor_data
             WHERE source = $1 AND ts = $2",
        )
        .bind(source)
        .bind(timestamp)
        .fetch_optional(&self.pool)
        .await
        .map_err(trace_err("get_sensor_data"))?;

        Ok(row.map(SensorData::from))
    }

    async fn delete_sensor_data(
        &self,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM sensor_data WHERE source = $1 AND ts = $2")
            .bind(source)
            .bind(timestamp)
            .execute(&self.pool)
            .await
            .map_err(trace_err("delete_sensor_data"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_all_sensor_data(&self, source: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM sensor_data WHERE source = $1")
            .bind(source)
            .execute(&self.pool)
            .await
            .map_err(trace_err("delete_all_sensor_data"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_sensor_data_index(&self, source: &str) -> StoreResult<Vec<SensorDataRef>> {
        let rows: Vec<SensorDataRefRow> = sqlx::query_as(
            "SELECT source, ts, tool FROM sensor_data WHERE source = $1 ORDER BY ts ASC",
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await
        .map_err(trace_err("get_sensor_data_index"))?;

        Ok(rows.into_iter().map(SensorDataRef::from).collect())
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
        let rows: Vec<SensorDataRefRow> = sqlx::query_as(
            "SELECT source, ts, tool FROM sensor_data
             WHERE source = $1 AND ts >= $2 AND ts <= $3 ORDER BY ts ASC",
        )
        .bind(source)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(trace_err("get_sensor_data_index_range"))?;

        Ok(rows.into_iter().map(SensorDataRef::from).collect())
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
        let rows: Vec<SensorDataRow> = sqlx::query_as(
            "SELECT source, ts, tool, properties FROM sensor_data
             WHERE source = $1 AND ts >= $2 AND ts <= $3 ORDER BY ts ASC",
        )
        .bind(source)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(trace_err("get_sensor_datas"))?;

        Ok(rows.into_iter().map(SensorData::from).collect())
    }

    async fn get_all_sensor_datas(&self, source: &str) -> StoreResult<Vec<SensorData>> {
        let rows: Vec<SensorDataRow> = sqlx::query_as(
            "SELECT source, ts, tool, properties FROM sensor_data
             WHERE source = $1 ORDER BY ts ASC",
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await
        .map_err(trace_err("get_all_sensor_datas"))?;

        Ok(rows.into_iter().map(SensorData::from).collect())
    }

    async fn get_latest_non_virtual_sensor_data(
        &self,
        source: &str,
    ) -> StoreResult<Option<SensorData>> {
        let Some(found) = self.get_source(source).await? else {
            return Ok(None);
        };
        if found.virtual_ {
            return Ok(None);
        }

        let row: Option<SensorDataRow> = sqlx::query_as(
            "SELECT source, ts, tool, properties FROM sensor_data
             WHERE source = $1 ORDER BY ts DESC LIMIT 1",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await
        .map_err(trace_err("get_latest_non_virtual_sensor_data"))?;

        Ok(row.map(SensorData::from))
    }

    async fn perform_maintenance(&self) -> StoreResult<()> {
        sqlx::query("ANALYZE sensor_data")
            .execute(&self.pool)
            .await
            .map_err(trace_err("perform_maintenance"))?;
        sqlx::query("ANALYZE sources")
            .execute(&self.pool)
            .await
            .map_err(trace_err("perform_maintenance"))?;
        Ok(())
    }

    async fn index_tables(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS sensor_data_source_ts_idx
             ON sensor_data (source, ts DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(trace_err("index_tables"))?;
        Ok(())
    }
}
