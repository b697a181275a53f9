//! Persistence for the append-only `detail` table.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tdl_core::{DetailTable, ReportRecord};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

pub const CRATE_NAME: &str = "tdl-storage";

pub const DETAIL_TABLE: &str = "detail";

const COLUMNS_PER_ROW: usize = 5;

/// Postgres caps one statement at 65 535 bind parameters, so a single
/// multi-row INSERT holds at most this many rows.
pub const MAX_ROWS_PER_INSERT: usize = u16::MAX as usize / COLUMNS_PER_ROW;

/// Mirrors the columns a dataframe append would create for a report batch.
pub const CREATE_DETAIL_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS detail (
    "id"      BIGINT      NOT NULL,
    "start"   TIMESTAMPTZ NOT NULL,
    "end"     TIMESTAMPTZ,
    "updated" TIMESTAMPTZ,
    "fields"  JSONB       NOT NULL DEFAULT '{}'::jsonb
)
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("batch of {rows} rows exceeds the {max} rows one INSERT can bind")]
    BatchTooLarge { rows: usize, max: usize },
}

/// Where normalized report rows end up. Implementations append and never rewrite.
#[async_trait]
pub trait DetailStore: Send + Sync {
    async fn stored_ids(&self) -> Result<HashSet<i64>, StoreError>;

    /// Appends every row unconditionally and returns the number written.
    async fn append(&self, table: &DetailTable) -> Result<u64, StoreError>;

    async fn row_count(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgDetailStore {
    pool: PgPool,
}

impl PgDetailStore {
    /// Opens the single shared connection used for the whole run.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self { pool })
    }

    pub async fn ensure_table(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_DETAIL_TABLE_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DetailStore for PgDetailStore {
    async fn stored_ids(&self) -> Result<HashSet<i64>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(r#"SELECT "id" FROM detail"#)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn append(&self, table: &DetailTable) -> Result<u64, StoreError> {
        if table.is_empty() {
            return Ok(0);
        }
        check_batch_size(table.len())?;
        let mut builder = build_insert(table);
        let written = builder.build().execute(&self.pool).await?.rows_affected();
        info!(rows = written, table = DETAIL_TABLE, "appended report rows");
        Ok(written)
    }

    async fn row_count(&self) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM detail")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

pub fn check_batch_size(rows: usize) -> Result<(), StoreError> {
    if rows > MAX_ROWS_PER_INSERT {
        return Err(StoreError::BatchTooLarge {
            rows,
            max: MAX_ROWS_PER_INSERT,
        });
    }
    Ok(())
}

/// One multi-row INSERT for the whole batch. Callers skip empty tables and
/// batches past [`MAX_ROWS_PER_INSERT`].
pub fn build_insert(table: &DetailTable) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(
        r#"INSERT INTO detail ("id", "start", "end", "updated", "fields") "#,
    );
    builder.push_values(table.rows.iter(), |mut row, record| {
        row.push_bind(record.id)
            .push_bind(record.start)
            .push_bind(record.end)
            .push_bind(record.updated)
            .push_bind(JsonValue::Object(record.fields.clone()));
    });
    builder
}

/// Process-local store for exercising the pipeline without Postgres.
#[derive(Debug, Default)]
pub struct MemoryDetailStore {
    rows: Mutex<Vec<ReportRecord>>,
}

impl MemoryDetailStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<ReportRecord>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }
}

#[async_trait]
impl DetailStore for MemoryDetailStore {
    async fn stored_ids(&self) -> Result<HashSet<i64>, StoreError> {
        Ok(self.rows.lock().await.iter().map(|r| r.id).collect())
    }

    async fn append(&self, table: &DetailTable) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        rows.extend(table.rows.iter().cloned());
        Ok(table.len() as u64)
    }

    async fn row_count(&self) -> Result<u64, StoreError> {
        Ok(self.rows.lock().await.len() as u64)
    }
}
