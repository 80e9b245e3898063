//! Append-only scan log backed by SQLite.
//!
//! Writes are frequent, small, and append-only, so the pool is opened with
//! WAL journaling, relaxed synchronous durability, in-memory temp storage,
//! and a ~20 MB page cache. Concurrent writers are serialized by the WAL;
//! the store holds no lock of its own and no transaction spans requests.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("scan storage failure: {0}")]
    Database(#[from] sqlx::Error),
}

/// One immutable scan event. `scan_date` keeps the stored
/// `YYYY-MM-DD HH:MM:SS` text representation.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScanRecord {
    pub id: i64,
    pub platform: i64,
    pub product: i64,
    #[serde(rename = "timestamp")]
    pub scan_date: String,
}

/// A (product, scan id) entry grouped under its platform in query responses
/// and `change_platform` payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairEntry {
    pub product: i64,
    #[serde(rename = "scanId")]
    pub scan_id: i64,
}

/// Conjunctive, all-optional query filters. A single-day `date` takes
/// precedence over `date_from`/`date_to`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ScanFilter {
    pub platform: Option<i64>,
    pub product: Option<i64>,
    pub date: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

impl ScanFilter {
    pub fn for_day(platform: i64, day: impl Into<String>) -> Self {
        Self {
            platform: Some(platform),
            date: Some(day.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanStore {
    pool: SqlitePool,
}

impl ScanStore {
    /// Open (creating if absent) the scan database at `path`.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", "MEMORY")
            .pragma("cache_size", "-20000");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Open an in-memory store. Used by tests; a single pooled connection
    /// keeps every operation on the same in-memory database.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .journal_mode(SqliteJournalMode::Memory)
            .pragma("temp_store", "MEMORY");

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Create the scans table and its indexes. Idempotent; the only schema
    /// migration is "create if absent".
    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scans
            (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                platform INTEGER NOT NULL,
                product INTEGER NOT NULL,
                scan_date DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Queries filter by any combination of platform, product, and date.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_platform_product ON scans(platform, product)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_scan_date ON scans(scan_date)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_platform_date ON scans(platform, scan_date)",
        )
        .execute(&self.pool)
        .await?;

        info!("scan database initialized");
        Ok(())
    }

    /// Insert one scan with a server-assigned timestamp and return the
    /// generated id. The row is durably committed before this returns; on
    /// failure the error surfaces to the caller with no retry here.
    pub async fn add_scan(&self, platform: i64, product: i64) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT INTO scans (platform, product) VALUES (?1, ?2)")
            .bind(platform)
            .bind(product)
            .execute(&self.pool)
            .await?;

        let scan_id = result.last_insert_rowid();
        info!(scan_id, platform, product, "scan recorded");
        Ok(scan_id)
    }

    /// Fetch scans matching `filter`, newest first.
    pub async fn query(&self, filter: &ScanFilter) -> Result<Vec<ScanRecord>, StoreError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, platform, product, scan_date FROM scans");
        let mut sep = " WHERE ";

        if let Some(platform) = filter.platform {
            builder.push(sep).push("platform = ").push_bind(platform);
            sep = " AND ";
        }

        if let Some(product) = filter.product {
            builder.push(sep).push("product = ").push_bind(product);
            sep = " AND ";
        }

        // Empty query values such as `?date=` mean "no filter", not an
        // impossible range.
        if let Some(date) = non_empty(filter.date.as_deref()) {
            let day = normalize_joiner(date);
            builder
                .push(sep)
                .push("scan_date BETWEEN ")
                .push_bind(format!("{day} 00:00:00"))
                .push(" AND ")
                .push_bind(format!("{day} 23:59:59.999999"));
        } else {
            if let Some(from) = non_empty(filter.date_from.as_deref()) {
                builder
                    .push(sep)
                    .push("scan_date >= ")
                    .push_bind(lower_bound(from));
                sep = " AND ";
            }
            if let Some(to) = non_empty(filter.date_to.as_deref()) {
                builder
                    .push(sep)
                    .push("scan_date <= ")
                    .push_bind(upper_bound(to));
            }
        }

        builder.push(" ORDER BY scan_date DESC, id DESC");

        let records = builder
            .build_query_as::<ScanRecord>()
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Pairs scanned on `day` for one platform, newest first. Backs the
    /// `change_platform` payload and the REST query grouping.
    pub async fn pairs_for_day(
        &self,
        platform: i64,
        day: &str,
    ) -> Result<Vec<PairEntry>, StoreError> {
        let records = self.query(&ScanFilter::for_day(platform, day)).await?;
        Ok(records
            .into_iter()
            .map(|r| PairEntry {
                product: r.product,
                scan_id: r.id,
            })
            .collect())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// The database stores `CURRENT_TIMESTAMP` with a space joiner, so incoming
/// ISO timestamps using `T` must be normalized before comparison.
fn normalize_joiner(ts: &str) -> String {
    ts.replace('T', " ")
}

fn lower_bound(raw: &str) -> String {
    let value = normalize_joiner(raw);
    if value.contains(' ') && value.contains(':') {
        value
    } else {
        format!("{value} 00:00:00")
    }
}

fn upper_bound(raw: &str) -> String {
    let value = normalize_joiner(raw);
    if value.contains(' ') && value.contains(':') {
        value
    } else {
        format!("{value} 23:59:59.999999")
    }
}
