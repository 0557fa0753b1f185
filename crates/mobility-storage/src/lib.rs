//! Day-stamped raw snapshot reader + consolidated SQLite warehouse.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use mobility_core::{
    City, Station, StationStatement, StationStatus, CITY_COLUMNS, STATION_COLUMNS,
    STATION_STATEMENT_COLUMNS,
};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const CRATE_NAME: &str = "mobility-storage";

pub const CITY_TABLE: &str = "CONSOLIDATE_CITY";
pub const STATION_TABLE: &str = "CONSOLIDATE_STATION";
pub const STATION_STATEMENT_TABLE: &str = "CONSOLIDATE_STATION_STATEMENT";

/// One object of a raw JSON array snapshot.
pub type JsonRecord = serde_json::Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum RawStoreError {
    #[error("raw snapshot not found: {}", path.display())]
    SnapshotNotFound { path: PathBuf },
    #[error("reading raw snapshot {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing raw snapshot {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("raw snapshot {} is not a JSON array", path.display())]
    NotAnArray { path: PathBuf },
    #[error("record {index} of raw snapshot {} is not a JSON object", path.display())]
    NotAnObject { path: PathBuf, index: usize },
}

#[derive(Debug, Clone)]
pub struct RawSnapshot {
    pub source: String,
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub records: Vec<JsonRecord>,
}

/// Reads `<root>/<ISO-date>/<source>.json` files written by the ingestion job.
#[derive(Debug, Clone)]
pub struct RawSnapshotStore {
    root: PathBuf,
}

impl RawSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(&self, run_date: NaiveDate, source: &str) -> PathBuf {
        let source = source.trim().trim_end_matches(".json");
        PathBuf::from(run_date.format("%Y-%m-%d").to_string()).join(format!("{source}.json"))
    }

    pub fn snapshot_path(&self, run_date: NaiveDate, source: &str) -> PathBuf {
        self.root.join(self.snapshot_relative_path(run_date, source))
    }

    /// Load the snapshot of `source` for `run_date`. There is no fallback to
    /// an earlier day.
    pub async fn load(&self, run_date: NaiveDate, source: &str) -> Result<RawSnapshot, RawStoreError> {
        let path = self.snapshot_path(run_date, source);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RawStoreError::SnapshotNotFound { path });
            }
            Err(err) => return Err(RawStoreError::Io { path, source: err }),
        };

        let value: JsonValue = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => return Err(RawStoreError::Parse { path, source: err }),
        };
        let JsonValue::Array(items) = value else {
            return Err(RawStoreError::NotAnArray { path });
        };

        let mut records = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            match item {
                JsonValue::Object(record) => records.push(record),
                _ => return Err(RawStoreError::NotAnObject { path, index }),
            }
        }

        debug!(source, path = %path.display(), records = records.len(), "loaded raw snapshot");
        Ok(RawSnapshot {
            source: source.to_string(),
            content_hash: Self::sha256_hex(&bytes),
            byte_size: bytes.len(),
            path,
            records,
        })
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("creating warehouse directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading schema file {}: {source}", path.display())]
    SchemaFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

/// Split a schema script on `;`, dropping blank fragments.
pub fn split_sql_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .collect()
}

fn insert_or_replace_sql(table: &str, columns: &[&str]) -> String {
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT OR REPLACE INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
}

fn select_sql(table: &str, columns: &[&str], order_by: &str) -> String {
    format!("SELECT {} FROM {table} ORDER BY {order_by}", columns.join(", "))
}

/// File-backed analytical store holding the three consolidated tables.
///
/// Writes use `INSERT OR REPLACE`: a row whose key already exists is fully
/// overwritten. Each `replace_*` call runs in its own transaction.
#[derive(Debug)]
pub struct Warehouse {
    pool: SqlitePool,
    path: PathBuf,
}

impl Warehouse {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, WarehouseError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| WarehouseError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        debug!(path = %path.display(), "opened warehouse");
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(self) {
        self.pool.close().await;
        debug!(path = %self.path.display(), "closed warehouse");
    }

    pub async fn apply_schema_file(&self, path: impl AsRef<Path>) -> Result<usize, WarehouseError> {
        let path = path.as_ref();
        let sql = fs::read_to_string(path)
            .await
            .map_err(|source| WarehouseError::SchemaFile {
                path: path.to_path_buf(),
                source,
            })?;
        self.apply_schema_sql(&sql).await
    }

    /// Execute each `;`-separated statement in order; returns how many ran.
    pub async fn apply_schema_sql(&self, sql: &str) -> Result<usize, WarehouseError> {
        let statements = split_sql_statements(sql);
        for statement in &statements {
            debug!(statement, "executing schema statement");
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(statements.len())
    }

    pub async fn replace_cities(&self, cities: &[City]) -> Result<usize, WarehouseError> {
        let sql = insert_or_replace_sql(CITY_TABLE, &CITY_COLUMNS);
        let mut tx = self.pool.begin().await?;
        for city in cities {
            sqlx::query(&sql)
                .bind(city.id.as_str())
                .bind(city.name.as_str())
                .bind(city.nb_inhabitants)
                .bind(city.created_date)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(cities.len())
    }

    pub async fn replace_stations(&self, stations: &[Station]) -> Result<usize, WarehouseError> {
        let sql = insert_or_replace_sql(STATION_TABLE, &STATION_COLUMNS);
        let mut tx = self.pool.begin().await?;
        for station in stations {
            sqlx::query(&sql)
                .bind(station.id.as_str())
                .bind(station.code.as_deref())
                .bind(station.name.as_deref())
                .bind(station.city_name.as_deref())
                .bind(station.city_code.as_deref())
                .bind(station.address.as_deref())
                .bind(station.longitude)
                .bind(station.latitude)
                .bind(station.status.as_ref().map(StationStatus::as_str))
                .bind(station.created_date)
                .bind(station.capacity)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(stations.len())
    }

    pub async fn replace_station_statements(
        &self,
        statements: &[StationStatement],
    ) -> Result<usize, WarehouseError> {
        let sql = insert_or_replace_sql(STATION_STATEMENT_TABLE, &STATION_STATEMENT_COLUMNS);
        let mut tx = self.pool.begin().await?;
        for statement in statements {
            sqlx::query(&sql)
                .bind(statement.station_id.as_str())
                .bind(statement.bicycle_docks_available)
                .bind(statement.bicycle_available)
                .bind(statement.last_statement_date.as_deref())
                .bind(statement.created_date)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(statements.len())
    }

    pub async fn cities(&self) -> Result<Vec<City>, WarehouseError> {
        let rows = sqlx::query(&select_sql(CITY_TABLE, &CITY_COLUMNS, "id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<City, WarehouseError> {
                Ok(City {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    nb_inhabitants: row.try_get("nb_inhabitants")?,
                    created_date: row.try_get("created_date")?,
                })
            })
            .collect()
    }

    pub async fn stations(&self) -> Result<Vec<Station>, WarehouseError> {
        let rows = sqlx::query(&select_sql(STATION_TABLE, &STATION_COLUMNS, "id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(station_from_row).collect()
    }

    pub async fn station_statements(&self) -> Result<Vec<StationStatement>, WarehouseError> {
        let rows = sqlx::query(&select_sql(
            STATION_STATEMENT_TABLE,
            &STATION_STATEMENT_COLUMNS,
            "station_id, created_date",
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<StationStatement, WarehouseError> {
                Ok(StationStatement {
                    station_id: row.try_get("station_id")?,
                    bicycle_docks_available: row.try_get("bicycle_docks_available")?,
                    bicycle_available: row.try_get("bicycle_available")?,
                    last_statement_date: row.try_get("last_statement_date")?,
                    created_date: row.try_get("created_date")?,
                })
            })
            .collect()
    }
}

fn station_from_row(row: &SqliteRow) -> Result<Station, WarehouseError> {
    let status: Option<String> = row.try_get("status")?;
    Ok(Station {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        city_name: row.try_get("city_name")?,
        city_code: row.try_get("city_code")?,
        address: row.try_get("address")?,
        longitude: row.try_get("longitude")?,
        latitude: row.try_get("latitude")?,
        status: status.map(StationStatus::from),
        created_date: row.try_get("created_date")?,
        capacity: row.try_get("capacity")?,
    })
}
