//! Per-city feed registry, raw table flattening and column mapping into the
//! canonical station tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use indexmap::IndexMap;
use mobility_core::{
    composite_station_id, Station, StationStatement, StationStatus, STATION_COLUMNS,
    STATION_STATEMENT_COLUMNS,
};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "mobility-feeds";

pub const STATION_KEY_COLUMN: &str = "id";
pub const STATEMENT_KEY_COLUMN: &str = "station_id";
pub const CREATED_DATE_COLUMN: &str = "created_date";

/// Stands in for a null or absent native id inside a composite id.
pub const MISSING_NATIVE_ID: &str = "None";

pub const REGISTRY_VERSION: u32 = 1;

const BUILTIN_REGISTRY_YAML: &str = include_str!("../cities.yaml");

/// Flattened source row: nested objects are addressed as `parent.child`.
pub type RawRow = IndexMap<String, JsonValue>;

/// Mapper output keyed by canonical column name, in selection order.
pub type NormalizedRow = IndexMap<String, JsonValue>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading city registry {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing city registry: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("city registry version {found} is not supported (expected {})", REGISTRY_VERSION)]
    UnsupportedVersion { found: u32 },
    #[error("city registry lists no cities")]
    Empty,
    #[error("city {0} is listed more than once")]
    DuplicateCity(String),
    #[error("city {city}: {table} columns must include computed column `{column}`")]
    MissingComputedColumn {
        city: String,
        table: &'static str,
        column: &'static str,
    },
    #[error("city {city}: {table} columns after rename are {actual:?}, expected {expected:?}")]
    ColumnMismatch {
        city: String,
        table: &'static str,
        actual: Vec<String>,
        expected: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("mapped row has no `{column}` column")]
    SchemaMismatch { column: String },
}

/// Column selection for one city and one target table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ColumnSpec {
    /// Raw field holding the feed's own station identifier.
    pub native_id: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    /// Raw status value -> canonical status value.
    #[serde(default)]
    pub status_map: BTreeMap<String, String>,
}

impl ColumnSpec {
    pub fn canonical_name<'a>(&'a self, column: &'a str) -> &'a str {
        self.rename.get(column).map(String::as_str).unwrap_or(column)
    }

    pub fn canonical_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|column| self.canonical_name(column))
            .collect()
    }

    /// Project every raw row onto the selected columns.
    ///
    /// `key_column` receives `<city_code>-<native id>`, `created_date` receives
    /// the run date, selected columns the row lacks are filled with null, and
    /// the result is renamed to canonical names. Output has one row per input row;
    /// a row without a native id keys as `<city_code>-None`.
    pub fn map_rows(
        &self,
        table: &RawTable,
        key_column: &str,
        city_code: &str,
        run_date: NaiveDate,
    ) -> Vec<NormalizedRow> {
        let created_date = JsonValue::String(run_date.format("%Y-%m-%d").to_string());

        let synthesized = self
            .columns
            .iter()
            .filter(|c| c.as_str() != key_column && c.as_str() != CREATED_DATE_COLUMN)
            .filter(|c| !table.has_column(c))
            .collect::<Vec<_>>();
        if !synthesized.is_empty() {
            debug!(city_code, columns = ?synthesized, "filling absent columns with null");
        }

        let mut missing_ids = 0usize;
        let rows = table
            .rows
            .iter()
            .map(|row| {
                let native_id = match row.get(&self.native_id).and_then(value_as_text) {
                    Some(native_id) => native_id,
                    None => {
                        missing_ids += 1;
                        MISSING_NATIVE_ID.to_string()
                    }
                };
                let key = composite_station_id(city_code, &native_id);

                let mut mapped = NormalizedRow::with_capacity(self.columns.len());
                for column in &self.columns {
                    let value = if column == key_column {
                        JsonValue::String(key.clone())
                    } else if column == CREATED_DATE_COLUMN {
                        created_date.clone()
                    } else {
                        row.get(column).cloned().unwrap_or(JsonValue::Null)
                    };
                    mapped.insert(self.canonical_name(column).to_string(), value);
                }
                mapped
            })
            .collect::<Vec<_>>();

        if missing_ids > 0 {
            warn!(
                city_code,
                field = %self.native_id,
                rows = missing_ids,
                "keying rows without a native station id with the missing-id marker"
            );
        }
        rows
    }

    fn validate(
        &self,
        city: &str,
        table: &'static str,
        key_column: &'static str,
        expected: &[&str],
    ) -> Result<(), RegistryError> {
        for computed in [key_column, CREATED_DATE_COLUMN] {
            if !self.columns.iter().any(|c| c == computed) {
                return Err(RegistryError::MissingComputedColumn {
                    city: city.to_string(),
                    table,
                    column: computed,
                });
            }
        }

        let mut actual = self
            .canonical_columns()
            .into_iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let mut wanted = expected.iter().map(ToString::to_string).collect::<Vec<_>>();
        actual.sort();
        wanted.sort();
        if actual != wanted {
            return Err(RegistryError::ColumnMismatch {
                city: city.to_string(),
                table,
                actual,
                expected: wanted,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CityFeed {
    /// Commune name, matched exactly against the reference dataset.
    pub name: String,
    #[serde(default)]
    pub source: Option<String>,
    pub stations: ColumnSpec,
    pub statements: ColumnSpec,
}

impl CityFeed {
    /// Raw snapshot name, `<city>_realtime_bicycle_data` unless configured.
    pub fn snapshot_source(&self) -> String {
        self.source
            .clone()
            .unwrap_or_else(|| format!("{}_realtime_bicycle_data", self.name.to_lowercase()))
    }
}

fn default_communes_source() -> String {
    "communes_data".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CityRegistry {
    version: u32,
    #[serde(default = "default_communes_source")]
    pub communes_source: String,
    pub cities: Vec<CityFeed>,
}

impl CityRegistry {
    /// Paris, Nantes and Toulouse, in that order.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_yaml_str(BUILTIN_REGISTRY_YAML)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RegistryError> {
        let registry: Self = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn city(&self, name: &str) -> Option<&CityFeed> {
        self.cities.iter().find(|feed| feed.name == name)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.version != REGISTRY_VERSION {
            return Err(RegistryError::UnsupportedVersion { found: self.version });
        }
        if self.cities.is_empty() {
            return Err(RegistryError::Empty);
        }
        let mut seen = BTreeSet::new();
        for feed in &self.cities {
            if !seen.insert(feed.name.as_str()) {
                return Err(RegistryError::DuplicateCity(feed.name.clone()));
            }
            feed.stations
                .validate(&feed.name, "station", STATION_KEY_COLUMN, &STATION_COLUMNS)?;
            feed.statements.validate(
                &feed.name,
                "station statement",
                STATEMENT_KEY_COLUMN,
                &STATION_STATEMENT_COLUMNS,
            )?;
        }
        Ok(())
    }
}

/// Raw snapshot records flattened into rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawTable {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a JsonMap<String, JsonValue>>) -> Self {
        let mut columns = Vec::new();
        let mut known = BTreeSet::new();
        let mut rows = Vec::new();
        for record in records {
            let mut row = RawRow::new();
            flatten_into(None, record, &mut row);
            for key in row.keys() {
                if known.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
            rows.push(row);
        }
        Self { columns, rows }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn flatten_into(prefix: Option<&str>, object: &JsonMap<String, JsonValue>, out: &mut RawRow) {
    for (key, value) in object {
        let key = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };
        match value {
            JsonValue::Object(inner) if !inner.is_empty() => {
                flatten_into(Some(key.as_str()), inner, out)
            }
            _ => {
                out.insert(key, value.clone());
            }
        }
    }
}

/// Text form of a scalar; `None` for null.
pub fn value_as_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

pub fn value_as_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn value_as_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn column<'a>(row: &'a NormalizedRow, name: &str) -> Result<&'a JsonValue, MappingError> {
    row.get(name).ok_or_else(|| MappingError::SchemaMismatch {
        column: name.to_string(),
    })
}

fn text_column(row: &NormalizedRow, name: &str) -> Result<Option<String>, MappingError> {
    Ok(value_as_text(column(row, name)?))
}

fn required_text_column(row: &NormalizedRow, name: &str) -> Result<String, MappingError> {
    text_column(row, name)?.ok_or_else(|| MappingError::SchemaMismatch {
        column: name.to_string(),
    })
}

/// Translate a raw status through `status_map`; unmapped values pass through.
pub fn normalize_status(
    raw: Option<String>,
    status_map: &BTreeMap<String, String>,
) -> Option<StationStatus> {
    raw.map(|value| match status_map.get(&value) {
        Some(mapped) => StationStatus::from(mapped.as_str()),
        None => StationStatus::from(value),
    })
}

/// Canonical stations for one city; `city_name`/`city_code` always come from
/// the registry and the resolved commune code, never from the feed.
pub fn stations_for_city(
    feed: &CityFeed,
    table: &RawTable,
    city_code: &str,
    run_date: NaiveDate,
) -> Result<Vec<Station>, MappingError> {
    let spec = &feed.stations;
    let rows = spec.map_rows(table, STATION_KEY_COLUMN, city_code, run_date);

    let mut unrecognized = BTreeSet::new();
    let mut stations = Vec::with_capacity(rows.len());
    for row in &rows {
        column(row, CREATED_DATE_COLUMN)?;
        let status = normalize_status(text_column(row, "status")?, &spec.status_map);
        if let Some(StationStatus::Other(raw)) = &status {
            unrecognized.insert(raw.clone());
        }
        stations.push(Station {
            id: required_text_column(row, STATION_KEY_COLUMN)?,
            code: text_column(row, "code")?,
            name: text_column(row, "name")?,
            city_name: Some(feed.name.clone()),
            city_code: Some(city_code.to_string()),
            address: text_column(row, "address")?,
            longitude: value_as_f64(column(row, "longitude")?),
            latitude: value_as_f64(column(row, "latitude")?),
            status,
            created_date: run_date,
            capacity: value_as_i64(column(row, "capacity")?),
        });
    }

    if !unrecognized.is_empty() {
        warn!(city = %feed.name, values = ?unrecognized, "passing through unrecognized station status values");
    }
    Ok(stations)
}

pub fn statements_for_city(
    feed: &CityFeed,
    table: &RawTable,
    city_code: &str,
    run_date: NaiveDate,
) -> Result<Vec<StationStatement>, MappingError> {
    let rows = feed
        .statements
        .map_rows(table, STATEMENT_KEY_COLUMN, city_code, run_date);
    rows.iter()
        .map(|row| -> Result<StationStatement, MappingError> {
            column(row, CREATED_DATE_COLUMN)?;
            Ok(StationStatement {
                station_id: required_text_column(row, STATEMENT_KEY_COLUMN)?,
                bicycle_docks_available: value_as_i64(column(row, "bicycle_docks_available")?),
                bicycle_available: value_as_i64(column(row, "bicycle_available")?),
                last_statement_date: text_column(row, "last_statement_date")?,
                created_date: run_date,
            })
        })
        .collect()
}
