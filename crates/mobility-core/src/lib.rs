//! Canonical domain model shared by the consolidation crates.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mobility-core";

/// Column order of the consolidated city table.
pub const CITY_COLUMNS: [&str; 4] = ["id", "name", "nb_inhabitants", "created_date"];

/// Column order of the consolidated station table.
pub const STATION_COLUMNS: [&str; 11] = [
    "id",
    "code",
    "name",
    "city_name",
    "city_code",
    "address",
    "longitude",
    "latitude",
    "status",
    "created_date",
    "capacity",
];

/// Column order of the consolidated station statement table.
pub const STATION_STATEMENT_COLUMNS: [&str; 5] = [
    "station_id",
    "bicycle_docks_available",
    "bicycle_available",
    "last_statement_date",
    "created_date",
];

/// Entry of the commune reference dataset (`geo.api.gouv.fr/communes`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commune {
    pub code: String,
    #[serde(rename = "nom")]
    pub name: String,
    #[serde(default)]
    pub population: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct City {
    pub id: String,
    pub name: String,
    pub nb_inhabitants: Option<i64>,
    pub created_date: NaiveDate,
}

/// Operating status of a station.
///
/// Feeds that already speak `OPEN`/`CLOSED` map onto the first two variants;
/// anything else is carried through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StationStatus {
    Open,
    Closed,
    Other(String),
}

impl StationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Other(raw) => raw.as_str(),
        }
    }
}

impl From<String> for StationStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "OPEN" => Self::Open,
            "CLOSED" => Self::Closed,
            _ => Self::Other(raw),
        }
    }
}

impl From<&str> for StationStatus {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<StationStatus> for String {
    fn from(status: StationStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    /// `<city_code>-<native station id>`, see [`composite_station_id`].
    pub id: String,
    pub code: Option<String>,
    pub name: Option<String>,
    pub city_name: Option<String>,
    pub city_code: Option<String>,
    pub address: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub status: Option<StationStatus>,
    pub created_date: NaiveDate,
    pub capacity: Option<i64>,
}

/// Latest occupancy snapshot of one station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationStatement {
    pub station_id: String,
    pub bicycle_docks_available: Option<i64>,
    pub bicycle_available: Option<i64>,
    pub last_statement_date: Option<String>,
    pub created_date: NaiveDate,
}

/// Globally unique station identifier, stable across runs for the same
/// (city, native id) pair.
pub fn composite_station_id(city_code: &str, native_id: &str) -> String {
    format!("{city_code}-{native_id}")
}
