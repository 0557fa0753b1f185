//! Consolidation pipeline: raw city snapshots -> CONSOLIDATE_* tables.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use mobility_core::{City, Commune, Station, StationStatement};
use mobility_feeds::{
    stations_for_city, statements_for_city, CityFeed, CityRegistry, MappingError, RawTable,
};
use mobility_storage::{
    RawSnapshot, RawSnapshotStore, Warehouse, CITY_TABLE, STATION_STATEMENT_TABLE, STATION_TABLE,
};
use serde::Serialize;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mobility-consolidate";

const SUGGESTION_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PopulationPolicy {
    /// Store `nb_inhabitants` as null, matching existing warehouses.
    #[default]
    Discard,
    /// Carry the commune's `population` into `nb_inhabitants`.
    Keep,
}

#[derive(Debug, Clone)]
pub struct ConsolidateConfig {
    pub raw_data_dir: PathBuf,
    pub database_path: PathBuf,
    pub schema_sql: PathBuf,
    pub cities_file: Option<PathBuf>,
    pub run_date: Option<NaiveDate>,
    pub population: PopulationPolicy,
}

impl Default for ConsolidateConfig {
    fn default() -> Self {
        Self {
            raw_data_dir: PathBuf::from("data/raw_data"),
            database_path: PathBuf::from("data/warehouse/mobility_analysis.sqlite"),
            schema_sql: PathBuf::from("data/sql_statements/create_consolidate_tables.sql"),
            cities_file: None,
            run_date: None,
            population: PopulationPolicy::Discard,
        }
    }
}

impl ConsolidateConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_run_date(None)
    }

    /// Like [`Self::from_env`], but an explicit `run_date` wins and
    /// `MOBILITY_RUN_DATE` is then not read at all.
    pub fn from_env_with_run_date(run_date: Option<NaiveDate>) -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), run_date)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>, run_date: Option<NaiveDate>) -> Result<Self> {
        let defaults = Self::default();
        let run_date = match run_date {
            Some(run_date) => Some(run_date),
            None => lookup("MOBILITY_RUN_DATE")
                .map(|raw| parse_run_date(&raw).context("reading MOBILITY_RUN_DATE"))
                .transpose()?,
        };
        Ok(Self {
            raw_data_dir: lookup("MOBILITY_RAW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.raw_data_dir),
            database_path: lookup("MOBILITY_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            schema_sql: lookup("MOBILITY_SCHEMA_SQL")
                .map(PathBuf::from)
                .unwrap_or(defaults.schema_sql),
            cities_file: lookup("MOBILITY_CITIES_FILE").map(PathBuf::from),
            run_date,
            population: match lookup("MOBILITY_KEEP_POPULATION").as_deref() {
                Some("1" | "true" | "TRUE" | "True") => PopulationPolicy::Keep,
                _ => PopulationPolicy::Discard,
            },
        })
    }

    /// Configured run date, else today's local date.
    pub fn effective_run_date(&self) -> NaiveDate {
        self.run_date.unwrap_or_else(|| Local::now().date_naive())
    }
}

pub fn parse_run_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("run date {raw:?} is not YYYY-MM-DD"))
}

fn closest_hint(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (closest match: {s:?})"))
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum CommuneLookupError {
    #[error("no commune named {name:?}{}", closest_hint(.suggestion))]
    NotFound {
        name: String,
        suggestion: Option<String>,
    },
    #[error("commune name {name:?} is ambiguous, matching codes {codes:?}")]
    Ambiguous { name: String, codes: Vec<String> },
}

/// Exact-name lookup over the commune reference dataset.
#[derive(Debug, Clone)]
pub struct CommuneResolver {
    communes: Vec<Commune>,
}

impl CommuneResolver {
    pub fn new(communes: Vec<Commune>) -> Self {
        Self { communes }
    }

    pub fn communes(&self) -> &[Commune] {
        &self.communes
    }

    /// Code of the single commune named exactly `name`.
    pub fn resolve(&self, name: &str) -> Result<&str, CommuneLookupError> {
        let mut matches = self.communes.iter().filter(|commune| commune.name == name);
        match (matches.next(), matches.next()) {
            (Some(single), None) => Ok(single.code.as_str()),
            (None, _) => Err(CommuneLookupError::NotFound {
                name: name.to_string(),
                suggestion: self.closest_name(name),
            }),
            (Some(first), Some(second)) => Err(CommuneLookupError::Ambiguous {
                name: name.to_string(),
                codes: [first, second]
                    .into_iter()
                    .chain(matches)
                    .map(|commune| commune.code.clone())
                    .collect(),
            }),
        }
    }

    fn closest_name(&self, name: &str) -> Option<String> {
        self.communes
            .iter()
            .map(|commune| (jaro_winkler(name, &commune.name), &commune.name))
            .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, candidate)| candidate.clone())
    }
}

pub fn parse_communes(snapshot: &RawSnapshot) -> Result<Vec<Commune>> {
    snapshot
        .records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            serde_json::from_value(serde_json::Value::Object(record.clone())).with_context(|| {
                format!("parsing commune #{index} of {}", snapshot.path.display())
            })
        })
        .collect()
}

/// Canonical city rows: one per distinct (code, name, population) after the
/// population policy is applied, first occurrence wins.
pub fn build_cities(communes: &[Commune], run_date: NaiveDate, population: PopulationPolicy) -> Vec<City> {
    let mut seen = HashSet::new();
    communes
        .iter()
        .map(|commune| City {
            id: commune.code.clone(),
            name: commune.name.clone(),
            nb_inhabitants: match population {
                PopulationPolicy::Keep => commune.population,
                PopulationPolicy::Discard => None,
            },
            created_date: run_date,
        })
        .filter(|city| seen.insert(city.clone()))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFingerprint {
    pub source: String,
    pub path: String,
    pub sha256: String,
    pub bytes: usize,
}

impl From<&RawSnapshot> for SnapshotFingerprint {
    fn from(snapshot: &RawSnapshot) -> Self {
        Self {
            source: snapshot.source.clone(),
            path: snapshot.path.display().to_string(),
            sha256: snapshot.content_hash.clone(),
            bytes: snapshot.byte_size,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CityTableReport {
    pub rows: usize,
    pub population: PopulationPolicy,
    pub snapshot: SnapshotFingerprint,
}

/// Rows written for one city into one table.
#[derive(Debug, Clone, Serialize)]
pub struct CityBatchReport {
    pub city: String,
    pub city_code: String,
    pub rows: usize,
    pub snapshot: SnapshotFingerprint,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub schema_statements: usize,
    pub cities: CityTableReport,
    pub stations: Vec<CityBatchReport>,
    pub station_statements: Vec<CityBatchReport>,
}

impl ConsolidationSummary {
    pub fn station_rows(&self) -> usize {
        self.stations.iter().map(|b| b.rows).sum()
    }

    pub fn station_statement_rows(&self) -> usize {
        self.station_statements.iter().map(|b| b.rows).sum()
    }
}

struct CityBatch<T> {
    report: CityBatchReport,
    rows: Vec<T>,
}

type CityMapper<T> = fn(&CityFeed, &RawTable, &str, NaiveDate) -> Result<Vec<T>, MappingError>;

pub struct Consolidator {
    config: ConsolidateConfig,
    snapshots: RawSnapshotStore,
    registry: CityRegistry,
}

impl Consolidator {
    pub fn new(config: ConsolidateConfig) -> Result<Self> {
        let registry = match &config.cities_file {
            Some(path) => CityRegistry::from_path(path)
                .with_context(|| format!("loading city registry {}", path.display()))?,
            None => CityRegistry::builtin().context("loading built-in city registry")?,
        };
        Ok(Self::with_registry(config, registry))
    }

    pub fn with_registry(config: ConsolidateConfig, registry: CityRegistry) -> Self {
        let snapshots = RawSnapshotStore::new(config.raw_data_dir.clone());
        Self {
            config,
            snapshots,
            registry,
        }
    }

    pub fn config(&self) -> &ConsolidateConfig {
        &self.config
    }

    pub fn registry(&self) -> &CityRegistry {
        &self.registry
    }

    async fn open_warehouse(&self) -> Result<Warehouse> {
        Warehouse::open(&self.config.database_path)
            .await
            .with_context(|| format!("opening warehouse {}", self.config.database_path.display()))
    }

    /// Create the consolidated tables from the schema file.
    pub async fn create_tables(&self) -> Result<usize> {
        let warehouse = self.open_warehouse().await?;
        let outcome = warehouse
            .apply_schema_file(&self.config.schema_sql)
            .await
            .with_context(|| format!("applying schema {}", self.config.schema_sql.display()));
        warehouse.close().await;
        let applied = outcome?;
        info!(statements = applied, "consolidated tables ready");
        Ok(applied)
    }

    async fn load_resolver(&self, run_date: NaiveDate) -> Result<(CommuneResolver, RawSnapshot)> {
        let snapshot = self
            .snapshots
            .load(run_date, &self.registry.communes_source)
            .await
            .context("loading commune reference dataset")?;
        let communes = parse_communes(&snapshot)?;
        Ok((CommuneResolver::new(communes), snapshot))
    }

    /// Resolve, load and map every configured city before anything is written.
    async fn map_all_cities<T>(
        &self,
        run_date: NaiveDate,
        table_label: &str,
        mapper: CityMapper<T>,
    ) -> Result<Vec<CityBatch<T>>> {
        let (resolver, _) = self.load_resolver(run_date).await?;
        let mut batches = Vec::with_capacity(self.registry.cities.len());
        for feed in &self.registry.cities {
            let city_code = resolver
                .resolve(&feed.name)
                .with_context(|| format!("resolving commune code for {}", feed.name))?;
            let snapshot = self
                .snapshots
                .load(run_date, &feed.snapshot_source())
                .await
                .with_context(|| format!("loading {} snapshot", feed.name))?;
            let table = RawTable::from_records(&snapshot.records);
            let rows = mapper(feed, &table, city_code, run_date)
                .with_context(|| format!("mapping {} {table_label}", feed.name))?;
            debug!(city = %feed.name, city_code, rows = rows.len(), table = table_label, "mapped city feed");
            batches.push(CityBatch {
                report: CityBatchReport {
                    city: feed.name.clone(),
                    city_code: city_code.to_string(),
                    rows: rows.len(),
                    snapshot: SnapshotFingerprint::from(&snapshot),
                },
                rows,
            });
        }
        Ok(batches)
    }

    pub async fn consolidate_cities(&self, run_date: NaiveDate) -> Result<CityTableReport> {
        let span = info_span!("consolidate_cities", %run_date);
        self.consolidate_cities_inner(run_date).instrument(span).await
    }

    async fn consolidate_cities_inner(&self, run_date: NaiveDate) -> Result<CityTableReport> {
        let (resolver, snapshot) = self.load_resolver(run_date).await?;
        if self.config.population == PopulationPolicy::Discard {
            warn!("discarding commune population; nb_inhabitants is stored as null");
        }
        let cities = build_cities(resolver.communes(), run_date, self.config.population);

        let warehouse = self.open_warehouse().await?;
        let outcome = warehouse
            .replace_cities(&cities)
            .await
            .with_context(|| format!("upserting {CITY_TABLE}"));
        warehouse.close().await;
        let rows = outcome?;

        info!(rows, "cities consolidated");
        Ok(CityTableReport {
            rows,
            population: self.config.population,
            snapshot: SnapshotFingerprint::from(&snapshot),
        })
    }

    /// Map every configured city, then upsert one batch per city in registry
    /// order. Load, lookup and mapping failures all happen before the first upsert.
    pub async fn consolidate_all_stations(&self, run_date: NaiveDate) -> Result<Vec<CityBatchReport>> {
        let span = info_span!("consolidate_stations", %run_date);
        self.consolidate_all_stations_inner(run_date).instrument(span).await
    }

    async fn consolidate_all_stations_inner(&self, run_date: NaiveDate) -> Result<Vec<CityBatchReport>> {
        let batches = self.map_all_cities(run_date, "stations", stations_for_city).await?;
        let warehouse = self.open_warehouse().await?;
        let outcome = upsert_station_batches(&warehouse, batches).await;
        warehouse.close().await;
        outcome
    }

    pub async fn consolidate_all_station_statements(
        &self,
        run_date: NaiveDate,
    ) -> Result<Vec<CityBatchReport>> {
        let span = info_span!("consolidate_station_statements", %run_date);
        self.consolidate_all_station_statements_inner(run_date)
            .instrument(span)
            .await
    }

    async fn consolidate_all_station_statements_inner(
        &self,
        run_date: NaiveDate,
    ) -> Result<Vec<CityBatchReport>> {
        let batches = self
            .map_all_cities(run_date, "station statements", statements_for_city)
            .await?;
        let warehouse = self.open_warehouse().await?;
        let outcome = upsert_statement_batches(&warehouse, batches).await;
        warehouse.close().await;
        outcome
    }

    /// Create tables, then consolidate cities, stations and statements.
    pub async fn run_all(&self, run_date: NaiveDate) -> Result<ConsolidationSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("consolidation_run", %run_id, %run_date);
        self.run_all_inner(run_id, run_date).instrument(span).await
    }

    async fn run_all_inner(&self, run_id: Uuid, run_date: NaiveDate) -> Result<ConsolidationSummary> {
        let started_at = Utc::now();
        let schema_statements = self.create_tables().await?;
        let cities = self.consolidate_cities(run_date).await?;
        let stations = self.consolidate_all_stations(run_date).await?;
        let station_statements = self.consolidate_all_station_statements(run_date).await?;
        let summary = ConsolidationSummary {
            run_id,
            run_date,
            started_at,
            finished_at: Utc::now(),
            schema_statements,
            cities,
            stations,
            station_statements,
        };
        info!(
            cities = summary.cities.rows,
            stations = summary.station_rows(),
            station_statements = summary.station_statement_rows(),
            "consolidation run complete"
        );
        Ok(summary)
    }
}

async fn upsert_station_batches(
    warehouse: &Warehouse,
    batches: Vec<CityBatch<Station>>,
) -> Result<Vec<CityBatchReport>> {
    let mut reports = Vec::with_capacity(batches.len());
    for batch in batches {
        let rows = warehouse
            .replace_stations(&batch.rows)
            .await
            .with_context(|| format!("upserting {} stations into {STATION_TABLE}", batch.report.city))?;
        info!(city = %batch.report.city, rows, "stations consolidated");
        reports.push(batch.report);
    }
    Ok(reports)
}

async fn upsert_statement_batches(
    warehouse: &Warehouse,
    batches: Vec<CityBatch<StationStatement>>,
) -> Result<Vec<CityBatchReport>> {
    let mut reports = Vec::with_capacity(batches.len());
    for batch in batches {
        let rows = warehouse
            .replace_station_statements(&batch.rows)
            .await
            .with_context(|| {
                format!(
                    "upserting {} station statements into {STATION_STATEMENT_TABLE}",
                    batch.report.city
                )
            })?;
        info!(city = %batch.report.city, rows, "station statements consolidated");
        reports.push(batch.report);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobility_core::StationStatus;
    use mobility_storage::RawStoreError;
    use serde_json::json;
    use std::path::Path;
    use tempfile::tempdir;

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 24).expect("date")
    }

    fn commune(name: &str, code: &str, population: Option<i64>) -> Commune {
        Commune {
            code: code.into(),
            name: name.into(),
            population,
        }
    }

    fn fixture_resolver() -> CommuneResolver {
        CommuneResolver::new(vec![
            commune("Paris", "75056", Some(2_133_111)),
            commune("Nantes", "44109", Some(323_204)),
            commune("Toulouse", "31555", Some(504_078)),
            commune("Saint-Denis", "93066", Some(113_942)),
            commune("Saint-Denis", "97411", Some(153_001)),
        ])
    }

    fn schema_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../data/sql_statements/create_consolidate_tables.sql")
    }

    fn write_snapshot(root: &Path, source: &str, body: serde_json::Value) {
        let day = root.join("2026-02-24");
        std::fs::create_dir_all(&day).expect("mkdir");
        std::fs::write(day.join(format!("{source}.json")), body.to_string()).expect("write");
    }

    fn config_in(root: &Path) -> ConsolidateConfig {
        ConsolidateConfig {
            raw_data_dir: root.join("raw_data"),
            database_path: root.join("warehouse/mobility.sqlite"),
            schema_sql: schema_path(),
            cities_file: None,
            run_date: Some(run_date()),
            population: PopulationPolicy::Discard,
        }
    }

    fn paris_only_registry() -> CityRegistry {
        let mut registry = CityRegistry::builtin().expect("builtin");
        registry.cities.retain(|feed| feed.name == "Paris");
        registry
    }

    fn paris_snapshot(capacity: i64) -> serde_json::Value {
        json!([{
            "stationcode": "16107",
            "is_installed": "OUI",
            "capacity": capacity,
            "coordonnees_geo": {"lon": 2.3, "lat": 48.8},
            "numdocksavailable": 5,
            "numbikesavailable": 15,
            "duedate": "2026-02-24T08:12:00+00:00"
        }])
    }

    #[test]
    fn resolves_unique_names_to_their_code() {
        let resolver = fixture_resolver();
        assert_eq!(resolver.resolve("Paris").expect("paris"), "75056");
        assert_eq!(resolver.resolve("Nantes").expect("nantes"), "44109");
        assert_eq!(resolver.resolve("Toulouse").expect("toulouse"), "31555");
    }

    #[test]
    fn unknown_name_fails_with_closest_suggestion() {
        let err = fixture_resolver().resolve("Toulous").expect_err("must fail");
        match err {
            CommuneLookupError::NotFound { name, suggestion } => {
                assert_eq!(name, "Toulous");
                assert_eq!(suggestion.as_deref(), Some("Toulouse"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let err = fixture_resolver().resolve("Lyon").expect_err("must fail");
        assert!(matches!(err, CommuneLookupError::NotFound { suggestion: None, .. }));
        assert!(fixture_resolver().resolve("paris").is_err());
    }

    #[test]
    fn duplicate_names_are_ambiguous_rather_than_picked() {
        let err = fixture_resolver().resolve("Saint-Denis").expect_err("must fail");
        match err {
            CommuneLookupError::Ambiguous { codes, .. } => {
                assert_eq!(codes, vec!["93066".to_string(), "97411".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cities_discard_population_by_default_and_deduplicate() {
        let communes = vec![
            commune("Paris", "75056", Some(2_133_111)),
            commune("Paris", "75056", Some(2_133_111)),
            commune("Nantes", "44109", None),
        ];
        let cities = build_cities(&communes, run_date(), PopulationPolicy::Discard);
        assert_eq!(
            cities,
            vec![
                City { id: "75056".into(), name: "Paris".into(), nb_inhabitants: None, created_date: run_date() },
                City { id: "44109".into(), name: "Nantes".into(), nb_inhabitants: None, created_date: run_date() },
            ]
        );

        let kept = build_cities(&communes, run_date(), PopulationPolicy::Keep);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].nb_inhabitants, Some(2_133_111));
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Vec<_>>();
        move |key: &str| pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn explicit_run_date_skips_malformed_env_date() {
        let env = env_of(&[("MOBILITY_RUN_DATE", "24/02/2026"), ("MOBILITY_KEEP_POPULATION", "true")]);
        let config = ConsolidateConfig::from_lookup(&env, Some(run_date())).expect("config");
        assert_eq!(config.effective_run_date(), run_date());
        assert_eq!(config.population, PopulationPolicy::Keep);

        let err = ConsolidateConfig::from_lookup(&env, None).expect_err("malformed env date");
        assert!(format!("{err:#}").contains("MOBILITY_RUN_DATE"));
    }

    #[test]
    fn env_values_override_defaults() {
        let env = env_of(&[
            ("MOBILITY_RUN_DATE", "2026-02-24"),
            ("MOBILITY_DATABASE_PATH", "/tmp/w.sqlite"),
            ("MOBILITY_CITIES_FILE", "cities.yaml"),
        ]);
        let config = ConsolidateConfig::from_lookup(env, None).expect("config");
        assert_eq!(config.run_date, Some(run_date()));
        assert_eq!(config.database_path, PathBuf::from("/tmp/w.sqlite"));
        assert_eq!(config.cities_file, Some(PathBuf::from("cities.yaml")));
        assert_eq!(config.raw_data_dir, PathBuf::from("data/raw_data"));
        assert_eq!(config.population, PopulationPolicy::Discard);
    }

    #[test]
    fn run_date_must_be_iso() {
        assert_eq!(parse_run_date("2026-02-24").expect("date"), run_date());
        assert!(parse_run_date("24/02/2026").is_err());
    }

    #[tokio::test]
    async fn paris_station_scenario_yields_canonical_row() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path());
        write_snapshot(
            &config.raw_data_dir,
            "communes_data",
            json!([{"nom": "Paris", "code": "75056", "population": 2133111}]),
        );
        write_snapshot(&config.raw_data_dir, "paris_realtime_bicycle_data", paris_snapshot(20));

        let consolidator = Consolidator::with_registry(config.clone(), paris_only_registry());
        consolidator.create_tables().await.expect("tables");
        let reports = consolidator.consolidate_all_stations(run_date()).await.expect("stations");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].city_code, "75056");
        assert_eq!(reports[0].rows, 1);

        let warehouse = Warehouse::open(&config.database_path).await.expect("open");
        let stations = warehouse.stations().await.expect("stations");
        warehouse.close().await;

        assert_eq!(stations.len(), 1);
        let station = &stations[0];
        assert_eq!(station.id, "75056-16107");
        assert_eq!(station.code.as_deref(), Some("16107"));
        assert_eq!(station.status, Some(StationStatus::Open));
        assert_eq!(station.city_code.as_deref(), Some("75056"));
        assert_eq!(station.city_name.as_deref(), Some("Paris"));
        assert_eq!(station.longitude, Some(2.3));
        assert_eq!(station.latitude, Some(48.8));
        assert_eq!(station.capacity, Some(20));
    }

    #[tokio::test]
    async fn reconsolidating_replaces_the_station_row() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path());
        write_snapshot(&config.raw_data_dir, "communes_data", json!([{"nom": "Paris", "code": "75056"}]));
        write_snapshot(&config.raw_data_dir, "paris_realtime_bicycle_data", paris_snapshot(20));

        let consolidator = Consolidator::with_registry(config.clone(), paris_only_registry());
        consolidator.create_tables().await.expect("tables");
        consolidator.consolidate_all_stations(run_date()).await.expect("first run");

        write_snapshot(&config.raw_data_dir, "paris_realtime_bicycle_data", paris_snapshot(32));
        consolidator.consolidate_all_stations(run_date()).await.expect("second run");

        let warehouse = Warehouse::open(&config.database_path).await.expect("open");
        let stations = warehouse.stations().await.expect("stations");
        warehouse.close().await;
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].capacity, Some(32));
    }

    #[tokio::test]
    async fn station_without_code_does_not_block_the_batch() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path());
        write_snapshot(&config.raw_data_dir, "communes_data", json!([{"nom": "Paris", "code": "75056"}]));
        write_snapshot(
            &config.raw_data_dir,
            "paris_realtime_bicycle_data",
            json!([
                {"stationcode": "1", "is_installed": "OUI", "capacity": 12},
                {"is_installed": "NON", "capacity": 8}
            ]),
        );

        let consolidator = Consolidator::with_registry(config.clone(), paris_only_registry());
        consolidator.create_tables().await.expect("tables");
        let reports = consolidator.consolidate_all_stations(run_date()).await.expect("stations");
        assert_eq!(reports[0].rows, 2);

        let warehouse = Warehouse::open(&config.database_path).await.expect("open");
        let stations = warehouse.stations().await.expect("stations");
        warehouse.close().await;
        let ids = stations.iter().map(|s| s.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["75056-1", "75056-None"]);
        assert_eq!(stations[1].capacity, Some(8));
    }

    #[tokio::test]
    async fn missing_city_snapshot_aborts_before_any_upsert() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path());
        write_snapshot(
            &config.raw_data_dir,
            "communes_data",
            json!([
                {"nom": "Paris", "code": "75056"},
                {"nom": "Nantes", "code": "44109"},
                {"nom": "Toulouse", "code": "31555"}
            ]),
        );
        write_snapshot(&config.raw_data_dir, "paris_realtime_bicycle_data", paris_snapshot(20));

        let consolidator = Consolidator::new(config.clone()).expect("consolidator");
        consolidator.create_tables().await.expect("tables");
        let err = consolidator
            .consolidate_all_stations(run_date())
            .await
            .expect_err("nantes snapshot is missing");
        assert!(matches!(
            err.downcast_ref::<RawStoreError>(),
            Some(RawStoreError::SnapshotNotFound { .. })
        ));

        let warehouse = Warehouse::open(&config.database_path).await.expect("open");
        assert!(warehouse.stations().await.expect("stations").is_empty());
        warehouse.close().await;
    }

    #[tokio::test]
    async fn unresolvable_city_surfaces_lookup_error() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path());
        write_snapshot(&config.raw_data_dir, "communes_data", json!([{"nom": "Lyon", "code": "69123"}]));

        let consolidator = Consolidator::with_registry(config, paris_only_registry());
        let err = consolidator
            .consolidate_all_station_statements(run_date())
            .await
            .expect_err("paris is absent");
        assert!(matches!(
            err.downcast_ref::<CommuneLookupError>(),
            Some(CommuneLookupError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cities_are_upserted_with_population_policy() {
        let dir = tempdir().expect("tempdir");
        let mut config = config_in(dir.path());
        write_snapshot(
            &config.raw_data_dir,
            "communes_data",
            json!([
                {"nom": "Paris", "code": "75056", "population": 2133111},
                {"nom": "Nantes", "code": "44109", "population": 323204}
            ]),
        );

        let consolidator = Consolidator::with_registry(config.clone(), paris_only_registry());
        consolidator.create_tables().await.expect("tables");
        let report = consolidator.consolidate_cities(run_date()).await.expect("cities");
        assert_eq!(report.rows, 2);
        assert_eq!(report.population, PopulationPolicy::Discard);

        config.population = PopulationPolicy::Keep;
        let keeping = Consolidator::with_registry(config.clone(), paris_only_registry());
        keeping.consolidate_cities(run_date()).await.expect("cities again");

        let warehouse = Warehouse::open(&config.database_path).await.expect("open");
        let cities = warehouse.cities().await.expect("cities");
        warehouse.close().await;
        assert_eq!(cities.len(), 2);
        assert_eq!(cities[0].id, "44109");
        assert_eq!(cities[0].nb_inhabitants, Some(323204));
        assert_eq!(cities[1].name, "Paris");
    }
}
