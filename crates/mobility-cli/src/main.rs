use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use mobility_consolidate::{parse_run_date, CityBatchReport, ConsolidateConfig, Consolidator};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mobility-cli")]
#[command(about = "Consolidate daily bike-share snapshots into the analytical warehouse")]
struct Cli {
    /// Snapshot day to consolidate (YYYY-MM-DD); defaults to MOBILITY_RUN_DATE, then today
    #[arg(long, value_parser = parse_run_date_arg)]
    run_date: Option<NaiveDate>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Create the consolidated tables
    InitSchema,
    Cities,
    Stations,
    Statements,
    /// Create tables, then consolidate cities, stations and statements
    All,
}

fn parse_run_date_arg(raw: &str) -> Result<NaiveDate, String> {
    parse_run_date(raw).map_err(|err| format!("{err:#}"))
}

fn print_batches(label: &str, batches: &[CityBatchReport]) {
    for batch in batches {
        println!(
            "{label}: city={} code={} rows={} sha256={}",
            batch.city, batch.city_code, batch.rows, batch.snapshot.sha256
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ConsolidateConfig::from_env_with_run_date(cli.run_date)?;
    let run_date = config.effective_run_date();
    let consolidator = Consolidator::new(config)?;
    info!(%run_date, database = %consolidator.config().database_path.display(), "starting");

    match cli.command.unwrap_or(Commands::All) {
        Commands::InitSchema => {
            let applied = consolidator.create_tables().await?;
            println!("schema applied: statements={applied}");
        }
        Commands::Cities => {
            let report = consolidator.consolidate_cities(run_date).await?;
            println!("cities: rows={} sha256={}", report.rows, report.snapshot.sha256);
        }
        Commands::Stations => {
            let batches = consolidator.consolidate_all_stations(run_date).await?;
            print_batches("stations", &batches);
        }
        Commands::Statements => {
            let batches = consolidator.consolidate_all_station_statements(run_date).await?;
            print_batches("station statements", &batches);
        }
        Commands::All => {
            let summary = consolidator.run_all(run_date).await?;
            println!(
                "consolidation complete: run_id={} run_date={} cities={} stations={} station_statements={}",
                summary.run_id,
                summary.run_date,
                summary.cities.rows,
                summary.station_rows(),
                summary.station_statement_rows()
            );
        }
    }

    Ok(())
}
