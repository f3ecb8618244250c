use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

mod config;
mod db;
mod filter;
mod loader;
mod metrics;
mod models;
mod normalize;
mod percent;
mod pivot;
mod report;
mod segment;

use config::{AnalyticsConfig, DEFAULT_AOV, DEFAULT_TIMEZONE};
use filter::{FilterKind, FilterOptions, FilterQuery};
use models::{CohortMonth, Currency, Dataset};

#[derive(Parser)]
#[command(name = "subscription-cohorts")]
#[command(about = "Subscription revenue and student retention cohorts", long_about = None)]
struct Cli {
    /// Directory holding students.csv and subscriptions.csv; Postgres is used when absent
    #[arg(long, global = true, env = "COHORT_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Average order value used for churn revenue projection
    #[arg(long, global = true, env = "COHORT_AOV", default_value_t = DEFAULT_AOV)]
    aov: f64,
    /// Currencies included in revenue metrics (repeatable)
    #[arg(long = "currency", global = true, default_values_t = ["egp".to_string()])]
    currencies: Vec<String>,
    /// IANA time zone whose calendar decides the current processing day
    #[arg(long, global = true, env = "COHORT_TIMEZONE", default_value = DEFAULT_TIMEZONE)]
    timezone: String,
    /// Treat this day as today when deciding which subscriptions have matured
    #[arg(long, global = true, env = "COHORT_AS_OF")]
    as_of: Option<NaiveDate>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Markdown,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import a students.csv/subscriptions.csv snapshot into Postgres
    Import {
        #[arg(long)]
        dir: PathBuf,
    },
    /// Revenue, status and yearly trend summary
    Overview {
        #[arg(long, value_enum, default_value_t = Format::Markdown)]
        format: Format,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Cohort retention, churn and revenue tables
    Cohorts {
        #[arg(long)]
        percentage: bool,
        #[arg(long, value_enum, default_value_t = Format::Markdown)]
        format: Format,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Drill into one cohort month and/or months-count bucket
    Filter {
        #[arg(long, value_enum, default_value_t = FilterKind::Retention)]
        kind: FilterKind,
        #[arg(long)]
        cohort_month: Option<CohortMonth>,
        #[arg(long)]
        months: Option<i64>,
        /// List the selectable cohort months and months counts instead
        #[arg(long)]
        options: bool,
        #[arg(long, value_enum, default_value_t = Format::Markdown)]
        format: Format,
    },
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set when --data-dir is not given")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn load(data_dir: Option<&Path>) -> anyhow::Result<Dataset> {
    match data_dir {
        Some(dir) => loader::load_csv_dir(dir),
        None => {
            let pool = connect().await?;
            db::load_dataset(&pool).await
        }
    }
}

fn emit<T: Serialize>(
    format: Format,
    value: &T,
    markdown: impl FnOnce(&T) -> String,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let rendered = match format {
        Format::Markdown => markdown(value),
        Format::Json => serde_json::to_string_pretty(value)?,
    };
    match out {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Report written to {}.", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "subscription_cohorts=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let Cli {
        data_dir,
        aov,
        currencies,
        timezone,
        as_of,
        command,
    } = Cli::parse();

    let zone = config::parse_timezone(&timezone)?;
    let config = AnalyticsConfig::new(
        aov,
        currencies.into_iter().map(Currency::from).collect(),
        config::reference_day(as_of, zone),
    );
    info!(
        aov = config.aov,
        reference_day = %config.reference_day,
        %zone,
        "configuration loaded"
    );

    match command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect().await?;
            let inserted = db::seed(&pool).await?;
            println!("Seed data inserted ({inserted} new subscriptions).");
        }
        Commands::Import { dir } => {
            let pool = connect().await?;
            let inserted = db::import_csv(&pool, &dir).await?;
            println!("Inserted {inserted} subscriptions from {}.", dir.display());
        }
        Commands::Overview { format, out } => {
            let dataset = load(data_dir.as_deref()).await?;
            let overview = metrics::Overview::build(&dataset, &config);
            emit(format, &overview, report::render_overview, out.as_deref())?;
        }
        Commands::Cohorts {
            percentage,
            format,
            out,
        } => {
            let dataset = load(data_dir.as_deref()).await?;
            let cohorts = report::CohortReport::build(&dataset, &config);
            if percentage {
                emit(
                    format,
                    &cohorts.percentages(),
                    |_| report::render_cohorts(&cohorts, true),
                    out.as_deref(),
                )?;
            } else {
                emit(
                    format,
                    &cohorts,
                    |cohorts| report::render_cohorts(cohorts, false),
                    out.as_deref(),
                )?;
            }
        }
        Commands::Filter {
            kind,
            cohort_month,
            months,
            options,
            format,
        } => {
            let dataset = load(data_dir.as_deref()).await?;
            let table = normalize::normalize(&dataset.subscriptions);
            let views = segment::segment(&table, config.reference_day);

            if options {
                let choices = FilterOptions::from_views(&views);
                emit(
                    format,
                    &choices,
                    |choices| {
                        let months: Vec<String> =
                            choices.cohort_months.iter().map(|m| m.to_string()).collect();
                        let counts: Vec<String> =
                            choices.elapsed_months.iter().map(|m| m.to_string()).collect();
                        format!(
                            "Cohort months: {}\nMonths counts: {}",
                            months.join(", "),
                            counts.join(", ")
                        )
                    },
                    None,
                )?;
                return Ok(());
            }

            let students = pivot::StudentIndex::new(&dataset.students);
            let query = FilterQuery {
                kind,
                cohort_month,
                elapsed_months: months,
            };
            let outcome = filter::drill_down(&views, &students, query, config.aov);
            if outcome.is_empty() {
                info!(?kind, ?cohort_month, ?months, "filter matched no subscriptions");
            }
            emit(format, &outcome, report::render_drill_down, None)?;
        }
    }

    Ok(())
}
