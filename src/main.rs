//! RankFlow - rank migration analysis over counselling allocation logs
//!
//! Usage:
//!   rankflow --db-path ./rankflow.db seed --ranks 2000
//!   rankflow journey --rank 450 --year 2024 --category GENERAL --quota STATE \
//!       --source KEA --level UG
//!   rankflow flows --year 2024 --source KEA --level UG --from-round 1 --to-round 2
//!   rankflow compare-years --rank-start 1 --rank-end 500 --category GENERAL --quota STATE \
//!       --source KEA --level UG --year1 2023 --year2 2024 --round 1

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rankflow_backend::analysis::{
    FlowRequest, JourneyRequest, MigrationFilters, PageRequest, ProbabilityRequest, RankBand,
    RoundComparisonRequest, StabilityRequest, YearComparisonRequest,
};
use rankflow_backend::fixtures::{CohortGenerator, CohortSpec};
use rankflow_backend::store::SqliteAllocationStore;
use rankflow_backend::{EngineConfig, MigrationEngine, Round};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Rank-upgrade and migration analysis engine
#[derive(Parser, Debug)]
#[command(name = "rankflow")]
#[command(about = "Journeys, flows, stability and rank-band comparisons over allocation logs")]
struct Cli {
    /// Path to the SQLite allocation database (overrides config)
    #[arg(short, long, env = "RANKFLOW_DB_PATH")]
    db_path: Option<String>,

    /// Engine config file (defaults to RANKFLOW_CONFIG_PATH or rankflow.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct PartitionArgs {
    #[arg(long)]
    year: u16,

    /// Counselling authority, e.g. KEA
    #[arg(long = "source")]
    source_id: String,

    /// Admission level, e.g. UG
    #[arg(long = "level")]
    level_id: String,
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(flatten)]
    partition: PartitionArgs,

    #[arg(long)]
    category: Option<String>,

    #[arg(long)]
    quota: Option<String>,

    #[arg(long)]
    from_round: Round,

    #[arg(long)]
    to_round: Round,

    /// Hide flows smaller than this (config default when omitted)
    #[arg(long)]
    min_flow_count: Option<usize>,

    /// Also list same-seat (freeze) groups
    #[arg(long)]
    include_freezes: bool,
}

impl FlowArgs {
    fn into_request(self) -> FlowRequest {
        FlowRequest {
            year: self.partition.year,
            source_id: self.partition.source_id,
            level_id: self.partition.level_id,
            category: self.category,
            quota: self.quota,
            from_round: self.from_round,
            to_round: self.to_round,
            min_flow_count: self.min_flow_count,
            include_freezes: self.include_freezes,
        }
    }
}

#[derive(Args, Debug)]
struct BandArgs {
    #[arg(long)]
    rank_start: u32,

    #[arg(long)]
    rank_end: u32,

    #[arg(long)]
    category: String,

    #[arg(long)]
    quota: String,

    #[arg(long = "source")]
    source_id: String,

    #[arg(long = "level")]
    level_id: String,
}

impl From<BandArgs> for RankBand {
    fn from(args: BandArgs) -> Self {
        RankBand {
            rank_start: args.rank_start,
            rank_end: args.rank_end,
            category: args.category,
            quota: args.quota,
            source_id: args.source_id,
            level_id: args.level_id,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconstruct one rank's journey across rounds
    Journey {
        #[arg(long)]
        rank: u32,

        #[command(flatten)]
        partition: PartitionArgs,

        #[arg(long)]
        category: String,

        #[arg(long)]
        quota: String,
    },

    /// Aggregate seat-to-seat flows between two rounds
    Flows(FlowArgs),

    /// Page through individual moves between two rounds
    Migrations {
        #[command(flatten)]
        flow: FlowArgs,

        #[arg(long)]
        state: Option<String>,

        #[arg(long = "college")]
        college_id: Option<String>,

        #[arg(long = "course")]
        course_id: Option<String>,

        #[arg(long)]
        rank_min: Option<u32>,

        #[arg(long)]
        rank_max: Option<u32>,

        /// Substring of a college/course name or id
        #[arg(long)]
        text: Option<String>,

        #[arg(long, default_value = "0")]
        offset: usize,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Retention-based stability of one college+course
    Stability {
        #[command(flatten)]
        partition: PartitionArgs,

        #[arg(long = "college")]
        college_id: String,

        #[arg(long = "course")]
        course_id: String,

        /// Prior years to include (config default when omitted)
        #[arg(long)]
        lookback: Option<u16>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        quota: Option<String>,
    },

    /// Next-round destination probabilities from one seat
    Probability {
        #[command(flatten)]
        partition: PartitionArgs,

        #[arg(long)]
        category: String,

        #[arg(long)]
        quota: String,

        #[arg(long)]
        round: Round,

        #[arg(long = "college")]
        college_id: String,

        #[arg(long = "course")]
        course_id: String,

        #[arg(long)]
        to_round: Option<Round>,
    },

    /// Seats reachable by a rank band in two years
    CompareYears {
        #[command(flatten)]
        band: BandArgs,

        #[arg(long)]
        year1: u16,

        #[arg(long)]
        year2: u16,

        #[arg(long)]
        round: Round,
    },

    /// Seats reachable by a rank band in two rounds of one year
    CompareRounds {
        #[command(flatten)]
        band: BandArgs,

        #[arg(long)]
        year: u16,

        #[arg(long)]
        round1: Round,

        #[arg(long)]
        round2: Round,
    },

    /// Bulk import allocation records, one JSON object per line
    Import { path: PathBuf },

    /// Write a deterministic synthetic cohort into the database
    Seed {
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Ranks per category/quota partition
        #[arg(long, default_value = "2000")]
        ranks: u32,

        #[arg(long, value_delimiter = ',', default_value = "2023,2024")]
        years: Vec<u16>,
    },

    /// Row counts per partition
    Stats,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rankflow_backend=info,rankflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize result")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env(),
    };
    if let Some(db_path) = cli.db_path {
        config.database_path = db_path;
    }

    let store = Arc::new(
        SqliteAllocationStore::new(&config.database_path).with_context(|| {
            format!(
                "failed to open allocation store at {}",
                config.database_path
            )
        })?,
    );
    let engine = MigrationEngine::new(store.clone(), config);
    let started = Instant::now();

    match cli.command {
        Commands::Journey {
            rank,
            partition,
            category,
            quota,
        } => {
            let request = JourneyRequest {
                rank,
                year: partition.year,
                category,
                quota,
                source_id: partition.source_id,
                level_id: partition.level_id,
            };
            let journey = engine.journey(&request).await?;
            if journey.is_none() {
                warn!("No allocation records for rank {} in {}", rank, request.year);
            }
            print_json(&journey)?;
        }
        Commands::Flows(args) => {
            let report = engine.flows(&args.into_request()).await?;
            print_json(&report)?;
        }
        Commands::Migrations {
            flow,
            state,
            college_id,
            course_id,
            rank_min,
            rank_max,
            text,
            offset,
            limit,
        } => {
            let filters = MigrationFilters {
                state,
                college_id,
                course_id,
                rank_min,
                rank_max,
                text,
            };
            let page = engine
                .student_migrations(&flow.into_request(), &filters, PageRequest { offset, limit })
                .await?;
            print_json(&page)?;
        }
        Commands::Stability {
            partition,
            college_id,
            course_id,
            lookback,
            category,
            quota,
        } => {
            let request = StabilityRequest {
                year: partition.year,
                lookback_years: lookback,
                source_id: partition.source_id,
                level_id: partition.level_id,
                college_id,
                course_id,
                category,
                quota,
            };
            print_json(&engine.stability(&request).await?)?;
        }
        Commands::Probability {
            partition,
            category,
            quota,
            round,
            college_id,
            course_id,
            to_round,
        } => {
            let request = ProbabilityRequest {
                year: partition.year,
                source_id: partition.source_id,
                level_id: partition.level_id,
                category,
                quota,
                round,
                college_id,
                course_id,
                to_round,
            };
            print_json(&engine.probability(&request).await?)?;
        }
        Commands::CompareYears {
            band,
            year1,
            year2,
            round,
        } => {
            let request = YearComparisonRequest {
                band: band.into(),
                year1,
                year2,
                round,
            };
            print_json(&engine.compare_years(&request).await?)?;
        }
        Commands::CompareRounds {
            band,
            year,
            round1,
            round2,
        } => {
            let request = RoundComparisonRequest {
                band: band.into(),
                year,
                round1,
                round2,
            };
            print_json(&engine.compare_rounds(&request).await?)?;
        }
        Commands::Import { path } => {
            let summary = store
                .import_json_lines(&path)
                .with_context(|| format!("import of {} failed", path.display()))?;
            info!(
                "📥 Imported {} records from {} lines",
                summary.records_written, summary.lines_read
            );
            print_json(&summary)?;
        }
        Commands::Seed { seed, ranks, years } => {
            let spec = CohortSpec {
                seed,
                years,
                ranks_per_partition: ranks,
                ..CohortSpec::default()
            };
            let records = CohortGenerator::new(spec).generate();
            let written = store.insert_batch(&records)?;
            info!("🌱 Seeded {} synthetic allocation records", written);
        }
        Commands::Stats => {
            print_json(&store.stats()?)?;
        }
    }

    info!("✅ Done in {:?}", started.elapsed());
    Ok(())
}
