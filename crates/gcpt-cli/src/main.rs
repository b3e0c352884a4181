use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use gcpt_storage::{PgStore, StoreHandles};
use gcpt_sync::{run_sync_once, SyncConfig, SyncRequest};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gcpt")]
#[command(about = "Government contract pipeline tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API.
    Serve {
        /// Replay captured SAM.gov responses instead of calling the live API.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Apply database migrations (requires DATABASE_URL).
    Migrate,
    /// Pull listings from SAM.gov into the external mirror.
    Sync(SyncArgs),
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// NAICS code to search; repeat for several.
    #[arg(long = "naics")]
    naics_codes: Vec<String>,
    #[arg(long)]
    keyword: Option<String>,
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    set_aside: Option<String>,
    #[arg(long)]
    posted_from: Option<NaiveDate>,
    #[arg(long)]
    posted_to: Option<NaiveDate>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    fixtures: Option<PathBuf>,
    /// Print the full report as JSON.
    #[arg(long)]
    json: bool,
}

impl SyncArgs {
    fn request(&self) -> SyncRequest {
        SyncRequest {
            keyword: self.keyword.clone(),
            naics_codes: (!self.naics_codes.is_empty()).then(|| self.naics_codes.clone()),
            state: self.state.clone(),
            set_aside: self.set_aside.clone(),
            posted_from: self.posted_from,
            posted_to: self.posted_to,
            limit: self.limit,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("GCPT_LOG_JSON").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { fixtures: None }) {
        Commands::Serve { fixtures } => {
            gcpt_web::serve_from_env(fixtures.as_deref()).await?;
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set to migrate")?;
            let store = PgStore::connect(&url).await.context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
            println!("migrations applied");
        }
        Commands::Sync(args) => {
            let handles = StoreHandles::from_env().await?;
            let config = SyncConfig::from_env();
            let report = run_sync_once(handles.pipeline, config, args.request(), args.fixtures.as_deref()).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "sync complete: job_id={} source={} imported={} updated={} errors={} fetched={}",
                    report.job_id, report.source, report.imported, report.updated, report.errors, report.total_fetched
                );
                for (code, counts) in &report.breakdown {
                    match &counts.error {
                        Some(err) => println!("  {code}: failed ({err})"),
                        None => println!(
                            "  {code}: imported={} updated={} errors={}",
                            counts.imported, counts.updated, counts.errors
                        ),
                    }
                }
            }
        }
    }

    Ok(())
}
