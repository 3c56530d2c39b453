use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lpt_core::parse_date;
use lpt_storage::{connect_pool, run_migrations};
use lpt_sync::{load_batch_file, IngestClient, SyncConfig, SyncPipeline};
use lpt_web::WebConfig;
use tracing::info;

mod logging;

#[derive(Debug, Parser)]
#[command(name = "lpt-cli")]
#[command(about = "Listing price tracker: ingest API, scraper and maintenance commands")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Apply pending database migrations.
    Migrate,
    /// Scrape once and push the result to the ingest API.
    Sync,
    /// Post a JSON ingest batch from disk.
    Push {
        file: PathBuf,
        #[arg(long, env = "API_INGEST_URL")]
        url: String,
        #[arg(long, env = "API_INGEST_SECRET")]
        secret: Option<String>,
        /// Override the batch date (YYYY-MM-DD).
        #[arg(long)]
        recorded_at: Option<String>,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    logging::init(logging::LogFormat::from_env());

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => lpt_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = WebConfig::from_env();
            let pool = connect_pool(&config.database_url, config.pool).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Sync => {
            let summary = lpt_sync::run_sync_once_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Push {
            file,
            url,
            secret,
            recorded_at,
        } => {
            let mut batch = load_batch_file(&file).await?;
            if let Some(date) = recorded_at {
                parse_date(&date).with_context(|| format!("invalid --recorded-at {date}"))?;
                batch.recorded_at = Some(date);
            }
            let client = IngestClient::new(reqwest::Client::new(), &url, secret);
            let ack = client.push(&batch).await?;
            println!(
                "pushed {} rows to {}: inserted={}",
                batch.listings().len(),
                client.endpoint(),
                ack.inserted
            );
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..SyncConfig::from_env()
            };
            let cron = config.sync_cron.clone();
            let pipeline = std::sync::Arc::new(SyncPipeline::new(config)?);
            let sched = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("scheduler stopping");
        }
    }

    Ok(())
}
