//! Scrape-and-push pipeline: fetch a listings page, extract rows, post them to the ingest API.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use lpt_adapters::{GenericListingExtractor, ListingExtractor};
use lpt_core::{IngestBatch, IngestRow, DATE_FORMAT};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

mod client;
mod fetch;

pub use client::{ingest_endpoint, IngestAck, IngestClient, IngestClientError, INGEST_SECRET_HEADER};
pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedPage, HttpClientConfig,
    HttpFetcher, RetryDisposition, SimpleTokenBucket,
};

pub const CRATE_NAME: &str = "lpt-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_ingest_url: Option<String>,
    pub api_ingest_secret: Option<String>,
    pub scrape_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scrape_delay: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub respect_robots: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_ingest_url: None,
            api_ingest_secret: None,
            scrape_base_url: "https://example.com".to_string(),
            user_agent: "lpt-bot/0.1".to_string(),
            http_timeout_secs: 15,
            scrape_delay: Duration::from_secs(2),
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            respect_robots: true,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_ingest_url: std::env::var("API_INGEST_URL").ok().filter(|s| !s.trim().is_empty()),
            api_ingest_secret: std::env::var("API_INGEST_SECRET").ok().filter(|s| !s.is_empty()),
            scrape_base_url: std::env::var("SCRAPE_BASE_URL").unwrap_or(defaults.scrape_base_url),
            user_agent: std::env::var("USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("REQUEST_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            scrape_delay: std::env::var("SCRAPE_DELAY_SECONDS")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.scrape_delay),
            scheduler_enabled: std::env::var("LPT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
            respect_robots: std::env::var("RESPECT_ROBOTS")
                .map(|v| !matches!(v.trim(), "0" | "false" | "FALSE" | "False" | "no"))
                .unwrap_or(defaults.respect_robots),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_url: String,
    pub extracted: usize,
    pub inserted: usize,
    pub pushed: bool,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    extractor: Box<dyn ListingExtractor>,
    ingest: Option<IngestClient>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            request_delay: config.scrape_delay,
            respect_robots: config.respect_robots,
            ..Default::default()
        })?;
        let ingest = config.api_ingest_url.as_deref().map(|url| {
            IngestClient::new(http.client().clone(), url, config.api_ingest_secret.clone())
                .with_backoff(http.backoff())
        });
        let extractor = GenericListingExtractor::new().context("building listing extractor")?;
        Ok(Self {
            config,
            http,
            extractor: Box::new(extractor),
            ingest,
        })
    }

    pub fn with_extractor(mut self, extractor: Box<dyn ListingExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let source_url = self.config.scrape_base_url.clone();

        let page = self
            .http
            .fetch_text(&source_url)
            .await
            .with_context(|| format!("fetching {source_url}"))?;
        let listings = self.extractor.extract_from_html(&page.body, &page.final_url);
        if listings.is_empty() {
            bail!("no listings extracted from {}", page.final_url);
        }
        let extracted = listings.len();
        info!(%run_id, source = self.extractor.source_name(), extracted, "listings extracted");

        let batch = IngestBatch {
            recorded_at: Some(started_at.date_naive().format(DATE_FORMAT).to_string()),
            listings: Some(listings.into_iter().map(IngestRow::from).collect()),
        };

        let (inserted, pushed) = match &self.ingest {
            Some(client) => {
                let ack = client.push(&batch).await.context("pushing batch to ingest api")?;
                info!(%run_id, endpoint = client.endpoint(), inserted = ack.inserted, "batch pushed");
                (ack.inserted, true)
            }
            None => {
                warn!(%run_id, "API_INGEST_URL is not set; skipping push");
                (0, false)
            }
        };

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_url,
            extracted,
            inserted,
            pushed,
        })
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = cron_with_seconds(&self.config.sync_cron);
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        extracted = summary.extracted,
                        inserted = summary.inserted,
                        pushed = summary.pushed,
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// The scheduler wants a leading seconds field; classic five-field crontab
/// expressions get `0` seconds prepended.
pub fn cron_with_seconds(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once().await
}

/// Read an ingest batch from a JSON file on disk.
pub async fn load_batch_file(path: &Path) -> Result<IngestBatch> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
