//! Polite page fetching: robots.txt check, fixed pacing, bounded retries with
//! capped exponential backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use texting_robots::Robot;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn should_retry(&self, disposition: RetryDisposition, attempt: usize) -> bool {
        disposition == RetryDisposition::Retryable && attempt < self.max_retries
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Minimum spacing between requests; zero disables pacing.
    pub request_delay: Duration,
    /// Consult the origin's robots.txt before every page request.
    pub respect_robots: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            request_delay: Duration::ZERO,
            respect_robots: true,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("robots.txt disallows {url}")]
    Disallowed { url: String },
}

/// What the origin's robots.txt says about our agent.
enum RobotsVerdict {
    AllowAll,
    DenyAll,
    Rules(Robot),
}

impl RobotsVerdict {
    fn allows(&self, url: &str) -> bool {
        match self {
            RobotsVerdict::AllowAll => true,
            RobotsVerdict::DenyAll => false,
            RobotsVerdict::Rules(robot) => robot.allowed(url),
        }
    }
}

/// Product token used for `User-agent:` matching (`lpt-bot/0.1` -> `lpt-bot`).
fn robots_agent(user_agent: Option<&str>) -> String {
    user_agent
        .and_then(|ua| ua.split('/').next())
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .unwrap_or("*")
        .to_string()
}

fn robots_url(page_url: &str) -> Option<String> {
    let page = Url::parse(page_url).ok()?;
    page.join("/robots.txt").ok().map(String::from)
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacing: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
    robots_agent: Option<String>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let pacing = (!config.request_delay.is_zero())
            .then(|| Arc::new(SimpleTokenBucket::new(1, config.request_delay)));

        let robots_agent = config
            .respect_robots
            .then(|| robots_agent(config.user_agent.as_deref()));

        Ok(Self {
            client,
            pacing,
            backoff: config.backoff,
            robots_agent,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            if let Some(agent) = &self.robots_agent {
                if !self.robots_verdict(url, agent).await.allows(url) {
                    return Err(FetchError::Disallowed { url: url.to_string() });
                }
            }
            self.fetch_with_retries(url).await
        }
        .instrument(span)
        .await
    }

    /// Missing robots.txt (404 and other 4xx) allows everything; 401/403, server
    /// errors, unreachable hosts and unparseable files deny.
    async fn robots_verdict(&self, page_url: &str, agent: &str) -> RobotsVerdict {
        let Some(robots_url) = robots_url(page_url) else {
            warn!(url = page_url, "cannot derive robots.txt location");
            return RobotsVerdict::DenyAll;
        };

        let resp = match self.client.get(&robots_url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(%robots_url, error = %err, "robots.txt unreachable; treating as disallowed");
                return RobotsVerdict::DenyAll;
            }
        };

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return RobotsVerdict::DenyAll;
        }
        if status.is_client_error() {
            debug!(%robots_url, %status, "no robots.txt; allowing");
            return RobotsVerdict::AllowAll;
        }
        if !status.is_success() {
            warn!(%robots_url, %status, "robots.txt fetch failed; treating as disallowed");
            return RobotsVerdict::DenyAll;
        }

        match resp.bytes().await {
            Ok(body) => match Robot::new(agent, &body) {
                Ok(robot) => RobotsVerdict::Rules(robot),
                Err(err) => {
                    warn!(%robots_url, error = %err, "unparseable robots.txt; treating as disallowed");
                    RobotsVerdict::DenyAll
                }
            },
            Err(err) => {
                warn!(%robots_url, error = %err, "robots.txt body unreadable; treating as disallowed");
                RobotsVerdict::DenyAll
            }
        }
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.pacing {
                bucket.take().await;
            }

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if self.backoff.should_retry(classify_status(status), attempt) {
                        warn!(%status, attempt, "retrying fetch after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if self.backoff.should_retry(classify_reqwest_error(&err), attempt) {
                        warn!(error = %err, attempt, "retrying fetch after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn only_transient_statuses_are_retried() {
        let policy = BackoffPolicy::default();
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        assert!(policy.should_retry(RetryDisposition::Retryable, 2));
        assert!(!policy.should_retry(RetryDisposition::Retryable, 3));
        assert!(!policy.should_retry(RetryDisposition::NonRetryable, 0));
    }

    #[test]
    fn robots_location_and_agent_token() {
        assert_eq!(
            robots_url("https://homes.example/search?page=2").as_deref(),
            Some("https://homes.example/robots.txt")
        );
        assert_eq!(robots_url("not a url"), None);
        assert_eq!(robots_agent(Some("lpt-bot/0.1")), "lpt-bot");
        assert_eq!(robots_agent(None), "*");
    }

    #[test]
    fn robots_rules_are_matched_per_agent() {
        let txt = b"User-agent: lpt-bot\nDisallow: /private\n\nUser-agent: *\nDisallow: /\n";
        let verdict = RobotsVerdict::Rules(Robot::new("lpt-bot", txt).unwrap());
        assert!(verdict.allows("https://homes.example/search"));
        assert!(!verdict.allows("https://homes.example/private/1"));
        assert!(!RobotsVerdict::DenyAll.allows("https://homes.example/"));
    }

    #[tokio::test]
    async fn token_bucket_spaces_requests() {
        let bucket = SimpleTokenBucket::new(1, Duration::from_millis(40));
        let started = Instant::now();
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
