//! Core domain model for LPT: listing snapshots, price history, trends and query bounds.

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "lpt-core";

pub const DEFAULT_CURRENCY: &str = "USD";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub const DEFAULT_LISTINGS_LIMIT: i64 = 100;
pub const MAX_LISTINGS_LIMIT: i64 = 500;
pub const DEFAULT_TREND_DAYS: i64 = 30;
pub const MAX_TREND_DAYS: i64 = 365;

/// One scraped observation of a listing, as stored in `listings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub id: i64,
    pub source_id: String,
    pub source: String,
    pub title: String,
    pub address: Option<String>,
    pub area: Option<String>,
    pub url: Option<String>,
    pub price: Option<f64>,
    pub currency: String,
    pub recorded_at: NaiveDate,
    pub created_at: DateTime<Utc>,
}

/// Latest known price for a `(source_id, recorded_at)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryPoint {
    pub source_id: String,
    pub source: String,
    pub area: Option<String>,
    pub price: Option<f64>,
    pub recorded_at: NaiveDate,
}

/// Average price and sample count for one `(date, area)` bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub area: Option<String>,
    pub avg_price: f64,
    pub count: i64,
}

/// Listing row as sent by a scraper. Required fields are optional here so a single
/// bad row can be rejected without failing the whole batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
}

/// One element of the `listings` array. Elements that do not decode as a
/// listing (wrong field types, `null`, scalars) are kept as raw JSON so the
/// row can be rejected on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IngestRow {
    Listing(ListingInput),
    Malformed(serde_json::Value),
}

impl From<ListingInput> for IngestRow {
    fn from(input: ListingInput) -> Self {
        IngestRow::Listing(input)
    }
}

impl IngestRow {
    pub fn as_listing(&self) -> Option<&ListingInput> {
        match self {
            IngestRow::Listing(input) => Some(input),
            IngestRow::Malformed(_) => None,
        }
    }

    pub fn validate(&self, recorded_at: NaiveDate) -> Result<NewListing, RowRejection> {
        match self {
            IngestRow::Listing(input) => input.validate(recorded_at),
            IngestRow::Malformed(value) => Err(RowRejection::Malformed(malformed_reason(value))),
        }
    }
}

fn malformed_reason(value: &serde_json::Value) -> String {
    match serde_json::from_value::<ListingInput>(value.clone()) {
        Err(err) => err.to_string(),
        Ok(_) => "row is not a listing object".to_string(),
    }
}

/// Ingest request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<String>,
    #[serde(default)]
    pub listings: Option<Vec<IngestRow>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowRejection {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("price must be a non-negative finite number")]
    InvalidPrice,
    #[error("malformed listing: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid recorded_at `{value}`: expected YYYY-MM-DD")]
pub struct InvalidDate {
    pub value: String,
}

/// Validated listing ready to be written for a given recorded date.
#[derive(Debug, Clone, PartialEq)]
pub struct NewListing {
    pub source_id: String,
    pub source: String,
    pub title: String,
    pub address: Option<String>,
    pub area: Option<String>,
    pub url: Option<String>,
    pub price: Option<f64>,
    pub recorded_at: NaiveDate,
}

impl NewListing {
    pub fn price_point(&self) -> PriceHistoryPoint {
        PriceHistoryPoint {
            source_id: self.source_id.clone(),
            source: self.source.clone(),
            area: self.area.clone(),
            price: self.price,
            recorded_at: self.recorded_at,
        }
    }
}

impl ListingInput {
    /// Check required fields and price bounds; blank optional strings become `None`.
    pub fn validate(&self, recorded_at: NaiveDate) -> Result<NewListing, RowRejection> {
        let source_id = required(&self.source_id, "source_id")?;
        let source = required(&self.source, "source")?;
        let title = required(&self.title, "title")?;

        if let Some(price) = self.price {
            if !price.is_finite() || price < 0.0 {
                return Err(RowRejection::InvalidPrice);
            }
        }

        Ok(NewListing {
            source_id,
            source,
            title,
            address: non_blank(&self.address),
            area: non_blank(&self.area),
            url: non_blank(&self.url),
            price: self.price,
            recorded_at,
        })
    }
}

impl IngestBatch {
    /// The batch date, or `today` when absent or empty.
    pub fn resolve_recorded_at(&self, today: NaiveDate) -> Result<NaiveDate, InvalidDate> {
        match self.recorded_at.as_deref().map(str::trim) {
            None | Some("") => Ok(today),
            Some(raw) => parse_date(raw).ok_or_else(|| InvalidDate {
                value: raw.to_string(),
            }),
        }
    }

    pub fn listings(&self) -> &[IngestRow] {
        self.listings.as_deref().unwrap_or_default()
    }
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, RowRejection> {
    non_blank(value).ok_or(RowRejection::MissingField(field))
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

/// Filters accepted by the listings query. Each variant maps to one bound predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingFilter {
    RecordedAt(NaiveDate),
    Area(String),
}

impl ListingFilter {
    pub fn column(&self) -> &'static str {
        match self {
            ListingFilter::RecordedAt(_) => "recorded_at",
            ListingFilter::Area(_) => "area",
        }
    }

    pub fn matches(&self, snapshot: &ListingSnapshot) -> bool {
        match self {
            ListingFilter::RecordedAt(date) => snapshot.recorded_at == *date,
            ListingFilter::Area(area) => snapshot.area.as_deref() == Some(area.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingQuery {
    pub filters: Vec<ListingFilter>,
    pub limit: i64,
}

impl Default for ListingQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            limit: DEFAULT_LISTINGS_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrendQuery {
    pub cutoff: NaiveDate,
    pub area: Option<String>,
}

impl TrendQuery {
    pub fn new(today: NaiveDate, days: i64, area: Option<String>) -> Self {
        Self {
            cutoff: trend_cutoff(today, days),
            area,
        }
    }
}

/// `limit` query value: default when absent or non-numeric, clamped to `0..=500`.
pub fn clamp_limit(raw: Option<&str>) -> i64 {
    clamp_param(raw, DEFAULT_LISTINGS_LIMIT, MAX_LISTINGS_LIMIT)
}

/// `days` query value: default when absent or non-numeric, clamped to `0..=365`.
pub fn clamp_days(raw: Option<&str>) -> i64 {
    clamp_param(raw, DEFAULT_TREND_DAYS, MAX_TREND_DAYS)
}

fn clamp_param(raw: Option<&str>, default: i64, max: i64) -> i64 {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(default)
        .clamp(0, max)
}

/// Inclusive lower bound of a trend window.
pub fn trend_cutoff(today: NaiveDate, days: i64) -> NaiveDate {
    let days = u64::try_from(days.max(0)).unwrap_or_default();
    today.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN)
}
