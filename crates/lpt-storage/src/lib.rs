//! Listing snapshot + price history storage for LPT.
//!
//! `ListingStore` is the seam between the HTTP layer and the backing store. The
//! Postgres implementation is the production backend; the in-memory one backs tests
//! and local runs without a database.

use async_trait::async_trait;
use lpt_core::{ListingQuery, ListingSnapshot, NewListing, PriceHistoryPoint, TrendPoint, TrendQuery};
use sqlx::error::{DatabaseError, ErrorKind};
use thiserror::Error;

pub mod ingest;
pub mod memory;
pub mod postgres;

pub use ingest::{apply_batch, IngestReport, RowOutcome};
pub use memory::MemoryListingStore;
pub use postgres::{connect_pool, run_migrations, PgListingStore, PoolSettings};

pub const CRATE_NAME: &str = "lpt-storage";

/// Result of a snapshot insert. A repeated `(source_id, recorded_at)` is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotInsert {
    Inserted { id: i64 },
    Duplicate,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database refused this particular row (constraint or data error).
    #[error("row rejected: {0}")]
    Rejected(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// Row-level failures are skipped by ingest; everything else aborts the request.
    pub fn is_row_level(&self) -> bool {
        matches!(self, StoreError::Rejected(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => classify_database_error(&*db_err),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Only integrity violations (SQLSTATE class 23) and data exceptions (class 22)
/// belong to the row. Connection and shutdown classes mean the store is gone;
/// anything else (missing relation, read-only replica, permissions) is a query failure.
fn classify_database_error(db_err: &dyn DatabaseError) -> StoreError {
    let message = db_err.message().to_string();
    if matches!(
        db_err.kind(),
        ErrorKind::UniqueViolation
            | ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation
    ) {
        return StoreError::Rejected(message);
    }

    let code = db_err.code();
    match code.as_deref().and_then(|c| c.get(..2)) {
        Some("22" | "23") => StoreError::Rejected(message),
        Some("08" | "53" | "57") => StoreError::Unavailable(message),
        _ => StoreError::Query(message),
    }
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Append a snapshot row; duplicates of `(source_id, recorded_at)` are reported, not raised.
    async fn insert_snapshot(&self, listing: &NewListing) -> Result<SnapshotInsert, StoreError>;

    /// Insert or replace the history row keyed by `(source_id, recorded_at)`.
    async fn upsert_price_point(&self, point: &PriceHistoryPoint) -> Result<(), StoreError>;

    /// Snapshots matching every filter, newest `recorded_at` first, then newest `id`.
    async fn list_snapshots(&self, query: &ListingQuery) -> Result<Vec<ListingSnapshot>, StoreError>;

    /// Average non-null price per `(recorded_at, area)` from the cutoff onwards, oldest first.
    async fn price_trends(&self, query: &TrendQuery) -> Result<Vec<TrendPoint>, StoreError>;

    /// Sorted distinct non-empty areas seen in snapshots.
    async fn distinct_areas(&self) -> Result<Vec<String>, StoreError>;
}
