//! Best-effort batch ingest across `listings` and `price_history`.

use chrono::NaiveDate;
use lpt_core::IngestRow;
use tracing::{info, warn};

use crate::{ListingStore, SnapshotInsert, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted { id: i64 },
    Duplicate,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub recorded_at: NaiveDate,
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub history_failures: usize,
    pub outcomes: Vec<RowOutcome>,
}

impl IngestReport {
    pub fn empty(recorded_at: NaiveDate) -> Self {
        Self {
            recorded_at,
            inserted: 0,
            duplicates: 0,
            rejected: 0,
            history_failures: 0,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, outcome: RowOutcome) {
        match &outcome {
            RowOutcome::Inserted { .. } => self.inserted += 1,
            RowOutcome::Duplicate => self.duplicates += 1,
            RowOutcome::Rejected { .. } => self.rejected += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// Write each row sequentially: snapshot insert, then history upsert-by-replace.
///
/// A row the store rejects is skipped and counted; the batch carries on. Only a
/// request-level failure (store unreachable) stops the loop and is returned.
/// The history row is refreshed even when the snapshot already existed, so a
/// re-sent batch updates the latest price without adding snapshot rows.
pub async fn apply_batch(
    store: &dyn ListingStore,
    recorded_at: NaiveDate,
    rows: &[IngestRow],
) -> Result<IngestReport, StoreError> {
    let mut report = IngestReport::empty(recorded_at);
    if rows.is_empty() {
        return Ok(report);
    }

    for (index, row) in rows.iter().enumerate() {
        let listing = match row.validate(recorded_at) {
            Ok(listing) => listing,
            Err(rejection) => {
                warn!(row = index, reason = %rejection, "skipping invalid listing");
                report.record(RowOutcome::Rejected {
                    reason: rejection.to_string(),
                });
                continue;
            }
        };

        let outcome = match store.insert_snapshot(&listing).await {
            Ok(SnapshotInsert::Inserted { id }) => RowOutcome::Inserted { id },
            Ok(SnapshotInsert::Duplicate) => RowOutcome::Duplicate,
            Err(err) if err.is_row_level() => {
                warn!(row = index, source_id = %listing.source_id, error = %err, "snapshot insert rejected");
                report.record(RowOutcome::Rejected {
                    reason: err.to_string(),
                });
                continue;
            }
            Err(err) => return Err(err),
        };

        match store.upsert_price_point(&listing.price_point()).await {
            Ok(()) => {}
            Err(err) if err.is_row_level() => {
                warn!(row = index, source_id = %listing.source_id, error = %err, "price history upsert rejected");
                report.history_failures += 1;
            }
            Err(err) => return Err(err),
        }

        report.record(outcome);
    }

    info!(
        %recorded_at,
        rows = rows.len(),
        inserted = report.inserted,
        duplicates = report.duplicates,
        rejected = report.rejected,
        history_failures = report.history_failures,
        "ingest batch applied"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryListingStore;
    use lpt_core::ListingInput;
    use serde_json::json;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 4, 2).unwrap()
    }

    fn row(source_id: &str, price: Option<f64>) -> IngestRow {
        input(source_id, price).into()
    }

    fn input(source_id: &str, price: Option<f64>) -> ListingInput {
        ListingInput {
            source_id: Some(source_id.to_string()),
            source: Some("example_listings".to_string()),
            title: Some(format!("Home {source_id}")),
            area: Some("Park District".to_string()),
            price,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_batch_touches_nothing() {
        let store = MemoryListingStore::new();
        let report = apply_batch(&store, day(), &[]).await.unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(store.write_count().await, 0);
    }

    #[tokio::test]
    async fn bad_rows_are_skipped_without_aborting_batch() {
        let store = MemoryListingStore::new();
        let mut missing_title = input("b", Some(10.0));
        missing_title.title = None;
        let rows = vec![row("a", Some(1.0)), missing_title.into(), row("c", Some(-5.0)), row("d", None)];

        let report = apply_batch(&store, day(), &rows).await.unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.rejected, 2);
        assert_eq!(report.outcomes.len(), 4);
        assert!(matches!(report.outcomes[1], RowOutcome::Rejected { .. }));
        assert_eq!(store.snapshot_count().await, 2);
        assert_eq!(store.history_count().await, 2);
    }

    #[tokio::test]
    async fn undecodable_rows_are_rejected_individually() {
        let store = MemoryListingStore::new();
        let rows = vec![
            row("a", Some(1.0)),
            IngestRow::Malformed(json!({"source_id": "b", "source": "s", "title": "t", "price": "n/a"})),
            IngestRow::Malformed(serde_json::Value::Null),
            row("c", Some(2.0)),
        ];

        let report = apply_batch(&store, day(), &rows).await.unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.rejected, 2);
        assert!(matches!(&report.outcomes[1], RowOutcome::Rejected { reason } if reason.starts_with("malformed listing")));
        assert_eq!(store.snapshot_count().await, 2);
    }

    #[tokio::test]
    async fn reingest_counts_only_new_snapshots_and_refreshes_price() {
        let store = MemoryListingStore::new();
        apply_batch(&store, day(), &[row("a", Some(100.0))]).await.unwrap();

        let report = apply_batch(&store, day(), &[row("a", Some(150.0)), row("b", Some(90.0))])
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(store.snapshot_count().await, 2);
        assert_eq!(store.history_count().await, 2);
        assert_eq!(store.history_point("a", day()).await.unwrap().price, Some(150.0));
    }

    #[tokio::test]
    async fn unavailable_store_aborts_batch() {
        let store = MemoryListingStore::new();
        store.set_available(false);
        let err = apply_batch(&store, day(), &[row("a", Some(1.0))]).await.unwrap_err();
        assert!(!err.is_row_level());
    }
}
