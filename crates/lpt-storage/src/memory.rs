use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use lpt_core::{
    ListingQuery, ListingSnapshot, NewListing, PriceHistoryPoint, TrendPoint, TrendQuery,
    DEFAULT_CURRENCY,
};
use tokio::sync::RwLock;

use crate::{ListingStore, SnapshotInsert, StoreError};

/// In-process store with the same constraints as the Postgres schema.
#[derive(Debug)]
pub struct MemoryListingStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    listings: Vec<ListingSnapshot>,
    history: BTreeMap<(String, NaiveDate), PriceHistoryPoint>,
    writes: usize,
}

impl Default for MemoryListingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                next_id: 1,
                ..Default::default()
            }),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing the backing store: every call fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn snapshot_count(&self) -> usize {
        self.tables.read().await.listings.len()
    }

    pub async fn history_count(&self) -> usize {
        self.tables.read().await.history.len()
    }

    /// Number of successful write calls, duplicates included.
    pub async fn write_count(&self) -> usize {
        self.tables.read().await.writes
    }

    pub async fn history_point(&self, source_id: &str, recorded_at: NaiveDate) -> Option<PriceHistoryPoint> {
        self.tables
            .read()
            .await
            .history
            .get(&(source_id.to_string(), recorded_at))
            .cloned()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn insert_snapshot(&self, listing: &NewListing) -> Result<SnapshotInsert, StoreError> {
        self.ensure_available()?;
        if matches!(listing.price, Some(p) if p < 0.0) {
            return Err(StoreError::Rejected("price violates non-negative check".into()));
        }

        let mut tables = self.tables.write().await;
        tables.writes += 1;
        let duplicate = tables
            .listings
            .iter()
            .any(|s| s.source_id == listing.source_id && s.recorded_at == listing.recorded_at);
        if duplicate {
            return Ok(SnapshotInsert::Duplicate);
        }

        let id = tables.next_id;
        tables.next_id += 1;
        tables.listings.push(ListingSnapshot {
            id,
            source_id: listing.source_id.clone(),
            source: listing.source.clone(),
            title: listing.title.clone(),
            address: listing.address.clone(),
            area: listing.area.clone(),
            url: listing.url.clone(),
            price: listing.price,
            currency: DEFAULT_CURRENCY.to_string(),
            recorded_at: listing.recorded_at,
            created_at: Utc::now(),
        });
        Ok(SnapshotInsert::Inserted { id })
    }

    async fn upsert_price_point(&self, point: &PriceHistoryPoint) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut tables = self.tables.write().await;
        tables.writes += 1;
        tables
            .history
            .insert((point.source_id.clone(), point.recorded_at), point.clone());
        Ok(())
    }

    async fn list_snapshots(&self, query: &ListingQuery) -> Result<Vec<ListingSnapshot>, StoreError> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let mut rows = tables
            .listings
            .iter()
            .filter(|s| query.filters.iter().all(|f| f.matches(s)))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at).then(b.id.cmp(&a.id)));
        rows.truncate(usize::try_from(query.limit.max(0)).unwrap_or_default());
        Ok(rows)
    }

    async fn price_trends(&self, query: &TrendQuery) -> Result<Vec<TrendPoint>, StoreError> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let mut buckets = BTreeMap::<(NaiveDate, Option<String>), (f64, i64)>::new();
        for point in tables.history.values() {
            let Some(price) = point.price else { continue };
            if point.recorded_at < query.cutoff {
                continue;
            }
            if let Some(area) = &query.area {
                if point.area.as_deref() != Some(area.as_str()) {
                    continue;
                }
            }
            let bucket = buckets
                .entry((point.recorded_at, point.area.clone()))
                .or_insert((0.0, 0));
            bucket.0 += price;
            bucket.1 += 1;
        }
        Ok(buckets
            .into_iter()
            .map(|((date, area), (sum, count))| TrendPoint {
                date,
                area,
                avg_price: sum / count as f64,
                count,
            })
            .collect())
    }

    async fn distinct_areas(&self) -> Result<Vec<String>, StoreError> {
        self.ensure_available()?;
        let tables = self.tables.read().await;
        let areas = tables
            .listings
            .iter()
            .filter_map(|s| s.area.as_deref())
            .filter(|a| !a.is_empty())
            .map(ToString::to_string)
            .collect::<BTreeSet<_>>();
        Ok(areas.into_iter().collect())
    }
}
