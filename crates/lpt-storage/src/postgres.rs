use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use lpt_core::{
    ListingFilter, ListingQuery, ListingSnapshot, NewListing, PriceHistoryPoint, TrendPoint,
    TrendQuery, DEFAULT_CURRENCY,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;

use crate::{ListingStore, SnapshotInsert, StoreError};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const SNAPSHOT_COLUMNS: &str =
    "id, source_id, source, title, address, area, url, price, currency, recorded_at, created_at";

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

pub async fn connect_pool(database_url: &str, settings: PoolSettings) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(settings.max_connections.max(1))
        .acquire_timeout(settings.acquire_timeout)
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await.context("running listing migrations")?;
    info!(migrations = MIGRATOR.iter().count(), "database migrations applied");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn snapshot_from_row(row: &PgRow) -> Result<ListingSnapshot, sqlx::Error> {
    Ok(ListingSnapshot {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        source: row.try_get("source")?,
        title: row.try_get("title")?,
        address: row.try_get("address")?,
        area: row.try_get("area")?,
        url: row.try_get("url")?,
        price: row.try_get("price")?,
        currency: row.try_get("currency")?,
        recorded_at: row.try_get("recorded_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn trend_from_row(row: &PgRow) -> Result<TrendPoint, sqlx::Error> {
    Ok(TrendPoint {
        date: row.try_get("date")?,
        area: row.try_get("area")?,
        avg_price: row.try_get("avg_price")?,
        count: row.try_get("count")?,
    })
}

pub(crate) fn listings_query(query: &ListingQuery) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!("SELECT {SNAPSHOT_COLUMNS} FROM listings WHERE 1=1"));
    for filter in &query.filters {
        builder.push(" AND ").push(filter.column()).push(" = ");
        match filter {
            ListingFilter::RecordedAt(date) => {
                builder.push_bind(*date);
            }
            ListingFilter::Area(area) => {
                builder.push_bind(area.clone());
            }
        }
    }
    builder.push(" ORDER BY recorded_at DESC, id DESC LIMIT ");
    builder.push_bind(query.limit);
    builder
}

pub(crate) fn trends_query(query: &TrendQuery) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(
        r#"
        SELECT recorded_at AS date,
               area,
               AVG(price) AS avg_price,
               COUNT(*) AS count
          FROM price_history
         WHERE price IS NOT NULL
           AND recorded_at >= "#,
    );
    builder.push_bind(query.cutoff);
    if let Some(area) = &query.area {
        builder.push(" AND area = ");
        builder.push_bind(area.clone());
    }
    builder.push(" GROUP BY recorded_at, area ORDER BY recorded_at ASC, area ASC NULLS FIRST");
    builder
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn insert_snapshot(&self, listing: &NewListing) -> Result<SnapshotInsert, StoreError> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO listings (source_id, source, title, address, area, url, price, currency, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source_id, recorded_at) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&listing.source_id)
        .bind(&listing.source)
        .bind(&listing.title)
        .bind(&listing.address)
        .bind(&listing.area)
        .bind(&listing.url)
        .bind(listing.price)
        .bind(DEFAULT_CURRENCY)
        .bind(listing.recorded_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match id {
            Some(id) => SnapshotInsert::Inserted { id },
            None => SnapshotInsert::Duplicate,
        })
    }

    async fn upsert_price_point(&self, point: &PriceHistoryPoint) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO price_history (source_id, source, area, price, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_id, recorded_at) DO UPDATE
               SET source = EXCLUDED.source,
                   area = EXCLUDED.area,
                   price = EXCLUDED.price
            "#,
        )
        .bind(&point.source_id)
        .bind(&point.source)
        .bind(&point.area)
        .bind(point.price)
        .bind(point.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_snapshots(&self, query: &ListingQuery) -> Result<Vec<ListingSnapshot>, StoreError> {
        let rows = listings_query(query).build().fetch_all(&self.pool).await?;
        let snapshots = rows
            .iter()
            .map(snapshot_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }

    async fn price_trends(&self, query: &TrendQuery) -> Result<Vec<TrendPoint>, StoreError> {
        let rows = trends_query(query).build().fetch_all(&self.pool).await?;
        let points = rows
            .iter()
            .map(trend_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(points)
    }

    async fn distinct_areas(&self) -> Result<Vec<String>, StoreError> {
        let areas = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT area
              FROM listings
             WHERE area IS NOT NULL
               AND area <> ''
             ORDER BY area
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(areas)
    }
}
