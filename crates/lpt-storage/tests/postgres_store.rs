//! Runs against a live Postgres: `DATABASE_URL=... cargo test -p lpt-storage -- --ignored`.
//! Each test gets a fresh database with the crate migrations applied.

use chrono::NaiveDate;
use lpt_core::{ListingFilter, ListingQuery, NewListing, TrendQuery};
use lpt_storage::{ListingStore, PgListingStore, SnapshotInsert, StoreError};
use sqlx::PgPool;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
}

fn listing(source_id: &str, area: Option<&str>, price: Option<f64>, recorded_at: NaiveDate) -> NewListing {
    NewListing {
        source_id: source_id.to_string(),
        source: "seed-example".to_string(),
        title: format!("Listing {source_id}"),
        address: None,
        area: area.map(ToString::to_string),
        url: None,
        price,
        recorded_at,
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs DATABASE_URL pointing at a Postgres server"]
async fn duplicate_snapshot_is_reported_not_raised(pool: PgPool) {
    let store = PgListingStore::new(pool);
    let row = listing("a", Some("Riverside"), Some(100.0), day(1));

    let first = store.insert_snapshot(&row).await.unwrap();
    assert!(matches!(first, SnapshotInsert::Inserted { .. }));
    assert_eq!(store.insert_snapshot(&row).await.unwrap(), SnapshotInsert::Duplicate);

    let rows = store.list_snapshots(&ListingQuery::default()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].currency, "USD");
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs DATABASE_URL pointing at a Postgres server"]
async fn negative_price_is_a_row_level_rejection(pool: PgPool) {
    let store = PgListingStore::new(pool);
    let err = store
        .insert_snapshot(&listing("neg", None, Some(-1.0), day(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Rejected(_)));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs DATABASE_URL pointing at a Postgres server"]
async fn trends_average_and_order_null_area_first(pool: PgPool) {
    let store = PgListingStore::new(pool);
    for (id, area, price) in [
        ("a", Some("Riverside"), Some(100.0)),
        ("b", Some("Riverside"), Some(200.0)),
        ("c", Some("Riverside"), Some(300.0)),
        ("d", None, Some(50.0)),
        ("e", Some("Hillside"), None),
    ] {
        store
            .upsert_price_point(&listing(id, area, price, day(2)).price_point())
            .await
            .unwrap();
    }
    // replaced, not duplicated
    store
        .upsert_price_point(&listing("d", None, Some(70.0), day(2)).price_point())
        .await
        .unwrap();

    let points = store
        .price_trends(&TrendQuery {
            cutoff: day(1),
            area: None,
        })
        .await
        .unwrap();

    assert_eq!(points.len(), 2);
    assert_eq!(points[0].area, None);
    assert_eq!(points[0].avg_price, 70.0);
    assert_eq!(points[1].area.as_deref(), Some("Riverside"));
    assert_eq!(points[1].avg_price, 200.0);
    assert_eq!(points[1].count, 3);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs DATABASE_URL pointing at a Postgres server"]
async fn listings_filter_and_areas_are_sorted(pool: PgPool) {
    let store = PgListingStore::new(pool);
    store.insert_snapshot(&listing("a", Some("Uptown"), Some(1.0), day(1))).await.unwrap();
    store.insert_snapshot(&listing("b", Some("Downtown"), Some(2.0), day(2))).await.unwrap();
    store.insert_snapshot(&listing("c", None, Some(3.0), day(2))).await.unwrap();

    let rows = store
        .list_snapshots(&ListingQuery {
            filters: vec![ListingFilter::RecordedAt(day(2))],
            limit: 10,
        })
        .await
        .unwrap();
    assert_eq!(rows.iter().map(|r| r.source_id.as_str()).collect::<Vec<_>>(), ["c", "b"]);

    assert_eq!(store.distinct_areas().await.unwrap(), ["Downtown", "Uptown"]);
}
