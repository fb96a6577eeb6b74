//! Integration tests for the SQL storage backends
//!
//! Tests can be filtered by database backend using the DATABASE_BACKEND environment variable:
//! - `DATABASE_BACKEND=sqlite cargo test` - Run only SQLite tests
//! - `DATABASE_BACKEND=postgres cargo test` - Run only PostgreSQL tests (needs DATABASE_URL)
//! - By default, both backends are tested

use chrono::{DateTime, TimeZone, Utc};
use clickstats::models::{
    ChartType, ClickEvent, DeviceType, Granularity, NewReport, PeriodPolicy, ReportUpdate,
    ResourceRef, Role,
};
use clickstats::storage::{
    ClickEventStore, PermissionStore, PostgresStorage, ReportStore, SqliteStorage, Storage,
    StorageError, UserDirectory,
};
use std::sync::Arc;

/// Get the database backend to test from environment variable
fn should_test_backend(backend: &str) -> bool {
    match std::env::var("DATABASE_BACKEND") {
        Ok(val) => val.to_lowercase() == backend.to_lowercase(),
        Err(_) => true, // Test all backends if not specified
    }
}

async fn create_sqlite_storage() -> Arc<dyn Storage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

async fn create_postgres_storage() -> Option<Arc<dyn Storage>> {
    let db_url = std::env::var("DATABASE_URL").ok()?;
    let storage = PostgresStorage::new(&db_url, 5).await.ok()?;
    storage.init().await.ok()?;
    Some(Arc::new(storage))
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, d, h, m, 0).unwrap()
}

async fn click_log_roundtrip(storage: Arc<dyn Storage>) {
    let link = unique("link");
    let events = [
        ClickEvent::new(&link, at(3, 8, 0), DeviceType::Mobile, "Chrome", Some("unknown")),
        ClickEvent::new(&link, at(1, 12, 30), DeviceType::Desktop, "Firefox", None),
        ClickEvent::new(&link, at(2, 0, 0), DeviceType::Bot, "curl", Some("https://a.example")),
    ];
    for event in &events {
        storage.append(event).await.unwrap();
    }

    let all = storage.query(&link, None, None).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].clicked_at <= w[1].clicked_at));
    assert_eq!(all[0], events[1]);

    // Null and the literal "unknown" survive as different referrers.
    assert_eq!(all[0].referrer, None);
    assert_eq!(all[2].referrer.as_deref(), Some("unknown"));

    let bounded = storage
        .query(&link, Some(at(2, 0, 0)), Some(at(3, 8, 0)))
        .await
        .unwrap();
    assert_eq!(bounded.len(), 2);

    assert_eq!(
        storage.earliest_click(&link).await.unwrap(),
        Some(at(1, 12, 30))
    );
    assert_eq!(
        storage.earliest_bucket(&link, Granularity::Day).await.unwrap(),
        Some(at(1, 0, 0))
    );
    assert_eq!(storage.earliest_click(&unique("none")).await.unwrap(), None);
}

async fn grant_transactions(storage: Arc<dyn Storage>) {
    let resource = ResourceRef::report(unique("report"));

    let mut tx = storage.begin(&resource).await.unwrap();
    tx.upsert("u1", Role::Admin).await.unwrap();
    tx.upsert("u2", Role::Viewer).await.unwrap();
    assert_eq!(tx.list().await.unwrap().len(), 2);
    drop(tx);
    assert!(storage.list(&resource).await.unwrap().is_empty());

    let mut tx = storage.begin(&resource).await.unwrap();
    tx.upsert("u1", Role::Admin).await.unwrap();
    tx.upsert("u2", Role::Viewer).await.unwrap();
    tx.upsert("u2", Role::Editor).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        storage.get(&resource, "u2").await.unwrap(),
        Some(Role::Editor)
    );

    let mut tx = storage.begin(&resource).await.unwrap();
    assert!(tx.delete("u2").await.unwrap());
    assert!(!tx.delete("u2").await.unwrap());
    tx.commit().await.unwrap();

    let grants = storage.list(&resource).await.unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].user_id, "u1");
    assert_eq!(grants[0].resource, resource);
}

async fn users_and_reports(storage: Arc<dyn Storage>) {
    let login = unique("user");
    let user = storage.create_user(&login).await.unwrap();
    assert!(matches!(
        storage.create_user(&login).await,
        Err(StorageError::Conflict)
    ));
    assert_eq!(
        storage.user_by_login(&login).await.unwrap(),
        Some(user.clone())
    );

    let report = storage
        .create_report(
            &user.id,
            &NewReport {
                name: "Launch".to_string(),
                short_link_ids: vec!["z".to_string(), "a".to_string(), "z".to_string()],
                granularity: Granularity::Hour,
                chart_type: ChartType::Bar,
                period: PeriodPolicy::Custom {
                    start: Some(at(1, 0, 0)),
                    end: None,
                },
            },
        )
        .await
        .unwrap();

    let loaded = storage.get_report(&report.id).await.unwrap().unwrap();
    assert_eq!(loaded, report);
    assert_eq!(loaded.short_link_ids, vec!["z", "a"]);
    assert_eq!(loaded.chart_type, ChartType::Bar);
    assert_eq!(loaded.period.custom_start(), Some(at(1, 0, 0)));
    assert!(storage.get_report(&unique("missing")).await.unwrap().is_none());

    // The creator's admin grant lands with the report.
    assert_eq!(
        storage
            .get(&ResourceRef::report(&report.id), &user.id)
            .await
            .unwrap(),
        Some(Role::Admin)
    );

    let updated = storage
        .update_report(
            &report.id,
            &ReportUpdate {
                name: Some("Relaunch".to_string()),
                short_link_ids: Some(vec!["a".to_string(), "q".to_string()]),
                period: Some(PeriodPolicy::Last30d),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.short_link_ids, vec!["a", "q"]);
    assert_eq!(updated.chart_type, ChartType::Bar);
    assert_eq!(storage.get_report(&report.id).await.unwrap(), Some(updated));
    assert!(storage
        .update_report(&unique("missing"), &ReportUpdate::default())
        .await
        .unwrap()
        .is_none());

    let listed = storage.reports_for_user(&user.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].report.id, report.id);
    assert_eq!(listed[0].role, Role::Admin);
}

#[tokio::test]
async fn test_click_log_sqlite() {
    if !should_test_backend("sqlite") {
        return;
    }
    click_log_roundtrip(create_sqlite_storage().await).await;
}

#[tokio::test]
async fn test_grant_transactions_sqlite() {
    if !should_test_backend("sqlite") {
        return;
    }
    grant_transactions(create_sqlite_storage().await).await;
}

#[tokio::test]
async fn test_users_and_reports_sqlite() {
    if !should_test_backend("sqlite") {
        return;
    }
    users_and_reports(create_sqlite_storage().await).await;
}

#[tokio::test]
async fn test_storage_postgres() {
    if !should_test_backend("postgres") {
        return;
    }
    let Some(storage) = create_postgres_storage().await else {
        return;
    };
    click_log_roundtrip(storage.clone()).await;
    grant_transactions(storage.clone()).await;
    users_and_reports(storage).await;
}
