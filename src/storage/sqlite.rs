use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::{
    unique_links, ClickEvent, NewReport, PeriodPolicy, PermissionGrant, Report, ReportAccess,
    ReportUpdate, ResourceKind, ResourceRef, Role, User,
};
use crate::storage::{
    db_err, from_unix, unix_now, ClickEventStore, GrantTransaction, PermissionStore, ReportStore,
    Storage, StorageError, StorageResult, UserDirectory,
};

pub(crate) type ClickRow = (String, i64, String, String, Option<String>);
pub(crate) type ReportRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<i64>,
    Option<i64>,
    i64,
    i64,
);

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
    /// SQLite has no row locks; grant transactions for one resource are
    /// serialized here before the database transaction opens.
    grant_locks: DashMap<ResourceRef, Arc<Mutex<()>>>,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
            grant_locks: DashMap::new(),
        })
    }
}

pub(crate) fn click_from_row(row: ClickRow) -> StorageResult<ClickEvent> {
    let (resource_id, clicked_at, device_type, browser, referrer) = row;
    Ok(ClickEvent {
        resource_id,
        clicked_at: from_unix(clicked_at)?,
        device_type: device_type.parse().map_err(StorageError::Other)?,
        browser,
        referrer,
    })
}

pub(crate) fn grant_from_row(
    resource: &ResourceRef,
    (user_id, role): (String, String),
) -> StorageResult<PermissionGrant> {
    Ok(PermissionGrant {
        resource: resource.clone(),
        user_id,
        role: role.parse().map_err(StorageError::Other)?,
    })
}

pub(crate) fn report_from_row(row: ReportRow, short_link_ids: Vec<String>) -> StorageResult<Report> {
    let (
        id,
        name,
        created_by,
        granularity,
        chart_type,
        period_type,
        custom_start,
        custom_end,
        created_at,
        updated_at,
    ) = row;

    let custom_start = custom_start.map(from_unix).transpose()?;
    let custom_end = custom_end.map(from_unix).transpose()?;

    Ok(Report {
        id,
        name,
        created_by,
        short_link_ids,
        granularity: granularity
            .parse()
            .map_err(|e: crate::Error| StorageError::Other(e.into()))?,
        chart_type: chart_type.parse().map_err(StorageError::Other)?,
        period: PeriodPolicy::from_parts(&period_type, custom_start, custom_end)
            .map_err(StorageError::Other)?,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                login TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS click_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_id TEXT NOT NULL,
                clicked_at INTEGER NOT NULL,
                device_type TEXT NOT NULL,
                browser TEXT NOT NULL,
                referrer TEXT
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_click_events_resource_time ON click_events(resource_id, clicked_at)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resource_permissions (
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (resource_type, resource_id, user_id)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_by TEXT NOT NULL,
                granularity TEXT NOT NULL,
                chart_type TEXT NOT NULL,
                period_type TEXT NOT NULL,
                custom_start INTEGER,
                custom_end INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS report_short_links (
                report_id TEXT NOT NULL,
                short_link_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (report_id, short_link_id)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ClickEventStore for SqliteStorage {
    async fn append(&self, event: &ClickEvent) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO click_events (resource_id, clicked_at, device_type, browser, referrer)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.resource_id)
        .bind(event.clicked_at.timestamp())
        .bind(event.device_type.as_str())
        .bind(&event.browser)
        .bind(event.referrer.as_deref())
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn query(
        &self,
        resource_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<ClickEvent>> {
        let rows = sqlx::query_as::<_, ClickRow>(
            r#"
            SELECT resource_id, clicked_at, device_type, browser, referrer
            FROM click_events
            WHERE resource_id = ?1
              AND (?2 IS NULL OR clicked_at >= ?2)
              AND (?3 IS NULL OR clicked_at <= ?3)
            ORDER BY clicked_at, id
            "#,
        )
        .bind(resource_id)
        .bind(from.map(|f| f.timestamp()))
        .bind(to.map(|t| t.timestamp()))
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        rows.into_iter().map(click_from_row).collect()
    }

    async fn earliest_click(&self, resource_id: &str) -> StorageResult<Option<DateTime<Utc>>> {
        let earliest = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MIN(clicked_at) FROM click_events WHERE resource_id = ?",
        )
        .bind(resource_id)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        earliest.map(from_unix).transpose()
    }
}

#[async_trait]
impl PermissionStore for SqliteStorage {
    async fn get(&self, resource: &ResourceRef, user_id: &str) -> StorageResult<Option<Role>> {
        let role = sqlx::query_scalar::<_, String>(
            r#"
            SELECT role FROM resource_permissions
            WHERE resource_type = ? AND resource_id = ? AND user_id = ?
            "#,
        )
        .bind(resource.kind.as_str())
        .bind(&resource.id)
        .bind(user_id)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        role.map(|r| r.parse().map_err(StorageError::Other))
            .transpose()
    }

    async fn list(&self, resource: &ResourceRef) -> StorageResult<Vec<PermissionGrant>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT user_id, role FROM resource_permissions
            WHERE resource_type = ? AND resource_id = ?
            ORDER BY user_id
            "#,
        )
        .bind(resource.kind.as_str())
        .bind(&resource.id)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| grant_from_row(resource, row))
            .collect()
    }

    async fn begin(&self, resource: &ResourceRef) -> StorageResult<Box<dyn GrantTransaction>> {
        let lock = self
            .grant_locks
            .entry(resource.clone())
            .or_default()
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        let tx = self.pool.begin().await.map_err(db_err)?;

        Ok(Box::new(SqliteGrantTransaction {
            resource: resource.clone(),
            tx,
            _guard: guard,
        }))
    }
}

struct SqliteGrantTransaction {
    resource: ResourceRef,
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl GrantTransaction for SqliteGrantTransaction {
    async fn get(&mut self, user_id: &str) -> StorageResult<Option<Role>> {
        let role = sqlx::query_scalar::<_, String>(
            r#"
            SELECT role FROM resource_permissions
            WHERE resource_type = ? AND resource_id = ? AND user_id = ?
            "#,
        )
        .bind(self.resource.kind.as_str())
        .bind(&self.resource.id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?;

        role.map(|r| r.parse().map_err(StorageError::Other))
            .transpose()
    }

    async fn list(&mut self) -> StorageResult<Vec<PermissionGrant>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT user_id, role FROM resource_permissions
            WHERE resource_type = ? AND resource_id = ?
            ORDER BY user_id
            "#,
        )
        .bind(self.resource.kind.as_str())
        .bind(&self.resource.id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| grant_from_row(&self.resource, row))
            .collect()
    }

    async fn upsert(&mut self, user_id: &str, role: Role) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_permissions (resource_type, resource_id, user_id, role)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (resource_type, resource_id, user_id) DO UPDATE SET
                role = excluded.role
            "#,
        )
        .bind(self.resource.kind.as_str())
        .bind(&self.resource.id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn delete(&mut self, user_id: &str) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM resource_permissions
            WHERE resource_type = ? AND resource_id = ? AND user_id = ?
            "#,
        )
        .bind(self.resource.kind.as_str())
        .bind(&self.resource.id)
        .bind(user_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let SqliteGrantTransaction {
            tx, _guard: guard, ..
        } = *self;
        tx.commit().await.map_err(db_err)?;
        drop(guard);
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for SqliteStorage {
    async fn create_user(&self, login: &str) -> StorageResult<User> {
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            login: login.to_string(),
            created_at: unix_now(),
        };

        sqlx::query("INSERT INTO users (id, login, created_at) VALUES (?, ?, ?)")
            .bind(&user.id)
            .bind(&user.login)
            .bind(user.created_at)
            .execute(self.pool.as_ref())
            .await
            .map_err(db_err)?;

        Ok(user)
    }

    async fn user_by_login(&self, login: &str) -> StorageResult<Option<User>> {
        let row = sqlx::query_as::<_, (String, String, i64)>(
            "SELECT id, login, created_at FROM users WHERE login = ?",
        )
        .bind(login)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        Ok(row.map(|(id, login, created_at)| User {
            id,
            login,
            created_at,
        }))
    }
}

#[async_trait]
impl ReportStore for SqliteStorage {
    async fn create_report(&self, created_by: &str, report: &NewReport) -> StorageResult<Report> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = unix_now();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO reports (id, name, created_by, granularity, chart_type, period_type,
                                 custom_start, custom_end, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&report.name)
        .bind(created_by)
        .bind(report.granularity.as_str())
        .bind(report.chart_type.as_str())
        .bind(report.period.kind())
        .bind(report.period.custom_start().map(|t| t.timestamp()))
        .bind(report.period.custom_end().map(|t| t.timestamp()))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        insert_links(&mut tx, &id, &unique_links(&report.short_link_ids)).await?;

        sqlx::query(
            r#"
            INSERT INTO resource_permissions (resource_type, resource_id, user_id, role)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(ResourceKind::Report.as_str())
        .bind(&id)
        .bind(created_by)
        .bind(Role::Admin.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        self.get_report(&id)
            .await?
            .ok_or_else(|| StorageError::Other(anyhow::anyhow!("report {id} vanished after insert")))
    }

    async fn get_report(&self, report_id: &str) -> StorageResult<Option<Report>> {
        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT id, name, created_by, granularity, chart_type, period_type,
                   custom_start, custom_end, created_at, updated_at
            FROM reports
            WHERE id = ?
            "#,
        )
        .bind(report_id)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let links = sqlx::query_scalar::<_, String>(
            "SELECT short_link_id FROM report_short_links WHERE report_id = ? ORDER BY position",
        )
        .bind(report_id)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        report_from_row(row, links).map(Some)
    }

    async fn update_report(
        &self,
        report_id: &str,
        update: &ReportUpdate,
    ) -> StorageResult<Option<Report>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT id, name, created_by, granularity, chart_type, period_type,
                   custom_start, custom_end, created_at, updated_at
            FROM reports
            WHERE id = ?
            "#,
        )
        .bind(report_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let links = sqlx::query_scalar::<_, String>(
            "SELECT short_link_id FROM report_short_links WHERE report_id = ? ORDER BY position",
        )
        .bind(report_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut report = report_from_row(row, links)?;
        report.apply(update, unix_now());

        sqlx::query(
            r#"
            UPDATE reports
            SET name = ?, granularity = ?, chart_type = ?, period_type = ?,
                custom_start = ?, custom_end = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&report.name)
        .bind(report.granularity.as_str())
        .bind(report.chart_type.as_str())
        .bind(report.period.kind())
        .bind(report.period.custom_start().map(|t| t.timestamp()))
        .bind(report.period.custom_end().map(|t| t.timestamp()))
        .bind(report.updated_at)
        .bind(report_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if update.short_link_ids.is_some() {
            sqlx::query("DELETE FROM report_short_links WHERE report_id = ?")
                .bind(report_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            insert_links(&mut tx, report_id, &report.short_link_ids).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(Some(report))
    }

    async fn reports_for_user(&self, user_id: &str) -> StorageResult<Vec<ReportAccess>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT r.id, p.role
            FROM reports r
            JOIN resource_permissions p
              ON p.resource_type = ? AND p.resource_id = r.id
            WHERE p.user_id = ?
            ORDER BY r.created_at, r.id
            "#,
        )
        .bind(ResourceKind::Report.as_str())
        .bind(user_id)
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        let mut listed = Vec::with_capacity(rows.len());
        for (report_id, role) in rows {
            if let Some(report) = self.get_report(&report_id).await? {
                listed.push(ReportAccess {
                    report,
                    role: role.parse().map_err(StorageError::Other)?,
                });
            }
        }
        Ok(listed)
    }
}

async fn insert_links(
    tx: &mut Transaction<'static, Sqlite>,
    report_id: &str,
    short_link_ids: &[String],
) -> StorageResult<()> {
    for (position, link_id) in short_link_ids.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO report_short_links (report_id, short_link_id, position)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(report_id)
        .bind(link_id)
        .bind(position as i64)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceType, Granularity};
    use chrono::TimeZone;

    async fn setup() -> SqliteStorage {
        let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
        storage.init().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_click_roundtrip_and_earliest_bucket() {
        let storage = setup().await;
        let first = Utc.with_ymd_and_hms(2024, 2, 10, 5, 30, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        storage
            .append(&ClickEvent::new("l1", second, DeviceType::Mobile, "Safari", Some("https://t.co")))
            .await
            .unwrap();
        storage
            .append(&ClickEvent::new("l1", first, DeviceType::Desktop, "Chrome", None))
            .await
            .unwrap();

        let events = storage.query("l1", None, None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].clicked_at, first);
        assert_eq!(events[0].referrer, None);
        assert_eq!(events[1].device_type, DeviceType::Mobile);

        let bucket = storage.earliest_bucket("l1", Granularity::Month).await.unwrap();
        assert_eq!(bucket, Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
        assert_eq!(storage.earliest_click("none").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_grant_transaction_commit_and_rollback() {
        let storage = setup().await;
        let resource = ResourceRef::short_link("l1");

        let mut tx = storage.begin(&resource).await.unwrap();
        tx.upsert("u1", Role::Admin).await.unwrap();
        tx.upsert("u2", Role::Viewer).await.unwrap();
        tx.upsert("u2", Role::Editor).await.unwrap();
        assert_eq!(tx.list().await.unwrap().len(), 2);
        tx.commit().await.unwrap();

        assert_eq!(storage.get(&resource, "u2").await.unwrap(), Some(Role::Editor));

        let mut tx = storage.begin(&resource).await.unwrap();
        assert!(tx.delete("u2").await.unwrap());
        drop(tx);

        assert_eq!(storage.list(&resource).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_report_roundtrip() {
        let storage = setup().await;
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let created = storage
            .create_report(
                "u1",
                &NewReport {
                    name: "launch".to_string(),
                    short_link_ids: vec!["b".to_string(), "a".to_string(), "b".to_string()],
                    granularity: Granularity::Hour,
                    period: PeriodPolicy::Custom {
                        start: Some(start),
                        end: None,
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(created.short_link_ids, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(created.granularity, Granularity::Hour);
        assert_eq!(created.period.custom_start(), Some(start));
        assert!(storage.get_report("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_report_carries_creator_admin_and_updates() {
        let storage = setup().await;
        let report = storage
            .create_report(
                "u1",
                &NewReport {
                    name: "launch".to_string(),
                    short_link_ids: vec!["a".to_string(), "b".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let resource = ResourceRef::report(&report.id);
        assert_eq!(storage.get(&resource, "u1").await.unwrap(), Some(Role::Admin));

        let updated = storage
            .update_report(
                &report.id,
                &ReportUpdate {
                    short_link_ids: Some(vec!["c".to_string(), "a".to_string()]),
                    granularity: Some(Granularity::Month),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.short_link_ids, vec!["c", "a"]);
        assert_eq!(storage.get_report(&report.id).await.unwrap(), Some(updated));

        let listed = storage.reports_for_user("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].report.name, "launch");
        assert_eq!(listed[0].role, Role::Admin);
        assert!(storage.reports_for_user("u2").await.unwrap().is_empty());
    }
}
