use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;

use crate::models::{
    unique_links, ClickEvent, NewReport, PermissionGrant, Report, ReportAccess, ReportUpdate,
    ResourceKind, ResourceRef, Role, User,
};
use crate::storage::sqlite::{
    click_from_row, grant_from_row, report_from_row, ClickRow, ReportRow,
};
use crate::storage::{
    db_err, from_unix, unix_now, ClickEventStore, GrantTransaction, PermissionStore, ReportStore,
    Storage, StorageError, StorageResult, UserDirectory,
};

pub struct PostgresStorage {
    pool: Arc<PgPool>,
}

impl PostgresStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                login TEXT NOT NULL UNIQUE,
                created_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS click_events (
                id BIGSERIAL PRIMARY KEY,
                resource_id TEXT NOT NULL,
                clicked_at BIGINT NOT NULL,
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
                custom_start BIGINT,
                custom_end BIGINT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
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
                position BIGINT NOT NULL,
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
impl ClickEventStore for PostgresStorage {
    async fn append(&self, event: &ClickEvent) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO click_events (resource_id, clicked_at, device_type, browser, referrer)
            VALUES ($1, $2, $3, $4, $5)
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
            WHERE resource_id = $1
              AND ($2::BIGINT IS NULL OR clicked_at >= $2)
              AND ($3::BIGINT IS NULL OR clicked_at <= $3)
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
            "SELECT MIN(clicked_at) FROM click_events WHERE resource_id = $1",
        )
        .bind(resource_id)
        .fetch_one(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        earliest.map(from_unix).transpose()
    }
}

#[async_trait]
impl PermissionStore for PostgresStorage {
    async fn get(&self, resource: &ResourceRef, user_id: &str) -> StorageResult<Option<Role>> {
        let role = sqlx::query_scalar::<_, String>(
            r#"
            SELECT role FROM resource_permissions
            WHERE resource_type = $1 AND resource_id = $2 AND user_id = $3
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
            WHERE resource_type = $1 AND resource_id = $2
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Held until commit or rollback; covers inserts as well as existing rows.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(resource.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        Ok(Box::new(PostgresGrantTransaction {
            resource: resource.clone(),
            tx,
        }))
    }
}

struct PostgresGrantTransaction {
    resource: ResourceRef,
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl GrantTransaction for PostgresGrantTransaction {
    async fn get(&mut self, user_id: &str) -> StorageResult<Option<Role>> {
        let role = sqlx::query_scalar::<_, String>(
            r#"
            SELECT role FROM resource_permissions
            WHERE resource_type = $1 AND resource_id = $2 AND user_id = $3
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
            WHERE resource_type = $1 AND resource_id = $2
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
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (resource_type, resource_id, user_id) DO UPDATE SET
                role = EXCLUDED.role
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
            WHERE resource_type = $1 AND resource_id = $2 AND user_id = $3
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
        self.tx.commit().await.map_err(db_err)
    }
}

#[async_trait]
impl UserDirectory for PostgresStorage {
    async fn create_user(&self, login: &str) -> StorageResult<User> {
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            login: login.to_string(),
            created_at: unix_now(),
        };

        sqlx::query("INSERT INTO users (id, login, created_at) VALUES ($1, $2, $3)")
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
            "SELECT id, login, created_at FROM users WHERE login = $1",
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
impl ReportStore for PostgresStorage {
    async fn create_report(&self, created_by: &str, report: &NewReport) -> StorageResult<Report> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = unix_now();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO reports (id, name, created_by, granularity, chart_type, period_type,
                                 custom_start, custom_end, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            VALUES ($1, $2, $3, $4)
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
            WHERE id = $1
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
            "SELECT short_link_id FROM report_short_links WHERE report_id = $1 ORDER BY position",
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
            WHERE id = $1
            FOR UPDATE
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
            "SELECT short_link_id FROM report_short_links WHERE report_id = $1 ORDER BY position",
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
            SET name = $1, granularity = $2, chart_type = $3, period_type = $4,
                custom_start = $5, custom_end = $6, updated_at = $7
            WHERE id = $8
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
            sqlx::query("DELETE FROM report_short_links WHERE report_id = $1")
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
              ON p.resource_type = $1 AND p.resource_id = r.id
            WHERE p.user_id = $2
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
    tx: &mut Transaction<'static, Postgres>,
    report_id: &str,
    short_link_ids: &[String],
) -> StorageResult<()> {
    for (position, link_id) in short_link_ids.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO report_short_links (report_id, short_link_id, position)
            VALUES ($1, $2, $3)
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
