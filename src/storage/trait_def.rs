use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{
    ClickEvent, Granularity, NewReport, PermissionGrant, Report, ReportAccess, ReportUpdate,
    ResourceRef, Role, User,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record already exists")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Append-only log of raw clicks.
#[async_trait]
pub trait ClickEventStore: Send + Sync {
    async fn append(&self, event: &ClickEvent) -> StorageResult<()>;

    /// Events for one resource with `from <= clicked_at <= to`; an absent
    /// bound leaves that side open. Ordered by `clicked_at`.
    async fn query(
        &self,
        resource_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<ClickEvent>>;

    async fn earliest_click(&self, resource_id: &str) -> StorageResult<Option<DateTime<Utc>>>;

    /// Bucket boundary containing the earliest click, if any.
    async fn earliest_bucket(
        &self,
        resource_id: &str,
        granularity: Granularity,
    ) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self
            .earliest_click(resource_id)
            .await?
            .map(|ts| granularity.truncate(ts)))
    }
}

/// Persisted role assignments. Reads outside a transaction see committed
/// state only; mutations go through [`PermissionStore::begin`].
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn get(&self, resource: &ResourceRef, user_id: &str) -> StorageResult<Option<Role>>;

    async fn list(&self, resource: &ResourceRef) -> StorageResult<Vec<PermissionGrant>>;

    /// Open a unit of work holding exclusive access to the grant set of
    /// `resource` until it is committed or dropped. Dropping rolls back.
    async fn begin(&self, resource: &ResourceRef) -> StorageResult<Box<dyn GrantTransaction>>;
}

#[async_trait]
pub trait GrantTransaction: Send {
    async fn get(&mut self, user_id: &str) -> StorageResult<Option<Role>>;

    async fn list(&mut self) -> StorageResult<Vec<PermissionGrant>>;

    async fn upsert(&mut self, user_id: &str, role: Role) -> StorageResult<()>;

    async fn delete(&mut self, user_id: &str) -> StorageResult<bool>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Register a login. Fails with [`StorageError::Conflict`] if taken.
    async fn create_user(&self, login: &str) -> StorageResult<User>;

    async fn user_by_login(&self, login: &str) -> StorageResult<Option<User>>;
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Persist the report, its links and an ADMIN grant for `created_by`
    /// as one unit. Either all of it is visible afterwards or none of it.
    async fn create_report(&self, created_by: &str, report: &NewReport) -> StorageResult<Report>;

    async fn get_report(&self, report_id: &str) -> StorageResult<Option<Report>>;

    /// Apply `update` and bump `updated_at`. `None` if the report is gone.
    async fn update_report(
        &self,
        report_id: &str,
        update: &ReportUpdate,
    ) -> StorageResult<Option<Report>>;

    /// Every report `user_id` holds a grant on, oldest first.
    async fn reports_for_user(&self, user_id: &str) -> StorageResult<Vec<ReportAccess>>;
}

/// A backend that provides every collaborator the core needs.
#[async_trait]
pub trait Storage: ClickEventStore + PermissionStore + UserDirectory + ReportStore {
    /// Initialize the storage (create tables, etc.)
    async fn init(&self) -> Result<()>;
}
