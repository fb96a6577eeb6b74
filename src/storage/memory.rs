//! In-process storage backend
//!
//! Keeps every collaborator in `DashMap`s. Each resource's grant set sits
//! behind its own async mutex; a grant transaction owns that mutex and
//! works on a staged copy that replaces the shared set on commit.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::{
    unique_links, ClickEvent, NewReport, PermissionGrant, Report, ReportAccess, ReportUpdate,
    ResourceKind, ResourceRef, Role, User,
};
use crate::storage::{
    unix_now, ClickEventStore, GrantTransaction, PermissionStore, ReportStore, Storage,
    StorageError, StorageResult, UserDirectory,
};

type GrantSet = HashMap<String, Role>;

#[derive(Default)]
pub struct MemoryStorage {
    clicks: DashMap<String, Vec<ClickEvent>>,
    grants: DashMap<ResourceRef, Arc<Mutex<GrantSet>>>,
    /// Keyed by login.
    users: DashMap<String, User>,
    reports: DashMap<String, Report>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn grant_set(&self, resource: &ResourceRef) -> Option<Arc<Mutex<GrantSet>>> {
        self.grants
            .get(resource)
            .map(|entry| Arc::clone(entry.value()))
    }
}

fn to_grants(resource: &ResourceRef, set: &GrantSet) -> Vec<PermissionGrant> {
    let mut grants: Vec<PermissionGrant> = set
        .iter()
        .map(|(user_id, role)| PermissionGrant {
            resource: resource.clone(),
            user_id: user_id.clone(),
            role: *role,
        })
        .collect();
    grants.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    grants
}

#[async_trait]
impl ClickEventStore for MemoryStorage {
    async fn append(&self, event: &ClickEvent) -> StorageResult<()> {
        let mut events = self.clicks.entry(event.resource_id.clone()).or_default();
        // Keep each log sorted so queries return events in time order.
        let idx = events.partition_point(|e| e.clicked_at <= event.clicked_at);
        events.insert(idx, event.clone());
        Ok(())
    }

    async fn query(
        &self,
        resource_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<ClickEvent>> {
        let Some(events) = self.clicks.get(resource_id) else {
            return Ok(Vec::new());
        };

        Ok(events
            .iter()
            .filter(|e| from.map_or(true, |f| e.clicked_at >= f))
            .filter(|e| to.map_or(true, |t| e.clicked_at <= t))
            .cloned()
            .collect())
    }

    async fn earliest_click(&self, resource_id: &str) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self
            .clicks
            .get(resource_id)
            .and_then(|events| events.first().map(|e| e.clicked_at)))
    }
}

#[async_trait]
impl PermissionStore for MemoryStorage {
    async fn get(&self, resource: &ResourceRef, user_id: &str) -> StorageResult<Option<Role>> {
        let Some(set) = self.grant_set(resource) else {
            return Ok(None);
        };
        let guard = set.lock().await;
        Ok(guard.get(user_id).copied())
    }

    async fn list(&self, resource: &ResourceRef) -> StorageResult<Vec<PermissionGrant>> {
        let Some(set) = self.grant_set(resource) else {
            return Ok(Vec::new());
        };
        let guard = set.lock().await;
        Ok(to_grants(resource, &guard))
    }

    async fn begin(&self, resource: &ResourceRef) -> StorageResult<Box<dyn GrantTransaction>> {
        let set = self
            .grants
            .entry(resource.clone())
            .or_default()
            .value()
            .clone();
        let guard = set.lock_owned().await;
        let staged = guard.clone();

        Ok(Box::new(MemoryGrantTransaction {
            resource: resource.clone(),
            guard,
            staged,
        }))
    }
}

struct MemoryGrantTransaction {
    resource: ResourceRef,
    guard: OwnedMutexGuard<GrantSet>,
    staged: GrantSet,
}

#[async_trait]
impl GrantTransaction for MemoryGrantTransaction {
    async fn get(&mut self, user_id: &str) -> StorageResult<Option<Role>> {
        Ok(self.staged.get(user_id).copied())
    }

    async fn list(&mut self) -> StorageResult<Vec<PermissionGrant>> {
        Ok(to_grants(&self.resource, &self.staged))
    }

    async fn upsert(&mut self, user_id: &str, role: Role) -> StorageResult<()> {
        self.staged.insert(user_id.to_string(), role);
        Ok(())
    }

    async fn delete(&mut self, user_id: &str) -> StorageResult<bool> {
        Ok(self.staged.remove(user_id).is_some())
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let MemoryGrantTransaction {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryStorage {
    async fn create_user(&self, login: &str) -> StorageResult<User> {
        use dashmap::mapref::entry::Entry;

        match self.users.entry(login.to_string()) {
            Entry::Occupied(_) => Err(StorageError::Conflict),
            Entry::Vacant(slot) => {
                let user = User {
                    id: uuid::Uuid::new_v4().to_string(),
                    login: login.to_string(),
                    created_at: unix_now(),
                };
                slot.insert(user.clone());
                Ok(user)
            }
        }
    }

    async fn user_by_login(&self, login: &str) -> StorageResult<Option<User>> {
        Ok(self.users.get(login).map(|u| u.value().clone()))
    }
}

#[async_trait]
impl ReportStore for MemoryStorage {
    async fn create_report(&self, created_by: &str, report: &NewReport) -> StorageResult<Report> {
        let now = unix_now();
        let created = Report {
            id: uuid::Uuid::new_v4().to_string(),
            name: report.name.clone(),
            created_by: created_by.to_string(),
            short_link_ids: unique_links(&report.short_link_ids),
            granularity: report.granularity,
            chart_type: report.chart_type,
            period: report.period,
            created_at: now,
            updated_at: now,
        };

        // The grant set is in place before the report becomes visible.
        let admins = GrantSet::from([(created_by.to_string(), Role::Admin)]);
        self.grants.insert(
            ResourceRef::report(&created.id),
            Arc::new(Mutex::new(admins)),
        );
        self.reports.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn get_report(&self, report_id: &str) -> StorageResult<Option<Report>> {
        Ok(self.reports.get(report_id).map(|r| r.value().clone()))
    }

    async fn update_report(
        &self,
        report_id: &str,
        update: &ReportUpdate,
    ) -> StorageResult<Option<Report>> {
        Ok(self.reports.get_mut(report_id).map(|mut entry| {
            entry.apply(update, unix_now());
            entry.value().clone()
        }))
    }

    async fn reports_for_user(&self, user_id: &str) -> StorageResult<Vec<ReportAccess>> {
        let sets: Vec<(String, Arc<Mutex<GrantSet>>)> = self
            .grants
            .iter()
            .filter(|entry| entry.key().kind == ResourceKind::Report)
            .map(|entry| (entry.key().id.clone(), Arc::clone(entry.value())))
            .collect();

        let mut listed = Vec::new();
        for (report_id, set) in sets {
            let Some(role) = set.lock().await.get(user_id).copied() else {
                continue;
            };
            if let Some(report) = self.reports.get(&report_id) {
                listed.push(ReportAccess {
                    report: report.value().clone(),
                    role,
                });
            }
        }
        listed.sort_by(|a, b| {
            (a.report.created_at, &a.report.id).cmp(&(b.report.created_at, &b.report.id))
        });
        Ok(listed)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn init(&self) -> Result<()> {
        Ok(())
    }
}
