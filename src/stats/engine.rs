//! Report and link statistics behind the access gate
//!
//! `build_report_stats` fans out one task per resource and joins them all
//! before merging. Results are put back in input order, so the output does
//! not depend on which task finishes first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::access::AccessController;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{
    AggregateReport, ClickEvent, Granularity, MergedStats, NewReport, Principal, Report,
    ReportAccess, ReportUpdate, ResourceRef, ResourceStats, Role,
};
use crate::stats::aggregator::{merge, merge_summaries, StatsAggregator};
use crate::stats::timeseries::{validate_window, TimeSeriesBuilder};
use crate::stats::window::{ReportWindowResolver, Window};
use crate::storage::{ClickEventStore, ReportStore, Stores};

/// Request-level overrides for a report's stored settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportStatsQuery {
    pub granularity: Option<Granularity>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tz_offset_minutes: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportStats {
    pub report_id: String,
    /// The caller's role on the report.
    pub role: Role,
    pub granularity: Granularity,
    pub window: Window,
    /// Per-link series share the merged label axis.
    pub stats: AggregateReport,
}

pub struct StatsEngine {
    clicks: Arc<dyn ClickEventStore>,
    reports: Arc<dyn ReportStore>,
    access: AccessController,
    builder: TimeSeriesBuilder,
    aggregator: StatsAggregator,
    resolver: ReportWindowResolver,
    clock: Arc<dyn Clock>,
}

impl StatsEngine {
    pub fn new(stores: Stores, clock: Arc<dyn Clock>) -> Self {
        Self {
            builder: TimeSeriesBuilder::new(stores.clicks.clone(), clock.clone()),
            aggregator: StatsAggregator::new(stores.clicks.clone()),
            resolver: ReportWindowResolver::new(clock.clone()),
            access: AccessController::new(stores.permissions, stores.users),
            clicks: stores.clicks,
            reports: stores.reports,
            clock,
        }
    }

    pub fn access(&self) -> &AccessController {
        &self.access
    }

    pub async fn record_click(&self, event: &ClickEvent) -> Result<()> {
        if event.resource_id.is_empty() {
            return Err(Error::invalid_range("resource id must not be empty"));
        }
        self.clicks.append(event).await?;
        Ok(())
    }

    /// Series and summary for every resource plus their merge.
    pub async fn build_report_stats(
        &self,
        resource_ids: &[String],
        granularity: Granularity,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<AggregateReport> {
        for id in resource_ids {
            validate_window(id, from, to)?;
        }
        // One "now" for the whole fan-out so every series ends on the same bucket.
        let to = Some(to.unwrap_or_else(|| self.clock.now()));

        debug!(
            resources = resource_ids.len(),
            granularity = ?granularity,
            "building report stats"
        );

        let mut tasks = JoinSet::new();
        for (idx, id) in resource_ids.iter().enumerate() {
            let builder = self.builder.clone();
            let aggregator = self.aggregator.clone();
            let id = id.clone();
            tasks.spawn(async move {
                let stats = resource_stats(&builder, &aggregator, id, granularity, from, to).await;
                (idx, stats)
            });
        }

        let mut slots: Vec<Option<Result<ResourceStats>>> =
            (0..resource_ids.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (idx, stats) = joined
                .map_err(|e| Error::StoreUnavailable(anyhow::anyhow!("stats task failed: {e}")))?;
            slots[idx] = Some(stats);
        }

        let mut per_resource = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Some(stats) => per_resource.push(stats?),
                None => {
                    return Err(Error::StoreUnavailable(anyhow::anyhow!(
                        "stats task produced no result"
                    )))
                }
            }
        }

        let series: Vec<_> = per_resource.iter().map(|s| s.series.clone()).collect();
        let summaries: Vec<_> = per_resource.iter().map(|s| s.summary.clone()).collect();

        Ok(AggregateReport {
            merged: MergedStats {
                series: merge(&series),
                summary: merge_summaries(&summaries),
            },
            per_resource,
        })
    }

    /// Statistics for one short link. Requires VIEWER.
    pub async fn link_stats(
        &self,
        principal: &Principal,
        link_id: &str,
        granularity: Granularity,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<ResourceStats> {
        validate_window(link_id, from, to)?;
        self.access
            .require(&ResourceRef::short_link(link_id), &principal.user_id, Role::Viewer)
            .await?;

        let to = Some(to.unwrap_or_else(|| self.clock.now()));
        resource_stats(
            &self.builder,
            &self.aggregator,
            link_id.to_string(),
            granularity,
            from,
            to,
        )
        .await
    }

    /// Persist a report with its creator as the first ADMIN. The creator
    /// needs at least VIEWER on every link the report bundles.
    pub async fn create_report(&self, principal: &Principal, new: NewReport) -> Result<Report> {
        self.require_links(principal, &new.short_link_ids).await?;

        let report = self.reports.create_report(&principal.user_id, &new).await?;

        info!(
            report_id = %report.id,
            creator = %principal.login,
            links = report.short_link_ids.len(),
            "report created"
        );
        Ok(report)
    }

    /// Edit a report's name, links or display settings. Requires EDITOR;
    /// newly bundled links need VIEWER like at creation.
    pub async fn update_report(
        &self,
        principal: &Principal,
        report_id: &str,
        update: ReportUpdate,
    ) -> Result<Report> {
        let current = self.load_report(report_id).await?;
        self.access
            .require(&ResourceRef::report(report_id), &principal.user_id, Role::Editor)
            .await?;

        if let Some(ids) = &update.short_link_ids {
            let added: Vec<String> = ids
                .iter()
                .filter(|id| !current.short_link_ids.contains(id))
                .cloned()
                .collect();
            self.require_links(principal, &added).await?;
        }

        let report = self
            .reports
            .update_report(report_id, &update)
            .await?
            .ok_or_else(|| Error::not_found(format!("report '{report_id}'")))?;

        info!(
            report_id = %report.id,
            editor = %principal.login,
            links = report.short_link_ids.len(),
            "report updated"
        );
        Ok(report)
    }

    /// Every report the caller holds a grant on, with that grant's role.
    pub async fn list_reports(&self, principal: &Principal) -> Result<Vec<ReportAccess>> {
        Ok(self.reports.reports_for_user(&principal.user_id).await?)
    }

    pub async fn get_report(&self, principal: &Principal, report_id: &str) -> Result<Report> {
        let report = self.load_report(report_id).await?;
        self.access
            .require(&ResourceRef::report(report_id), &principal.user_id, Role::Viewer)
            .await?;
        Ok(report)
    }

    /// Aggregate statistics for a report. Requires VIEWER on the report.
    pub async fn report_stats(
        &self,
        principal: &Principal,
        report_id: &str,
        query: ReportStatsQuery,
    ) -> Result<ReportStats> {
        let report = self.load_report(report_id).await?;
        let role = self
            .access
            .require(&ResourceRef::report(report_id), &principal.user_id, Role::Viewer)
            .await?;

        let window =
            self.resolver
                .resolve(&report.period, query.from, query.to, query.tz_offset_minutes)?;
        let granularity = query.granularity.unwrap_or(report.granularity);

        let stats = self
            .build_report_stats(&report.short_link_ids, granularity, window.from, Some(window.to))
            .await?
            .aligned();

        Ok(ReportStats {
            report_id: report.id,
            role,
            granularity,
            window,
            stats,
        })
    }

    async fn require_links(&self, principal: &Principal, link_ids: &[String]) -> Result<()> {
        for link_id in link_ids {
            self.access
                .require(&ResourceRef::short_link(link_id), &principal.user_id, Role::Viewer)
                .await?;
        }
        Ok(())
    }

    async fn load_report(&self, report_id: &str) -> Result<Report> {
        self.reports
            .get_report(report_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("report '{report_id}'")))
    }
}

async fn resource_stats(
    builder: &TimeSeriesBuilder,
    aggregator: &StatsAggregator,
    resource_id: String,
    granularity: Granularity,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<ResourceStats> {
    let series = builder.build(&resource_id, from, to, granularity).await?;
    let summary = aggregator.summarize(&resource_id, from, to).await?;
    Ok(ResourceStats {
        resource_id,
        series,
        summary,
    })
}
