//! Per-resource breakdowns and cross-resource merging
//!
//! Merging sums over the union of keys, so it is commutative and
//! associative and per-resource work can finish in any order.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{ClickEvent, Granularity, StatsSummary, TimeSeries};
use crate::stats::timeseries::validate_window;
use crate::storage::ClickEventStore;

/// `resource_id` of a merged series whose inputs name different resources.
pub const MERGED_RESOURCE_ID: &str = "*";

#[derive(Clone)]
pub struct StatsAggregator {
    clicks: Arc<dyn ClickEventStore>,
}

impl StatsAggregator {
    pub fn new(clicks: Arc<dyn ClickEventStore>) -> Self {
        Self { clicks }
    }

    /// Device, browser and referrer breakdown of the clicks in `[from, to]`.
    pub async fn summarize(
        &self,
        resource_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<StatsSummary> {
        validate_window(resource_id, from, to)?;
        let events = self.clicks.query(resource_id, from, to).await?;
        Ok(summary_of(&events))
    }
}

pub fn summary_of(events: &[ClickEvent]) -> StatsSummary {
    let mut summary = StatsSummary::default();
    for event in events {
        summary.record(event);
    }
    summary
}

/// Sum series over the union of their labels; a label missing from an
/// input contributes 0.
pub fn merge(series: &[TimeSeries]) -> TimeSeries {
    let Some(first) = series.first() else {
        return TimeSeries::empty(MERGED_RESOURCE_ID, Granularity::default());
    };

    let mut buckets: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();
    for s in series {
        for (label, value) in s.points() {
            *buckets.entry(label).or_insert(0) += value;
        }
    }

    let resource_id = if series.iter().all(|s| s.resource_id == first.resource_id) {
        first.resource_id.clone()
    } else {
        MERGED_RESOURCE_ID.to_string()
    };
    // Coarsest input wins so the result does not depend on input order.
    let granularity = series
        .iter()
        .map(|s| s.granularity)
        .max()
        .unwrap_or_default();

    let (labels, values) = buckets.into_iter().unzip();
    TimeSeries {
        resource_id,
        granularity,
        labels,
        values,
    }
}

pub fn merge_summaries(summaries: &[StatsSummary]) -> StatsSummary {
    let mut merged = StatsSummary::default();
    for summary in summaries {
        merged.total += summary.total;
        for (device, count) in &summary.by_device {
            *merged.by_device.entry(*device).or_insert(0) += count;
        }
        for (browser, count) in &summary.by_browser {
            *merged.by_browser.entry(browser.clone()).or_insert(0) += count;
        }
        for (referrer, count) in &summary.by_referrer {
            *merged.by_referrer.entry(referrer.clone()).or_insert(0) += count;
        }
    }
    merged
}
