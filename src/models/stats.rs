//! Time series and summary types produced by the statistics engine

use chrono::{DateTime, Datelike, Days, Months, NaiveTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::models::{ClickEvent, DeviceType};

/// Bucket width of a time series, declared finest to coarsest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    #[default]
    Day,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    /// Floor `ts` to the start of its bucket (UTC wall clock).
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = ts.date_naive().and_time(NaiveTime::MIN);
        match self {
            Self::Hour => (midnight + TimeDelta::hours(i64::from(ts.hour()))).and_utc(),
            Self::Day => midnight.and_utc(),
            Self::Month => (midnight - Days::new(u64::from(ts.day0()))).and_utc(),
        }
    }

    /// Start of the bucket following `bucket`. Months step by calendar month.
    pub fn next(&self, bucket: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Hour => bucket.checked_add_signed(TimeDelta::hours(1)),
            Self::Day => bucket.checked_add_signed(TimeDelta::days(1)),
            Self::Month => bucket.checked_add_months(Months::new(1)),
        }
    }

    pub fn label_format(&self) -> &'static str {
        match self {
            Self::Hour => "%d-%m-%Y %H:%M:%S",
            Self::Day => "%d-%m-%Y",
            Self::Month => "%m-%Y",
        }
    }

    pub fn format_label(&self, bucket: DateTime<Utc>) -> String {
        bucket.format(self.label_format()).to_string()
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "month" => Ok(Self::Month),
            other => Err(Error::invalid_range(format!("unknown granularity '{other}'"))),
        }
    }
}

/// Gap-free click counts, one value per bucket start in `labels`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub resource_id: String,
    pub granularity: Granularity,
    pub labels: Vec<DateTime<Utc>>,
    pub values: Vec<u64>,
}

impl TimeSeries {
    pub fn empty(resource_id: impl Into<String>, granularity: Granularity) -> Self {
        Self {
            resource_id: resource_id.into(),
            granularity,
            labels: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.values.iter().sum()
    }

    /// Labels rendered in the granularity's display format.
    pub fn formatted_labels(&self) -> Vec<String> {
        self.labels
            .iter()
            .map(|l| self.granularity.format_label(*l))
            .collect()
    }

    pub fn points(&self) -> impl Iterator<Item = (DateTime<Utc>, u64)> + '_ {
        self.labels.iter().copied().zip(self.values.iter().copied())
    }

    pub fn value_at(&self, label: DateTime<Utc>) -> u64 {
        self.labels
            .binary_search(&label)
            .ok()
            .and_then(|idx| self.values.get(idx).copied())
            .unwrap_or(0)
    }

    /// Project this series onto another label axis; labels it lacks read as 0.
    pub fn reindex(&self, labels: &[DateTime<Utc>]) -> TimeSeries {
        TimeSeries {
            resource_id: self.resource_id.clone(),
            granularity: self.granularity,
            labels: labels.to_vec(),
            values: labels.iter().map(|l| self.value_at(*l)).collect(),
        }
    }
}

/// Referrer facet key. A missing referrer is kept apart from any literal
/// string, including the string "unknown".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReferrerKey {
    Unknown,
    Referrer(String),
}

impl ReferrerKey {
    pub fn from_option(referrer: Option<&str>) -> Self {
        match referrer {
            Some(r) => Self::Referrer(r.to_string()),
            None => Self::Unknown,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Unknown => "unknown",
            Self::Referrer(r) => r,
        }
    }

    pub fn as_option(&self) -> Option<&str> {
        match self {
            Self::Unknown => None,
            Self::Referrer(r) => Some(r),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub total: u64,
    pub by_device: BTreeMap<DeviceType, u64>,
    pub by_browser: BTreeMap<String, u64>,
    #[serde(with = "referrer_facet")]
    pub by_referrer: BTreeMap<ReferrerKey, u64>,
}

impl StatsSummary {
    /// Count one click into every facet.
    pub fn record(&mut self, event: &ClickEvent) {
        self.total += 1;
        *self.by_device.entry(event.device_type).or_insert(0) += 1;
        *self.by_browser.entry(event.browser.clone()).or_insert(0) += 1;
        *self
            .by_referrer
            .entry(ReferrerKey::from_option(event.referrer.as_deref()))
            .or_insert(0) += 1;
    }

    /// Every click contributes to each facet exactly once.
    pub fn is_consistent(&self) -> bool {
        let devices: u64 = self.by_device.values().sum();
        let browsers: u64 = self.by_browser.values().sum();
        let referrers: u64 = self.by_referrer.values().sum();
        devices == self.total && browsers == self.total && referrers == self.total
    }
}

/// Referrers serialize as `[{ "referrer": "..." | null, "count": n }]`
/// because a JSON object cannot key on null.
mod referrer_facet {
    use super::ReferrerKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        referrer: Option<String>,
        count: u64,
    }

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<ReferrerKey, u64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(key, count)| Entry {
                referrer: key.as_option().map(str::to_string),
                count: *count,
            })
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<ReferrerKey, u64>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        for entry in entries {
            *map.entry(ReferrerKey::from_option(entry.referrer.as_deref()))
                .or_insert(0) += entry.count;
        }
        Ok(map)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub resource_id: String,
    pub series: TimeSeries,
    pub summary: StatsSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedStats {
    pub series: TimeSeries,
    pub summary: StatsSummary,
}

/// Per-resource statistics plus their cross-resource merge. Recomputed per
/// request, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub per_resource: Vec<ResourceStats>,
    pub merged: MergedStats,
}

impl AggregateReport {
    /// Put every per-resource series on the merged label axis.
    pub fn aligned(mut self) -> Self {
        let labels = self.merged.series.labels.clone();
        for stats in &mut self.per_resource {
            stats.series = stats.series.reindex(&labels);
        }
        self
    }
}
