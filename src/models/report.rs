use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::models::{Granularity, Role};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    #[default]
    Line,
    Bar,
}

impl ChartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Bar => "bar",
        }
    }
}

impl FromStr for ChartType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "line" => Ok(Self::Line),
            "bar" => Ok(Self::Bar),
            other => anyhow::bail!("unknown chart type '{other}'"),
        }
    }
}

/// How a report picks its statistics window when a request does not
/// supply explicit bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeriodPolicy {
    #[serde(rename = "last24h")]
    Last24h,
    #[serde(rename = "last7d")]
    Last7d,
    #[serde(rename = "last30d")]
    Last30d,
    #[serde(rename = "last365d")]
    Last365d,
    #[default]
    #[serde(rename = "allTime")]
    AllTime,
    #[serde(rename = "custom")]
    Custom {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
}

impl PeriodPolicy {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Last24h => "last24h",
            Self::Last7d => "last7d",
            Self::Last30d => "last30d",
            Self::Last365d => "last365d",
            Self::AllTime => "allTime",
            Self::Custom { .. } => "custom",
        }
    }

    /// Rebuild a policy from its persisted columns.
    pub fn from_parts(
        kind: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Self> {
        Ok(match kind {
            "last24h" => Self::Last24h,
            "last7d" => Self::Last7d,
            "last30d" => Self::Last30d,
            "last365d" => Self::Last365d,
            "allTime" => Self::AllTime,
            "custom" => Self::Custom { start, end },
            other => anyhow::bail!("unknown period type '{other}'"),
        })
    }

    pub fn custom_start(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Custom { start, .. } => *start,
            _ => None,
        }
    }

    pub fn custom_end(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Custom { end, .. } => *end,
            _ => None,
        }
    }
}

/// A named bundle of short links with its own access-control list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub name: String,
    pub created_by: String,
    pub short_link_ids: Vec<String>,
    pub granularity: Granularity,
    pub chart_type: ChartType,
    pub period: PeriodPolicy,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewReport {
    pub name: String,
    pub short_link_ids: Vec<String>,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub chart_type: ChartType,
    #[serde(default)]
    pub period: PeriodPolicy,
}

/// Partial edit of a report. Absent fields keep their stored value; a
/// present link list replaces the bundled links wholesale.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportUpdate {
    pub name: Option<String>,
    pub short_link_ids: Option<Vec<String>>,
    pub granularity: Option<Granularity>,
    pub chart_type: Option<ChartType>,
    pub period: Option<PeriodPolicy>,
}

impl Report {
    pub fn apply(&mut self, update: &ReportUpdate, now: i64) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(ids) = &update.short_link_ids {
            self.short_link_ids = unique_links(ids);
        }
        if let Some(granularity) = update.granularity {
            self.granularity = granularity;
        }
        if let Some(chart_type) = update.chart_type {
            self.chart_type = chart_type;
        }
        if let Some(period) = update.period {
            self.period = period;
        }
        self.updated_at = now;
    }
}

/// A report together with the caller's role on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportAccess {
    #[serde(flatten)]
    pub report: Report,
    pub role: Role,
}

/// Link ids in first-seen order with repeats dropped.
pub fn unique_links(ids: &[String]) -> Vec<String> {
    let mut unique = Vec::with_capacity(ids.len());
    for id in ids {
        if !unique.contains(id) {
            unique.push(id.clone());
        }
    }
    unique
}
