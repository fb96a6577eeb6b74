use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
    Bot,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "DESKTOP",
            Self::Mobile => "MOBILE",
            Self::Tablet => "TABLET",
            Self::Bot => "BOT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DESKTOP" => Ok(Self::Desktop),
            "MOBILE" => Ok(Self::Mobile),
            "TABLET" => Ok(Self::Tablet),
            "BOT" => Ok(Self::Bot),
            "UNKNOWN" => Ok(Self::Unknown),
            other => anyhow::bail!("unknown device type '{other}'"),
        }
    }
}

/// A single recorded click on a short link. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickEvent {
    pub resource_id: String,
    pub clicked_at: DateTime<Utc>,
    pub device_type: DeviceType,
    pub browser: String,
    pub referrer: Option<String>,
}

impl ClickEvent {
    pub fn new(
        resource_id: impl Into<String>,
        clicked_at: DateTime<Utc>,
        device_type: DeviceType,
        browser: impl Into<String>,
        referrer: Option<&str>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            clicked_at,
            device_type,
            browser: browser.into(),
            referrer: referrer.map(str::to_string),
        }
    }
}
