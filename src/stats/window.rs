use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::PeriodPolicy;

/// Resolved statistics window. An open `from` means "since the first click".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub from: Option<DateTime<Utc>>,
    pub to: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReportWindowResolver {
    clock: Arc<dyn Clock>,
}

impl ReportWindowResolver {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Turn a period policy, or explicit bounds, into a concrete window.
    ///
    /// Explicit bounds win only when both are given. Otherwise the policy is
    /// evaluated against client-local now, which is UTC now minus
    /// `client_utc_offset_minutes` (negative offsets are ahead of UTC, so
    /// Moscow is -180).
    pub fn resolve(
        &self,
        policy: &PeriodPolicy,
        explicit_from: Option<DateTime<Utc>>,
        explicit_to: Option<DateTime<Utc>>,
        client_utc_offset_minutes: i32,
    ) -> Result<Window> {
        let window = match (explicit_from, explicit_to) {
            (Some(from), Some(to)) => Window {
                from: Some(from),
                to,
            },
            _ => {
                let now = self.clock.now();
                let client_now = now
                    .checked_sub_signed(TimeDelta::minutes(i64::from(client_utc_offset_minutes)))
                    .ok_or_else(|| {
                        Error::invalid_range(format!(
                            "utc offset {client_utc_offset_minutes} is out of range"
                        ))
                    })?;
                policy_window(policy, client_now)?
            }
        };

        if let Some(from) = window.from {
            if from > window.to {
                return Err(Error::invalid_range(format!(
                    "window start {from} is after end {}",
                    window.to
                )));
            }
        }

        Ok(window)
    }
}

fn policy_window(policy: &PeriodPolicy, client_now: DateTime<Utc>) -> Result<Window> {
    let trailing = |delta: TimeDelta| -> Result<Window> {
        let from = client_now
            .checked_sub_signed(delta)
            .ok_or_else(|| Error::invalid_range("window start is out of range"))?;
        Ok(Window {
            from: Some(from),
            to: client_now,
        })
    };

    match policy {
        PeriodPolicy::Last24h => trailing(TimeDelta::hours(24)),
        PeriodPolicy::Last7d => trailing(TimeDelta::days(7)),
        PeriodPolicy::Last30d => trailing(TimeDelta::days(30)),
        PeriodPolicy::Last365d => trailing(TimeDelta::days(365)),
        PeriodPolicy::AllTime => Ok(Window {
            from: None,
            to: client_now,
        }),
        PeriodPolicy::Custom { start, end } => Ok(Window {
            from: *start,
            to: end.unwrap_or(client_now),
        }),
    }
}
