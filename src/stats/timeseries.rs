//! Gap-filled click series
//!
//! A series has one label per bucket start between the window's endpoints,
//! zeros included, so charts can plot it on a continuous axis.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{Granularity, TimeSeries};
use crate::storage::ClickEventStore;

/// Reject calls that can never produce a meaningful window.
pub(crate) fn validate_window(
    resource_id: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<()> {
    if resource_id.is_empty() {
        return Err(Error::invalid_range("resource id must not be empty"));
    }
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(Error::invalid_range(format!(
                "window start {from} is after end {to}"
            )));
        }
    }
    Ok(())
}

/// Every bucket start from the bucket of `from` to the bucket of `to`, inclusive.
pub fn bucket_labels(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    granularity: Granularity,
) -> Vec<DateTime<Utc>> {
    let last = granularity.truncate(to);
    let mut labels = Vec::new();
    let mut cursor = Some(granularity.truncate(from));

    while let Some(bucket) = cursor {
        if bucket > last {
            break;
        }
        labels.push(bucket);
        cursor = granularity.next(bucket);
    }

    labels
}

/// Count timestamps into `labels`. Timestamps outside the labelled range are dropped.
pub fn bucketize<I>(
    resource_id: &str,
    granularity: Granularity,
    labels: Vec<DateTime<Utc>>,
    timestamps: I,
) -> TimeSeries
where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    let mut values = vec![0u64; labels.len()];
    for ts in timestamps {
        if let Ok(idx) = labels.binary_search(&granularity.truncate(ts)) {
            values[idx] += 1;
        }
    }

    TimeSeries {
        resource_id: resource_id.to_string(),
        granularity,
        labels,
        values,
    }
}

#[derive(Clone)]
pub struct TimeSeriesBuilder {
    clicks: Arc<dyn ClickEventStore>,
    clock: Arc<dyn Clock>,
}

impl TimeSeriesBuilder {
    pub fn new(clicks: Arc<dyn ClickEventStore>, clock: Arc<dyn Clock>) -> Self {
        Self { clicks, clock }
    }

    /// Build the series for `resource_id`.
    ///
    /// An open `from` starts at the bucket of the earliest click; with no
    /// clicks at all the series is empty. An open `to` ends at the current
    /// time.
    pub async fn build(
        &self,
        resource_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        granularity: Granularity,
    ) -> Result<TimeSeries> {
        // An explicit start must not lie past the defaulted end either.
        let end = to.unwrap_or_else(|| self.clock.now());
        validate_window(resource_id, from, Some(end))?;

        let start = match from {
            Some(from) => from,
            None => match self.clicks.earliest_bucket(resource_id, granularity).await? {
                Some(bucket) => bucket,
                None => return Ok(TimeSeries::empty(resource_id, granularity)),
            },
        };

        let labels = bucket_labels(start, end, granularity);
        let events = self.clicks.query(resource_id, from, to).await?;

        debug!(
            resource_id = %resource_id,
            granularity = ?granularity,
            buckets = labels.len(),
            events = events.len(),
            "built time series"
        );

        Ok(bucketize(
            resource_id,
            granularity,
            labels,
            events.iter().map(|e| e.clicked_at),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::models::{ClickEvent, DeviceType};
    use crate::storage::MemoryStorage;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    async fn builder_with(
        events: &[(&str, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> TimeSeriesBuilder {
        let storage = Arc::new(MemoryStorage::new());
        for (id, ts) in events {
            storage
                .append(&ClickEvent::new(*id, *ts, DeviceType::Desktop, "Firefox", None))
                .await
                .unwrap();
        }
        TimeSeriesBuilder::new(storage, Arc::new(FixedClock(now)))
    }

    #[tokio::test]
    async fn test_hourly_series_fills_gaps() {
        let builder = builder_with(
            &[
                ("r", at(2024, 1, 1, 0, 10)),
                ("r", at(2024, 1, 1, 0, 45)),
                ("r", at(2024, 1, 1, 1, 5)),
            ],
            at(2024, 6, 1, 0, 0),
        )
        .await;

        let series = builder
            .build(
                "r",
                Some(at(2024, 1, 1, 0, 0)),
                Some(at(2024, 1, 1, 2, 0)),
                Granularity::Hour,
            )
            .await
            .unwrap();

        assert_eq!(
            series.labels,
            vec![at(2024, 1, 1, 0, 0), at(2024, 1, 1, 1, 0), at(2024, 1, 1, 2, 0)]
        );
        assert_eq!(series.values, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_open_bounds_use_earliest_bucket_and_now() {
        let builder = builder_with(
            &[("r", at(2024, 1, 20, 9, 0)), ("r", at(2024, 3, 2, 9, 0))],
            at(2024, 4, 15, 12, 0),
        )
        .await;

        let series = builder.build("r", None, None, Granularity::Month).await.unwrap();
        assert_eq!(series.formatted_labels(), vec!["01-2024", "02-2024", "03-2024", "04-2024"]);
        assert_eq!(series.values, vec![1, 0, 1, 0]);
    }

    #[tokio::test]
    async fn test_no_events_yields_empty_series() {
        let builder = builder_with(&[], at(2024, 1, 1, 0, 0)).await;
        let series = builder.build("r", None, None, Granularity::Day).await.unwrap();
        assert!(series.is_empty());
        assert_eq!(series.values.len(), series.labels.len());
    }

    #[tokio::test]
    async fn test_explicit_window_without_events_is_all_zero() {
        let builder = builder_with(&[], at(2024, 1, 1, 0, 0)).await;
        let series = builder
            .build(
                "r",
                Some(at(2024, 1, 1, 0, 0)),
                Some(at(2024, 1, 3, 23, 0)),
                Granularity::Day,
            )
            .await
            .unwrap();
        assert_eq!(series.values, vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn test_invalid_ranges_are_rejected() {
        let builder = builder_with(&[], at(2024, 1, 1, 0, 0)).await;

        let err = builder
            .build(
                "r",
                Some(at(2024, 1, 2, 0, 0)),
                Some(at(2024, 1, 1, 0, 0)),
                Granularity::Day,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));

        let err = builder.build("", None, None, Granularity::Day).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));
    }

    #[tokio::test]
    async fn test_start_after_now_is_rejected() {
        let builder = builder_with(
            &[("r", at(2024, 1, 1, 0, 0))],
            at(2024, 1, 1, 12, 0),
        )
        .await;

        let err = builder
            .build("r", Some(at(2024, 1, 2, 0, 0)), None, Granularity::Hour)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));

        // Starting exactly at now is a one-bucket window.
        let series = builder
            .build("r", Some(at(2024, 1, 1, 12, 0)), None, Granularity::Hour)
            .await
            .unwrap();
        assert_eq!(series.values, vec![0]);
    }

    fn granularity() -> impl Strategy<Value = Granularity> {
        prop_oneof![
            Just(Granularity::Hour),
            Just(Granularity::Day),
            Just(Granularity::Month),
        ]
    }

    // 2020-01-01T00:00:00Z
    const BASE: i64 = 1_577_836_800;

    proptest! {
        #[test]
        fn prop_labels_have_no_gaps(
            g in granularity(),
            start in 0i64..(5 * 365 * 86_400),
            span in 0i64..(2 * 365 * 86_400),
        ) {
            let from = DateTime::from_timestamp(BASE + start, 0).unwrap();
            let to = DateTime::from_timestamp(BASE + start + span, 0).unwrap();
            let labels = bucket_labels(from, to, g);

            prop_assert!(!labels.is_empty());
            prop_assert_eq!(labels[0], g.truncate(from));
            prop_assert_eq!(*labels.last().unwrap(), g.truncate(to));
            for pair in labels.windows(2) {
                prop_assert_eq!(g.next(pair[0]), Some(pair[1]));
            }
        }

        #[test]
        fn prop_bucket_sum_matches_event_count(
            g in granularity(),
            span in 1i64..(90 * 86_400),
            offsets in proptest::collection::vec(0i64..1_000_000, 0..200),
        ) {
            let from = DateTime::from_timestamp(BASE, 0).unwrap();
            let to = DateTime::from_timestamp(BASE + span, 0).unwrap();
            let timestamps: Vec<_> = offsets
                .iter()
                .map(|o| DateTime::from_timestamp(BASE + o % (span + 1), 0).unwrap())
                .collect();

            let series = bucketize("r", g, bucket_labels(from, to, g), timestamps.clone());
            prop_assert_eq!(series.labels.len(), series.values.len());
            prop_assert_eq!(series.total(), timestamps.len() as u64);
        }
    }
}
