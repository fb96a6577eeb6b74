//! Click statistics: gap-filled series, breakdowns, merging and
//! permission-gated report computation.

pub mod aggregator;
pub mod engine;
pub mod timeseries;
pub mod window;

pub use aggregator::{merge, merge_summaries, StatsAggregator, MERGED_RESOURCE_ID};
pub use engine::{ReportStats, ReportStatsQuery, StatsEngine};
pub use timeseries::TimeSeriesBuilder;
pub use window::{ReportWindowResolver, Window};
