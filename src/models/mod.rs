pub mod click;
pub mod permission;
pub mod report;
pub mod stats;

pub use click::{ClickEvent, DeviceType};
pub use permission::{PermissionGrant, Principal, ResourceKind, ResourceRef, Role, User};
pub use report::{unique_links, ChartType, NewReport, PeriodPolicy, Report, ReportAccess, ReportUpdate};
pub use stats::{
    AggregateReport, Granularity, MergedStats, ReferrerKey, ResourceStats, StatsSummary,
    TimeSeries,
};
