//! Scheduled downtimes
//!
//! Maintenance windows on hosts and services, the manager that owns them
//! and a query helper over the collection.

pub mod downtime;
pub mod finder;
pub mod manager;

pub use downtime::{
    Downtime, DowntimeContext, DowntimeKind, DowntimeRecord, DowntimeRequest, DowntimeTarget,
    ENGINE_AUTHOR,
};
pub use finder::DowntimeFinder;
pub use manager::{DowntimeFilter, DowntimeManager};
