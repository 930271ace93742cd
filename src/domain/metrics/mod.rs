//! Resource metrics: per-container sampling, request rates and tiered storage.

mod aggregate;
mod collector;
mod delta;
pub mod model;
mod requests;
mod ring;

pub use aggregate::aggregate;
pub use collector::{CollectorSettings, MetricsCollector};
pub use model::{
    AggregatedBucket, AppResourceSnapshot, StatusPoint, SystemResourceSnapshot, Timestamped,
};
pub use requests::parse_request_counters;
