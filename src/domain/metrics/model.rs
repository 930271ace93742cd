use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::model::AppStatus;

/// Resource usage over one sampling interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    pub memory_limit_mb: f64,
    /// Bytes received since the previous sample
    pub network_rx_bytes: u64,
    /// Bytes sent since the previous sample
    pub network_tx_bytes: u64,
    /// `None` until a request counter source produced two samples
    pub requests_per_minute: Option<f64>,
}

impl ResourceUsage {
    pub fn add(&mut self, other: &ResourceUsage) {
        self.cpu_percent += other.cpu_percent;
        self.memory_used_mb += other.memory_used_mb;
        self.memory_limit_mb += other.memory_limit_mb;
        self.network_rx_bytes += other.network_rx_bytes;
        self.network_tx_bytes += other.network_tx_bytes;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppResourceSnapshot {
    pub app_id: String,
    #[serde(flatten)]
    pub usage: ResourceUsage,
    pub replicas: usize,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemResourceSnapshot {
    #[serde(flatten)]
    pub usage: ResourceUsage,
    pub active_containers: usize,
    pub active_apps: usize,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPoint {
    pub app_id: String,
    pub status: AppStatus,
    pub recorded_at: DateTime<Utc>,
}

pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// A timestamped sample carrying resource usage, the unit of aggregation.
pub trait UsageSample: Timestamped {
    fn usage(&self) -> &ResourceUsage;
}

impl Timestamped for AppResourceSnapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.collected_at
    }
}

impl UsageSample for AppResourceSnapshot {
    fn usage(&self) -> &ResourceUsage {
        &self.usage
    }
}

impl Timestamped for SystemResourceSnapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.collected_at
    }
}

impl UsageSample for SystemResourceSnapshot {
    fn usage(&self) -> &ResourceUsage {
        &self.usage
    }
}

impl Timestamped for StatusPoint {
    fn timestamp(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedBucket {
    pub bucket_start: DateTime<Utc>,
    pub samples: usize,
    pub cpu_percent: Stat,
    pub memory_used_mb: Stat,
    pub network_rx_bytes: Stat,
    pub network_tx_bytes: Stat,
    /// `None` when no sample of the bucket had a request rate
    pub requests_per_minute: Option<Stat>,
}

/// Answer of a metrics query: raw samples for short windows, buckets for long ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "points", rename_all = "lowercase")]
pub enum MetricsSeries<T> {
    Raw(Vec<T>),
    Aggregated(Vec<AggregatedBucket>),
}
