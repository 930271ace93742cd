use std::{collections::HashMap, time::Duration};

use anyhow::Error;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use super::metrics::{
    aggregate, AggregatedBucket, AppResourceSnapshot, StatusPoint, SystemResourceSnapshot,
};

/// Image build submitted to the engine.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// `name:tag`
    pub tag: String,
    pub labels: HashMap<String, String>,
    /// gzip compressed tarball of the build context
    pub context: Bytes,
}

/// One line of the engine's build progress stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildProgress {
    pub stream: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRequest {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub exposed_port: u16,
    pub network: String,
}

/// Container as reported by the engine listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: Option<String>,
    pub image: String,
    pub state: String,
    pub status: String,
    /// Unix seconds
    pub created: i64,
    pub labels: HashMap<String, String>,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Point-in-time resource counters of one running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStatsSample {
    pub cpu_total_usage: u64,
    pub system_cpu_usage: u64,
    pub online_cpus: u32,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub networks: HashMap<String, InterfaceCounters>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    fn build_image(&self, request: BuildRequest) -> BoxStream<'_, Result<BuildProgress, Error>>;

    async fn create_container(&self, request: ContainerRequest) -> Result<String, Error>;

    async fn start_container(&self, id: &str) -> Result<(), Error>;

    async fn stop_container(&self, id: &str) -> Result<(), Error>;

    async fn restart_container(&self, id: &str) -> Result<(), Error>;

    async fn remove_container(&self, id: &str) -> Result<(), Error>;

    /// Lists all containers (running or not) carrying every `key=value` label given.
    async fn list_containers(&self, labels: &[String]) -> Result<Vec<ContainerSummary>, Error>;

    /// Lists image ids carrying every label given, optionally restricted to dangling images.
    async fn list_images(&self, labels: &[String], dangling_only: bool) -> Result<Vec<String>, Error>;

    async fn remove_image(&self, id: &str) -> Result<(), Error>;

    async fn container_stats(&self, id: &str) -> Result<ContainerStatsSample, Error>;
}

/// Source of cumulative per-service request counters, keyed by service slug.
#[async_trait]
pub trait RequestCounterSource: Send + Sync {
    async fn fetch_counters(&self) -> Result<HashMap<String, f64>, Error>;
}

/// Durable metrics storage. All writes are best effort from the collector's point of view.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn insert_app_snapshots(&self, snapshots: &[AppResourceSnapshot]) -> Result<(), Error>;

    async fn insert_system_snapshot(&self, snapshot: &SystemResourceSnapshot) -> Result<(), Error>;

    async fn insert_status_points(&self, points: &[StatusPoint]) -> Result<(), Error>;

    /// Snapshots of one app, or of every app when `app_id` is `None`, oldest first.
    async fn app_snapshots_since(
        &self,
        app_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<AppResourceSnapshot>, Error>;

    async fn system_snapshots_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SystemResourceSnapshot>, Error>;

    async fn status_points_since(
        &self,
        app_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatusPoint>, Error>;

    /// Deletes every record collected before `before`, returns how many were removed.
    async fn delete_before(&self, before: DateTime<Utc>) -> Result<u64, Error>;

    async fn aggregated_app_metrics(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
        bucket: Duration,
    ) -> Result<Vec<AggregatedBucket>, Error> {
        let snapshots = self.app_snapshots_since(Some(app_id), since).await?;
        Ok(aggregate(&snapshots, bucket))
    }

    async fn aggregated_system_metrics(
        &self,
        since: DateTime<Utc>,
        bucket: Duration,
    ) -> Result<Vec<AggregatedBucket>, Error> {
        let snapshots = self.system_snapshots_since(since).await?;
        Ok(aggregate(&snapshots, bucket))
    }
}
