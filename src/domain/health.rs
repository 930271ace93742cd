//! Health supervision: a cached, periodically refreshed status snapshot per app.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Error;
use chrono::Utc;
use futures::future::join_all;
use itertools::Itertools;
use log::{debug, warn};
use tokio::sync::RwLock;

use super::{
    model::{AppHealthSnapshot, AppStatus, ContainerInfo},
    orchestrator::{Orchestrator, APP_ID_LABEL},
    poller::PeriodicTask,
};

/// Invoked with `(app_id, previous, current)` on every observed status transition.
pub type StatusChangeCallback = Arc<dyn Fn(&str, AppStatus, AppStatus) + Send + Sync>;

pub struct HealthSupervisor {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    tracked: RwLock<HashSet<String>>,
    snapshots: RwLock<HashMap<String, AppHealthSnapshot>>,
    on_change: Option<StatusChangeCallback>,
    task: PeriodicTask,
}

impl HealthSupervisor {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        interval: Duration,
        on_change: Option<StatusChangeCallback>,
    ) -> Self {
        Self {
            orchestrator,
            interval,
            tracked: RwLock::new(HashSet::new()),
            snapshots: RwLock::new(HashMap::new()),
            on_change,
            task: PeriodicTask::new("Health supervisor"),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        self.task.start(self.interval, move || {
            let supervisor = supervisor.clone();
            async move { supervisor.poll_once().await }
        });
    }

    pub fn stop(&self) {
        self.task.stop();
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    pub async fn track(&self, app_id: &str) {
        self.tracked.write().await.insert(app_id.to_string());
    }

    pub async fn untrack(&self, app_id: &str) {
        self.tracked.write().await.remove(app_id);
        self.snapshots.write().await.remove(app_id);
    }

    pub async fn tracked(&self) -> Vec<String> {
        self.tracked.read().await.iter().cloned().sorted().collect()
    }

    pub async fn get_snapshot(&self, app_id: &str) -> Option<AppHealthSnapshot> {
        self.snapshots.read().await.get(app_id).cloned()
    }

    pub async fn get_all_snapshots(&self) -> HashMap<String, AppHealthSnapshot> {
        self.snapshots.read().await.clone()
    }

    /// One poll cycle: adopt unknown apps, then refresh every tracked app concurrently.
    pub async fn poll_once(&self) {
        self.adopt_running_apps().await;

        let tracked = self.tracked().await;
        let results = join_all(tracked.iter().map(|app_id| self.inspect(app_id))).await;

        let polled_at = Utc::now();
        let mut transitions = Vec::new();
        {
            let still_tracked = self.tracked.read().await;
            let mut snapshots = self.snapshots.write().await;
            for (app_id, result) in tracked.into_iter().zip(results) {
                // untracked while the poll was in flight
                if !still_tracked.contains(&app_id) {
                    continue;
                }
                let (status, containers) = match result {
                    Ok(observed) => observed,
                    Err(e) => {
                        warn!("Health check of app {} failed: {:#}", app_id, e);
                        (AppStatus::Error, Vec::new())
                    }
                };
                let snapshot = AppHealthSnapshot {
                    app_id: app_id.clone(),
                    status,
                    containers,
                    polled_at,
                };
                if let Some(previous) = snapshots.insert(app_id.clone(), snapshot) {
                    if previous.status != status {
                        transitions.push((app_id, previous.status, status));
                    }
                }
            }
        }

        for (app_id, previous, current) in transitions {
            debug!("App {} went from {} to {}", app_id, previous, current);
            if let Some(callback) = &self.on_change {
                callback(&app_id, previous, current);
            }
        }
    }

    async fn adopt_running_apps(&self) {
        match self.orchestrator.list_managed_containers(None).await {
            Ok(containers) => {
                let found: Vec<String> = containers
                    .iter()
                    .filter_map(|container| container.labels.get(APP_ID_LABEL).cloned())
                    .unique()
                    .collect();
                let mut tracked = self.tracked.write().await;
                for app_id in found {
                    if tracked.insert(app_id.clone()) {
                        debug!("Adopted app {} from existing containers", app_id);
                    }
                }
            }
            Err(e) => warn!("Can't discover managed containers: {:#}", e),
        }
    }

    async fn inspect(&self, app_id: &str) -> Result<(AppStatus, Vec<ContainerInfo>), Error> {
        tokio::try_join!(
            self.orchestrator.get_app_status(app_id),
            self.orchestrator.get_containers(app_id)
        )
    }
}
