use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use anyhow::Error;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::{Mutex, RwLock};

use crate::{
    config::AppConfig,
    domain::{
        health::HealthSupervisor,
        model::ContainerState,
        orchestrator::{Orchestrator, APP_ID_LABEL, APP_SLUG_LABEL},
        poller::PeriodicTask,
        port::{ContainerSummary, MetricsStore, RequestCounterSource},
    },
};

use super::{
    aggregate::aggregate,
    delta::CounterCache,
    model::{
        AggregatedBucket, AppResourceSnapshot, MetricsSeries, ResourceUsage, StatusPoint,
        SystemResourceSnapshot, Timestamped,
    },
    requests::{request_rates, RequestRates},
    ring::RingBuffer,
};

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub interval: Duration,
    /// Window kept in memory
    pub history: Duration,
    /// Age past which durable records are pruned
    pub retention: Duration,
    /// Prune cadence, in collection cycles; 0 disables pruning
    pub prune_every_cycles: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            history: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
            prune_every_cycles: 360,
        }
    }
}

impl From<&AppConfig> for CollectorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            interval: config.metrics_interval(),
            history: config.metrics_history(),
            retention: config.metrics_retention(),
            prune_every_cycles: config.prune_every_cycles,
        }
    }
}

impl CollectorSettings {
    /// Ring buffer capacity, one slot per interval of history.
    pub fn capacity(&self) -> usize {
        let interval = self.interval.as_millis().max(1);
        (self.history.as_millis().div_ceil(interval) as usize).max(1)
    }

    /// Window actually covered by the ring buffers.
    pub fn horizon(&self) -> Duration {
        self.interval * self.capacity() as u32
    }
}

/// Bucket width used for long windows served from durable storage.
pub fn bucket_width(period: Duration) -> Duration {
    const HOUR: u64 = 3600;
    match period.as_secs() {
        secs if secs <= 6 * HOUR => Duration::from_secs(60),
        secs if secs <= 24 * HOUR => Duration::from_secs(300),
        _ => Duration::from_secs(HOUR),
    }
}

fn ago(period: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(period)
        .ok()
        .and_then(|period| Utc::now().checked_sub_signed(period))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// State carried from one collection cycle to the next, only touched under the cycle lock.
struct CycleState {
    cycle: u64,
    counters: CounterCache,
    request_source: Option<Arc<dyn RequestCounterSource>>,
    previous_requests: Option<HashMap<String, f64>>,
}

struct MetricRings {
    capacity: usize,
    system: RingBuffer<SystemResourceSnapshot>,
    apps: HashMap<String, RingBuffer<AppResourceSnapshot>>,
    statuses: HashMap<String, RingBuffer<StatusPoint>>,
}

impl MetricRings {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            system: RingBuffer::new(capacity),
            apps: HashMap::new(),
            statuses: HashMap::new(),
        }
    }

    fn push_app(&mut self, snapshot: AppResourceSnapshot) {
        let capacity = self.capacity;
        self.apps
            .entry(snapshot.app_id.clone())
            .or_insert_with(|| RingBuffer::new(capacity))
            .push(snapshot);
    }

    fn push_status(&mut self, point: StatusPoint) {
        let capacity = self.capacity;
        self.statuses
            .entry(point.app_id.clone())
            .or_insert_with(|| RingBuffer::new(capacity))
            .push(point);
    }
}

#[derive(Default)]
struct AppTotals {
    usage: ResourceUsage,
    replicas: usize,
}

pub struct MetricsCollector {
    orchestrator: Arc<Orchestrator>,
    health: Arc<HealthSupervisor>,
    store: Option<Arc<dyn MetricsStore>>,
    settings: CollectorSettings,
    state: Mutex<CycleState>,
    rings: RwLock<MetricRings>,
    slugs: RwLock<HashMap<String, String>>,
    task: PeriodicTask,
}

impl MetricsCollector {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        health: Arc<HealthSupervisor>,
        store: Option<Arc<dyn MetricsStore>>,
        settings: CollectorSettings,
    ) -> Self {
        let capacity = settings.capacity();
        Self {
            orchestrator,
            health,
            store,
            settings,
            state: Mutex::new(CycleState {
                cycle: 0,
                counters: CounterCache::new(),
                request_source: None,
                previous_requests: None,
            }),
            rings: RwLock::new(MetricRings::new(capacity)),
            slugs: RwLock::new(HashMap::new()),
            task: PeriodicTask::new("Metrics collector"),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let collector = Arc::clone(self);
        self.task.start(self.settings.interval, move || {
            let collector = collector.clone();
            async move {
                collector.collect_once().await;
            }
        });
    }

    pub fn stop(&self) {
        self.task.stop();
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Replaces the request counter source; the next scrape is a fresh baseline.
    pub async fn set_request_source(&self, source: Option<Arc<dyn RequestCounterSource>>) {
        let mut state = self.state.lock().await;
        state.request_source = source;
        state.previous_requests = None;
    }

    pub async fn register_slug(&self, slug: &str, app_id: &str) {
        self.slugs
            .write()
            .await
            .insert(slug.to_string(), app_id.to_string());
    }

    pub async fn unregister_slug(&self, slug: &str) {
        self.slugs.write().await.remove(slug);
    }

    /// One collection cycle. Cycles never overlap: the whole cycle holds the state lock.
    pub async fn collect_once(&self) -> SystemResourceSnapshot {
        let mut state = self.state.lock().await;
        state.cycle += 1;
        let cycle = state.cycle;
        let now = Utc::now();

        let statuses: Vec<StatusPoint> = self
            .health
            .get_all_snapshots()
            .await
            .into_values()
            .map(|snapshot| StatusPoint {
                app_id: snapshot.app_id,
                status: snapshot.status,
                recorded_at: now,
            })
            .collect();

        let mut apps: BTreeMap<String, AppTotals> = statuses
            .iter()
            .map(|point| (point.app_id.clone(), AppTotals::default()))
            .collect();
        let mut system = ResourceUsage::default();
        let mut active_containers = 0;

        match self.orchestrator.list_managed_containers(None).await {
            Ok(containers) => {
                let running = self.running_containers(containers).await;
                let samples = join_all(running.iter().map(|(app_id, id)| async move {
                    (app_id, id, self.orchestrator.container_stats(id).await)
                }))
                .await;
                for (app_id, id, sample) in samples {
                    match sample {
                        Ok(sample) => {
                            let usage = state.counters.observe(id, &sample, cycle);
                            let totals = apps.entry(app_id.clone()).or_default();
                            totals.usage.add(&usage);
                            totals.replicas += 1;
                            system.add(&usage);
                            active_containers += 1;
                        }
                        Err(e) => debug!("Skipping container {} this cycle: {:#}", id, e),
                    }
                }
                let evicted = state.counters.evict_stale(cycle);
                if evicted > 0 {
                    debug!(
                        "Evicted {} idle container counter(s), {} tracked",
                        evicted,
                        state.counters.len()
                    );
                }
            }
            Err(e) => warn!("Metrics cycle {} has no container data: {:#}", cycle, e),
        }

        let rates = self.scrape_request_rates(&mut state).await;
        let app_snapshots: Vec<AppResourceSnapshot> = apps
            .into_iter()
            .map(|(app_id, totals)| {
                let mut usage = totals.usage;
                usage.requests_per_minute = rates.as_ref().map(|rates| rates.for_app(&app_id));
                AppResourceSnapshot {
                    app_id,
                    usage,
                    replicas: totals.replicas,
                    collected_at: now,
                }
            })
            .collect();
        system.requests_per_minute = rates.as_ref().map(|rates| rates.total);
        let system_snapshot = SystemResourceSnapshot {
            usage: system,
            active_containers,
            active_apps: app_snapshots.iter().filter(|s| s.replicas > 0).count(),
            collected_at: now,
        };

        {
            let mut rings = self.rings.write().await;
            rings.system.push(system_snapshot.clone());
            for snapshot in &app_snapshots {
                rings.push_app(snapshot.clone());
            }
            for point in &statuses {
                rings.push_status(point.clone());
            }
            debug!(
                "Metrics cycle {} recorded, {} system sample(s) in memory",
                cycle,
                rings.system.len()
            );
        }

        self.persist(app_snapshots, system_snapshot.clone(), statuses);
        if self.settings.prune_every_cycles > 0 && cycle % self.settings.prune_every_cycles == 0 {
            self.prune();
        }
        system_snapshot
    }

    /// `(app id, container id)` of running containers, learning slugs on the way.
    async fn running_containers(&self, containers: Vec<ContainerSummary>) -> Vec<(String, String)> {
        let mut slugs = self.slugs.write().await;
        containers
            .into_iter()
            .filter(|container| ContainerState::parse(&container.state).is_running())
            .filter_map(|container| {
                let app_id = container.labels.get(APP_ID_LABEL)?.clone();
                if let Some(slug) = container.labels.get(APP_SLUG_LABEL) {
                    slugs.insert(slug.clone(), app_id.clone());
                }
                Some((app_id, container.id))
            })
            .collect()
    }

    async fn scrape_request_rates(&self, state: &mut CycleState) -> Option<RequestRates> {
        let source = state.request_source.clone()?;
        match source.fetch_counters().await {
            Ok(current) => {
                let slugs = self.slugs.read().await;
                let rates = request_rates(
                    state.previous_requests.as_ref(),
                    &current,
                    &slugs,
                    self.settings.interval,
                );
                state.previous_requests = Some(current);
                rates
            }
            Err(e) => {
                warn!("Can't scrape request counters: {:#}", e);
                state.previous_requests = None;
                None
            }
        }
    }

    fn persist(
        &self,
        apps: Vec<AppResourceSnapshot>,
        system: SystemResourceSnapshot,
        statuses: Vec<StatusPoint>,
    ) {
        let Some(store) = self.store.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = store.insert_system_snapshot(&system).await {
                warn!("Can't persist system metrics: {:#}", e);
            }
            if !apps.is_empty() {
                if let Err(e) = store.insert_app_snapshots(&apps).await {
                    warn!("Can't persist app metrics: {:#}", e);
                }
            }
            if !statuses.is_empty() {
                if let Err(e) = store.insert_status_points(&statuses).await {
                    warn!("Can't persist status points: {:#}", e);
                }
            }
        });
    }

    fn prune(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let before = ago(self.settings.retention);
        tokio::spawn(async move {
            match store.delete_before(before).await {
                Ok(removed) => info!("Pruned {} metric record(s) older than {}", removed, before),
                Err(e) => warn!("Can't prune metrics: {:#}", e),
            }
        });
    }

    /// Backfills the ring buffers from durable storage, returns how many records were loaded.
    pub async fn hydrate_from_db(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let since = ago(self.settings.horizon());
        let (system, apps, statuses) = tokio::join!(
            store.system_snapshots_since(since),
            store.app_snapshots_since(None, since),
            store.status_points_since(None, since),
        );

        let mut rings = self.rings.write().await;
        let mut loaded = 0;
        match system {
            Ok(system) => {
                for snapshot in sorted(system) {
                    rings.system.push(snapshot);
                    loaded += 1;
                }
            }
            Err(e) => warn!("Can't load system metrics history: {:#}", e),
        }
        match apps {
            Ok(apps) => {
                for snapshot in sorted(apps) {
                    rings.push_app(snapshot);
                    loaded += 1;
                }
            }
            Err(e) => warn!("Can't load app metrics history: {:#}", e),
        }
        match statuses {
            Ok(statuses) => {
                for point in sorted(statuses) {
                    rings.push_status(point);
                    loaded += 1;
                }
            }
            Err(e) => warn!("Can't load status history: {:#}", e),
        }
        info!("Hydrated {} metric record(s) from storage", loaded);
        loaded
    }

    fn served_from_store(&self, period: Duration) -> Option<&Arc<dyn MetricsStore>> {
        self.store
            .as_ref()
            .filter(|_| period > self.settings.horizon())
    }

    pub async fn get_system_metrics(&self, period: Duration) -> MetricsSeries<SystemResourceSnapshot> {
        let since = ago(period);
        if let Some(store) = self.served_from_store(period) {
            match store.aggregated_system_metrics(since, bucket_width(period)).await {
                Ok(buckets) => return MetricsSeries::Aggregated(buckets),
                Err(e) => warn!("Falling back to in-memory system metrics: {:#}", e),
            }
        }
        MetricsSeries::Raw(self.rings.read().await.system.since(since))
    }

    pub async fn get_app_metrics(&self, app_id: &str, period: Duration) -> MetricsSeries<AppResourceSnapshot> {
        let since = ago(period);
        if let Some(store) = self.served_from_store(period) {
            match store.aggregated_app_metrics(app_id, since, bucket_width(period)).await {
                Ok(buckets) => return MetricsSeries::Aggregated(buckets),
                Err(e) => warn!("Falling back to in-memory metrics of app {}: {:#}", app_id, e),
            }
        }
        MetricsSeries::Raw(self.memory_app_metrics(app_id, since).await)
    }

    async fn memory_app_metrics(&self, app_id: &str, since: DateTime<Utc>) -> Vec<AppResourceSnapshot> {
        self.rings
            .read()
            .await
            .apps
            .get(app_id)
            .map(|ring| ring.since(since))
            .unwrap_or_default()
    }

    /// Raw system snapshots of the period, from storage when configured.
    pub async fn get_system_metrics_history(
        &self,
        period: Duration,
    ) -> Result<Vec<SystemResourceSnapshot>, Error> {
        let since = ago(period);
        match &self.store {
            Some(store) => store.system_snapshots_since(since).await,
            None => Ok(self.rings.read().await.system.since(since)),
        }
    }

    pub async fn get_app_metrics_history(
        &self,
        app_id: &str,
        period: Duration,
    ) -> Result<Vec<AppResourceSnapshot>, Error> {
        let since = ago(period);
        match &self.store {
            Some(store) => store.app_snapshots_since(Some(app_id), since).await,
            None => Ok(self.memory_app_metrics(app_id, since).await),
        }
    }

    pub async fn get_system_metrics_aggregated(
        &self,
        period: Duration,
        bucket: Duration,
    ) -> Result<Vec<AggregatedBucket>, Error> {
        let since = ago(period);
        match &self.store {
            Some(store) => store.aggregated_system_metrics(since, bucket).await,
            None => Ok(aggregate(&self.rings.read().await.system.since(since), bucket)),
        }
    }

    pub async fn get_app_metrics_aggregated(
        &self,
        app_id: &str,
        period: Duration,
        bucket: Duration,
    ) -> Result<Vec<AggregatedBucket>, Error> {
        let since = ago(period);
        match &self.store {
            Some(store) => store.aggregated_app_metrics(app_id, since, bucket).await,
            None => Ok(aggregate(&self.memory_app_metrics(app_id, since).await, bucket)),
        }
    }

    pub async fn get_status_history(&self, app_id: &str, period: Duration) -> Vec<StatusPoint> {
        let since = ago(period);
        if let Some(store) = self.served_from_store(period) {
            match store.status_points_since(Some(app_id), since).await {
                Ok(points) => return points,
                Err(e) => warn!("Falling back to in-memory status history: {:#}", e),
            }
        }
        self.rings
            .read()
            .await
            .statuses
            .get(app_id)
            .map(|ring| ring.since(since))
            .unwrap_or_default()
    }
}

fn sorted<T: Timestamped>(mut records: Vec<T>) -> Vec<T> {
    records.sort_by_key(|record| record.timestamp());
    records
}
