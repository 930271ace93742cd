//! In-memory container engine for unit tests.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use map_macro::hash_map;
use tokio::sync::Notify;

use super::{
    orchestrator::{
        OrchestratorSettings, APP_ID_LABEL, APP_SLUG_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    },
    port::{
        BuildProgress, BuildRequest, ContainerEngine, ContainerRequest, ContainerStatsSample,
        ContainerSummary,
    },
};

pub fn settings(build_root: &Path, upload_root: &Path) -> OrchestratorSettings {
    OrchestratorSettings {
        name_prefix: "shinydock".to_string(),
        base_image: "rocker/r-ver".to_string(),
        app_port: 3838,
        route_prefix: "/app".to_string(),
        network: "shinydock".to_string(),
        build_root: build_root.to_path_buf(),
        upload_root: upload_root.to_path_buf(),
    }
}

#[derive(Debug, Clone)]
pub struct FakeImage {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub dangling: bool,
}

#[derive(Default)]
pub struct FakeState {
    pub containers: Vec<ContainerSummary>,
    pub images: Vec<FakeImage>,
    pub stats: HashMap<String, ContainerStatsSample>,
    pub failing_stats: HashSet<String>,
    pub build_output: Vec<BuildProgress>,
    /// Holds every build stream until notified
    pub build_gate: Option<Arc<Notify>>,
    pub builds: Vec<BuildRequest>,
    pub created: Vec<ContainerRequest>,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
    pub unavailable: bool,
    next_id: usize,
}

impl FakeState {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("c{}", self.next_id)
    }

    fn container_mut(&mut self, id: &str) -> Result<&mut ContainerSummary, Error> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow!("No such container: {}", id))
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.unavailable {
            Err(anyhow!("Cannot connect to the container engine"))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Adds a managed container in the given engine state, returns its id.
    pub fn add_container(&self, app_id: &str, slug: &str, state: &str) -> String {
        let mut guard = self.state();
        let id = guard.next_id();
        guard.containers.push(ContainerSummary {
            id: id.clone(),
            name: Some(format!("shinydock-{}-{}", slug, id)),
            image: format!("shinydock-{}:test", slug),
            state: state.to_string(),
            status: status_for(state).to_string(),
            created: 1_700_000_000,
            labels: hash_map! {
                MANAGED_BY_LABEL.to_string() => MANAGED_BY_VALUE.to_string(),
                APP_ID_LABEL.to_string() => app_id.to_string(),
                APP_SLUG_LABEL.to_string() => slug.to_string(),
            },
            ports: vec![3838],
        });
        id
    }

    pub fn add_unmanaged_container(&self, app_id: &str) -> String {
        let mut guard = self.state();
        let id = guard.next_id();
        guard.containers.push(ContainerSummary {
            id: id.clone(),
            name: None,
            image: "postgres:16".to_string(),
            state: "running".to_string(),
            status: "Up 1 hour".to_string(),
            created: 1_700_000_000,
            labels: hash_map! { APP_ID_LABEL.to_string() => app_id.to_string() },
            ports: vec![],
        });
        id
    }

    pub fn add_image(&self, id: &str, app_id: &str, dangling: bool) {
        self.state().images.push(FakeImage {
            id: id.to_string(),
            labels: hash_map! {
                APP_ID_LABEL.to_string() => app_id.to_string(),
                MANAGED_BY_LABEL.to_string() => MANAGED_BY_VALUE.to_string(),
            },
            dangling,
        });
    }

    pub fn set_container_state(&self, id: &str, state: &str) {
        let mut guard = self.state();
        if let Ok(container) = guard.container_mut(id) {
            container.state = state.to_string();
            container.status = status_for(state).to_string();
        }
    }

    pub fn set_stats(&self, id: &str, sample: ContainerStatsSample) {
        self.state().stats.insert(id.to_string(), sample);
    }

    pub fn fail_stats(&self, id: &str) {
        self.state().failing_stats.insert(id.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    pub fn script_build(&self, output: Vec<BuildProgress>) {
        self.state().build_output = output;
    }

    pub fn gate_builds(&self, gate: Arc<Notify>) {
        self.state().build_gate = Some(gate);
    }
}

fn status_for(state: &str) -> &'static str {
    match state {
        "running" => "Up 1 second",
        "exited" => "Exited (1) 1 second ago",
        "created" => "Created",
        _ => "",
    }
}

fn has_labels(labels: &HashMap<String, String>, filters: &[String]) -> bool {
    filters.iter().all(|filter| match filter.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(filter),
    })
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn build_image(&self, request: BuildRequest) -> BoxStream<'_, Result<BuildProgress, Error>> {
        let mut state = self.state();
        if state.unavailable {
            return futures::stream::once(async { Err(anyhow!("Cannot connect to the container engine")) })
                .boxed();
        }
        state.builds.push(request);
        let output: Vec<Result<BuildProgress, Error>> =
            state.build_output.iter().cloned().map(Ok).collect();
        let output = futures::stream::iter(output);
        match state.build_gate.clone() {
            Some(gate) => futures::stream::once(async move { gate.notified().await })
                .filter_map(|()| futures::future::ready(None::<Result<BuildProgress, Error>>))
                .chain(output)
                .boxed(),
            None => output.boxed(),
        }
    }

    async fn create_container(&self, request: ContainerRequest) -> Result<String, Error> {
        let mut state = self.state();
        state.check_available()?;
        let id = state.next_id();
        state.containers.push(ContainerSummary {
            id: id.clone(),
            name: Some(request.name.clone()),
            image: request.image.clone(),
            state: "created".to_string(),
            status: "Created".to_string(),
            created: 1_700_000_000,
            labels: request.labels.clone(),
            ports: vec![request.exposed_port],
        });
        state.created.push(request);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state();
        state.check_available()?;
        let container = state.container_mut(id)?;
        container.state = "running".to_string();
        container.status = status_for("running").to_string();
        state.started.push(id.to_string());
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state();
        state.check_available()?;
        let container = state.container_mut(id)?;
        container.state = "exited".to_string();
        container.status = "Exited (0) 1 second ago".to_string();
        state.stopped.push(id.to_string());
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state();
        state.check_available()?;
        let container = state.container_mut(id)?;
        container.state = "running".to_string();
        state.restarted.push(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state();
        state.check_available()?;
        state.container_mut(id)?;
        state.containers.retain(|c| c.id != id);
        Ok(())
    }

    async fn list_containers(&self, labels: &[String]) -> Result<Vec<ContainerSummary>, Error> {
        let state = self.state();
        state.check_available()?;
        Ok(state
            .containers
            .iter()
            .filter(|c| has_labels(&c.labels, labels))
            .cloned()
            .collect())
    }

    async fn list_images(&self, labels: &[String], dangling_only: bool) -> Result<Vec<String>, Error> {
        let state = self.state();
        state.check_available()?;
        Ok(state
            .images
            .iter()
            .filter(|image| has_labels(&image.labels, labels))
            .filter(|image| !dangling_only || image.dangling)
            .map(|image| image.id.clone())
            .collect())
    }

    async fn remove_image(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state();
        state.check_available()?;
        state.images.retain(|image| image.id != id);
        Ok(())
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStatsSample, Error> {
        let state = self.state();
        state.check_available()?;
        if state.failing_stats.contains(id) {
            return Err(anyhow!("Container {} is not running", id));
        }
        state
            .stats
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("No stats for container {}", id))
    }
}
