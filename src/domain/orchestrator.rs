use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, Context, Error};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, info, warn};
use map_macro::hash_map;

use crate::config::AppConfig;

use super::{
    build_log::BuildLogHub,
    context::BuildContext,
    image,
    model::{
        AppSpec, AppStatus, BuildFailure, BuildInProgress, BuildResult, CodeOrigin, ContainerInfo,
        ContainerState, HealthPhase,
    },
    port::{
        BuildProgress, BuildRequest, ContainerEngine, ContainerRequest, ContainerStatsSample,
        ContainerSummary,
    },
};

pub const MANAGED_BY_LABEL: &str = "shinydock.managed-by";
pub const MANAGED_BY_VALUE: &str = "shinydock";
pub const APP_ID_LABEL: &str = "shinydock.app.id";
pub const APP_SLUG_LABEL: &str = "shinydock.app.slug";
pub const REPLICA_LABEL: &str = "shinydock.replica";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub name_prefix: String,
    pub base_image: String,
    pub app_port: u16,
    pub route_prefix: String,
    pub network: String,
    pub build_root: PathBuf,
    pub upload_root: PathBuf,
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            name_prefix: config.name_prefix.clone(),
            base_image: config.base_image.clone(),
            app_port: config.app_port,
            route_prefix: config.route_prefix.clone(),
            network: config.docker_network.clone(),
            build_root: config.build_root.clone(),
            upload_root: config.upload_root.clone(),
        }
    }
}

impl OrchestratorSettings {
    /// Directory holding the uploaded code of an app.
    pub fn upload_dir(&self, app_id: &str) -> PathBuf {
        self.upload_root.join(app_id)
    }
}

pub fn replica_name(prefix: &str, slug: &str, index: u16) -> String {
    format!("{}-{}-{}", prefix, slug, index)
}

/// Coarse app status from the states of its managed containers.
pub fn derive_status(building: bool, states: &[ContainerState]) -> AppStatus {
    if building {
        AppStatus::Building
    } else if states.is_empty() {
        AppStatus::Stopped
    } else if states.iter().any(ContainerState::is_failed) {
        AppStatus::Error
    } else if states.iter().all(ContainerState::is_running) {
        AppStatus::Running
    } else {
        AppStatus::Starting
    }
}

impl From<ContainerSummary> for ContainerInfo {
    fn from(summary: ContainerSummary) -> Self {
        ContainerInfo {
            state: ContainerState::parse(&summary.state),
            health: HealthPhase::from_status(&summary.status),
            created_at: DateTime::<Utc>::from_timestamp(summary.created, 0).unwrap_or_default(),
            port: summary.ports.iter().min().copied(),
            id: summary.id,
            name: summary.name,
            status: summary.status,
        }
    }
}

/// Marks an app as building for as long as it lives.
struct BuildingGuard<'a> {
    orchestrator: &'a Orchestrator,
    app_id: String,
    log_generation: u64,
}

impl Drop for BuildingGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.building().remove(&self.app_id);
        self.orchestrator
            .build_logs
            .finish(&self.app_id, self.log_generation);
    }
}

pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    settings: OrchestratorSettings,
    building: Mutex<HashSet<String>>,
    build_logs: BuildLogHub,
}

impl Orchestrator {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: OrchestratorSettings) -> Self {
        Self {
            engine,
            settings,
            building: Mutex::new(HashSet::new()),
            build_logs: BuildLogHub::new(),
        }
    }

    pub fn build_logs(&self) -> &BuildLogHub {
        &self.build_logs
    }

    fn building(&self) -> MutexGuard<'_, HashSet<String>> {
        self.building
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_building(&self, app_id: &str) -> bool {
        self.building().contains(app_id)
    }

    /// At most one build per app is in flight.
    fn mark_building(&self, app_id: &str) -> Result<BuildingGuard<'_>, BuildInProgress> {
        if !self.building().insert(app_id.to_string()) {
            return Err(BuildInProgress {
                app_id: app_id.to_string(),
            });
        }
        let log_generation = self.build_logs.begin(app_id);
        Ok(BuildingGuard {
            orchestrator: self,
            app_id: app_id.to_string(),
            log_generation,
        })
    }

    /// Builds the image of an app. Build failures are reported in the result. An uploaded origin
    /// without `local_code` or a build already running for the app is an error.
    pub async fn build_image(
        &self,
        spec: &AppSpec,
        local_code: Option<&Path>,
        on_log: Option<&(dyn Fn(&str) + Send + Sync)>,
    ) -> Result<BuildResult, Error> {
        if spec.code_origin == CodeOrigin::Uploaded && local_code.is_none() {
            return Err(anyhow!(
                "App {} uses uploaded code but no local code path was given",
                spec.id
            ));
        }
        let image_name = image::image_name(&self.settings.name_prefix, &spec.slug);
        let image_tag = image::image_tag(spec);
        let _building = self.mark_building(&spec.id)?;
        info!("Build image {}:{} for app {}", image_name, image_tag, spec.id);

        let mut log = Vec::new();
        let failed = |log: Vec<String>, message: String| BuildResult {
            success: false,
            image_name: image_name.clone(),
            image_tag: image_tag.clone(),
            log,
            error: Some(message),
        };

        let archive = match self.prepare_context(spec, local_code).await {
            Ok(prepared) => prepared,
            Err(e) => {
                let message = format!("{:#}", e);
                warn!("Build context for app {} failed: {}", spec.id, message);
                self.record(&spec.id, on_log, &mut log, &message);
                return Ok(failed(log, message));
            }
        };

        let request = BuildRequest {
            tag: format!("{}:{}", image_name, image_tag),
            labels: hash_map! {
                APP_ID_LABEL.to_string() => spec.id.clone(),
                MANAGED_BY_LABEL.to_string() => MANAGED_BY_VALUE.to_string(),
            },
            context: archive,
        };
        let mut progress = self.engine.build_image(request);
        let mut error = None;
        while let Some(item) = progress.next().await {
            match item {
                Ok(BuildProgress {
                    stream,
                    error: build_error,
                }) => {
                    if let Some(text) = stream {
                        for line in text.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
                            self.record(&spec.id, on_log, &mut log, line);
                        }
                    }
                    if let Some(message) = build_error {
                        self.record(&spec.id, on_log, &mut log, &message);
                        error = Some(message);
                        break;
                    }
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    self.record(&spec.id, on_log, &mut log, &message);
                    error = Some(message);
                    break;
                }
            }
        }

        match error {
            Some(message) => {
                warn!("Build of app {} failed: {}", spec.id, message);
                Ok(failed(log, message))
            }
            None => {
                info!("Image {}:{} built", image_name, image_tag);
                Ok(BuildResult {
                    success: true,
                    image_name,
                    image_tag,
                    log,
                    error: None,
                })
            }
        }
    }

    fn record(
        &self,
        app_id: &str,
        on_log: Option<&(dyn Fn(&str) + Send + Sync)>,
        log: &mut Vec<String>,
        line: &str,
    ) {
        self.build_logs.publish(app_id, line);
        if let Some(callback) = on_log {
            callback(line);
        }
        log.push(line.to_string());
    }

    /// Archives a fresh build context. The directory is gone once this returns, whatever the
    /// outcome, and is removed on the blocking pool.
    async fn prepare_context(&self, spec: &AppSpec, local_code: Option<&Path>) -> Result<Bytes, Error> {
        let build_root = self.settings.build_root.clone();
        let origin = spec.code_origin.clone();
        let local_code = local_code.map(Path::to_path_buf);
        let dockerfile = image::dockerfile(spec, &self.settings.base_image, self.settings.app_port);
        tokio::task::spawn_blocking(move || {
            let context = BuildContext::create(&build_root)?;
            match origin {
                CodeOrigin::Git { repository, branch } => {
                    context.populate_from_git(&repository, branch.as_deref())?
                }
                CodeOrigin::Uploaded => {
                    let path = local_code.ok_or_else(|| anyhow!("No local code path"))?;
                    context.populate_from_dir(&path)?
                }
            }
            context.write_dockerfile(&dockerfile)?;
            let archive = context.archive().context("Can't archive build context")?;
            Ok::<_, Error>(archive)
        })
        .await
        .context("Build context preparation aborted")?
    }

    /// Creates and starts every replica of an app, building the image first when no image
    /// reference is given.
    pub async fn start_app(&self, spec: &AppSpec, image: Option<&str>) -> Result<(), Error> {
        let image = match image {
            Some(image) => image.to_string(),
            None => {
                let local_code = match spec.code_origin {
                    CodeOrigin::Uploaded => Some(self.settings.upload_dir(&spec.id)),
                    CodeOrigin::Git { .. } => None,
                };
                let result = self.build_image(spec, local_code.as_deref(), None).await?;
                if !result.success {
                    return Err(BuildFailure {
                        app_id: spec.id.clone(),
                        message: result.error.unwrap_or_else(|| "unknown error".to_string()),
                        log: result.log,
                    }
                    .into());
                }
                result.image_ref()
            }
        };

        info!(
            "Starting {} replica(s) of app {} from {}",
            spec.replicas, spec.id, image
        );
        for index in 0..spec.replicas {
            let request = self.replica_request(spec, &image, index);
            let name = request.name.clone();
            let id = self
                .engine
                .create_container(request)
                .await
                .with_context(|| format!("Can't create container {}", name))?;
            self.engine
                .start_container(&id)
                .await
                .with_context(|| format!("Can't start container {}", name))?;
            info!("Instance {} started as {}", name, id);
        }
        Ok(())
    }

    fn replica_request(&self, spec: &AppSpec, image: &str, index: u16) -> ContainerRequest {
        let settings = &self.settings;
        let route = format!("{}/{}", settings.route_prefix.trim_end_matches('/'), spec.slug);
        let service = &spec.slug;
        ContainerRequest {
            name: replica_name(&settings.name_prefix, &spec.slug, index),
            image: image.to_string(),
            labels: hash_map! {
                MANAGED_BY_LABEL.to_string() => MANAGED_BY_VALUE.to_string(),
                APP_ID_LABEL.to_string() => spec.id.clone(),
                APP_SLUG_LABEL.to_string() => spec.slug.clone(),
                REPLICA_LABEL.to_string() => index.to_string(),
                "traefik.enable".to_string() => "true".to_string(),
                "traefik.docker.network".to_string() => settings.network.clone(),
                format!("traefik.http.routers.{}.rule", service) => format!("PathPrefix(`{}`)", route),
                format!("traefik.http.routers.{}.middlewares", service) => format!("{}-strip", service),
                format!("traefik.http.middlewares.{}-strip.stripprefix.prefixes", service) => route.clone(),
                format!("traefik.http.routers.{}.service", service) => service.clone(),
                format!("traefik.http.services.{}.loadbalancer.server.port", service) => settings.app_port.to_string(),
            },
            exposed_port: settings.app_port,
            network: settings.network.clone(),
        }
    }

    /// Stops running replicas, then removes every replica of the app.
    pub async fn stop_app(&self, app_id: &str) -> Result<(), Error> {
        let containers = self.list_managed_containers(Some(app_id)).await?;
        for container in &containers {
            if ContainerState::parse(&container.state).is_running() {
                self.engine
                    .stop_container(&container.id)
                    .await
                    .with_context(|| format!("Can't stop container {}", container.id))?;
            }
        }
        for container in &containers {
            self.engine
                .remove_container(&container.id)
                .await
                .with_context(|| format!("Error while removing container {}", container.id))?;
        }
        info!("App {} stopped, {} container(s) removed", app_id, containers.len());
        Ok(())
    }

    pub async fn restart_app(&self, app_id: &str) -> Result<(), Error> {
        let containers = self.list_managed_containers(Some(app_id)).await?;
        for container in &containers {
            self.engine
                .restart_container(&container.id)
                .await
                .with_context(|| format!("Can't restart container {}", container.id))?;
        }
        info!("App {} restarted, {} container(s)", app_id, containers.len());
        Ok(())
    }

    pub async fn get_app_status(&self, app_id: &str) -> Result<AppStatus, Error> {
        let states: Vec<ContainerState> = self
            .list_managed_containers(Some(app_id))
            .await?
            .iter()
            .map(|container| ContainerState::parse(&container.state))
            .collect();
        Ok(derive_status(self.is_building(app_id), &states))
    }

    pub async fn get_containers(&self, app_id: &str) -> Result<Vec<ContainerInfo>, Error> {
        Ok(self
            .list_managed_containers(Some(app_id))
            .await?
            .into_iter()
            .map(ContainerInfo::from)
            .collect())
    }

    /// Removes the app's stopped containers and its dangling images.
    pub async fn cleanup(&self, app_id: &str) -> Result<(), Error> {
        let stale: Vec<ContainerSummary> = self
            .list_managed_containers(Some(app_id))
            .await?
            .into_iter()
            .filter(|container| !ContainerState::parse(&container.state).is_running())
            .collect();
        for container in &stale {
            self.engine
                .remove_container(&container.id)
                .await
                .with_context(|| format!("Error while removing container {}", container.id))?;
        }
        let dangling = self.engine.list_images(&[app_label(app_id)], true).await?;
        let images = self.remove_image_ids(&dangling).await;
        info!(
            "Cleanup of app {}: {} container(s), {} image(s) removed",
            app_id,
            stale.len(),
            images
        );
        Ok(())
    }

    /// Removes every image of the app, tagged or not. Returns how many were removed.
    pub async fn remove_images(&self, app_id: &str) -> Result<usize, Error> {
        let images = self.engine.list_images(&[app_label(app_id)], false).await?;
        Ok(self.remove_image_ids(&images).await)
    }

    async fn remove_image_ids(&self, ids: &[String]) -> usize {
        let mut removed = 0;
        for id in ids {
            match self.engine.remove_image(id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Can't remove image {}: {:#}", id, e),
            }
        }
        removed
    }

    /// Every container carrying the managed-by label, optionally narrowed to one app.
    pub async fn list_managed_containers(
        &self,
        app_id: Option<&str>,
    ) -> Result<Vec<ContainerSummary>, Error> {
        let mut filters = vec![format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE)];
        if let Some(app_id) = app_id {
            filters.push(app_label(app_id));
        }
        let containers = self
            .engine
            .list_containers(&filters)
            .await
            .context("Can't list managed containers")?;
        debug!("{} managed container(s) listed for {:?}", containers.len(), app_id);
        Ok(containers)
    }

    pub async fn container_stats(&self, id: &str) -> Result<ContainerStatsSample, Error> {
        self.engine.container_stats(id).await
    }
}

fn app_label(app_id: &str) -> String {
    format!("{}={}", APP_ID_LABEL, app_id)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use rand::{seq::SliceRandom, Rng};
    use tempfile::TempDir;

    use super::*;
    use crate::domain::testing::{settings, FakeEngine};

    fn uploaded_spec(replicas: u16) -> AppSpec {
        AppSpec {
            id: "app-1".to_string(),
            slug: "sales".to_string(),
            runtime_version: "4.3.2".to_string(),
            packages: vec!["shiny".to_string()],
            code_origin: CodeOrigin::Uploaded,
            entry_point: "app.R".to_string(),
            replicas,
        }
    }

    struct Fixture {
        engine: Arc<FakeEngine>,
        orchestrator: Orchestrator,
        builds: TempDir,
        uploads: TempDir,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(FakeEngine::new());
        let builds = TempDir::new().unwrap();
        let uploads = TempDir::new().unwrap();
        let code = uploads.path().join("app-1");
        std::fs::create_dir_all(&code).unwrap();
        std::fs::write(code.join("app.R"), "shiny::runApp()").unwrap();
        let orchestrator = Orchestrator::new(
            engine.clone(),
            settings(builds.path(), uploads.path()),
        );
        Fixture {
            engine,
            orchestrator,
            builds,
            uploads,
        }
    }

    #[test]
    fn status_derivation_over_random_container_sets() {
        let states = [
            ContainerState::Created,
            ContainerState::Running,
            ContainerState::Paused,
            ContainerState::Restarting,
            ContainerState::Removing,
            ContainerState::Exited,
            ContainerState::Dead,
            ContainerState::Unknown,
        ];
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let len = rng.gen_range(0..6);
            let set: Vec<ContainerState> = (0..len)
                .map(|_| *states.choose(&mut rng).unwrap())
                .collect();
            let expected = if set.is_empty() {
                AppStatus::Stopped
            } else if set.iter().any(|s| *s == ContainerState::Exited || *s == ContainerState::Dead) {
                AppStatus::Error
            } else if set.iter().all(|s| *s == ContainerState::Running) {
                AppStatus::Running
            } else {
                AppStatus::Starting
            };
            assert_eq!(derive_status(false, &set), expected, "{:?}", set);
            assert_eq!(derive_status(true, &set), AppStatus::Building);
        }
    }

    #[tokio::test]
    async fn start_app_creates_and_starts_named_replicas() {
        let f = fixture();
        f.orchestrator
            .start_app(&uploaded_spec(3), None)
            .await
            .unwrap();

        let mut names: Vec<String> = f
            .orchestrator
            .get_containers("app-1")
            .await
            .unwrap()
            .into_iter()
            .filter_map(|c| c.name)
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["shinydock-sales-0", "shinydock-sales-1", "shinydock-sales-2"]
        );
        assert_eq!(f.engine.state().started.len(), 3);
        assert_eq!(
            f.orchestrator.get_app_status("app-1").await.unwrap(),
            AppStatus::Running
        );
        let tag = format!("shinydock-sales:{}", image::image_tag(&uploaded_spec(3)));
        assert_eq!(f.engine.state().builds[0].tag, tag);
        assert!(f
            .engine
            .state()
            .containers
            .iter()
            .all(|c| c.image == tag));
    }

    #[tokio::test]
    async fn replicas_carry_routing_metadata_without_published_ports() {
        let f = fixture();
        f.orchestrator
            .start_app(&uploaded_spec(1), Some("shinydock-sales:abc"))
            .await
            .unwrap();
        assert!(f.engine.state().builds.is_empty());

        let request = f.engine.state().created[0].clone();
        let labels = &request.labels;
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY_VALUE);
        assert_eq!(labels[APP_ID_LABEL], "app-1");
        assert_eq!(labels["traefik.http.routers.sales.rule"], "PathPrefix(`/app/sales`)");
        assert_eq!(
            labels["traefik.http.middlewares.sales-strip.stripprefix.prefixes"],
            "/app/sales"
        );
        assert_eq!(labels["traefik.http.routers.sales.middlewares"], "sales-strip");
        assert_eq!(labels["traefik.http.routers.sales.service"], "sales");
        assert_eq!(
            labels["traefik.http.services.sales.loadbalancer.server.port"],
            "3838"
        );
        assert_eq!(request.network, "shinydock");
        assert_eq!(request.exposed_port, 3838);
    }

    #[tokio::test]
    async fn stop_app_empties_the_managed_set() {
        let f = fixture();
        f.orchestrator
            .start_app(&uploaded_spec(2), Some("img:1"))
            .await
            .unwrap();
        let exited = f.engine.add_container("app-1", "sales", "exited");

        f.orchestrator.stop_app("app-1").await.unwrap();

        assert_eq!(
            f.orchestrator.get_app_status("app-1").await.unwrap(),
            AppStatus::Stopped
        );
        assert!(f
            .orchestrator
            .list_managed_containers(Some("app-1"))
            .await
            .unwrap()
            .is_empty());
        let state = f.engine.state();
        assert_eq!(state.stopped.len(), 2);
        assert!(!state.stopped.contains(&exited));
    }

    #[tokio::test]
    async fn restart_app_restarts_in_place() {
        let f = fixture();
        let a = f.engine.add_container("app-1", "sales", "running");
        let b = f.engine.add_container("app-1", "sales", "exited");
        f.engine.add_container("app-2", "other", "running");

        f.orchestrator.restart_app("app-1").await.unwrap();

        let state = f.engine.state();
        assert_eq!(state.restarted, vec![a, b]);
        assert!(state.created.is_empty());
    }

    #[tokio::test]
    async fn uploaded_build_without_code_path_fails_fast() {
        let f = fixture();
        let result = f.orchestrator.build_image(&uploaded_spec(1), None, None).await;
        assert!(result.is_err());
        assert!(f.engine.state().builds.is_empty());
    }

    #[tokio::test]
    async fn build_error_is_reported_with_partial_log() {
        let f = fixture();
        f.engine.script_build(vec![
            BuildProgress {
                stream: Some("Step 1/6 : FROM rocker/r-ver:4.3.2\n".to_string()),
                error: None,
            },
            BuildProgress {
                stream: None,
                error: Some("package 'nope' is not available".to_string()),
            },
            BuildProgress {
                stream: Some("never seen\n".to_string()),
                error: None,
            },
        ]);
        let seen = StdMutex::new(Vec::new());
        let on_log = |line: &str| seen.lock().unwrap().push(line.to_string());
        let code = f.uploads.path().join("app-1");

        let result = f
            .orchestrator
            .build_image(
                &uploaded_spec(1),
                Some(&code),
                Some(&on_log as &(dyn Fn(&str) + Send + Sync)),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("package 'nope' is not available"));
        assert_eq!(
            result.log,
            vec!["Step 1/6 : FROM rocker/r-ver:4.3.2", "package 'nope' is not available"]
        );
        assert_eq!(*seen.lock().unwrap(), result.log);
        assert!(!f.orchestrator.is_building("app-1"));
        assert_eq!(std::fs::read_dir(f.builds.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn start_app_surfaces_build_failure_with_log() {
        let f = fixture();
        f.engine.script_build(vec![BuildProgress {
            stream: None,
            error: Some("boom".to_string()),
        }]);

        let error = f
            .orchestrator
            .start_app(&uploaded_spec(2), None)
            .await
            .unwrap_err();

        let failure = error.downcast_ref::<BuildFailure>().unwrap();
        assert_eq!(failure.message, "boom");
        assert_eq!(failure.log, vec!["boom"]);
        assert!(f.engine.state().created.is_empty());
    }

    #[tokio::test]
    async fn missing_upload_directory_is_a_build_failure() {
        let f = fixture();
        let result = f
            .orchestrator
            .build_image(
                &uploaded_spec(1),
                Some(&f.uploads.path().join("missing")),
                None,
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("does not exist"));
        assert!(f.engine.state().builds.is_empty());
    }

    #[tokio::test]
    async fn cleanup_spares_running_containers_and_tagged_images() {
        let f = fixture();
        let running = f.engine.add_container("app-1", "sales", "running");
        f.engine.add_container("app-1", "sales", "exited");
        f.engine.add_container("app-1", "sales", "created");
        f.engine.add_image("img-tagged", "app-1", false);
        f.engine.add_image("img-dangling", "app-1", true);
        f.engine.add_image("img-other", "app-2", true);

        f.orchestrator.cleanup("app-1").await.unwrap();

        let state = f.engine.state();
        let remaining: Vec<&str> = state.containers.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(remaining, vec![running.as_str()]);
        let images: Vec<&str> = state.images.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(images, vec!["img-tagged", "img-other"]);
    }

    #[tokio::test]
    async fn remove_images_removes_every_image_of_the_app() {
        let f = fixture();
        f.engine.add_image("img-tagged", "app-1", false);
        f.engine.add_image("img-dangling", "app-1", true);
        f.engine.add_image("img-other", "app-2", false);

        assert_eq!(f.orchestrator.remove_images("app-1").await.unwrap(), 2);
        assert_eq!(f.engine.state().images.len(), 1);
    }

    #[tokio::test]
    async fn listing_ignores_unmanaged_containers() {
        let f = fixture();
        f.engine.add_unmanaged_container("app-1");
        assert_eq!(
            f.orchestrator.get_app_status("app-1").await.unwrap(),
            AppStatus::Stopped
        );
        assert!(f
            .orchestrator
            .list_managed_containers(None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn container_info_exposes_health_and_port() {
        let f = fixture();
        f.orchestrator
            .start_app(&uploaded_spec(1), Some("img:1"))
            .await
            .unwrap();
        f.engine.state().containers[0].status = "Up 5 minutes (healthy)".to_string();

        let info = f.orchestrator.get_containers("app-1").await.unwrap();
        assert_eq!(info[0].health, Some(HealthPhase::Healthy));
        assert_eq!(info[0].port, Some(3838));
        assert_eq!(info[0].state, ContainerState::Running);
    }

    #[tokio::test]
    async fn overlapping_build_of_the_same_app_is_rejected() {
        let f = fixture();
        let gate = Arc::new(tokio::sync::Notify::new());
        f.engine.gate_builds(gate.clone());
        let spec = uploaded_spec(1);
        let code = f.uploads.path().join("app-1");

        let slow = f.orchestrator.build_image(&spec, Some(&code), None);
        let while_in_flight = async {
            while f.engine.state().builds.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
            let leftover_contexts = std::fs::read_dir(f.builds.path()).unwrap().count();
            let second = f.orchestrator.build_image(&spec, Some(&code), None).await;
            let status = f.orchestrator.get_app_status("app-1").await.unwrap();
            let log_open = f.orchestrator.build_logs().subscribe("app-1").is_some();
            gate.notify_one();
            (leftover_contexts, second, status, log_open)
        };
        let (first, (leftover_contexts, second, status, log_open)) =
            tokio::join!(slow, while_in_flight);

        assert_eq!(leftover_contexts, 0);
        assert!(second.unwrap_err().downcast_ref::<BuildInProgress>().is_some());
        assert_eq!(status, AppStatus::Building);
        assert!(log_open);
        assert!(first.unwrap().success);
        assert_eq!(f.engine.state().builds.len(), 1);
        assert!(!f.orchestrator.is_building("app-1"));
        assert!(f.orchestrator.build_logs().subscribe("app-1").is_none());
    }

    #[test]
    fn uploaded_code_lives_under_the_app_id() {
        let f = fixture();
        assert_eq!(
            f.orchestrator.settings.upload_dir("app-1"),
            f.uploads.path().join("app-1")
        );
    }
}
