use std::{error::Error, sync::Arc, time::Duration};

use anyhow::Context;
use bollard::{Docker, API_DEFAULT_VERSION};
use config::load_config;
use domain::{
    health::{HealthSupervisor, StatusChangeCallback},
    metrics::{CollectorSettings, MetricsCollector},
    orchestrator::{Orchestrator, OrchestratorSettings},
    port::{MetricsStore, RequestCounterSource},
};
use infra::{
    docker::DockerEngine,
    proxy::HttpRequestCounterSource,
    store::FileMetricsStore,
    web::{router, AppState},
};
use log::info;
use tokio::net::TcpListener;

mod config;
mod domain;
mod infra;

const PROXY_SCRAPE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    info!("Start shinydock - container orchestration for hosted R apps");

    let config = load_config()?;
    info!("Loaded config {:?}", config);
    let docker = Docker::connect_with_socket(&config.docker_socket, 120, API_DEFAULT_VERSION)
        .context("Can't connect to docker socket")?;

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(DockerEngine::new(docker)),
        OrchestratorSettings::from(&config),
    ));

    let on_change: StatusChangeCallback = Arc::new(|app_id, previous, current| {
        info!("App {} went from {} to {}", app_id, previous, current);
    });
    let health = Arc::new(HealthSupervisor::new(
        orchestrator.clone(),
        config.health_interval(),
        Some(on_change),
    ));

    let store: Option<Arc<dyn MetricsStore>> = match &config.metrics_store_dir {
        Some(dir) => Some(FileMetricsStore::open(dir).await?),
        None => None,
    };
    let metrics = Arc::new(MetricsCollector::new(
        orchestrator.clone(),
        health.clone(),
        store,
        CollectorSettings::from(&config),
    ));
    if let Some(url) = &config.proxy_metrics_url {
        let source: Arc<dyn RequestCounterSource> = Arc::new(HttpRequestCounterSource::new(
            url,
            &config.proxy_request_metric,
            PROXY_SCRAPE_TIMEOUT,
        )?);
        metrics.set_request_source(Some(source)).await;
    }

    metrics.hydrate_from_db().await;
    health.start();
    metrics.start();

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Can't listen on {}", config.listen_addr))?;
    info!("Listening on {}", config.listen_addr);
    axum::serve(
        listener,
        router(AppState {
            orchestrator,
            health: health.clone(),
            metrics: metrics.clone(),
        }),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    })
    .await?;

    metrics.stop();
    health.stop();
    Ok(())
}
