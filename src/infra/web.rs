use std::{convert::Infallible, sync::Arc, time::Duration};

use anyhow::Error;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use itertools::Itertools;
use log::{error, info};
use serde::Deserialize;
use serde_json::json;

use crate::domain::{
    health::HealthSupervisor,
    metrics::MetricsCollector,
    model::{AppSpec, BuildFailure, BuildInProgress},
    orchestrator::{Orchestrator, APP_SLUG_LABEL},
};

const DEFAULT_PERIOD_SECS: u64 = 3600;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub health: Arc<HealthSupervisor>,
    pub metrics: Arc<MetricsCollector>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/apps", get(list_apps).post(start_app))
        .route("/apps/:app_id", get(get_app).delete(destroy_app))
        .route("/apps/:app_id/stop", post(stop_app))
        .route("/apps/:app_id/restart", post(restart_app))
        .route("/apps/:app_id/cleanup", post(cleanup_app))
        .route("/apps/:app_id/build-log", get(build_log))
        .route("/apps/:app_id/metrics", get(app_metrics))
        .route("/apps/:app_id/metrics/history", get(app_metrics_history))
        .route("/metrics/system", get(system_metrics))
        .route("/metrics/system/history", get(system_metrics_history))
        .route("/status", get(status))
        .with_state(Arc::new(state))
}

#[derive(Debug, Deserialize)]
struct PeriodQuery {
    period: Option<u64>,
    /// Bucket width in seconds, raw rows when absent
    bucket: Option<u64>,
}

impl PeriodQuery {
    fn period(&self) -> Duration {
        Duration::from_secs(self.period.unwrap_or(DEFAULT_PERIOD_SECS))
    }

    fn bucket(&self) -> Option<Duration> {
        self.bucket.map(|secs| Duration::from_secs(secs.max(1)))
    }
}

fn failure(operation: &str, e: Error) -> Response {
    error!("Error during {} {:?}", operation, e);
    if let Some(build) = e.downcast_ref::<BuildFailure>() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error": build.message,
                "log": build.log,
            })),
        )
            .into_response();
    }
    if let Some(running) = e.downcast_ref::<BuildInProgress>() {
        return (StatusCode::CONFLICT, running.to_string()).into_response();
    }
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Something went wrong: {e}"),
    )
        .into_response()
}

async fn list_apps(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshots = state.health.get_all_snapshots().await;
    Json(
        snapshots
            .into_values()
            .sorted_by(|a, b| a.app_id.cmp(&b.app_id))
            .collect::<Vec<_>>(),
    )
}

async fn start_app(State(state): State<Arc<AppState>>, Json(spec): Json<AppSpec>) -> Response {
    state.health.track(&spec.id).await;
    state.metrics.register_slug(&spec.slug, &spec.id).await;
    match state.orchestrator.start_app(&spec, None).await {
        Ok(()) => {
            info!("App {} deployed under /{}", spec.id, spec.slug);
            (StatusCode::OK, "Application started").into_response()
        }
        Err(e) => failure("start_app", e),
    }
}

async fn get_app(State(state): State<Arc<AppState>>, Path(app_id): Path<String>) -> Response {
    match state.health.get_snapshot(&app_id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (StatusCode::NOT_FOUND, format!("Unknown app {}", app_id)).into_response(),
    }
}

async fn stop_app(State(state): State<Arc<AppState>>, Path(app_id): Path<String>) -> Response {
    match state.orchestrator.stop_app(&app_id).await {
        Ok(()) => (StatusCode::OK, "Application stopped").into_response(),
        Err(e) => failure("stop_app", e),
    }
}

async fn restart_app(State(state): State<Arc<AppState>>, Path(app_id): Path<String>) -> Response {
    match state.orchestrator.restart_app(&app_id).await {
        Ok(()) => (StatusCode::OK, "Application restarted").into_response(),
        Err(e) => failure("restart_app", e),
    }
}

async fn cleanup_app(State(state): State<Arc<AppState>>, Path(app_id): Path<String>) -> Response {
    match state.orchestrator.cleanup(&app_id).await {
        Ok(()) => (StatusCode::OK, "Application cleaned up").into_response(),
        Err(e) => failure("cleanup", e),
    }
}

async fn destroy_app(State(state): State<Arc<AppState>>, Path(app_id): Path<String>) -> Response {
    let destroyed: Result<usize, Error> = async {
        let slugs: Vec<String> = state
            .orchestrator
            .list_managed_containers(Some(&app_id))
            .await?
            .into_iter()
            .filter_map(|container| container.labels.get(APP_SLUG_LABEL).cloned())
            .unique()
            .collect();
        state.orchestrator.stop_app(&app_id).await?;
        let images = state.orchestrator.remove_images(&app_id).await?;
        state.health.untrack(&app_id).await;
        for slug in slugs {
            state.metrics.unregister_slug(&slug).await;
        }
        Ok(images)
    }
    .await;
    match destroyed {
        Ok(images) => {
            info!("App {} destroyed, {} image(s) removed", app_id, images);
            (StatusCode::OK, "Application destroyed").into_response()
        }
        Err(e) => failure("destroy_app", e),
    }
}

async fn build_log(State(state): State<Arc<AppState>>, Path(app_id): Path<String>) -> Response {
    match state.orchestrator.build_logs().subscribe(&app_id) {
        Some(subscription) => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            Body::from_stream(
                subscription
                    .into_lines()
                    .map(|line| Ok::<_, Infallible>(format!("{}\n", line))),
            ),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, format!("No build in progress for {}", app_id)).into_response(),
    }
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "health_supervisor": state.health.is_running(),
        "metrics_collector": state.metrics.is_running(),
        "tracked_apps": state.health.tracked().await.len(),
    }))
}

async fn app_metrics(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    Query(query): Query<PeriodQuery>,
) -> impl IntoResponse {
    let series = state.metrics.get_app_metrics(&app_id, query.period()).await;
    let statuses = state.metrics.get_status_history(&app_id, query.period()).await;
    Json(json!({
        "series": series,
        "statuses": statuses,
    }))
}

async fn system_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeriodQuery>,
) -> impl IntoResponse {
    Json(state.metrics.get_system_metrics(query.period()).await)
}

async fn app_metrics_history(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    Query(query): Query<PeriodQuery>,
) -> Response {
    let metrics = &state.metrics;
    let history = match query.bucket() {
        Some(bucket) => metrics
            .get_app_metrics_aggregated(&app_id, query.period(), bucket)
            .await
            .map(|buckets| Json(buckets).into_response()),
        None => metrics
            .get_app_metrics_history(&app_id, query.period())
            .await
            .map(|rows| Json(rows).into_response()),
    };
    history.unwrap_or_else(|e| failure("app_metrics_history", e))
}

async fn system_metrics_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PeriodQuery>,
) -> Response {
    let metrics = &state.metrics;
    let history = match query.bucket() {
        Some(bucket) => metrics
            .get_system_metrics_aggregated(query.period(), bucket)
            .await
            .map(|buckets| Json(buckets).into_response()),
        None => metrics
            .get_system_metrics_history(query.period())
            .await
            .map(|rows| Json(rows).into_response()),
    };
    history.unwrap_or_else(|e| failure("system_metrics_history", e))
}
