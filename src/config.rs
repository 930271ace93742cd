use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Error};
use config::Config;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub docker_socket: String,
    pub docker_network: String,
    pub name_prefix: String,
    pub base_image: String,
    pub app_port: u16,
    pub route_prefix: String,
    pub build_root: PathBuf,
    pub upload_root: PathBuf,
    pub health_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub metrics_history_secs: u64,
    pub metrics_retention_hours: u64,
    pub prune_every_cycles: u64,
    pub metrics_store_dir: Option<PathBuf>,
    pub proxy_metrics_url: Option<String>,
    pub proxy_request_metric: String,
    pub listen_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            docker_socket: "/var/run/docker.sock".to_string(),
            docker_network: "shinydock".to_string(),
            name_prefix: "shinydock".to_string(),
            base_image: "rocker/r-ver".to_string(),
            app_port: 3838,
            route_prefix: "/app".to_string(),
            build_root: std::env::temp_dir().join("shinydock-builds"),
            upload_root: PathBuf::from("/var/lib/shinydock/uploads"),
            health_interval_secs: 15,
            metrics_interval_secs: 10,
            metrics_history_secs: 3600,
            metrics_retention_hours: 168,
            prune_every_cycles: 360,
            metrics_store_dir: None,
            proxy_metrics_url: None,
            proxy_request_metric: "traefik_service_requests_total".to_string(),
            listen_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl AppConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }

    pub fn metrics_history(&self) -> Duration {
        Duration::from_secs(self.metrics_history_secs)
    }

    pub fn metrics_retention(&self) -> Duration {
        Duration::from_secs(self.metrics_retention_hours * 3600)
    }
}

pub fn load_config() -> Result<AppConfig, Error> {
    let config = Config::builder()
        .add_source(config::File::with_name("shinydock").required(false))
        .add_source(config::Environment::with_prefix("shinydock").try_parsing(true))
        .build()
        .context("Can't load configuration")?;

    config
        .try_deserialize()
        .context("Can't deserialize AppConfig from loaded configuration")
}
