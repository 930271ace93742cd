use std::collections::HashMap;

use anyhow::{anyhow, Context, Error};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig,
        RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, Stats,
        StatsOptions, StopContainerOptions,
    },
    image::{BuildImageOptions, ListImagesOptions, RemoveImageOptions},
    secret::{EndpointSettings, HostConfig, RestartPolicy, RestartPolicyNameEnum},
    Docker,
};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use itertools::Itertools;
use log::debug;
use map_macro::hash_map;

use crate::domain::port::{
    BuildProgress, BuildRequest, ContainerEngine, ContainerRequest, ContainerStatsSample,
    ContainerSummary, InterfaceCounters,
};

const STOP_TIMEOUT_SECS: i64 = 10;

pub struct DockerEngine {
    pub docker: Docker,
}

impl DockerEngine {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

fn label_filters(labels: &[String]) -> HashMap<String, Vec<String>> {
    hash_map! {
        "label".to_string() => labels.to_vec()
    }
}

fn into_summary(container: bollard::secret::ContainerSummary) -> Option<ContainerSummary> {
    Some(ContainerSummary {
        id: container.id?,
        name: container
            .names
            .and_then(|names| names.first().cloned())
            .map(|name| name.trim_start_matches('/').to_string()),
        image: container.image.unwrap_or_default(),
        state: container.state.unwrap_or_default(),
        status: container.status.unwrap_or_default(),
        created: container.created.unwrap_or_default(),
        labels: container.labels.unwrap_or_default(),
        ports: container
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|port| port.private_port)
            .unique()
            .sorted()
            .collect(),
    })
}

fn into_sample(stats: Stats) -> ContainerStatsSample {
    ContainerStatsSample {
        cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
        system_cpu_usage: stats.cpu_stats.system_cpu_usage.unwrap_or_default(),
        online_cpus: stats
            .cpu_stats
            .online_cpus
            .map(|cpus| cpus as u32)
            .unwrap_or(1),
        memory_usage_bytes: stats.memory_stats.usage.unwrap_or_default(),
        memory_limit_bytes: stats.memory_stats.limit.unwrap_or_default(),
        networks: stats
            .networks
            .unwrap_or_default()
            .into_iter()
            .map(|(interface, network)| {
                (
                    interface,
                    InterfaceCounters {
                        rx_bytes: network.rx_bytes,
                        tx_bytes: network.tx_bytes,
                    },
                )
            })
            .collect(),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn build_image(&self, request: BuildRequest) -> BoxStream<'_, Result<BuildProgress, Error>> {
        debug!("Build image {}", request.tag);
        self.docker
            .build_image(
                BuildImageOptions {
                    dockerfile: "Dockerfile".to_string(),
                    t: request.tag,
                    labels: request.labels,
                    rm: true,
                    forcerm: true,
                    ..Default::default()
                },
                None,
                Some(request.context),
            )
            .map(|info| {
                info.map(|info| BuildProgress {
                    stream: info.stream,
                    error: info.error,
                })
                .context("Docker build stream failed")
            })
            .boxed()
    }

    async fn create_container(&self, request: ContainerRequest) -> Result<String, Error> {
        let config = Config {
            image: Some(request.image),
            labels: Some(request.labels),
            exposed_ports: Some(hash_map! {
                format!("{}/tcp", request.exposed_port) => HashMap::new()
            }),
            host_config: Some(HostConfig {
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::ON_FAILURE),
                    maximum_retry_count: Some(3),
                }),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: hash_map! {
                    request.network => EndpointSettings {
                        ..Default::default()
                    }
                },
            }),
            ..Default::default()
        };
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: request.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .with_context(|| format!("Error while creating container {}", request.name))?;
        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("Error while starting container {}", id))
    }

    async fn stop_container(&self, id: &str) -> Result<(), Error> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
            .with_context(|| format!("Error while stopping container {}", id))
    }

    async fn restart_container(&self, id: &str) -> Result<(), Error> {
        self.docker
            .restart_container(
                id,
                Some(RestartContainerOptions {
                    t: STOP_TIMEOUT_SECS as isize,
                }),
            )
            .await
            .with_context(|| format!("Error while restarting container {}", id))
    }

    async fn remove_container(&self, id: &str) -> Result<(), Error> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .context(format!("Error while removing container {}", id))
    }

    async fn list_containers(&self, labels: &[String]) -> Result<Vec<ContainerSummary>, Error> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: label_filters(labels),
                ..Default::default()
            }))
            .await
            .context("Can't list containers")?;
        Ok(containers.into_iter().filter_map(into_summary).collect())
    }

    async fn list_images(&self, labels: &[String], dangling_only: bool) -> Result<Vec<String>, Error> {
        let mut filters = label_filters(labels);
        if dangling_only {
            filters.insert("dangling".to_string(), vec!["true".to_string()]);
        }
        let images = self
            .docker
            .list_images(Some(ListImagesOptions {
                filters,
                ..Default::default()
            }))
            .await
            .context("Can't list images")?;
        Ok(images.into_iter().map(|image| image.id).collect())
    }

    async fn remove_image(&self, id: &str) -> Result<(), Error> {
        self.docker
            .remove_image(
                id,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await
            .with_context(|| format!("Error while removing image {}", id))?;
        Ok(())
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStatsSample, Error> {
        let stats: Vec<Stats> = self
            .docker
            .stats(
                id,
                Some(StatsOptions {
                    stream: false,
                    one_shot: true,
                }),
            )
            .try_collect()
            .await
            .with_context(|| format!("Can't read stats of container {}", id))?;
        stats
            .into_iter()
            .next()
            .map(into_sample)
            .ok_or_else(|| anyhow!("Docker returned no stats for container {}", id))
    }
}
