use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declarative description of an app, owned by the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSpec {
    pub id: String,
    pub slug: String,
    pub runtime_version: String,
    #[serde(default)]
    pub packages: Vec<String>,
    pub code_origin: CodeOrigin,
    pub entry_point: String,
    #[serde(default = "default_replicas")]
    pub replicas: u16,
}

fn default_replicas() -> u16 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodeOrigin {
    Git {
        repository: String,
        branch: Option<String>,
    },
    /// Code bytes live in an externally managed directory keyed by app id.
    Uploaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Building,
    Starting,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AppStatus::Building => "building",
            AppStatus::Starting => "starting",
            AppStatus::Running => "running",
            AppStatus::Stopped => "stopped",
            AppStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Engine-side container state, parsed from the engine's state string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ContainerState::Exited | ContainerState::Dead)
    }
}

/// Health-check phase reported by the engine inside the human status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthPhase {
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthPhase {
    pub fn from_status(status: &str) -> Option<Self> {
        if status.contains("unhealthy") {
            Some(HealthPhase::Unhealthy)
        } else if status.contains("healthy") {
            Some(HealthPhase::Healthy)
        } else if status.contains("health: starting") {
            Some(HealthPhase::Starting)
        } else {
            None
        }
    }
}

/// Caller-facing view of one replica container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: Option<String>,
    pub state: ContainerState,
    pub status: String,
    pub health: Option<HealthPhase>,
    pub created_at: DateTime<Utc>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    pub image_name: String,
    pub image_tag: String,
    pub log: Vec<String>,
    pub error: Option<String>,
}

impl BuildResult {
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }
}

/// Raised by `start_app` when the implicit build did not succeed.
#[derive(Debug, thiserror::Error)]
#[error("image build failed for app {app_id}: {message}")]
pub struct BuildFailure {
    pub app_id: String,
    pub message: String,
    pub log: Vec<String>,
}

/// A second build of an app was requested while one is still running.
#[derive(Debug, thiserror::Error)]
#[error("a build of app {app_id} is already in progress")]
pub struct BuildInProgress {
    pub app_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppHealthSnapshot {
    pub app_id: String,
    pub status: AppStatus,
    pub containers: Vec<ContainerInfo>,
    pub polled_at: DateTime<Utc>,
}
