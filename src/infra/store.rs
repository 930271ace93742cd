//! Durable metrics storage adapters.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

use crate::domain::{
    metrics::{AppResourceSnapshot, StatusPoint, SystemResourceSnapshot, Timestamped},
    port::MetricsStore,
};

const APP_SNAPSHOTS: &str = "app_snapshots.jsonl";
const SYSTEM_SNAPSHOTS: &str = "system_snapshots.jsonl";
const STATUS_POINTS: &str = "status_points.jsonl";

/// One JSON document per line, one file per record kind.
pub struct FileMetricsStore {
    dir: PathBuf,
    // appends and prune rewrites must not interleave
    lock: Mutex<()>,
}

impl FileMetricsStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Arc<Self>, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Can't create metrics directory {}", dir.display()))?;
        Ok(Arc::new(Self {
            dir,
            lock: Mutex::new(()),
        }))
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    async fn append<T: Serialize>(&self, file: &str, records: &[T]) -> Result<(), Error> {
        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }
        let _guard = self.lock.lock().await;
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(file))
            .await
            .with_context(|| format!("Can't open {}", file))?;
        out.write_all(&buffer).await?;
        out.flush().await?;
        Ok(())
    }

    async fn read_all<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>, Error> {
        let _guard = self.lock.lock().await;
        read_records(&self.path(file)).await
    }

    async fn retain_since<T>(&self, file: &str, before: DateTime<Utc>) -> Result<u64, Error>
    where
        T: Serialize + DeserializeOwned + Timestamped,
    {
        let _guard = self.lock.lock().await;
        let path = self.path(file);
        let records: Vec<T> = read_records(&path).await?;
        let total = records.len();
        let kept: Vec<&T> = records.iter().filter(|r| r.timestamp() >= before).collect();
        let removed = (total - kept.len()) as u64;
        if removed == 0 {
            return Ok(0);
        }
        let mut buffer = Vec::new();
        for record in kept {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }
        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, &buffer).await?;
        fs::rename(&tmp, &path).await?;
        debug!("Pruned {} record(s) from {}", removed, file);
        Ok(removed)
    }
}

async fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, Error> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Can't read {}", path.display())),
    };
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping corrupt record in {}: {}", path.display(), e);
                None
            }
        })
        .collect())
}

#[async_trait]
impl MetricsStore for FileMetricsStore {
    async fn insert_app_snapshots(&self, snapshots: &[AppResourceSnapshot]) -> Result<(), Error> {
        self.append(APP_SNAPSHOTS, snapshots).await
    }

    async fn insert_system_snapshot(&self, snapshot: &SystemResourceSnapshot) -> Result<(), Error> {
        self.append(SYSTEM_SNAPSHOTS, std::slice::from_ref(snapshot))
            .await
    }

    async fn insert_status_points(&self, points: &[StatusPoint]) -> Result<(), Error> {
        self.append(STATUS_POINTS, points).await
    }

    async fn app_snapshots_since(
        &self,
        app_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<AppResourceSnapshot>, Error> {
        let records: Vec<AppResourceSnapshot> = self.read_all(APP_SNAPSHOTS).await?;
        Ok(records
            .into_iter()
            .filter(|s| s.collected_at >= since)
            .filter(|s| app_id.map_or(true, |id| s.app_id == id))
            .collect())
    }

    async fn system_snapshots_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SystemResourceSnapshot>, Error> {
        let records: Vec<SystemResourceSnapshot> = self.read_all(SYSTEM_SNAPSHOTS).await?;
        Ok(records
            .into_iter()
            .filter(|s| s.collected_at >= since)
            .collect())
    }

    async fn status_points_since(
        &self,
        app_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatusPoint>, Error> {
        let records: Vec<StatusPoint> = self.read_all(STATUS_POINTS).await?;
        Ok(records
            .into_iter()
            .filter(|p| p.recorded_at >= since)
            .filter(|p| app_id.map_or(true, |id| p.app_id == id))
            .collect())
    }

    async fn delete_before(&self, before: DateTime<Utc>) -> Result<u64, Error> {
        Ok(self
            .retain_since::<AppResourceSnapshot>(APP_SNAPSHOTS, before)
            .await?
            + self
                .retain_since::<SystemResourceSnapshot>(SYSTEM_SNAPSHOTS, before)
                .await?
            + self
                .retain_since::<StatusPoint>(STATUS_POINTS, before)
                .await?)
    }
}

#[cfg(test)]
use tokio::sync::RwLock;

/// Process-local store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct InMemoryMetricsStore {
    apps: RwLock<Vec<AppResourceSnapshot>>,
    system: RwLock<Vec<SystemResourceSnapshot>>,
    statuses: RwLock<Vec<StatusPoint>>,
}

#[cfg(test)]
impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn system_len(&self) -> usize {
        self.system.read().await.len()
    }
}

#[cfg(test)]
#[async_trait]
impl MetricsStore for InMemoryMetricsStore {
    async fn insert_app_snapshots(&self, snapshots: &[AppResourceSnapshot]) -> Result<(), Error> {
        self.apps.write().await.extend_from_slice(snapshots);
        Ok(())
    }

    async fn insert_system_snapshot(&self, snapshot: &SystemResourceSnapshot) -> Result<(), Error> {
        self.system.write().await.push(snapshot.clone());
        Ok(())
    }

    async fn insert_status_points(&self, points: &[StatusPoint]) -> Result<(), Error> {
        self.statuses.write().await.extend_from_slice(points);
        Ok(())
    }

    async fn app_snapshots_since(
        &self,
        app_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<AppResourceSnapshot>, Error> {
        Ok(self
            .apps
            .read()
            .await
            .iter()
            .filter(|s| s.collected_at >= since)
            .filter(|s| app_id.map_or(true, |id| s.app_id == id))
            .cloned()
            .collect())
    }

    async fn system_snapshots_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<SystemResourceSnapshot>, Error> {
        Ok(self
            .system
            .read()
            .await
            .iter()
            .filter(|s| s.collected_at >= since)
            .cloned()
            .collect())
    }

    async fn status_points_since(
        &self,
        app_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<StatusPoint>, Error> {
        Ok(self
            .statuses
            .read()
            .await
            .iter()
            .filter(|p| p.recorded_at >= since)
            .filter(|p| app_id.map_or(true, |id| p.app_id == id))
            .cloned()
            .collect())
    }

    async fn delete_before(&self, before: DateTime<Utc>) -> Result<u64, Error> {
        let mut removed = 0;
        {
            let mut apps = self.apps.write().await;
            let len = apps.len();
            apps.retain(|s| s.collected_at >= before);
            removed += len - apps.len();
        }
        {
            let mut system = self.system.write().await;
            let len = system.len();
            system.retain(|s| s.collected_at >= before);
            removed += len - system.len();
        }
        {
            let mut statuses = self.statuses.write().await;
            let len = statuses.len();
            statuses.retain(|p| p.recorded_at >= before);
            removed += len - statuses.len();
        }
        Ok(removed as u64)
    }
}
