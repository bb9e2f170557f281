use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::core::{Deployment, DeploymentId, TaskId, TaskUpdate};
use crate::state::{DeploymentLocks, DeploymentStore};
use crate::util::blocking;
use crate::{Error, Result};

/// Store keeping one pretty-printed JSON document per deployment.
///
/// Writes go to `<id>.json.tmp` and are renamed over `<id>.json`; the
/// previous document is kept as `<id>.json.bak`. A crash mid-write leaves
/// either the old or the new record, never a torn one.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    locks: DeploymentLocks,
}

impl JsonFileStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            debug!(dir = %dir.display(), "creating state directory");
            fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            dir,
            locks: DeploymentLocks::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: DeploymentId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn read(&self, id: DeploymentId) -> Result<Deployment> {
        let path = self.record_path(id);
        blocking(move || read_record(&path)?.ok_or(Error::DeploymentNotFound(id))).await
    }

    async fn write(&self, deployment: &Deployment) -> Result<()> {
        let contents = serde_json::to_string_pretty(deployment)?;
        let path = self.record_path(deployment.id);
        blocking(move || write_record(&path, &contents)).await
    }
}

fn read_record(path: &Path) -> Result<Option<Deployment>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    let deployment: Deployment = serde_json::from_str(&contents)?;
    Ok(Some(deployment))
}

fn write_record(path: &Path, contents: &str) -> Result<()> {
    if path.exists() {
        let backup_path = path.with_extension("json.bak");
        fs::copy(path, &backup_path)?;
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[async_trait]
impl DeploymentStore for JsonFileStore {
    async fn save(&self, deployment: &Deployment) -> Result<()> {
        let _guard = self.locks.acquire(deployment.id).await;
        self.write(deployment).await?;
        debug!(deployment = %deployment.id, status = %deployment.status, "deployment saved");
        Ok(())
    }

    async fn load(&self, id: DeploymentId) -> Result<Deployment> {
        let _guard = self.locks.acquire(id).await;
        self.read(id).await
    }

    async fn update_task_status(
        &self,
        id: DeploymentId,
        task_id: TaskId,
        update: TaskUpdate,
    ) -> Result<Deployment> {
        let _guard = self.locks.acquire(id).await;
        let mut deployment = self.read(id).await?;
        deployment.apply(&task_id, update)?;
        self.write(&deployment).await?;
        Ok(deployment)
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        let dir = self.dir.clone();
        let mut deployments = blocking(move || {
            let mut deployments = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_record(&path) {
                    Ok(Some(deployment)) => deployments.push(deployment),
                    Ok(None) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable deployment record"),
                }
            }
            Ok(deployments)
        })
        .await?;
        deployments.sort_by_key(|d| d.created_at);
        Ok(deployments)
    }

    async fn delete(&self, id: DeploymentId) -> Result<()> {
        let guard = self.locks.acquire(id).await;
        let path = self.record_path(id);
        blocking(move || {
            if !path.exists() {
                return Err(Error::DeploymentNotFound(id));
            }
            fs::remove_file(&path)?;
            let backup_path = path.with_extension("json.bak");
            if backup_path.exists() {
                fs::remove_file(&backup_path)?;
            }
            Ok(())
        })
        .await?;
        drop(guard);
        self.locks.forget(id);
        debug!(deployment = %id, "deployment record deleted");
        Ok(())
    }
}
