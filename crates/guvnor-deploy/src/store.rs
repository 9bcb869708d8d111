use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::engine::Application;
use crate::error::{DeployError, DeployResult};

const REGISTRY_FILE: &str = "applications.json";

/// `applications.json` under the application root.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(app_dir: &Path) -> Self {
        Self {
            path: app_dir.join(REGISTRY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns an empty list when nothing was saved yet.
    pub async fn load(&self) -> DeployResult<Vec<Application>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| DeployError::Persist(format!("parse {}: {e}", self.path.display())))
    }

    pub async fn save(&self, apps: &[Application]) -> DeployResult<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let data = serde_json::to_vec_pretty(apps).map_err(|e| DeployError::Persist(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(&data).await?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
