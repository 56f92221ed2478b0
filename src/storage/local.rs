use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tokio::fs;

use super::ObjectMetadata;

const META_SUFFIX: &str = ".meta.json";

#[derive(Clone, Debug)]
pub struct LocalFileStorage {
    base_dir: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl LocalFileStorage {
    pub fn new(base_dir: PathBuf, timeout: Duration) -> Self {
        Self { base_dir, timeout }
    }

    pub async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        let path = self.resolve_path(key)?;
        let bytes = match self.bounded(key, fs::read(&path)).await? {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read object {key}")),
        };
        let content_type = self
            .metadata(key)
            .await?
            .map(|meta| meta.content_type)
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Ok(Some(StoredObject {
            bytes,
            content_type,
        }))
    }

    pub async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<()> {
        let path = self.resolve_path(key)?;
        if let Some(parent) = path.parent() {
            self.bounded(key, fs::create_dir_all(parent))
                .await?
                .with_context(|| format!("create directory for {key}"))?;
        }
        self.bounded(key, fs::write(&path, data))
            .await?
            .with_context(|| format!("write object {key}"))?;
        let meta = ObjectMetadata {
            content_type: content_type.to_string(),
            size: data.len(),
            created_at: Utc::now().timestamp(),
        };
        let payload = serde_json::to_vec(&meta)?;
        self.bounded(key, fs::write(meta_path(&path), payload))
            .await?
            .with_context(|| format!("write metadata for {key}"))?;
        Ok(())
    }

    pub async fn metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let path = meta_path(&self.resolve_path(key)?);
        match self.bounded(key, fs::read(path)).await? {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn resolve_path(&self, key: &str) -> Result<PathBuf> {
        let normalized = Path::new(key.trim_start_matches('/'));
        if normalized
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            bail!("invalid object key: {key}");
        }
        Ok(self.base_dir.join(normalized))
    }

    async fn bounded<T>(&self, key: &str, op: impl Future<Output = T>) -> Result<T> {
        tokio::time::timeout(self.timeout, op)
            .await
            .map_err(|_| anyhow!("object store timed out on {key}"))
    }
}

fn meta_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(META_SUFFIX);
    PathBuf::from(raw)
}
