//! # cb-storage-local
//! Filesystem implementations of the device-side ports.
//! `FileKeyValueStore` backs the cache and admin session; `LocalObjectStore`
//! keeps uploaded post images when running without the hosted backend.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use cb_core::{KeyValueStore, ObjectStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::warn;

/// One file per key, named by the key's SHA-256 and sharded two levels deep.
pub struct FileKeyValueStore {
    root_path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: String,
}

impl FileKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root_path: root.into() }
    }

    /// "ab/cd/abcd...hash.json"
    fn get_sharded_path(&self, key: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(key.as_bytes()));
        let mut path = self.root_path.clone();
        path.push(&hash[0..2]);
        path.push(&hash[2..4]);
        path.push(format!("{hash}.json"));
        path
    }

    async fn read_entry(path: &Path) -> anyhow::Result<Option<StoredEntry>> {
        match fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw).with_context(|| format!("corrupt entry {}", path.display()))?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entry = Self::read_entry(&self.get_sharded_path(key)).await?;
        Ok(entry.filter(|e| e.key == key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        let target_path = self.get_sharded_path(key);
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let encoded = serde_json::to_string(&StoredEntry { key: key.to_string(), value })?;
        fs::write(&target_path, encoded).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        match fs::remove_file(self.get_sharded_path(key)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root_path.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                match Self::read_entry(&path).await {
                    Ok(Some(stored)) => keys.push(stored.key),
                    Ok(None) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable entry"),
                }
            }
        }
        Ok(keys)
    }
}

/// Stores objects under `root/bucket/path` and serves them from `url_prefix`.
pub struct LocalObjectStore {
    root_path: PathBuf,
    url_prefix: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self { root_path: root.into(), url_prefix: url_prefix.into() }
    }

    fn object_path(&self, bucket: &str, path: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(bucket).join(path);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            bail!("object path {} escapes the storage root", relative.display());
        }
        Ok(self.root_path.join(relative))
    }
}

/// Declared image types must match what the bytes actually are.
fn check_image(data: &[u8], content_type: &str) -> anyhow::Result<()> {
    let Some(declared) = image::ImageFormat::from_mime_type(content_type) else {
        bail!("unsupported image type {content_type}");
    };
    let actual = image::guess_format(data).context("unrecognized image data")?;
    if actual != declared {
        bail!("declared {content_type} but data is {actual:?}");
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> anyhow::Result<()> {
        if content_type.starts_with("image/") {
            check_image(&data, content_type)?;
        }
        let target_path = self.object_path(bucket, path)?;
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target_path, &data).await?;
        Ok(())
    }

    async fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/{}/{}", self.url_prefix.trim_end_matches('/'), bucket, path)
    }
}
