//! Cache storage persisted under a directory.
//!
//! Layout: one subdirectory per cache, two files per entry. `<id>.body`
//! holds the raw body and `<id>.toml` the metadata, where `<id>` is the
//! URL-safe base64 SHA-256 of the request key. Both files are written to a
//! temporary name and renamed into place; the body lands first so a visible
//! metadata file always refers to a complete body.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{Cache, CacheStorage};
use crate::error::{Error, Result};
use crate::request::RequestKey;
use crate::response::Response;

const META_EXT: &str = "toml";
const BODY_EXT: &str = "body";

/// Metadata stored next to each body file.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    body_len: u64,
    stored_at: DateTime<Utc>,
}

/// Cache storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Creates a storage rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cache_dir(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

/// Cache names become directory names, so they must be a single plain component.
fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(Error::Storage(format!("invalid cache name: {name:?}")));
    }
    Ok(())
}

#[async_trait]
impl CacheStorage for DiskStorage {
    type Cache = DiskCache;

    async fn open(&self, name: &str) -> Result<DiskCache> {
        let dir = self.cache_dir(name)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(DiskCache { dir })
    }

    async fn has(&self, name: &str) -> Result<bool> {
        let dir = self.cache_dir(name)?;
        Ok(tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && validate_name(name).is_ok()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let dir = self.cache_dir(name)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// A single on-disk cache.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    fn entry_id(key: &RequestKey) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(key.as_str().as_bytes()))
    }

    fn paths(&self, key: &RequestKey) -> (PathBuf, PathBuf) {
        let id = Self::entry_id(key);
        (
            self.dir.join(format!("{id}.{META_EXT}")),
            self.dir.join(format!("{id}.{BODY_EXT}")),
        )
    }

    async fn read_meta(path: &Path) -> Result<Option<EntryMeta>> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&contents)
            .map(Some)
            .map_err(|e| Error::Storage(format!("corrupt entry {}: {e}", path.display())))
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl Cache for DiskCache {
    async fn lookup(&self, key: &RequestKey) -> Result<Option<Response>> {
        let (meta_path, body_path) = self.paths(key);
        let Some(meta) = Self::read_meta(&meta_path).await? else {
            return Ok(None);
        };
        // Hash collisions are not expected, but a mismatched key is still a miss.
        if meta.key != key.as_str() {
            return Ok(None);
        }

        let body = match tokio::fs::read(&body_path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if body.len() as u64 != meta.body_len {
            log::debug!("Body length mismatch for {key}, treating as miss");
            return Ok(None);
        }

        Ok(Some(Response {
            status: meta.status,
            status_text: meta.status_text,
            headers: meta.headers,
            body: body.into(),
        }))
    }

    async fn put(&self, key: &RequestKey, response: &Response) -> Result<()> {
        let (meta_path, body_path) = self.paths(key);
        let meta = EntryMeta {
            key: key.as_str().to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            body_len: response.body.len() as u64,
            stored_at: Utc::now(),
        };
        let meta_str = toml::to_string(&meta).map_err(|e| Error::Storage(e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        write_atomic(&body_path, &response.body).await?;
        write_atomic(&meta_path, meta_str.as_bytes()).await
    }

    async fn delete(&self, key: &RequestKey) -> Result<bool> {
        let (meta_path, body_path) = self.paths(key);
        let existed = match tokio::fs::remove_file(&meta_path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        let _ = tokio::fs::remove_file(&body_path).await;
        Ok(existed)
    }

    async fn keys(&self) -> Result<Vec<RequestKey>> {
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == META_EXT)
                && let Some(meta) = Self::read_meta(&path).await?
            {
                keys.push(RequestKey::from_raw(meta.key));
            }
        }
        keys.sort();
        Ok(keys)
    }
}
