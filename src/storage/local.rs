//! Filesystem backend.
//!
//! Every immediate subdirectory of `root` is a container and every regular
//! file below it is an object, named by its `/`-separated path relative to
//! the container directory. User metadata is kept in JSON sidecar files
//! under `root/.metadata/<container>/`, outside of any container.
//!
//! The sidecar also caches the object's etag together with the size and
//! modification time it was computed for, so a listing only hashes files
//! that changed since the last listing or upload.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use super::{check_object_name, ObjectInfo, ObjectMetadata, ObjectStore};
use crate::error::{IngestError, Result};

const METADATA_DIR: &str = ".metadata";

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            IngestError::storage(format!(
                "cannot create storage root {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf> {
        if container.is_empty() || container.starts_with('.') || container.contains('/') {
            return Err(IngestError::storage(format!(
                "invalid container name '{}'",
                container
            )));
        }
        Ok(self.root.join(container))
    }

    fn existing_container_dir(&self, container: &str) -> Result<PathBuf> {
        let dir = self.container_dir(container)?;
        if !dir.is_dir() {
            return Err(IngestError::storage(format!(
                "container '{}' does not exist",
                container
            )));
        }
        Ok(dir)
    }

    fn sidecar_path(&self, container: &str, path: &str) -> PathBuf {
        self.root
            .join(METADATA_DIR)
            .join(container)
            .join(format!("{}.json", path))
    }

    /// User metadata stored with an object, empty when none was given.
    pub async fn metadata(&self, container: &str, path: &str) -> Result<ObjectMetadata> {
        check_object_name(path)?;
        match tokio::fs::read_to_string(self.sidecar_path(container, path)).await {
            Ok(content) => Ok(serde_json::from_str::<Sidecar>(&content)?.metadata),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ObjectMetadata::new()),
            Err(e) => Err(IngestError::storage(e.to_string())),
        }
    }
}

/// Contents of `.metadata/<container>/<path>.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
    #[serde(default)]
    metadata: ObjectMetadata,
    #[serde(default)]
    etag: Option<CachedEtag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CachedEtag {
    etag: String,
    size: u64,
    modified_secs: u64,
    modified_nanos: u32,
}

impl CachedEtag {
    fn new(etag: String, file: &std::fs::Metadata) -> Option<Self> {
        let modified = file.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
        Some(Self {
            etag,
            size: file.len(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        })
    }

    /// True when the cached etag was computed for this exact file state.
    fn matches(&self, file: &std::fs::Metadata) -> bool {
        CachedEtag::new(self.etag.clone(), file).as_ref() == Some(self)
    }
}

fn read_sidecar(path: &Path) -> Sidecar {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

fn write_sidecar(path: &Path, sidecar: &Sidecar) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| IngestError::storage(e.to_string()))?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(sidecar)?)
        .map_err(|e| IngestError::storage(format!("cannot write {}: {}", path.display(), e)))
}

/// Content hash used as the local etag.
fn content_etag(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())[..32].to_string()
}

/// [`content_etag`] of a file, streamed rather than read into memory.
fn file_etag(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| IngestError::storage(format!("cannot read {}: {}", path.display(), e)))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| IngestError::storage(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(hex::encode(hasher.finalize())[..32].to_string())
}

fn scan_container(dir: &Path, sidecar_dir: &Path) -> Result<Vec<ObjectInfo>> {
    let mut objects = Vec::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| IngestError::storage(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(dir).unwrap_or(path);
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let file = entry.metadata().map_err(|e| IngestError::storage(e.to_string()))?;
        let sidecar_path = sidecar_dir.join(format!("{}.json", name));
        let mut sidecar = read_sidecar(&sidecar_path);

        let etag = match &sidecar.etag {
            Some(cached) if cached.matches(&file) => cached.etag.clone(),
            _ => {
                let etag = file_etag(path)?;
                sidecar.etag = CachedEtag::new(etag.clone(), &file);
                if let Err(e) = write_sidecar(&sidecar_path, &sidecar) {
                    debug!(object = %name, error = %e, "etag not cached");
                }
                etag
            }
        };

        objects.push(ObjectInfo {
            name,
            size: file.len(),
            etag,
        });
    }

    Ok(objects)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn kind(&self) -> &str {
        "local"
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| IngestError::storage(e.to_string()))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| IngestError::storage(e.to_string()))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            let name = entry.file_name().to_string_lossy().to_string();
            if is_dir && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn create_container(&self, name: &str) -> Result<()> {
        let dir = self.container_dir(name)?;
        if dir.exists() {
            return Err(IngestError::storage(format!(
                "container '{}' already exists",
                name
            )));
        }
        tokio::fs::create_dir(&dir)
            .await
            .map_err(|e| IngestError::storage(format!("cannot create {}: {}", dir.display(), e)))
    }

    async fn list_objects(&self, container: &str) -> Result<Vec<ObjectInfo>> {
        let dir = self.existing_container_dir(container)?;
        let sidecar_dir = self.root.join(METADATA_DIR).join(container);
        tokio::task::spawn_blocking(move || scan_container(&dir, &sidecar_dir))
            .await
            .map_err(|e| IngestError::storage(format!("listing task failed: {}", e)))?
    }

    async fn upload(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        metadata: &ObjectMetadata,
        replace: bool,
    ) -> Result<bool> {
        check_object_name(path)?;
        let target = self.existing_container_dir(container)?.join(path);
        if !replace && target.exists() {
            return Ok(false);
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IngestError::storage(e.to_string()))?;
        }
        tokio::fs::write(&target, bytes).await.map_err(|e| {
            IngestError::storage(format!("cannot write {}: {}", target.display(), e))
        })?;

        let file = tokio::fs::metadata(&target)
            .await
            .map_err(|e| IngestError::storage(e.to_string()))?;
        let sidecar = Sidecar {
            metadata: metadata.clone(),
            etag: CachedEtag::new(content_etag(bytes), &file),
        };
        let sidecar_path = self.sidecar_path(container, path);
        tokio::task::spawn_blocking(move || write_sidecar(&sidecar_path, &sidecar))
            .await
            .map_err(|e| IngestError::storage(format!("metadata task failed: {}", e)))??;

        Ok(true)
    }

    async fn download(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        check_object_name(path)?;
        let target = self.existing_container_dir(container)?.join(path);
        tokio::fs::read(&target).await.map_err(|e| {
            IngestError::storage(format!("cannot read {}/{}: {}", container, path, e))
        })
    }

    fn object_url(&self, container: &str, path: &str) -> String {
        format!("file://{}", self.root.join(container).join(path).display())
    }
}
