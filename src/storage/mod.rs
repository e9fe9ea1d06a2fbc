//! Object storage abstraction.
//!
//! The [`ObjectStore`] trait is the only surface the pipeline needs from a
//! storage provider: container listing and creation, flat object listing,
//! upload and download. Three backends ship with the crate:
//!
//! | Backend | Type | Use |
//! |---------|------|-----|
//! | `s3` | [`S3ObjectStore`] | Amazon S3 and S3-compatible services |
//! | `local` | [`LocalObjectStore`] | directories on the local filesystem |
//! | `memory` | [`MemoryObjectStore`] | tests and dry runs |

pub mod local;
pub mod memory;
pub mod s3;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StorageConfig;
use crate::error::{IngestError, Result};

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// One entry of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
    pub etag: String,
}

/// User metadata attached to uploaded objects.
pub type ObjectMetadata = BTreeMap<String, String>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend identifier (`"s3"`, `"local"`, `"memory"`).
    fn kind(&self) -> &str;

    /// Names of all containers visible to this client.
    async fn list_containers(&self) -> Result<Vec<String>>;

    /// Create a container. Creating one that already exists is an error.
    async fn create_container(&self, name: &str) -> Result<()>;

    /// Every object in `container`, in a listing order that is stable
    /// within one call.
    async fn list_objects(&self, container: &str) -> Result<Vec<ObjectInfo>>;

    /// Store `bytes` at `path`. With `replace = false` an existing object is
    /// left untouched and `Ok(false)` is returned.
    async fn upload(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        metadata: &ObjectMetadata,
        replace: bool,
    ) -> Result<bool>;

    async fn download(&self, container: &str, path: &str) -> Result<Vec<u8>>;

    /// Location string recorded as a document's `raw_storage_path`.
    fn object_url(&self, container: &str, path: &str) -> String;
}

/// Build the backend selected by `[storage]`.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match config.backend.as_str() {
        "local" => {
            let root = config
                .root
                .clone()
                .ok_or_else(|| IngestError::config("storage.root is required for 'local'"))?;
            Ok(Arc::new(LocalObjectStore::new(root)?))
        }
        "s3" => {
            let s3 = config
                .s3
                .clone()
                .ok_or_else(|| IngestError::config("[storage.s3] is required for 's3'"))?;
            Ok(Arc::new(S3ObjectStore::from_env(s3)?))
        }
        "memory" => Ok(Arc::new(MemoryObjectStore::new())),
        other => Err(IngestError::config(format!(
            "unknown storage backend '{}'",
            other
        ))),
    }
}

/// Reject object names that could escape their container.
pub(crate) fn check_object_name(path: &str) -> Result<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|segment| segment == ".." || segment == ".")
    {
        return Err(IngestError::storage(format!(
            "invalid object name '{}'",
            path
        )));
    }
    Ok(())
}
