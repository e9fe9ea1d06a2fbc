//! In-memory [`ObjectStore`] for tests and dry runs.
//!
//! Containers and objects live in `BTreeMap`s behind `std::sync::RwLock`.
//! The store records every `create_container` call and can be told to
//! fail creation of specific containers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{check_object_name, ObjectInfo, ObjectMetadata, ObjectStore};
use crate::error::{IngestError, Result};

struct StoredObject {
    bytes: Vec<u8>,
    etag: String,
    metadata: ObjectMetadata,
}

type Containers = BTreeMap<String, BTreeMap<String, StoredObject>>;

pub struct MemoryObjectStore {
    containers: RwLock<Containers>,
    create_calls: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(BTreeMap::new()),
            create_calls: Mutex::new(Vec::new()),
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    /// A store that already holds the given (empty) containers.
    pub fn with_containers<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        if let Ok(mut containers) = store.containers.write() {
            for name in names {
                containers.insert(name.into(), BTreeMap::new());
            }
        }
        store
    }

    /// Put an object directly, creating the container if needed.
    pub fn put(&self, container: &str, name: &str, bytes: impl Into<Vec<u8>>) -> Result<()> {
        let bytes = bytes.into();
        let mut containers = self.write()?;
        containers.entry(container.to_string()).or_default().insert(
            name.to_string(),
            StoredObject {
                etag: content_etag(&bytes),
                bytes,
                metadata: ObjectMetadata::new(),
            },
        );
        Ok(())
    }

    /// Make every future `create_container(name)` fail.
    pub fn fail_creation_of(&self, name: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(name.to_string());
        }
    }

    /// Names passed to `create_container`, in call order.
    pub fn create_calls(&self) -> Vec<String> {
        self.create_calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn metadata(&self, container: &str, name: &str) -> Option<ObjectMetadata> {
        let containers = self.containers.read().ok()?;
        containers
            .get(container)?
            .get(name)
            .map(|o| o.metadata.clone())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Containers>> {
        self.containers
            .read()
            .map_err(|_| IngestError::storage("memory store lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Containers>> {
        self.containers
            .write()
            .map_err(|_| IngestError::storage("memory store lock poisoned"))
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

fn content_etag(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())[..32].to_string()
}

fn missing(container: &str) -> IngestError {
    IngestError::storage(format!("container '{}' does not exist", container))
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        Ok(self.read()?.keys().cloned().collect())
    }

    async fn create_container(&self, name: &str) -> Result<()> {
        if let Ok(mut calls) = self.create_calls.lock() {
            calls.push(name.to_string());
        }

        let should_fail = self
            .failing
            .lock()
            .map(|failing| failing.contains(name))
            .unwrap_or(false);
        if should_fail {
            return Err(IngestError::storage(format!(
                "injected failure creating '{}'",
                name
            )));
        }

        let mut containers = self.write()?;
        if containers.contains_key(name) {
            return Err(IngestError::storage(format!(
                "container '{}' already exists",
                name
            )));
        }
        containers.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn list_objects(&self, container: &str) -> Result<Vec<ObjectInfo>> {
        let containers = self.read()?;
        let objects = containers.get(container).ok_or_else(|| missing(container))?;
        Ok(objects
            .iter()
            .map(|(name, o)| ObjectInfo {
                name: name.clone(),
                size: o.bytes.len() as u64,
                etag: o.etag.clone(),
            })
            .collect())
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
        let mut containers = self.write()?;
        let objects = containers
            .get_mut(container)
            .ok_or_else(|| missing(container))?;
        if !replace && objects.contains_key(path) {
            return Ok(false);
        }
        objects.insert(
            path.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                etag: content_etag(bytes),
                metadata: metadata.clone(),
            },
        );
        Ok(true)
    }

    async fn download(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        let containers = self.read()?;
        containers
            .get(container)
            .ok_or_else(|| missing(container))?
            .get(path)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| {
                IngestError::storage(format!("object '{}/{}' does not exist", container, path))
            })
    }

    fn object_url(&self, container: &str, path: &str) -> String {
        format!("memory://{}/{}", container, path)
    }
}
