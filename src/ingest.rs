//! Raw-container scanning.
//!
//! The scanner compares what object storage lists in the raw container
//! (the observed set) with what the registry already knows, and registers
//! one row for every object not seen before. Running it twice against an
//! unchanged container registers nothing the second time.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::configuration::PipelineConfig;
use crate::documents::{DocumentRegistry, RegisterOutcome};
use crate::error::{IngestError, Result};
use crate::models::NewDocument;
use crate::storage::{check_object_name, ObjectInfo, ObjectStore};

/// Counts for one scan of the raw container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub container: String,
    pub listed: usize,
    /// New rows (or, in a dry run, rows that would be created).
    pub registered: usize,
    /// Objects whose identity was already registered.
    pub skipped: usize,
    pub failed: usize,
    pub dry_run: bool,
}

pub struct IngestionScanner {
    registry: DocumentRegistry,
    store: Arc<dyn ObjectStore>,
    source_system: String,
}

impl IngestionScanner {
    pub fn new(
        registry: DocumentRegistry,
        store: Arc<dyn ObjectStore>,
        source_system: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            source_system: source_system.into(),
        }
    }

    /// Register every unseen object of the raw container of `config`.
    ///
    /// Objects are visited in listing order. Item-level failures are
    /// counted and the scan moves on; configuration and connectivity
    /// errors abort it.
    pub async fn scan(&self, config: &PipelineConfig, dry_run: bool) -> Result<ScanReport> {
        let container = config.raw_container()?;
        let objects = self.store.list_objects(container).await?;

        let mut report = ScanReport {
            container: container.to_string(),
            listed: objects.len(),
            dry_run,
            ..Default::default()
        };

        for object in &objects {
            match self.scan_object(container, object, dry_run).await {
                Ok(true) => report.registered += 1,
                Ok(false) => report.skipped += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(container, object = %object.name, error = %e, "object not registered");
                    report.failed += 1;
                }
            }
        }

        info!(
            container,
            listed = report.listed,
            registered = report.registered,
            skipped = report.skipped,
            failed = report.failed,
            dry_run,
            "scan finished"
        );
        Ok(report)
    }

    /// Returns `true` when the object is (or would be) newly registered.
    async fn scan_object(&self, container: &str, object: &ObjectInfo, dry_run: bool) -> Result<bool> {
        let candidate = self.candidate(container, object)?;

        if self.registry.lookup(&candidate.identity()).await?.is_some() {
            debug!(container, object = %object.name, "already registered");
            return Ok(false);
        }
        if dry_run {
            return Ok(true);
        }

        match self.registry.register(&candidate).await? {
            RegisterOutcome::Inserted(id) => {
                info!(document_id = %id, container, object = %object.name, "document registered");
                Ok(true)
            }
            RegisterOutcome::AlreadyRegistered => {
                debug!(container, object = %object.name, "registered concurrently");
                Ok(false)
            }
        }
    }

    fn candidate(&self, container: &str, object: &ObjectInfo) -> Result<NewDocument> {
        check_object_name(&object.name).map_err(|e| IngestError::stage("scan", e.to_string()))?;

        Ok(NewDocument {
            source_system: self.source_system.clone(),
            source_path: object.name.clone(),
            raw_container: container.to_string(),
            raw_file_name: object.name.clone(),
            raw_file_size: object.size,
            raw_etag: object.etag.clone(),
            raw_file_type: file_type_of(&object.name),
            raw_storage_path: self.store.object_url(container, &object.name),
        })
    }
}

/// Lower-cased extension of the last path segment, or `""` if it has none.
pub fn file_type_of(name: &str) -> String {
    let file = name.rsplit('/').next().unwrap_or(name);
    match file.rfind('.') {
        Some(pos) if pos > 0 && pos + 1 < file.len() => file[pos + 1..].to_lowercase(),
        _ => String::new(),
    }
}
