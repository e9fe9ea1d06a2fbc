//! Container provisioning.
//!
//! Makes sure every tier of a [`PipelineConfig`] has its physical container
//! in object storage. Existing containers are detected from a single
//! listing up front and never re-created; the providers treat
//! create-on-existing as an error.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::configuration::PipelineConfig;
use crate::error::Result;
use crate::storage::ObjectStore;

/// A tier whose container could not be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionFailure {
    pub tier: String,
    pub container: String,
    pub message: String,
}

/// Outcome of one [`ContainerProvisioner::ensure_containers`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Containers that were present before the call, in tier order.
    pub existing: Vec<String>,
    pub created: Vec<String>,
    pub failed: Vec<ProvisionFailure>,
}

pub struct ContainerProvisioner {
    store: Arc<dyn ObjectStore>,
    pause: Duration,
}

impl ContainerProvisioner {
    /// `pause` is slept between consecutive creation calls.
    pub fn new(store: Arc<dyn ObjectStore>, pause: Duration) -> Self {
        Self { store, pause }
    }

    /// Create the containers of `config` that do not exist yet.
    ///
    /// Tiers are visited in sorted order. A failed creation is recorded and
    /// the next tier is tried; only the initial listing can fail the call.
    pub async fn ensure_containers(&self, config: &PipelineConfig) -> Result<ProvisionReport> {
        let known: BTreeSet<String> = self.store.list_containers().await?.into_iter().collect();
        let mut report = ProvisionReport::default();
        let mut attempted = false;

        for (tier, container) in &config.containers {
            if report.created.contains(container) {
                debug!(tier, container, "container created for an earlier tier");
                continue;
            }
            if known.contains(container) {
                info!(tier, container, "container exists");
                if !report.existing.contains(container) {
                    report.existing.push(container.clone());
                }
                continue;
            }

            if attempted && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
            attempted = true;

            match self.store.create_container(container).await {
                Ok(()) => {
                    info!(tier, container, "container created");
                    report.created.push(container.clone());
                }
                Err(e) => {
                    warn!(tier, container, error = %e, "container creation failed");
                    report.failed.push(ProvisionFailure {
                        tier: tier.clone(),
                        container: container.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}
