//! The pipeline handle.
//!
//! [`Pipeline`] owns the registry pool and the object-store client and
//! hands them to each component explicitly. The binary opens one handle
//! per invocation and closes it on exit; tests build one over a temporary
//! database and a [`MemoryObjectStore`](crate::storage::MemoryObjectStore),
//! swapping in their own stage collaborators.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::info;

use crate::config::{Config, LlmConfig, PipelineSettings};
use crate::configuration::{ConfigurationStore, PipelineConfig};
use crate::documents::DocumentRegistry;
use crate::error::Result;
use crate::extract::{LocalTextExtractor, TextExtractor};
use crate::ingest::{IngestionScanner, ScanReport};
use crate::provision::{ContainerProvisioner, ProvisionReport};
use crate::qna::{create_generator, QnaGenerator};
use crate::scoring::{Evaluator, OverlapEvaluator};
use crate::stages::{
    run_stage, AiProcessStage, EvaluateStage, ExtractTextStage, Stage, StageReport,
};
use crate::status::{self, StatusReport};
use crate::storage::{open_store, ObjectStore};

/// The three processing stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    ExtractText,
    AiProcess,
    Evaluate,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [StageKind::ExtractText, StageKind::AiProcess, StageKind::Evaluate];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::ExtractText => "extract-text",
            StageKind::AiProcess => "ai-process",
            StageKind::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extract-text" | "extract_text" => Ok(StageKind::ExtractText),
            "ai-process" | "ai_process" => Ok(StageKind::AiProcess),
            "evaluate" => Ok(StageKind::Evaluate),
            other => Err(format!(
                "unknown stage '{}': expected extract-text, ai-process, or evaluate",
                other
            )),
        }
    }
}

/// Outcome of [`Pipeline::run_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub scan: ScanReport,
    pub stages: Vec<StageReport>,
}

pub struct Pipeline {
    pool: SqlitePool,
    registry: DocumentRegistry,
    configurations: ConfigurationStore,
    store: Arc<dyn ObjectStore>,
    settings: PipelineSettings,
    llm: LlmConfig,
    extractor: Arc<dyn TextExtractor>,
    generator: Option<Arc<dyn QnaGenerator>>,
    evaluator: Arc<dyn Evaluator>,
}

impl Pipeline {
    /// Build a handle over an existing pool and store with the default
    /// collaborators.
    pub fn new(pool: SqlitePool, store: Arc<dyn ObjectStore>, settings: PipelineSettings) -> Self {
        Self {
            registry: DocumentRegistry::new(pool.clone()),
            configurations: ConfigurationStore::new(pool.clone()),
            pool,
            store,
            settings,
            llm: LlmConfig::default(),
            extractor: Arc::new(LocalTextExtractor),
            generator: None,
            evaluator: Arc::new(OverlapEvaluator::default()),
        }
    }

    /// Connect to the registry, apply the schema and open the configured
    /// object store.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = crate::db::connect(&config.db).await?;
        crate::migrate::run_migrations(&pool).await?;
        let store = open_store(&config.storage)?;
        info!(backend = store.kind(), db = %config.db.path.display(), "pipeline opened");

        let mut pipeline = Self::new(pool, store, config.pipeline.clone());
        pipeline.llm = config.llm.clone();
        Ok(pipeline)
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn QnaGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub fn configurations(&self) -> &ConfigurationStore {
        &self.configurations
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Close the registry pool.
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// The stored configuration named by `pipeline.config_name`.
    pub async fn pipeline_config(&self) -> Result<PipelineConfig> {
        self.configurations.read(&self.settings.config_name).await
    }

    pub async fn provision(&self) -> Result<ProvisionReport> {
        let config = self.pipeline_config().await?;
        ContainerProvisioner::new(
            self.store.clone(),
            Duration::from_millis(self.settings.provision_pause_ms),
        )
        .ensure_containers(&config)
        .await
    }

    pub async fn scan(&self, dry_run: bool) -> Result<ScanReport> {
        let config = self.pipeline_config().await?;
        IngestionScanner::new(
            self.registry.clone(),
            self.store.clone(),
            self.settings.source_system.clone(),
        )
        .scan(&config, dry_run)
        .await
    }

    fn build_stage(&self, kind: StageKind, config: PipelineConfig) -> Result<Box<dyn Stage>> {
        let stage: Box<dyn Stage> = match kind {
            StageKind::ExtractText => Box::new(ExtractTextStage::new(
                self.store.clone(),
                self.extractor.clone(),
                config,
                self.settings.max_tokens,
            )),
            StageKind::AiProcess => {
                let generator = match &self.generator {
                    Some(generator) => generator.clone(),
                    None => Arc::from(create_generator(&self.llm)?),
                };
                Box::new(AiProcessStage::new(self.store.clone(), generator, config))
            }
            StageKind::Evaluate => {
                Box::new(EvaluateStage::new(self.store.clone(), self.evaluator.clone()))
            }
        };
        Ok(stage)
    }

    pub async fn run_stage(&self, kind: StageKind, limit: Option<i64>) -> Result<StageReport> {
        let config = self.pipeline_config().await?;
        let stage = self.build_stage(kind, config)?;
        run_stage(&self.registry, stage.as_ref(), limit).await
    }

    /// Scan, then run each stage in order. Without a question generator
    /// the run stops after text extraction.
    pub async fn run_all(&self, limit: Option<i64>) -> Result<RunReport> {
        let scan = self.scan(false).await?;
        let mut stages = Vec::new();

        for kind in StageKind::ALL {
            if kind == StageKind::AiProcess && self.generator.is_none() && !self.llm.is_enabled() {
                info!("question generation disabled; stopping after text extraction");
                break;
            }
            stages.push(self.run_stage(kind, limit).await?);
        }

        Ok(RunReport { scan, stages })
    }

    pub async fn status(&self) -> Result<StatusReport> {
        status::collect(&self.registry, status::DEFAULT_FAILURE_LIMIT).await
    }
}
