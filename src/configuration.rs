//! Named pipeline configurations stored in the registry database.
//!
//! A configuration maps logical storage tiers (`raw`, `bronze`, ...) to
//! physical container names and lists the file types the pipeline accepts.
//! Rows are written wholesale and read by name; there is no partial merge
//! and no versioning.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::{IngestError, Result};

pub const TIER_RAW: &str = "raw";
pub const TIER_BRONZE: &str = "bronze";
pub const TIER_SILVER: &str = "silver";
pub const TIER_TELEMETRY: &str = "telemetry";
pub const TIER_TESTING: &str = "testing";

/// File types the bundled text extractor can read.
pub const SUPPORTED_FILETYPES: &[&str] = &[
    "csv", "docx", "htm", "html", "json", "md", "pdf", "pptx", "txt", "xlsx",
];

/// Strongly typed view of a stored configuration blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub name: String,
    /// Logical tier name → physical container name.
    pub containers: BTreeMap<String, String>,
    /// Lower-cased, sorted, deduplicated extensions.
    #[serde(default)]
    pub filetypes: Vec<String>,
    /// Any other keys in the blob, kept as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PipelineConfig {
    /// Default configuration with every known tier.
    pub fn template(name: &str) -> Self {
        let containers = [
            (TIER_RAW, "qna-raw"),
            (TIER_BRONZE, "qna-preprocessed"),
            (TIER_SILVER, "qna-processed"),
            (TIER_TELEMETRY, "qna-telemetry"),
            (TIER_TESTING, "qna-test"),
        ]
        .into_iter()
        .map(|(tier, container)| (tier.to_string(), container.to_string()))
        .collect();

        Self {
            name: name.to_string(),
            containers,
            filetypes: SUPPORTED_FILETYPES.iter().map(|s| s.to_string()).collect(),
            extra: serde_json::Map::new(),
        }
    }

    /// Check the configuration and normalize `filetypes`.
    pub fn validate(mut self) -> Result<Self> {
        if self.containers.is_empty() {
            return Err(IngestError::config("'containers' must not be empty"));
        }
        if !self.containers.contains_key(TIER_RAW) {
            return Err(IngestError::config(
                "'containers' must map the 'raw' tier",
            ));
        }
        for (tier, container) in &self.containers {
            if !is_valid_container_name(container) {
                return Err(IngestError::config(format!(
                    "invalid container name '{}' for tier '{}': use 3-63 lowercase letters, digits, or hyphens",
                    container, tier
                )));
            }
        }
        let raw = &self.containers[TIER_RAW];
        for tier in [TIER_BRONZE, TIER_SILVER] {
            if self.container(tier) == Some(raw.as_str()) {
                return Err(IngestError::config(format!(
                    "tier '{}' must not share the raw container '{}'",
                    tier, raw
                )));
            }
        }

        let mut filetypes: Vec<String> = self
            .filetypes
            .iter()
            .map(|ft| ft.trim().trim_start_matches('.').to_lowercase())
            .filter(|ft| !ft.is_empty())
            .collect();
        filetypes.sort();
        filetypes.dedup();
        self.filetypes = filetypes;

        Ok(self)
    }

    /// Physical container for a tier.
    pub fn container(&self, tier: &str) -> Option<&str> {
        self.containers.get(tier).map(String::as_str)
    }

    pub fn raw_container(&self) -> Result<&str> {
        self.container(TIER_RAW)
            .ok_or_else(|| IngestError::config("no 'raw' container configured"))
    }

    pub fn accepts_filetype(&self, file_type: &str) -> bool {
        self.filetypes.iter().any(|ft| ft == file_type)
    }
}

fn is_valid_container_name(name: &str) -> bool {
    let len_ok = (3..=63).contains(&name.len());
    let chars_ok = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    let edges_ok = name
        .bytes()
        .next()
        .zip(name.bytes().last())
        .map(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric())
        .unwrap_or(false);
    len_ok && chars_ok && edges_ok && !name.contains("--")
}

/// Read/write access to the `configuration` table.
#[derive(Clone)]
pub struct ConfigurationStore {
    pool: SqlitePool,
}

impl ConfigurationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validate `config` and store it under `name`, replacing any previous
    /// row unconditionally.
    pub async fn write(&self, name: &str, config: &PipelineConfig) -> Result<()> {
        let config = config.clone().validate()?;
        let data = serde_json::to_string(&config)?;

        sqlx::query(
            r#"
            INSERT INTO configuration (name, data) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(name)
        .bind(&data)
        .execute(&self.pool)
        .await?;

        info!(name, "configuration written");
        Ok(())
    }

    /// Load the configuration stored under `name`.
    ///
    /// Returns [`IngestError::ConfigNotFound`] when no row exists.
    pub async fn read(&self, name: &str) -> Result<PipelineConfig> {
        let data: Option<String> = sqlx::query_scalar("SELECT data FROM configuration WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        let data = data.ok_or_else(|| IngestError::ConfigNotFound {
            name: name.to_string(),
        })?;

        let config: PipelineConfig = serde_json::from_str(&data)?;
        config.validate()
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT name FROM configuration ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }
}
