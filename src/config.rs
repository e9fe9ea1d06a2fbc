//! Application configuration (`docflow.toml`).
//!
//! This is the process-level configuration: where the registry database
//! lives, which object-storage backend to talk to, and pipeline tuning.
//! The per-pipeline container map lives in the database instead (see
//! [`crate::configuration`]).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `"local"`, `"s3"`, or `"memory"`.
    pub backend: String,
    /// Root directory for the local backend.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSettings {
    #[serde(default = "default_config_name")]
    pub config_name: String,
    #[serde(default = "default_source_system")]
    pub source_system: String,
    #[serde(default = "default_provision_pause_ms")]
    pub provision_pause_ms: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            config_name: default_config_name(),
            source_system: default_source_system(),
            provision_pause_ms: default_provision_pause_ms(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_config_name() -> String {
    "ai_pipeline".to_string()
}
fn default_source_system() -> String {
    "object-storage".to_string()
}
fn default_provision_pause_ms() -> u64 {
    1000
}
fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_pairs")]
    pub max_pairs: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: default_base_url(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_pairs: default_max_pairs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_pairs() -> usize {
    10
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if !(1..=16).contains(&config.db.max_connections) {
        bail!("db.max_connections must be in [1, 16]");
    }

    match config.storage.backend.as_str() {
        "local" => {
            if config.storage.root.is_none() {
                bail!("storage.root must be set when backend is 'local'");
            }
        }
        "s3" => {
            if config.storage.s3.is_none() {
                bail!("[storage.s3] must be set when backend is 's3'");
            }
        }
        "memory" => {}
        other => bail!(
            "Unknown storage backend: '{}'. Must be local, s3, or memory.",
            other
        ),
    }

    if config.pipeline.max_tokens == 0 {
        bail!("pipeline.max_tokens must be > 0");
    }
    if config.pipeline.config_name.trim().is_empty() {
        bail!("pipeline.config_name must not be empty");
    }

    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.llm.model.is_none() {
                bail!("llm.model must be specified when provider is 'openai'");
            }
            if config.llm.max_pairs == 0 {
                bail!("llm.max_pairs must be > 0");
            }
        }
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn minimal_local_config_gets_defaults() {
        let cfg = parse(
            r#"
[db]
path = "/tmp/docflow.sqlite"

[storage]
backend = "local"
root = "/tmp/storage"
"#,
        );
        assert!(validate(&cfg).is_ok());
        assert_eq!(cfg.db.max_connections, 5);
        assert_eq!(cfg.pipeline.config_name, "ai_pipeline");
        assert_eq!(cfg.pipeline.provision_pause_ms, 1000);
        assert!(!cfg.llm.is_enabled());
    }

    #[test]
    fn local_backend_requires_root() {
        let cfg = parse(
            r#"
[db]
path = "/tmp/docflow.sqlite"

[storage]
backend = "local"
"#,
        );
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("storage.root"));
    }

    #[test]
    fn openai_requires_model() {
        let cfg = parse(
            r#"
[db]
path = "/tmp/docflow.sqlite"

[storage]
backend = "memory"

[llm]
provider = "openai"
"#,
        );
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("llm.model"));
    }

    #[test]
    fn unknown_backend_rejected() {
        let cfg = parse(
            r#"
[db]
path = "/tmp/docflow.sqlite"

[storage]
backend = "ftp"
"#,
        );
        assert!(validate(&cfg).is_err());
    }
}
