//! Question/answer generation collaborator for the AI-processing stage.
//!
//! - **[`DisabledGenerator`]**: fails every call; used when `[llm]` is not configured.
//! - **[`OpenAiQnaGenerator`]**: calls an OpenAI-compatible `/chat/completions`
//!   endpoint in JSON mode, with retry and backoff.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::config::LlmConfig;
use crate::error::{IngestError, Result};

const STAGE: &str = "ai_process";

/// Upper bound on excerpt characters sent in one request.
const MAX_PROMPT_CHARS: usize = 48_000;

const SYSTEM_PROMPT: &str = "You write question and answer pairs that a reader could answer \
using only the numbered document excerpts provided. Each answer must be stated in the \
excerpts. Reply with a JSON object of the form \
{\"pairs\": [{\"question\": \"...\", \"answer\": \"...\", \"chunk_index\": 0}]}.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QnaPair {
    pub question: String,
    pub answer: String,
    /// Excerpt the pair was drawn from, when the model reports it.
    #[serde(default)]
    pub chunk_index: Option<u32>,
}

#[async_trait]
pub trait QnaGenerator: Send + Sync {
    /// Model identifier recorded with the stage output.
    fn model_name(&self) -> &str;

    async fn generate(&self, chunks: &[Chunk]) -> Result<Vec<QnaPair>>;
}

/// Build the generator selected by `[llm] provider`.
pub fn create_generator(config: &LlmConfig) -> Result<Box<dyn QnaGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledGenerator)),
        "openai" => Ok(Box::new(OpenAiQnaGenerator::new(config)?)),
        other => Err(IngestError::config(format!(
            "unknown llm provider '{}'",
            other
        ))),
    }
}

pub struct DisabledGenerator;

#[async_trait]
impl QnaGenerator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _chunks: &[Chunk]) -> Result<Vec<QnaPair>> {
        Err(IngestError::config(
            "question generation is disabled; set [llm] provider = \"openai\" and a model",
        ))
    }
}

/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiQnaGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
    max_retries: u32,
    max_pairs: usize,
}

impl OpenAiQnaGenerator {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| IngestError::config("OPENAI_API_KEY environment variable not set"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| IngestError::config("llm.model required for provider 'openai'"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IngestError::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            model,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            max_retries: config.max_retries,
            max_pairs: config.max_pairs,
        })
    }
}

#[async_trait]
impl QnaGenerator for OpenAiQnaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, chunks: &[Chunk]) -> Result<Vec<QnaPair>> {
        let body = serde_json::json!({
            "model": self.model,
            "response_format": {"type": "json_object"},
            "temperature": 0.2,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt(chunks, self.max_pairs)},
            ],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, ?delay, "retrying chat completion");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            IngestError::stage(STAGE, format!("unreadable response: {}", e))
                        })?;
                        let mut pairs = parse_chat_response(&json)?;
                        pairs.truncate(self.max_pairs);
                        return Ok(pairs);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = IngestError::stage(
                        STAGE,
                        format!("chat API error {}: {}", status, body_text),
                    );
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(%status, attempt, "chat completion failed, will retry");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "chat request failed, will retry");
                    last_err = Some(IngestError::stage(STAGE, format!("chat request failed: {}", e)));
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| IngestError::stage(STAGE, "chat completion failed after retries")))
    }
}

/// Numbered excerpts plus the pair budget, capped at [`MAX_PROMPT_CHARS`].
fn user_prompt(chunks: &[Chunk], max_pairs: usize) -> String {
    let mut prompt = format!("Write at most {} question and answer pairs.\n\n", max_pairs);
    for chunk in chunks {
        let section = format!("[excerpt {}]\n{}\n\n", chunk.index, chunk.text);
        if prompt.len() + section.len() > MAX_PROMPT_CHARS {
            break;
        }
        prompt.push_str(&section);
    }
    prompt
}

#[derive(Deserialize)]
struct PairsEnvelope {
    #[serde(default)]
    pairs: Vec<QnaPair>,
}

/// Pull the pairs out of a chat completion. Pairs with an empty question
/// or answer are dropped; a reply with no usable pair is an error.
fn parse_chat_response(json: &serde_json::Value) -> Result<Vec<QnaPair>> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| IngestError::stage(STAGE, "invalid chat response: missing message content"))?;

    let envelope: PairsEnvelope = serde_json::from_str(content)
        .map_err(|e| IngestError::stage(STAGE, format!("model reply is not valid JSON: {}", e)))?;

    let pairs: Vec<QnaPair> = envelope
        .pairs
        .into_iter()
        .map(|p| QnaPair {
            question: p.question.trim().to_string(),
            answer: p.answer.trim().to_string(),
            chunk_index: p.chunk_index,
        })
        .filter(|p| !p.question.is_empty() && !p.answer.is_empty())
        .collect();

    if pairs.is_empty() {
        return Err(IngestError::stage(STAGE, "model returned no question/answer pairs"));
    }
    Ok(pairs)
}
