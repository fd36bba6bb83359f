//! Extraction client
//!
//! Sends one chunk to the model, retries transient failures with backoff
//! and turns the response into a typed, provenance-stamped result. The
//! client never fails a batch: exhausted retries come back as a
//! [`ExtractionOutcome::Failed`] value carrying the chunk for a later pass.
//!
//! Author: hephaex@gmail.com

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vg_core::{
    Chunk, CompletionRequest, ExtractionConfig, ExtractionResult, ExtractionStats, FailedChunk,
    LlmClient, Result, VgError,
};

use crate::decode::decode;
use crate::parser::{truncate_chars, RecoveryParser};
use crate::retry::{sleep_or_cancel, with_deadline, RetryPolicy};

const DEFAULT_TEMPLATE: &str = include_str!("prompts/extraction.txt");

/// Default per-call deadline
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// What happened to one chunk
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    /// Too short to be worth a model call
    Skipped,
    /// Parsed and decoded; provenance already stamped
    Extracted {
        result: ExtractionResult,
        attempts: u32,
        retries: u32,
        /// Success after an earlier failure (in this call or a previous pass)
        recovered_after_failure: bool,
    },
    /// Every attempt failed
    Failed { chunk: FailedChunk, retries: u32 },
    /// The cancellation token fired
    Cancelled,
}

impl ExtractionOutcome {
    /// Extraction payload, empty for anything but a success
    pub fn result(&self) -> Option<&ExtractionResult> {
        match self {
            Self::Extracted { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Fold this outcome into the run's counters
    pub fn apply_to(&self, stats: &mut ExtractionStats) {
        match self {
            Self::Extracted {
                result,
                retries,
                recovered_after_failure,
                ..
            } => {
                stats.chunks_processed += 1;
                stats.retries += u64::from(*retries);
                if *recovered_after_failure {
                    stats.successful_retries += 1;
                }
                stats.entities_extracted += result.entities.len() as u64;
                stats.relationships_extracted += result.relationships.len() as u64;
                if result.strategy.is_recovered() {
                    stats.recovered_parses += 1;
                }
                stats.skipped_items += result.skipped_items as u64;
            }
            Self::Failed { retries, .. } => {
                stats.errors += 1;
                stats.retries += u64::from(*retries);
            }
            Self::Skipped | Self::Cancelled => {}
        }
    }
}

/// LLM-backed entity/relationship extractor
pub struct ExtractionClient {
    llm: Arc<dyn LlmClient>,
    parser: RecoveryParser,
    config: ExtractionConfig,
    retry: RetryPolicy,
    model: String,
    timeout: Duration,
    template: String,
}

impl ExtractionClient {
    /// Create a client for `model` on the given backend
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, config: ExtractionConfig) -> Self {
        Self {
            llm,
            parser: RecoveryParser::new(),
            retry: RetryPolicy::from_config(&config),
            config,
            model: model.into(),
            timeout: DEFAULT_CALL_TIMEOUT,
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the hard per-call deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a custom prompt template (`{text}`, `{filename}`, `{date}` placeholders)
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Same backend and policy, different model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn backend(&self) -> &str {
        self.llm.name()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Build the extraction prompt for a chunk
    pub fn build_prompt(&self, chunk: &Chunk) -> String {
        let meta = &chunk.metadata;
        let filename = if meta.filename.is_empty() {
            "Unknown"
        } else {
            meta.filename.as_str()
        };
        let date = meta.extra_str("date").unwrap_or("Unknown");
        let text = truncate_chars(&chunk.text, self.config.max_input_chars);

        fill_template(
            &self.template,
            &[("filename", filename), ("date", date), ("text", &text)],
        )
    }

    /// Request parameters: more room and less randomness on retries
    pub fn request_for(&self, prompt: &str, is_retry: bool) -> CompletionRequest {
        let (max_tokens, temperature) = if is_retry {
            (self.config.retry_max_tokens, self.config.retry_temperature)
        } else {
            (self.config.max_tokens, self.config.temperature)
        };

        CompletionRequest {
            model: self.model.clone(),
            max_tokens,
            temperature,
            prompt: prompt.to_string(),
        }
    }

    /// Extract entities and relationships from one chunk.
    ///
    /// `retry_count` is the number of attempts earlier passes already spent
    /// on this chunk; it switches request tuning to retry mode and is folded
    /// into the failure's attempt count.
    pub async fn extract(
        &self,
        chunk: &Chunk,
        retry_count: u32,
        cancel: &CancellationToken,
    ) -> ExtractionOutcome {
        if chunk.text.trim().chars().count() < self.config.min_chunk_chars {
            return ExtractionOutcome::Skipped;
        }

        let prompt = self.build_prompt(chunk);
        let source = chunk.metadata.source_ref();
        let mut retries = 0u32;
        let mut last_error = VgError::LlmError("no attempts configured".to_string());

        for attempt in 0..self.retry.max_attempts {
            if cancel.is_cancelled() {
                return ExtractionOutcome::Cancelled;
            }
            let request = self.request_for(&prompt, retry_count > 0 || attempt > 0);

            match self.attempt(&request, cancel).await {
                Ok(mut result) => {
                    result.stamp_provenance(&source);
                    return ExtractionOutcome::Extracted {
                        result,
                        attempts: attempt + 1,
                        retries,
                        recovered_after_failure: attempt > 0 || retry_count > 0,
                    };
                }
                Err(VgError::Cancelled) => return ExtractionOutcome::Cancelled,
                Err(err) => {
                    let retryable = err.is_transient() && self.retry.has_next(attempt);
                    if !retryable {
                        last_error = err;
                        break;
                    }

                    retries += 1;
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = self.retry.max_attempts,
                        filename = %source.filename,
                        error = %truncate_chars(&err.to_string(), 80),
                        "extraction attempt failed, retrying in {:?}",
                        delay
                    );
                    if sleep_or_cancel(delay, cancel).await.is_err() {
                        return ExtractionOutcome::Cancelled;
                    }
                    last_error = err;
                }
            }
        }

        let error = last_error.to_string();
        tracing::error!(
            attempts = self.retry.max_attempts,
            filename = %source.filename,
            chunk_id = %source.chunk_id,
            "error extracting from chunk: {}",
            truncate_chars(&error, 100)
        );

        ExtractionOutcome::Failed {
            chunk: FailedChunk {
                text: chunk.text.clone(),
                metadata: chunk.metadata.clone(),
                error,
                attempts: retry_count + self.retry.max_attempts,
            },
            retries,
        }
    }

    async fn attempt(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult> {
        let raw = with_deadline(self.timeout, cancel, self.llm.complete(request)).await?;
        let parsed = self.parser.parse(&raw)?;
        decode(&parsed)
    }
}

/// Substitute `{key}` placeholders in one pass; inserted values are never
/// rescanned, and unknown `{...}` spans (the JSON example) are kept verbatim.
fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let replacement = values.iter().find_map(|(key, value)| {
            tail[1..]
                .strip_prefix(key)
                .filter(|after| after.starts_with('}'))
                .map(|_| (*value, key.len() + 2))
        });
        match replacement {
            Some((value, consumed)) => {
                out.push_str(value);
                rest = &tail[consumed..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

// ============================================================================
// Tests
// ============================================================================
