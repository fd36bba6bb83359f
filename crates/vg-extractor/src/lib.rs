//! VaultGraph Extractor - Knowledge extraction pipeline
//!
//! Sends chunks of note text to a language model, recovers a JSON object
//! from whatever the model returned and decodes it into typed entities and
//! relationships with per-chunk provenance.
//!
//! # Example
//!
//! ```ignore
//! use vg_extractor::{create_llm_client, ExtractionClient};
//!
//! let llm = create_llm_client(&config.llm)?;
//! let client = ExtractionClient::new(llm, &config.llm.model, config.extraction.clone());
//! let outcome = client.extract(&chunk, 0, &cancel).await;
//! ```

pub mod client;
pub mod decode;
pub mod llm;
pub mod parser;
pub mod retry;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use client::{ExtractionClient, ExtractionOutcome};
pub use llm::{create_llm_client, AnthropicClient, OllamaClient, OpenAiClient};
pub use parser::{ParseFailure, ParsedResponse, RecoveryParser};
pub use retry::RetryPolicy;
