//! VaultGraph Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout VaultGraph:
//! - Chunk and provenance models
//! - Extraction payloads (entities, relationships) and counters
//! - Common error types
//! - The LLM completion capability
//! - Configuration management

pub mod config;

pub use config::{
    AppConfig, ConfigError, ExtractionConfig, LlmConfig, LlmProvider, LoggingConfig, QueryConfig,
    StorageConfig,
};

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for VaultGraph operations
#[derive(Error, Debug)]
pub enum VgError {
    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed model response ({attempts} strategies tried): {sample}")]
    ParseError { attempts: usize, sample: String },

    #[error("Invalid extraction payload: {0}")]
    DecodeError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VgError {
    /// Whether the extraction layer should retry after this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LlmError(_) | Self::Timeout(_) | Self::ParseError { .. } | Self::DecodeError(_)
        )
    }
}

impl From<ConfigError> for VgError {
    fn from(err: ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VgError>;

/// Ordered property bag attached to entities and relationships
pub type Properties = BTreeMap<String, serde_json::Value>;

// ============================================================================
// Chunks and Provenance
// ============================================================================

/// Number of leading characters of chunk text folded into its identity hash
pub const CHUNK_HASH_PREFIX_CHARS: usize = 100;

/// Provenance record: which chunk produced an entity or relationship
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    pub filename: String,
    pub chunk_id: String,
}

impl SourceRef {
    pub fn new(filename: impl Into<String>, chunk_id: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            chunk_id: chunk_id.into(),
        }
    }
}

/// Metadata supplied alongside a chunk by the chunk source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Originating file
    #[serde(default)]
    pub filename: String,

    /// Chunk identifier within the file (numbers are accepted and stringified)
    #[serde(default, deserialize_with = "string_or_number")]
    pub chunk_id: String,

    /// Any additional fields (date, tags, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ChunkMetadata {
    pub fn new(filename: impl Into<String>, chunk_id: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            chunk_id: chunk_id.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Attach an extra metadata field
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Look up an extra field as a string
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// Provenance record stamped onto extracted items
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            filename: non_empty_or_unknown(&self.filename),
            chunk_id: non_empty_or_unknown(&self.chunk_id),
        }
    }
}

fn non_empty_or_unknown(value: &str) -> String {
    if value.is_empty() {
        "Unknown".to_string()
    } else {
        value.to_string()
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// A unit of source text submitted for extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn new(text: impl Into<String>, metadata: ChunkMetadata) -> Self {
        Self {
            text: text.into(),
            metadata,
        }
    }

    /// Identity hash used for idempotent re-runs.
    ///
    /// `md5(filename + ":" + chunk_id + ":" + first 100 chars of text)` as lowercase hex.
    pub fn identity_hash(&self) -> String {
        let prefix: String = self.text.chars().take(CHUNK_HASH_PREFIX_CHARS).collect();
        let key = format!(
            "{}:{}:{}",
            self.metadata.filename, self.metadata.chunk_id, prefix
        );
        format!("{:x}", md5::compute(key.as_bytes()))
    }
}

// ============================================================================
// Extraction Payloads
// ============================================================================

/// Trim an entity name and collapse internal whitespace runs to one space
pub fn clean_entity_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Which recovery strategy produced a parsed model response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStrategy {
    /// Strict JSON parse (after optional code-fence stripping)
    #[default]
    Direct,
    /// Largest `{...}` span
    ObjectSpan,
    /// Trailing commas, unterminated strings, single quotes repaired
    Repaired,
    /// `entities` / `relationships` arrays parsed separately
    ArrayFragments,
    /// First balanced object found by a brace-depth scan
    BalancedScan,
}

impl ParseStrategy {
    /// Anything other than a direct parse is a recovered, lower-confidence result
    pub fn is_recovered(&self) -> bool {
        !matches!(self, Self::Direct)
    }
}

impl std::fmt::Display for ParseStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::ObjectSpan => write!(f, "object_span"),
            Self::Repaired => write!(f, "repaired"),
            Self::ArrayFragments => write!(f, "array_fragments"),
            Self::BalancedScan => write!(f, "balanced_scan"),
        }
    }
}

/// Entity as returned by the model, after validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
    pub properties: Properties,
    pub sources: Vec<SourceRef>,
}

impl ExtractedEntity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            properties: Properties::new(),
            sources: Vec::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: SourceRef) -> Self {
        self.sources.push(source);
        self
    }
}

/// Relationship as returned by the model, after validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    pub relationship_type: String,
    pub properties: Properties,
    pub sources: Vec<SourceRef>,
}

impl ExtractedRelationship {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        relationship_type: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relationship_type: relationship_type.into(),
            properties: Properties::new(),
            sources: Vec::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: SourceRef) -> Self {
        self.sources.push(source);
        self
    }
}

/// Typed result of extracting one chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,

    /// Strategy the recovery parser needed
    pub strategy: ParseStrategy,

    /// Items dropped during decoding (missing name/source/target)
    pub skipped_items: usize,
}

impl ExtractionResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }

    /// Stamp a provenance record onto every entity and relationship
    pub fn stamp_provenance(&mut self, source: &SourceRef) {
        for entity in &mut self.entities {
            if !entity.sources.contains(source) {
                entity.sources.push(source.clone());
            }
        }
        for relationship in &mut self.relationships {
            if !relationship.sources.contains(source) {
                relationship.sources.push(source.clone());
            }
        }
    }
}

// ============================================================================
// Counters and Failures
// ============================================================================

/// Monotonic extraction counters, persisted with every snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionStats {
    pub chunks_processed: u64,
    pub entities_extracted: u64,
    pub relationships_extracted: u64,
    pub errors: u64,
    pub retries: u64,
    pub successful_retries: u64,
    pub recovered_parses: u64,
    pub skipped_items: u64,
}

/// A chunk whose extraction exhausted every retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedChunk {
    pub text: String,
    pub metadata: ChunkMetadata,
    pub error: String,
    pub attempts: u32,
}

impl FailedChunk {
    /// Rebuild the chunk for another extraction pass
    pub fn to_chunk(&self) -> Chunk {
        Chunk::new(self.text.clone(), self.metadata.clone())
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A single completion request sent to the model backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub prompt: String,
}

/// Trait for LLM completion backends
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion and return the raw response text
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_hash_is_stable_md5() {
        let chunk = Chunk::new("hello", ChunkMetadata::new("a.md", "1"));
        let expected = format!("{:x}", md5::compute(b"a.md:1:hello"));
        assert_eq!(chunk.identity_hash(), expected);
        assert_eq!(chunk.identity_hash().len(), 32);
    }

    #[test]
    fn test_chunk_hash_uses_first_hundred_chars() {
        let base = "x".repeat(100);
        let a = Chunk::new(format!("{base}tail one"), ChunkMetadata::new("f.md", "0"));
        let b = Chunk::new(format!("{base}tail two"), ChunkMetadata::new("f.md", "0"));
        let c = Chunk::new(format!("{base}tail two"), ChunkMetadata::new("f.md", "1"));
        assert_eq!(a.identity_hash(), b.identity_hash());
        assert_ne!(b.identity_hash(), c.identity_hash());
    }

    #[test]
    fn test_metadata_accepts_numeric_chunk_id() {
        let chunk: Chunk = serde_json::from_str(
            r#"{"text": "t", "metadata": {"filename": "n.md", "chunk_id": 7, "date": "2024-01-01"}}"#,
        )
        .unwrap();
        assert_eq!(chunk.metadata.chunk_id, "7");
        assert_eq!(chunk.metadata.extra_str("date"), Some("2024-01-01"));
    }

    #[test]
    fn test_source_ref_defaults_to_unknown() {
        let meta = ChunkMetadata::default();
        assert_eq!(meta.source_ref(), SourceRef::new("Unknown", "Unknown"));
    }

    #[test]
    fn test_stamp_provenance_skips_duplicates() {
        let source = SourceRef::new("a.md", "1");
        let mut result = ExtractionResult {
            entities: vec![ExtractedEntity::new("A", "concept").with_source(source.clone())],
            relationships: vec![ExtractedRelationship::new("A", "B", "uses")],
            ..Default::default()
        };
        result.stamp_provenance(&source);
        assert_eq!(result.entities[0].sources.len(), 1);
        assert_eq!(result.relationships[0].sources, vec![source]);
    }

    #[test]
    fn test_stats_tolerate_missing_counters() {
        let stats: ExtractionStats =
            serde_json::from_str(r#"{"chunks_processed": 4, "errors": 1}"#).unwrap();
        assert_eq!(stats.chunks_processed, 4);
        assert_eq!(stats.retries, 0);
        assert_eq!(stats.successful_retries, 0);
    }

    #[test]
    fn test_clean_entity_name() {
        assert_eq!(clean_entity_name("  CAR-T\n  Therapy \t"), "CAR-T Therapy");
        assert_eq!(clean_entity_name("   "), "");
    }

    #[test]
    fn test_transient_classification() {
        assert!(VgError::LlmError("rate limited".into()).is_transient());
        assert!(VgError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!VgError::Cancelled.is_transient());
        assert!(!VgError::ConfigError("missing key".into()).is_transient());
    }
}
