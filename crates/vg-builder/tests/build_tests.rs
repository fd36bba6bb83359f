//! Builder integration tests
//!
//! Exercise whole batches against a scripted model backend and real files
//! in a temporary storage root.
//!
//! Author: hephaex@gmail.com

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vg_builder::{BuildState, GraphBuilder};
use vg_core::{Chunk, ChunkMetadata, CompletionRequest, ExtractionConfig, Result, StorageConfig, VgError};
use vg_extractor::testing::ScriptedLlm;
use vg_extractor::{ExtractionClient, RetryPolicy};

const TOPICS: usize = 10;

fn chunks() -> Vec<Chunk> {
    (0..TOPICS)
        .map(|i| {
            Chunk::new(
                format!("Notes about Topic-{i} and how it feeds the shared Knowledge Base hub."),
                ChunkMetadata::new(format!("notes/topic-{i}.md"), "0"),
            )
        })
        .collect()
}

/// Deterministic per-chunk answer keyed on the topic named in the prompt
fn respond(request: &CompletionRequest) -> Result<String> {
    let topic = (0..TOPICS)
        .find(|i| request.prompt.contains(&format!("Topic-{i} ")))
        .ok_or_else(|| VgError::LlmError("unknown prompt".into()))?;

    Ok(format!(
        r#"{{"entities": [{{"name": "Topic-{topic}", "type": "concept", "properties": {{"description": "topic {topic}"}}}}, {{"name": "Knowledge Base", "type": "project"}}],
            "relationships": [{{"source": "Topic-{topic}", "target": "knowledge base", "type": "part_of"}}]}}"#
    ))
}

fn storage(root: &Path, checkpoint_every: usize, concurrency: usize) -> StorageConfig {
    StorageConfig {
        root: root.to_path_buf(),
        checkpoint_every,
        skip_processed: true,
        concurrency,
    }
}

fn client(llm: Arc<ScriptedLlm>, attempts: u32) -> ExtractionClient {
    ExtractionClient::new(llm, "extract-model", ExtractionConfig::default())
        .with_retry_policy(RetryPolicy::immediate(attempts))
}

fn builder(llm: Arc<ScriptedLlm>, config: StorageConfig) -> GraphBuilder {
    GraphBuilder::new(client(llm, 3), config)
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn test_rebuilding_same_chunks_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlm::from_fn(respond));
    let mut builder = builder(llm.clone(), storage(dir.path(), 5, 1));
    let cancel = CancellationToken::new();

    builder.build(&chunks(), &cancel).await.unwrap();
    let first = builder.store().to_snapshot();
    let stats = builder.stats();
    assert_eq!(llm.calls(), TOPICS);

    let report = builder.build(&chunks(), &cancel).await.unwrap();
    assert_eq!(report.skipped, TOPICS);
    assert_eq!(report.processed, 0);
    assert_eq!(llm.calls(), TOPICS);
    assert_eq!(builder.store().to_snapshot(), first);
    assert_eq!(builder.stats(), stats);
}

#[tokio::test]
async fn test_alias_resolution_collapses_hub() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(ScriptedLlm::from_fn(respond));
    let mut builder = builder(llm, storage(dir.path(), 5, 1));

    builder.build(&chunks(), &CancellationToken::new()).await.unwrap();
    let store = builder.store();
    assert_eq!(store.node_count(), TOPICS + 1);
    assert_eq!(store.edge_count(), TOPICS);
    assert!(store.entity("knowledge base").is_none());
    assert_eq!(store.entity("Knowledge Base").unwrap().sources.len(), TOPICS);
}

// =============================================================================
// Checkpoint resume
// =============================================================================

#[tokio::test]
async fn test_resume_matches_uninterrupted_run() {
    let cancel = CancellationToken::new();

    let full_dir = tempfile::tempdir().unwrap();
    let mut full = builder(Arc::new(ScriptedLlm::from_fn(respond)), storage(full_dir.path(), 5, 1));
    full.build(&chunks(), &cancel).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut partial = builder(Arc::new(ScriptedLlm::from_fn(respond)), storage(dir.path(), 5, 1));
    partial.build(&chunks()[..5], &cancel).await.unwrap();
    assert!(dir.path().join("graph_checkpoint_5.json").exists());
    drop(partial);

    let llm = Arc::new(ScriptedLlm::from_fn(respond));
    let mut resumed = builder(llm.clone(), storage(dir.path(), 5, 1));
    let path = resumed.resume_latest().unwrap().unwrap();
    assert!(path.ends_with("graph_checkpoint_5.json"));
    assert_eq!(resumed.processed_count(), 5);

    resumed.build(&chunks(), &cancel).await.unwrap();
    assert_eq!(llm.calls(), TOPICS - 5);
    assert_eq!(resumed.store().to_snapshot(), full.store().to_snapshot());
    assert_eq!(resumed.stats(), full.stats());
    assert_eq!(resumed.state(), BuildState::Completed);
}

#[tokio::test]
async fn test_second_run_extends_saved_graph() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    let mut first = builder(Arc::new(ScriptedLlm::from_fn(respond)), storage(dir.path(), 5, 1));
    first.build(&chunks()[..5], &cancel).await.unwrap();
    let saved = first.save_graph(None).unwrap();
    drop(first);

    let mut second = builder(Arc::new(ScriptedLlm::from_fn(respond)), storage(dir.path(), 5, 1));
    assert_eq!(second.resume_latest().unwrap(), Some(saved));
    second.build(&chunks()[5..], &cancel).await.unwrap();
    second.save_graph(None).unwrap();

    let mut reloaded = builder(Arc::new(ScriptedLlm::from_fn(respond)), storage(dir.path(), 5, 1));
    reloaded.resume_latest().unwrap();
    assert_eq!(reloaded.processed_count(), TOPICS);
    assert_eq!(reloaded.store().node_count(), TOPICS + 1);
    assert!(dir.path().join("graph_checkpoint_5.json").exists());
    assert!(dir.path().join("graph_checkpoint_10.json").exists());
}

#[tokio::test]
async fn test_concurrent_build_matches_sequential() {
    let cancel = CancellationToken::new();

    let seq_dir = tempfile::tempdir().unwrap();
    let mut sequential = builder(Arc::new(ScriptedLlm::from_fn(respond)), storage(seq_dir.path(), 3, 1));
    sequential.build(&chunks(), &cancel).await.unwrap();

    let par_dir = tempfile::tempdir().unwrap();
    let mut parallel = builder(Arc::new(ScriptedLlm::from_fn(respond)), storage(par_dir.path(), 3, 4));
    let report = parallel.build(&chunks(), &cancel).await.unwrap();

    assert_eq!(report.checkpoints_written, 3);
    assert_eq!(parallel.store().to_snapshot(), sequential.store().to_snapshot());
    assert_eq!(parallel.stats(), sequential.stats());
}

// =============================================================================
// Retries and failures
// =============================================================================

#[tokio::test]
async fn test_retry_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let good = respond(&CompletionRequest {
        model: String::new(),
        max_tokens: 0,
        temperature: 0.0,
        prompt: "Topic-0 ".into(),
    })
    .unwrap();
    let llm = Arc::new(ScriptedLlm::sequence(vec![
        Err(VgError::LlmError("rate limited".into())),
        Ok("I could not produce JSON this time.".into()),
        Ok(good),
    ]));
    let mut builder = builder(llm, storage(dir.path(), 10, 1));

    let report = builder.build(&chunks()[..1], &CancellationToken::new()).await.unwrap();
    let stats = builder.stats();

    assert_eq!(stats.retries, 2);
    assert_eq!(stats.successful_retries, 1);
    assert_eq!(stats.chunks_processed, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(report.failed_chunks, 0);
    assert!(!dir.path().join("failed_chunks.json").exists());
}

#[tokio::test]
async fn test_failed_chunks_recover_with_retry_model() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let down = Arc::new(ScriptedLlm::from_fn(|_| Err(VgError::LlmError("server error".into()))));
    let mut builder = GraphBuilder::new(client(down, 2), storage(dir.path(), 10, 1));

    let report = builder.build(&chunks()[..3], &cancel).await.unwrap();
    assert_eq!(report.errored, 3);
    assert_eq!(builder.store().node_count(), 0);

    let failed = builder.checkpoint_store().load_failed(None).unwrap();
    assert_eq!(failed.len(), 3);
    assert!(failed.iter().all(|f| f.attempts == 2));

    let up = Arc::new(ScriptedLlm::from_fn(respond));
    let retry_client = client(up.clone(), 3).with_model("retry-model");
    let report = builder.retry_failed_with(&retry_client, &failed, &cancel).await.unwrap();

    assert_eq!(report.extracted, 3);
    assert_eq!(report.failed_chunks, 0);
    assert_eq!(builder.store().node_count(), 4);
    assert_eq!(builder.stats().successful_retries, 3);
    assert!(builder.checkpoint_store().load_failed(None).unwrap().is_empty());

    let requests = up.requests();
    assert!(requests.iter().all(|r| r.model == "retry-model" && r.max_tokens == 6000));
}

// =============================================================================
// Degraded storage
// =============================================================================

#[tokio::test]
async fn test_unwritable_storage_keeps_graph_in_memory() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let root = file.path().join("graph_data");
    let llm = Arc::new(ScriptedLlm::from_fn(respond));
    let mut builder = builder(llm, storage(&root, 2, 1));

    let report = builder.build(&chunks(), &CancellationToken::new()).await.unwrap();

    assert_eq!(report.checkpoints_written, 0);
    assert_eq!(report.processed, TOPICS);
    assert_eq!(builder.store().node_count(), TOPICS + 1);
    assert!(builder.save_graph(None).is_err());
}
