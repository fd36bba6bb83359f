//! Graph builder
//!
//! Drives a batch of chunks through extraction and into the graph, keeping
//! the processed-chunk set, counters and failed-chunk list alongside the
//! store. Extraction may run concurrently; merging, counting and
//! checkpointing always happen here, one outcome at a time, in input order.
//!
//! Author: hephaex@gmail.com

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use vg_core::{Chunk, ExtractionStats, FailedChunk, Result, StorageConfig};
use vg_extractor::{ExtractionClient, ExtractionOutcome};
use vg_graph::{GraphAssembler, GraphStore, VisualizationExport};

use crate::checkpoint::{CheckpointStore, Snapshot};

/// Builder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Idle,
    Resuming,
    Processing,
    Checkpointing,
    Completed,
    Interrupted,
}

/// Summary of one `build` or `retry_failed` call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    /// Chunks handed to the extractor and settled (success, failure or too short)
    pub processed: usize,
    /// Chunks skipped as already processed
    pub skipped: usize,
    /// Chunks that produced an extraction
    pub extracted: usize,
    /// Chunks that exhausted their retries in this call
    pub errored: usize,
    /// Retry attempts spent across the batch
    pub retried: usize,
    /// Chunks awaiting a retry pass, including ones from earlier batches
    pub failed_chunks: usize,
    pub total_nodes: usize,
    pub total_edges: usize,
    pub checkpoints_written: usize,
    pub interrupted: bool,
}

/// Incremental knowledge-graph builder
pub struct GraphBuilder {
    client: Arc<ExtractionClient>,
    assembler: GraphAssembler,
    stats: ExtractionStats,
    processed: BTreeSet<String>,
    failed: Vec<FailedChunk>,
    checkpoints: CheckpointStore,
    config: StorageConfig,
    state: BuildState,
}

impl GraphBuilder {
    pub fn new(client: ExtractionClient, config: StorageConfig) -> Self {
        Self {
            client: Arc::new(client),
            assembler: GraphAssembler::new(),
            stats: ExtractionStats::default(),
            processed: BTreeSet::new(),
            failed: Vec::new(),
            checkpoints: CheckpointStore::new(&config.root),
            config,
            state: BuildState::Idle,
        }
    }

    pub fn store(&self) -> &GraphStore {
        self.assembler.store()
    }

    pub fn stats(&self) -> ExtractionStats {
        self.stats
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    pub fn is_processed(&self, chunk: &Chunk) -> bool {
        self.processed.contains(&chunk.identity_hash())
    }

    /// Processed chunks that still await a retry pass
    pub fn failed_chunks(&self) -> &[FailedChunk] {
        &self.failed
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Current state as a resumable snapshot
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            graph: self.store().to_snapshot(),
            stats: self.stats,
            processed_chunk_hashes: self.processed.iter().cloned().collect(),
            failed_chunks: self.failed.clone(),
            timestamp: Utc::now(),
        }
    }

    // ========================================================================
    // Batch processing
    // ========================================================================

    /// Extract and merge a batch of chunks.
    ///
    /// Storage problems are logged and the batch continues in memory.
    /// Cancelling `cancel` stops new extractions, writes a final checkpoint
    /// and returns a report with `interrupted` set.
    pub async fn build(
        &mut self,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let total = chunks.len();
        let mut report = BatchReport::default();
        self.state = BuildState::Processing;

        if let Err(e) = self.checkpoints.init() {
            tracing::warn!(error = %e, "storage unavailable, continuing in memory");
        }

        let mut pending = Vec::with_capacity(total);
        let mut seen = HashSet::new();
        for (position, chunk) in chunks.iter().enumerate() {
            let hash = chunk.identity_hash();
            if self.config.skip_processed
                && (self.processed.contains(&hash) || !seen.insert(hash.clone()))
            {
                report.skipped += 1;
                continue;
            }
            pending.push((position, hash, chunk));
        }

        tracing::info!(
            total,
            pending = pending.len(),
            skipped = report.skipped,
            backend = self.client.backend(),
            model = self.client.model(),
            max_attempts = self.client.retry_policy().max_attempts,
            "processing chunks"
        );

        let client = Arc::clone(&self.client);
        let concurrency = self.config.concurrency.max(1);
        let mut outcomes = stream::iter(pending)
            .map(|(position, hash, chunk)| {
                let client = Arc::clone(&client);
                let cancel = cancel.clone();
                async move {
                    let outcome = client.extract(chunk, 0, &cancel).await;
                    (position, hash, outcome)
                }
            })
            .buffered(concurrency);

        let mut since_checkpoint = 0usize;
        while let Some((position, hash, outcome)) = outcomes.next().await {
            if !self.record(position + 1, total, hash, outcome, &mut report) {
                continue;
            }

            since_checkpoint += 1;
            if since_checkpoint >= self.config.checkpoint_every {
                since_checkpoint = 0;
                self.checkpoint(&mut report);
            }
        }

        report.interrupted = cancel.is_cancelled();
        if report.interrupted && since_checkpoint > 0 {
            self.checkpoint(&mut report);
        }

        if !self.failed.is_empty() {
            tracing::warn!(count = self.failed.len(), "chunks failed and can be retried");
            if let Err(e) = self.checkpoints.save_failed(&self.failed) {
                tracing::warn!(error = %e, "could not save failed chunks");
            }
        }

        self.state = if report.interrupted {
            BuildState::Interrupted
        } else {
            BuildState::Completed
        };
        self.finish(&mut report);

        tracing::info!(
            processed = report.processed,
            skipped = report.skipped,
            errors = report.errored,
            retries = report.retried,
            nodes = report.total_nodes,
            edges = report.total_edges,
            interrupted = report.interrupted,
            "batch finished"
        );
        Ok(report)
    }

    /// Fold one outcome into graph, counters and report. Returns whether the
    /// chunk was settled (and so counts towards the checkpoint cadence).
    fn record(
        &mut self,
        index: usize,
        total: usize,
        hash: String,
        outcome: ExtractionOutcome,
        report: &mut BatchReport,
    ) -> bool {
        outcome.apply_to(&mut self.stats);

        match outcome {
            ExtractionOutcome::Cancelled => return false,
            ExtractionOutcome::Skipped => {
                tracing::debug!(chunk = index, total, "chunk too short, skipped");
            }
            ExtractionOutcome::Extracted {
                result, retries, ..
            } => {
                report.extracted += 1;
                report.retried += retries as usize;
                if result.is_empty() {
                    tracing::warn!(chunk = index, total, "no data extracted");
                } else {
                    tracing::info!(
                        chunk = index,
                        total,
                        entities = result.entities.len(),
                        relationships = result.relationships.len(),
                        "chunk extracted"
                    );
                }
                self.assembler.merge(&result);
            }
            ExtractionOutcome::Failed { chunk, retries } => {
                report.errored += 1;
                report.retried += retries as usize;
                self.remember_failure(chunk);
            }
        }

        report.processed += 1;
        self.processed.insert(hash);
        true
    }

    fn checkpoint(&mut self, report: &mut BatchReport) {
        let previous = self.state;
        self.state = BuildState::Checkpointing;
        match self.checkpoints.save_checkpoint(&self.snapshot()) {
            Ok(_) => report.checkpoints_written += 1,
            Err(e) => tracing::warn!(error = %e, "could not write checkpoint, continuing in memory"),
        }
        // The checkpoint marks failures as processed; the retry list must be on disk too
        if !self.failed.is_empty() {
            if let Err(e) = self.checkpoints.save_failed(&self.failed) {
                tracing::warn!(error = %e, "could not save failed chunks");
            }
        }
        self.state = previous;
    }

    /// Add or refresh a failure, keyed by chunk identity
    fn remember_failure(&mut self, failed: FailedChunk) {
        let hash = failed.to_chunk().identity_hash();
        match self
            .failed
            .iter_mut()
            .find(|f| f.to_chunk().identity_hash() == hash)
        {
            Some(existing) => *existing = failed,
            None => self.failed.push(failed),
        }
    }

    fn forget_failure(&mut self, chunk: &Chunk) {
        let hash = chunk.identity_hash();
        self.failed.retain(|f| f.to_chunk().identity_hash() != hash);
    }

    fn finish(&self, report: &mut BatchReport) {
        report.failed_chunks = self.failed.len();
        report.total_nodes = self.store().node_count();
        report.total_edges = self.store().edge_count();
    }

    // ========================================================================
    // Retrying failures
    // ========================================================================

    /// Re-run previously failed chunks with this builder's client
    pub async fn retry_failed(
        &mut self,
        failed: &[FailedChunk],
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let client = Arc::clone(&self.client);
        self.retry_failed_with(&client, failed, cancel).await
    }

    /// Re-run previously failed chunks, e.g. with a more capable model.
    ///
    /// Each chunk's earlier `attempts` are passed along so requests use retry
    /// tuning. Successes leave the retry list, repeat failures update their
    /// entry, and the failed-chunk file is rewritten with what remains.
    pub async fn retry_failed_with(
        &mut self,
        client: &ExtractionClient,
        failed: &[FailedChunk],
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        self.state = BuildState::Processing;

        tracing::info!(
            count = failed.len(),
            model = client.model(),
            "retrying failed chunks"
        );

        for (i, entry) in failed.iter().enumerate() {
            tracing::debug!(
                chunk = i + 1,
                filename = %entry.metadata.filename,
                previous_attempts = entry.attempts,
                "retrying chunk"
            );

            let chunk = entry.to_chunk();
            let outcome = client.extract(&chunk, entry.attempts, cancel).await;
            outcome.apply_to(&mut self.stats);

            match outcome {
                ExtractionOutcome::Cancelled => {
                    // Unattempted entries stay on the retry list
                    for rest in &failed[i..] {
                        self.remember_if_absent(rest.clone());
                    }
                    break;
                }
                ExtractionOutcome::Extracted {
                    result, retries, ..
                } => {
                    report.extracted += 1;
                    report.retried += retries as usize;
                    self.assembler.merge(&result);
                    self.processed.insert(chunk.identity_hash());
                    self.forget_failure(&chunk);
                }
                ExtractionOutcome::Failed { chunk, retries } => {
                    report.errored += 1;
                    report.retried += retries as usize;
                    self.remember_failure(chunk);
                }
                ExtractionOutcome::Skipped => self.forget_failure(&chunk),
            }
            report.processed += 1;
        }

        report.interrupted = cancel.is_cancelled();
        if let Err(e) = self.checkpoints.save_failed(&self.failed) {
            tracing::warn!(error = %e, "could not save failed chunks");
        }

        self.state = if report.interrupted {
            BuildState::Interrupted
        } else {
            BuildState::Completed
        };
        self.finish(&mut report);

        tracing::info!(
            succeeded = report.extracted,
            still_failed = report.failed_chunks,
            "retry finished"
        );
        Ok(report)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Replace graph, counters and processed set from a snapshot file
    pub fn resume_from(&mut self, path: &Path) -> Result<()> {
        self.state = BuildState::Resuming;
        let path = self.checkpoints.resolve(path);
        let snapshot = match self.checkpoints.load_snapshot(&path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.state = BuildState::Idle;
                return Err(e);
            }
        };
        self.restore(snapshot)?;
        self.state = BuildState::Idle;

        tracing::info!(
            path = %path.display(),
            nodes = self.store().node_count(),
            edges = self.store().edge_count(),
            processed = self.processed.len(),
            "resumed from snapshot"
        );
        Ok(())
    }

    /// Resume from the newest snapshot in the storage root, if any: the saved
    /// graph or the latest checkpoint, whichever was written last
    pub fn resume_latest(&mut self) -> Result<Option<PathBuf>> {
        match self.checkpoints.latest_snapshot()? {
            Some(path) => {
                self.resume_from(&path)?;
                Ok(Some(path))
            }
            None => {
                tracing::info!(
                    root = %self.checkpoints.root().display(),
                    "no snapshot to resume from"
                );
                Ok(None)
            }
        }
    }

    fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        let store = GraphStore::from_snapshot(snapshot.graph)?;
        self.assembler = GraphAssembler::from_store(store);
        self.stats = snapshot.stats;
        self.processed = snapshot.processed_chunk_hashes.into_iter().collect();
        self.failed = snapshot.failed_chunks;

        // Older snapshots carry no retry list; pick up the failed file instead
        match self.checkpoints.load_failed(None) {
            Ok(on_disk) => {
                for entry in on_disk {
                    if self.processed.contains(&entry.to_chunk().identity_hash()) {
                        self.remember_if_absent(entry);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not read failed chunks"),
        }
        Ok(())
    }

    fn remember_if_absent(&mut self, failed: FailedChunk) {
        let hash = failed.to_chunk().identity_hash();
        if !self
            .failed
            .iter()
            .any(|f| f.to_chunk().identity_hash() == hash)
        {
            self.failed.push(failed);
        }
    }

    /// Write a full snapshot; defaults to `knowledge_graph.json` in the root
    pub fn save_graph(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = path.map_or_else(
            || self.checkpoints.graph_path(),
            |p| self.checkpoints.resolve(p),
        );
        self.checkpoints.save_snapshot(&path, &self.snapshot())?;
        Ok(path)
    }

    /// Write the visualization export
    pub fn export_json(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = path.map_or_else(
            || self.checkpoints.export_path(),
            |p| self.checkpoints.resolve(p),
        );
        let export = VisualizationExport::from_store(self.store(), self.stats);
        self.checkpoints.save_export(&path, &export)?;
        Ok(path)
    }
}
