//! Checkpoint storage
//!
//! Snapshots are pretty-printed JSON files under one storage root:
//! `graph_checkpoint_{n}.json` every few chunks, `knowledge_graph.json` for
//! explicit saves and `failed_chunks.json` for chunks awaiting a retry pass.
//! Writes go to a temporary file first and are renamed into place.
//!
//! Author: hephaex@gmail.com

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use vg_core::{ExtractionStats, FailedChunk, Result, VgError};
use vg_graph::{GraphSnapshot, VisualizationExport};

pub const CHECKPOINT_PREFIX: &str = "graph_checkpoint_";
pub const GRAPH_FILE: &str = "knowledge_graph.json";
pub const EXPORT_FILE: &str = "knowledge_graph_viz.json";
pub const FAILED_CHUNKS_FILE: &str = "failed_chunks.json";

/// Everything needed to resume a build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub graph: GraphSnapshot,
    #[serde(default)]
    pub stats: ExtractionStats,
    #[serde(default)]
    pub processed_chunk_hashes: Vec<String>,
    /// Chunks whose hashes are processed but that still await a retry pass
    #[serde(default)]
    pub failed_chunks: Vec<FailedChunk>,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
}

/// A checkpoint file found in the storage root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    /// Processed-chunk count encoded in the file name
    pub chunk_count: usize,
    pub modified: Option<SystemTime>,
}

/// File-backed snapshot storage rooted at one directory
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the storage root if needed
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| {
            VgError::StorageError(format!(
                "cannot create storage root {}: {e}",
                self.root.display()
            ))
        })
    }

    pub fn checkpoint_path(&self, chunk_count: usize) -> PathBuf {
        self.root
            .join(format!("{CHECKPOINT_PREFIX}{chunk_count}.json"))
    }

    pub fn graph_path(&self) -> PathBuf {
        self.root.join(GRAPH_FILE)
    }

    pub fn export_path(&self) -> PathBuf {
        self.root.join(EXPORT_FILE)
    }

    pub fn failed_path(&self) -> PathBuf {
        self.root.join(FAILED_CHUNKS_FILE)
    }

    /// Map a user-supplied path into the storage root.
    ///
    /// Absolute paths and paths that already exist are used as given; a bare
    /// relative name is placed under the root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.exists() || path.starts_with(&self.root) {
            return path.to_path_buf();
        }
        match path.file_name() {
            Some(name) => self.root.join(name),
            None => path.to_path_buf(),
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn save_snapshot(&self, path: &Path, snapshot: &Snapshot) -> Result<()> {
        write_json(path, snapshot)?;
        tracing::info!(path = %path.display(), "graph saved");
        Ok(())
    }

    pub fn save_checkpoint(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let path = self.checkpoint_path(snapshot.processed_chunk_hashes.len());
        write_json(&path, snapshot)?;
        tracing::info!(
            path = %path.display(),
            processed = snapshot.processed_chunk_hashes.len(),
            "checkpoint saved"
        );
        Ok(path)
    }

    pub fn load_snapshot(&self, path: &Path) -> Result<Snapshot> {
        read_json(path)
    }

    pub fn save_export(&self, path: &Path, export: &VisualizationExport) -> Result<()> {
        write_json(path, export)?;
        tracing::info!(
            path = %path.display(),
            nodes = export.nodes.len(),
            edges = export.edges.len(),
            "graph exported"
        );
        Ok(())
    }

    /// All checkpoints in the root, oldest first
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_error(&self.root, e)),
        };

        let mut checkpoints: Vec<CheckpointInfo> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                let chunk_count = checkpoint_number(&path)?;
                let modified = entry.metadata().and_then(|m| m.modified()).ok();
                Some(CheckpointInfo {
                    path,
                    chunk_count,
                    modified,
                })
            })
            .collect();

        checkpoints.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then(a.chunk_count.cmp(&b.chunk_count))
        });
        Ok(checkpoints)
    }

    /// Most recently written checkpoint; ties go to the higher chunk count
    pub fn latest_checkpoint(&self) -> Result<Option<PathBuf>> {
        Ok(self.list_checkpoints()?.pop().map(|info| info.path))
    }

    /// Newest resumable snapshot: the saved graph or the latest checkpoint,
    /// whichever was written last. The saved graph wins a tie.
    pub fn latest_snapshot(&self) -> Result<Option<PathBuf>> {
        let checkpoint = self.list_checkpoints()?.pop();
        let graph = self.graph_path();
        let graph_modified = fs::metadata(&graph).and_then(|m| m.modified()).ok();

        Ok(match (graph.exists(), checkpoint) {
            (false, checkpoint) => checkpoint.map(|info| info.path),
            (true, Some(info)) if info.modified > graph_modified => Some(info.path),
            (true, _) => Some(graph),
        })
    }

    // ========================================================================
    // Failed chunks
    // ========================================================================

    pub fn save_failed(&self, failed: &[FailedChunk]) -> Result<PathBuf> {
        let path = self.failed_path();
        write_json(&path, failed)?;
        tracing::info!(path = %path.display(), count = failed.len(), "failed chunks saved");
        Ok(path)
    }

    /// Load a failed-chunk list; a missing file means nothing failed
    pub fn load_failed(&self, path: Option<&Path>) -> Result<Vec<FailedChunk>> {
        let path = path.map_or_else(|| self.failed_path(), |p| self.resolve(p));
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_json(&path)
    }
}

fn checkpoint_number(path: &Path) -> Option<usize> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(CHECKPOINT_PREFIX)?
        .parse()
        .ok()
}

fn storage_error(path: &Path, err: std::io::Error) -> VgError {
    VgError::StorageError(format!("{}: {err}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| storage_error(parent, e))?;
    }

    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| storage_error(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| storage_error(path, e))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => VgError::NotFound(path.display().to_string()),
        _ => storage_error(path, e),
    })?;
    serde_json::from_str(&content)
        .map_err(|e| VgError::StorageError(format!("{}: invalid snapshot: {e}", path.display())))
}
