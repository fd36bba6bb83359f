//! VaultGraph Builder - incremental graph construction
//!
//! Feeds chunks through the extractor into the graph, skips chunks seen in
//! earlier runs, writes periodic checkpoints and keeps failed chunks for a
//! later retry pass.

pub mod builder;
pub mod checkpoint;

pub use builder::{BatchReport, BuildState, GraphBuilder};
pub use checkpoint::{CheckpointInfo, CheckpointStore, Snapshot};
