//! VaultGraph Graph - knowledge graph storage and queries
//!
//! Holds extracted entities and relationships in an in-memory directed
//! multigraph, merges new extraction results into it and answers
//! neighborhood, path and statistics queries.

pub mod assembler;
pub mod export;
pub mod query;
pub mod store;

pub use assembler::{AliasCache, GraphAssembler, MergeSummary, PLACEHOLDER_TYPE};
pub use export::VisualizationExport;
pub use query::{
    format_context, CentralEntity, GraphQuerier, GraphStats, Neighborhood, QueryEngine,
    RelationView,
};
pub use store::{EdgeRecord, Entity, GraphSnapshot, GraphStore, Relationship};
