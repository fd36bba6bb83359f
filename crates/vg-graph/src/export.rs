//! Visualization export
//!
//! Flat `{nodes, edges, stats}` JSON for graph viewers. Properties are
//! lifted to the top level of each record and provenance lists are capped.
//!
//! Author: hephaex@gmail.com

use serde::Serialize;
use vg_core::{ExtractionStats, Properties, SourceRef};

use crate::store::GraphStore;

/// Sources kept per exported node
pub const NODE_SOURCE_LIMIT: usize = 5;

/// Sources kept per exported edge
pub const EDGE_SOURCE_LIMIT: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct ExportNode {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(flatten)]
    pub properties: Properties,
    pub source_count: usize,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportEdge {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    #[serde(flatten)]
    pub properties: Properties,
    pub source_count: usize,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VisualizationExport {
    pub nodes: Vec<ExportNode>,
    pub edges: Vec<ExportEdge>,
    pub stats: ExtractionStats,
}

impl VisualizationExport {
    pub fn from_store(store: &GraphStore, stats: ExtractionStats) -> Self {
        let nodes = store
            .entities()
            .map(|entity| ExportNode {
                id: entity.name.clone(),
                label: entity.name.clone(),
                entity_type: entity.entity_type.clone(),
                properties: without_reserved(&entity.properties, &["id", "label", "type"]),
                source_count: entity.sources.len(),
                sources: capped(&entity.sources, NODE_SOURCE_LIMIT),
            })
            .collect();

        let edges = store
            .edges()
            .map(|edge| ExportEdge {
                source: edge.source.name.clone(),
                target: edge.target.name.clone(),
                relationship_type: edge.relationship.relationship_type.clone(),
                properties: without_reserved(
                    &edge.relationship.properties,
                    &["source", "target", "type"],
                ),
                source_count: edge.relationship.sources.len(),
                sources: capped(&edge.relationship.sources, EDGE_SOURCE_LIMIT),
            })
            .collect();

        Self { nodes, edges, stats }
    }
}

/// Drop property keys that would collide with the record's own fields
fn without_reserved(properties: &Properties, reserved: &[&str]) -> Properties {
    properties
        .iter()
        .filter(|(key, _)| {
            let key = key.as_str();
            !reserved.contains(&key) && key != "sources" && key != "source_count"
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn capped(sources: &[SourceRef], limit: usize) -> Vec<SourceRef> {
    sources.iter().take(limit).cloned().collect()
}
