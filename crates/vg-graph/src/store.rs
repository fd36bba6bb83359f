//! In-memory graph store
//!
//! A directed multigraph over `petgraph::DiGraph` with a name index. Nodes
//! are never removed, so node and edge indices follow insertion order and a
//! snapshot round-trips with the same ordering.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use vg_core::{Properties, Result, SourceRef, VgError};

/// Graph node: one canonical entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            properties: Properties::new(),
            sources: Vec::new(),
        }
    }

    /// Append a provenance record unless an identical one is present
    pub fn add_source(&mut self, source: &SourceRef) -> bool {
        push_unique(&mut self.sources, source)
    }

    pub fn description(&self) -> Option<&str> {
        self.properties.get("description").and_then(|v| v.as_str())
    }
}

/// Graph edge payload; endpoints live in the graph structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "type")]
    pub relationship_type: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
}

impl Relationship {
    pub fn new(relationship_type: impl Into<String>) -> Self {
        Self {
            relationship_type: relationship_type.into(),
            properties: Properties::new(),
            sources: Vec::new(),
        }
    }
}

pub(crate) fn push_unique(sources: &mut Vec<SourceRef>, source: &SourceRef) -> bool {
    if sources.contains(source) {
        false
    } else {
        sources.push(source.clone());
        true
    }
}

/// Serialized edge with named endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub source: String,
    pub target: String,
    #[serde(flatten)]
    pub relationship: Relationship,
}

/// Serialized form of a [`GraphStore`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub nodes: Vec<Entity>,
    #[serde(default)]
    pub edges: Vec<EdgeRecord>,
}

/// Borrowed view of one edge
#[derive(Debug, Clone, Copy)]
pub struct EdgeView<'a> {
    pub index: EdgeIndex,
    pub source: &'a Entity,
    pub target: &'a Entity,
    pub relationship: &'a Relationship,
}

/// Directed multigraph of entities
#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    graph: DiGraph<Entity, Relationship>,
    index: HashMap<String, NodeIndex>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Underlying petgraph structure, for algorithms
    pub fn graph(&self) -> &DiGraph<Entity, Relationship> {
        &self.graph
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Node index for an exact canonical name
    pub fn node_index(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.node_index(name).map(|idx| &self.graph[idx])
    }

    pub fn entity_at(&self, idx: NodeIndex) -> &Entity {
        &self.graph[idx]
    }

    pub(crate) fn entity_at_mut(&mut self, idx: NodeIndex) -> &mut Entity {
        &mut self.graph[idx]
    }

    /// Insert a node; an existing node with the same name is left untouched
    pub fn insert_entity(&mut self, entity: Entity) -> NodeIndex {
        if let Some(idx) = self.index.get(&entity.name) {
            return *idx;
        }
        let name = entity.name.clone();
        let idx = self.graph.add_node(entity);
        self.index.insert(name, idx);
        idx
    }

    /// Add a parallel edge between two existing nodes
    pub fn add_relationship(
        &mut self,
        source: NodeIndex,
        target: NodeIndex,
        relationship: Relationship,
    ) -> EdgeIndex {
        self.graph.add_edge(source, target, relationship)
    }

    /// Entities in insertion order
    pub fn entities(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }

    /// Edges in insertion order
    pub fn edges(&self) -> impl Iterator<Item = EdgeView<'_>> + '_ {
        self.graph.edge_references().map(move |edge| self.view(edge))
    }

    /// In-degree plus out-degree; a self-loop counts twice
    pub fn degree(&self, idx: NodeIndex) -> usize {
        self.graph.edges_directed(idx, Direction::Outgoing).count()
            + self.graph.edges_directed(idx, Direction::Incoming).count()
    }

    /// Outgoing edges of a node, in insertion order
    pub fn outgoing(&self, idx: NodeIndex) -> Vec<EdgeView<'_>> {
        self.directed(idx, Direction::Outgoing)
    }

    /// Incoming edges of a node, in insertion order
    pub fn incoming(&self, idx: NodeIndex) -> Vec<EdgeView<'_>> {
        self.directed(idx, Direction::Incoming)
    }

    fn directed(&self, idx: NodeIndex, direction: Direction) -> Vec<EdgeView<'_>> {
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(idx, direction)
            .map(|edge| self.view(edge))
            .collect();
        edges.sort_by_key(|edge| edge.index);
        edges
    }

    fn view<'a>(
        &'a self,
        edge: petgraph::graph::EdgeReference<'a, Relationship>,
    ) -> EdgeView<'a> {
        EdgeView {
            index: edge.id(),
            source: &self.graph[edge.source()],
            target: &self.graph[edge.target()],
            relationship: edge.weight(),
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn to_snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.entities().cloned().collect(),
            edges: self
                .edges()
                .map(|edge| EdgeRecord {
                    source: edge.source.name.clone(),
                    target: edge.target.name.clone(),
                    relationship: edge.relationship.clone(),
                })
                .collect(),
        }
    }

    /// Rebuild a store; node and edge order follow the snapshot
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        let mut store = Self::new();
        for node in snapshot.nodes {
            if store.contains(&node.name) {
                return Err(VgError::StorageError(format!(
                    "duplicate node in snapshot: {}",
                    node.name
                )));
            }
            store.insert_entity(node);
        }

        for edge in snapshot.edges {
            let source = store.require(&edge.source)?;
            let target = store.require(&edge.target)?;
            store.add_relationship(source, target, edge.relationship);
        }

        Ok(store)
    }

    fn require(&self, name: &str) -> Result<NodeIndex> {
        self.node_index(name).ok_or_else(|| {
            VgError::StorageError(format!("snapshot edge references unknown node: {name}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GraphStore {
        let mut store = GraphStore::new();
        let a = store.insert_entity(Entity::new("A", "concept"));
        let b = store.insert_entity(Entity::new("B", "concept"));
        store.add_relationship(a, b, Relationship::new("uses"));
        store.add_relationship(a, b, Relationship::new("creates"));
        store.add_relationship(b, b, Relationship::new("part_of"));
        store
    }

    #[test]
    fn test_insert_is_idempotent_by_name() {
        let mut store = GraphStore::new();
        let first = store.insert_entity(Entity::new("A", "concept"));
        let second = store.insert_entity(Entity::new("A", "person"));
        assert_eq!(first, second);
        assert_eq!(store.node_count(), 1);
        assert_eq!(store.entity("A").unwrap().entity_type, "concept");
    }

    #[test]
    fn test_parallel_edges_and_degree() {
        let store = sample();
        assert_eq!(store.edge_count(), 3);
        let a = store.node_index("A").unwrap();
        let b = store.node_index("B").unwrap();
        assert_eq!(store.degree(a), 2);
        assert_eq!(store.degree(b), 4);

        let types: Vec<_> = store
            .outgoing(a)
            .iter()
            .map(|e| e.relationship.relationship_type.as_str())
            .collect();
        assert_eq!(types, vec!["uses", "creates"]);
    }

    #[test]
    fn test_snapshot_round_trip_preserves_order() {
        let store = sample();
        let snapshot = store.to_snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored = GraphStore::from_snapshot(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.to_snapshot(), snapshot);
        assert_eq!(snapshot.edges[1].relationship.relationship_type, "creates");
    }

    #[test]
    fn test_snapshot_with_dangling_edge_is_rejected() {
        let snapshot = GraphSnapshot {
            nodes: vec![Entity::new("A", "concept")],
            edges: vec![EdgeRecord {
                source: "A".into(),
                target: "Missing".into(),
                relationship: Relationship::new("uses"),
            }],
        };
        assert!(matches!(
            GraphStore::from_snapshot(snapshot),
            Err(VgError::StorageError(_))
        ));
    }

    #[test]
    fn test_edge_record_flattens_relationship() {
        let snapshot = sample().to_snapshot();
        let value = serde_json::to_value(&snapshot.edges[0]).unwrap();
        assert_eq!(value["source"], "A");
        assert_eq!(value["type"], "uses");
    }
}
