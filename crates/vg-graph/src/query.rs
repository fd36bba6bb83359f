//! Query engine
//!
//! Read-only questions over a [`GraphStore`]: fuzzy neighborhood lookup,
//! path discovery with directional fallback, summary statistics and
//! plain-text context for question answering.
//!
//! Author: hephaex@gmail.com

use std::collections::HashSet;
use std::sync::Arc;

use petgraph::algo::{all_simple_paths, connected_components};
use petgraph::graph::NodeIndex;
use petgraph::Undirected;
use serde::Serialize;
use vg_core::{CompletionRequest, LlmClient, Properties, QueryConfig, Result, SourceRef, VgError};

use crate::store::{EdgeView, GraphStore};

const ANSWER_TEMPLATE: &str = include_str!("prompts/answer.txt");

// ============================================================================
// Result types
// ============================================================================

/// One relationship seen from a neighborhood's center
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationView {
    /// Target for outgoing edges, source for incoming ones
    pub entity: String,
    pub relationship: String,
    pub properties: Properties,
}

impl RelationView {
    fn new(entity: &str, edge: &EdgeView<'_>) -> Self {
        Self {
            entity: entity.to_string(),
            relationship: edge.relationship.relationship_type.clone(),
            properties: edge.relationship.properties.clone(),
        }
    }
}

/// Entity with its direct relationships
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighborhood {
    pub found: bool,
    pub entity: String,
    pub entity_type: String,
    pub properties: Properties,
    pub sources: Vec<SourceRef>,
    pub outgoing: Vec<RelationView>,
    pub incoming: Vec<RelationView>,
}

impl Neighborhood {
    /// Sentinel for a name that matched nothing
    pub fn not_found(query: &str) -> Self {
        Self {
            found: false,
            entity: query.to_string(),
            entity_type: String::new(),
            properties: Properties::new(),
            sources: Vec::new(),
            outgoing: Vec::new(),
            incoming: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CentralEntity {
    pub entity: String,
    pub centrality: f64,
    pub connections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub density: f64,
    pub is_connected: bool,
    pub top_entities: Vec<CentralEntity>,
}

// ============================================================================
// Query Engine
// ============================================================================

/// Read-only query interface over a graph store
pub struct QueryEngine<'a> {
    store: &'a GraphStore,
    config: QueryConfig,
}

impl<'a> QueryEngine<'a> {
    pub fn new(store: &'a GraphStore) -> Self {
        Self {
            store,
            config: QueryConfig::default(),
        }
    }

    pub fn with_config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve a user-supplied name to a node.
    ///
    /// Candidates are nodes whose lowercase name contains the query or is
    /// contained in it. The best-connected candidate wins; ties go to an
    /// exact case-insensitive match, then to the smallest name.
    pub fn resolve(&self, name: &str) -> Option<NodeIndex> {
        let query = clean_query(name);
        if query.is_empty() {
            return None;
        }
        let query_lower = query.to_lowercase();

        let graph = self.store.graph();
        graph
            .node_indices()
            .filter(|&idx| {
                let candidate = graph[idx].name.to_lowercase();
                candidate.contains(&query_lower) || query_lower.contains(&candidate)
            })
            .max_by(|&a, &b| {
                let (name_a, name_b) = (&graph[a].name, &graph[b].name);
                self.store
                    .degree(a)
                    .cmp(&self.store.degree(b))
                    .then_with(|| {
                        let exact_a = name_a.to_lowercase() == query_lower;
                        let exact_b = name_b.to_lowercase() == query_lower;
                        exact_a.cmp(&exact_b)
                    })
                    .then_with(|| name_b.cmp(name_a))
            })
    }

    /// Neighborhood of the best match for `name`
    pub fn neighborhood(&self, name: &str) -> Neighborhood {
        match self.resolve(name) {
            Some(idx) => self.neighborhood_of(idx),
            None => Neighborhood::not_found(&clean_query(name)),
        }
    }

    /// Neighborhood of a specific node
    pub fn neighborhood_of(&self, idx: NodeIndex) -> Neighborhood {
        let entity = self.store.entity_at(idx);
        Neighborhood {
            found: true,
            entity: entity.name.clone(),
            entity_type: entity.entity_type.clone(),
            properties: entity.properties.clone(),
            sources: entity.sources.clone(),
            outgoing: self
                .store
                .outgoing(idx)
                .iter()
                .map(|edge| RelationView::new(&edge.target.name, edge))
                .collect(),
            incoming: self
                .store
                .incoming(idx)
                .iter()
                .map(|edge| RelationView::new(&edge.source.name, edge))
                .collect(),
        }
    }

    /// Simple paths of at most `max_depth` edges, listed source to target.
    ///
    /// Edge direction is followed first; when that finds nothing the search
    /// runs against reversed edges, then ignoring direction.
    pub fn paths(&self, source: &str, target: &str, max_depth: usize) -> Vec<Vec<String>> {
        let (Some(from), Some(to)) = (self.resolve(source), self.resolve(target)) else {
            return Vec::new();
        };
        if from == to {
            return vec![vec![self.store.entity_at(from).name.clone()]];
        }
        if max_depth == 0 {
            return Vec::new();
        }

        let graph = self.store.graph();
        let max_intermediate = Some(max_depth - 1);
        let cap = self.config.max_paths;

        let mut found = unique_paths(
            all_simple_paths::<Vec<NodeIndex>, _>(graph, from, to, 0, max_intermediate),
            cap,
        );

        if found.is_empty() {
            let mut reversed = graph.map(|_, _| (), |_, _| ());
            reversed.reverse();
            found = unique_paths(
                all_simple_paths::<Vec<NodeIndex>, _>(&reversed, from, to, 0, max_intermediate),
                cap,
            );
        }

        if found.is_empty() {
            let undirected = graph
                .map(|_, _| (), |_, _| ())
                .into_edge_type::<Undirected>();
            found = unique_paths(
                all_simple_paths::<Vec<NodeIndex>, _>(&undirected, from, to, 0, max_intermediate),
                cap,
            );
        }

        found
            .into_iter()
            .map(|path| {
                path.into_iter()
                    .map(|idx| self.store.entity_at(idx).name.clone())
                    .collect()
            })
            .collect()
    }

    /// Size, density, weak connectivity and the `top_k` most central entities
    pub fn stats(&self, top_k: usize) -> GraphStats {
        let n = self.store.node_count();
        let m = self.store.edge_count();

        let density = if n > 1 {
            m as f64 / (n as f64 * (n as f64 - 1.0))
        } else {
            0.0
        };

        GraphStats {
            total_nodes: n,
            total_edges: m,
            density,
            is_connected: n > 0 && connected_components(self.store.graph()) == 1,
            top_entities: self.central_entities(top_k),
        }
    }

    /// Entities ranked by degree centrality, ties in insertion order
    pub fn central_entities(&self, top_k: usize) -> Vec<CentralEntity> {
        let n = self.store.node_count();
        let mut ranked: Vec<CentralEntity> = self
            .store
            .graph()
            .node_indices()
            .map(|idx| {
                let connections = self.store.degree(idx);
                let centrality = if n > 1 {
                    connections as f64 / (n as f64 - 1.0)
                } else {
                    1.0
                };
                CentralEntity {
                    entity: self.store.entity_at(idx).name.clone(),
                    centrality,
                    connections,
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.centrality.total_cmp(&a.centrality));
        ranked.truncate(top_k);
        ranked
    }

    /// Context text for a free-form question.
    ///
    /// Uses entities whose names appear in the question; falls back to the
    /// most central entities when none do.
    pub fn context_for_question(&self, question: &str, max_entities: usize) -> String {
        let question_lower = question.to_lowercase();
        let graph = self.store.graph();

        let mentioned: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&idx| question_lower.contains(&graph[idx].name.to_lowercase()))
            .take(max_entities)
            .collect();

        let neighborhoods: Vec<Neighborhood> = if mentioned.is_empty() {
            self.central_entities(self.config.top_k)
                .iter()
                .filter_map(|central| self.store.node_index(&central.entity))
                .map(|idx| self.neighborhood_of(idx))
                .collect()
        } else {
            mentioned
                .into_iter()
                .map(|idx| self.neighborhood_of(idx))
                .collect()
        };

        format_context(&neighborhoods, self.config.context_edge_limit)
    }
}

/// Distinct paths in discovery order, pulling no more from `paths` than needed.
/// Parallel edges make the raw enumeration repeat node sequences.
fn unique_paths(
    paths: impl Iterator<Item = Vec<NodeIndex>>,
    cap: usize,
) -> Vec<Vec<NodeIndex>> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    if cap == 0 {
        return unique;
    }
    for path in paths {
        if seen.insert(path.clone()) {
            unique.push(path);
            if unique.len() >= cap {
                break;
            }
        }
    }
    unique
}

fn clean_query(name: &str) -> String {
    name.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_string()
}

/// Render neighborhoods as prompt context; not-found entries are skipped
pub fn format_context(neighborhoods: &[Neighborhood], edge_limit: usize) -> String {
    neighborhoods
        .iter()
        .filter(|n| n.found)
        .map(|n| format_block(n, edge_limit))
        .collect::<Vec<_>>()
        .join("\n---\n")
}

fn format_block(n: &Neighborhood, edge_limit: usize) -> String {
    let entity_type = if n.entity_type.is_empty() {
        "Unknown"
    } else {
        n.entity_type.as_str()
    };

    let mut text = format!("Entity: {}\nType: {}\n", n.entity, entity_type);
    if let Some(description) = n.properties.get("description") {
        let description = description
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| description.to_string());
        text.push_str(&format!("Description: {description}\n"));
    }

    if !n.outgoing.is_empty() || !n.incoming.is_empty() {
        text.push_str("Relationships:\n");
    }
    for rel in n.outgoing.iter().take(edge_limit) {
        text.push_str(&format!("  - {} --[{}]--> {}\n", n.entity, rel.relationship, rel.entity));
    }
    for rel in n.incoming.iter().take(edge_limit) {
        text.push_str(&format!("  - {} --[{}]--> {}\n", rel.entity, rel.relationship, n.entity));
    }

    text
}

// ============================================================================
// Question answering
// ============================================================================

/// Answers questions by handing graph context to a language model
pub struct GraphQuerier {
    llm: Arc<dyn LlmClient>,
    model: String,
    config: QueryConfig,
}

impl GraphQuerier {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            config: QueryConfig::default(),
        }
    }

    pub fn with_config(mut self, config: QueryConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the answering prompt for `question`
    pub fn build_prompt(&self, store: &GraphStore, question: &str) -> String {
        let context = QueryEngine::new(store)
            .with_config(self.config.clone())
            .context_for_question(question, self.config.max_context_entities);

        ANSWER_TEMPLATE
            .replace("{question}", question)
            .replace("{context}", &context)
    }

    pub async fn answer(&self, store: &GraphStore, question: &str) -> Result<String> {
        if store.is_empty() {
            return Err(VgError::NotFound("knowledge graph is empty".to_string()));
        }

        let request = CompletionRequest {
            model: self.model.clone(),
            max_tokens: self.config.answer_max_tokens,
            temperature: 0.3,
            prompt: self.build_prompt(store, question),
        };

        tracing::info!(backend = self.llm.name(), model = %self.model, "answering question over graph");
        self.llm.complete(&request).await
    }
}
