//! Graph assembler
//!
//! The only writer of a [`GraphStore`]. Names are resolved case-insensitively
//! through an alias cache so `"car-t therapy"` lands on the node first
//! created as `"CAR-T Therapy"`.

use std::collections::HashMap;

use petgraph::graph::NodeIndex;
use vg_core::{clean_entity_name, ExtractionResult, Properties, SourceRef};

use crate::store::{push_unique, Entity, GraphStore, Relationship};

/// Type given to nodes created only as relationship endpoints
pub const PLACEHOLDER_TYPE: &str = "unknown";

/// `lowercase(name) -> canonical name`
#[derive(Debug, Clone, Default)]
pub struct AliasCache {
    aliases: HashMap<String, String>,
}

impl AliasCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from node names; the first node per lowercase name wins
    pub fn rebuild(store: &GraphStore) -> Self {
        let mut cache = Self::new();
        for entity in store.entities() {
            cache.register(&entity.name);
        }
        cache
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.aliases.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Register a canonical name unless its alias is already taken
    pub fn register(&mut self, canonical: &str) {
        self.aliases
            .entry(canonical.to_lowercase())
            .or_insert_with(|| canonical.to_string());
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// What one merge changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub entities_added: usize,
    pub entities_updated: usize,
    pub relationships_added: usize,
    /// Endpoint nodes created for relationships naming unseen entities
    pub placeholders_created: usize,
    pub skipped: usize,
}

impl MergeSummary {
    fn absorb(&mut self, other: MergeSummary) {
        self.entities_added += other.entities_added;
        self.entities_updated += other.entities_updated;
        self.relationships_added += other.relationships_added;
        self.placeholders_created += other.placeholders_created;
        self.skipped += other.skipped;
    }
}

/// Owns the store and the alias cache that indexes it
#[derive(Debug, Clone, Default)]
pub struct GraphAssembler {
    store: GraphStore,
    aliases: AliasCache,
}

impl GraphAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt an existing store (e.g. a loaded snapshot) and index it
    pub fn from_store(store: GraphStore) -> Self {
        let aliases = AliasCache::rebuild(&store);
        Self { store, aliases }
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn into_store(self) -> GraphStore {
        self.store
    }

    pub fn aliases(&self) -> &AliasCache {
        &self.aliases
    }

    /// Fold one extraction result into the graph. Never fails; unusable
    /// items are counted in `skipped`.
    pub fn merge(&mut self, result: &ExtractionResult) -> MergeSummary {
        let mut summary = MergeSummary::default();

        for entity in &result.entities {
            self.upsert(
                &entity.name,
                &entity.entity_type,
                &entity.properties,
                &entity.sources,
                &mut summary,
            );
        }

        for rel in &result.relationships {
            let relationship = Relationship {
                relationship_type: rel.relationship_type.clone(),
                properties: rel.properties.clone(),
                sources: dedup_sources(&rel.sources),
            };
            self.connect(&rel.source, &rel.target, relationship, &mut summary);
        }

        summary
    }

    /// Merge another store with the same semantics as [`merge`](Self::merge)
    pub fn merge_store(&mut self, other: &GraphStore) -> MergeSummary {
        let mut summary = MergeSummary::default();

        for entity in other.entities() {
            self.upsert(
                &entity.name,
                &entity.entity_type,
                &entity.properties,
                &entity.sources,
                &mut summary,
            );
        }

        for edge in other.edges() {
            self.connect(
                &edge.source.name,
                &edge.target.name,
                edge.relationship.clone(),
                &mut summary,
            );
        }

        tracing::debug!(
            added = summary.entities_added,
            updated = summary.entities_updated,
            edges = summary.relationships_added,
            "merged graph store"
        );
        summary
    }

    /// Merge several results in order
    pub fn merge_all<'a>(
        &mut self,
        results: impl IntoIterator<Item = &'a ExtractionResult>,
    ) -> MergeSummary {
        let mut summary = MergeSummary::default();
        for result in results {
            summary.absorb(self.merge(result));
        }
        summary
    }

    fn upsert(
        &mut self,
        name: &str,
        entity_type: &str,
        properties: &Properties,
        sources: &[SourceRef],
        summary: &mut MergeSummary,
    ) {
        let name = clean_entity_name(name);
        if name.is_empty() {
            summary.skipped += 1;
            return;
        }

        if let Some(idx) = self.lookup(&name) {
            let node = self.store.entity_at_mut(idx);
            for source in sources {
                push_unique(&mut node.sources, source);
            }
            for (key, value) in properties {
                node.properties
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            if node.entity_type == PLACEHOLDER_TYPE && entity_type != PLACEHOLDER_TYPE {
                node.entity_type = entity_type.to_string();
            }
            summary.entities_updated += 1;
            return;
        }

        let entity = Entity {
            name: name.clone(),
            entity_type: entity_type.to_string(),
            properties: properties.clone(),
            sources: dedup_sources(sources),
        };
        self.store.insert_entity(entity);
        self.aliases.register(&name);
        summary.entities_added += 1;
    }

    fn connect(
        &mut self,
        source: &str,
        target: &str,
        relationship: Relationship,
        summary: &mut MergeSummary,
    ) {
        let source = clean_entity_name(source);
        let target = clean_entity_name(target);
        if source.is_empty() || target.is_empty() {
            summary.skipped += 1;
            return;
        }

        let from = self.resolve_or_create(&source, summary);
        let to = self.resolve_or_create(&target, summary);
        self.store.add_relationship(from, to, relationship);
        summary.relationships_added += 1;
    }

    fn resolve_or_create(&mut self, name: &str, summary: &mut MergeSummary) -> NodeIndex {
        if let Some(idx) = self.lookup(name) {
            return idx;
        }
        let idx = self.store.insert_entity(Entity::new(name, PLACEHOLDER_TYPE));
        self.aliases.register(name);
        summary.placeholders_created += 1;
        idx
    }

    fn lookup(&self, name: &str) -> Option<NodeIndex> {
        self.aliases
            .resolve(name)
            .and_then(|canonical| self.store.node_index(canonical))
            .or_else(|| self.store.node_index(name))
    }
}

fn dedup_sources(sources: &[SourceRef]) -> Vec<SourceRef> {
    let mut out = Vec::with_capacity(sources.len());
    for source in sources {
        push_unique(&mut out, source);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use vg_core::{ExtractedEntity, ExtractedRelationship};

    fn src(chunk: &str) -> SourceRef {
        SourceRef::new("notes/a.md", chunk)
    }

    fn result(entities: Vec<ExtractedEntity>, relationships: Vec<ExtractedRelationship>) -> ExtractionResult {
        ExtractionResult {
            entities,
            relationships,
            ..Default::default()
        }
    }

    #[test]
    fn test_case_insensitive_resolution_keeps_first_casing() {
        let mut assembler = GraphAssembler::new();
        assembler.merge(&result(
            vec![ExtractedEntity::new("CAR-T Therapy", "treatment").with_source(src("1"))],
            vec![],
        ));
        let summary = assembler.merge(&result(
            vec![ExtractedEntity::new("car-t therapy", "treatment").with_source(src("2"))],
            vec![],
        ));

        assert_eq!(summary.entities_updated, 1);
        assert_eq!(assembler.store().node_count(), 1);
        let node = assembler.store().entity("CAR-T Therapy").unwrap();
        assert_eq!(node.sources, vec![src("1"), src("2")]);
    }

    #[test]
    fn test_properties_are_first_write_wins() {
        let mut assembler = GraphAssembler::new();
        assembler.merge(&result(
            vec![ExtractedEntity::new("A", "concept").with_property("description", "first")],
            vec![],
        ));
        assembler.merge(&result(
            vec![ExtractedEntity::new("a", "concept")
                .with_property("description", "second")
                .with_property("domain", "general")],
            vec![],
        ));

        let node = assembler.store().entity("A").unwrap();
        assert_eq!(node.properties["description"], "first");
        assert_eq!(node.properties["domain"], "general");
    }

    #[test]
    fn test_duplicate_sources_are_not_repeated() {
        let mut assembler = GraphAssembler::new();
        let entity = ExtractedEntity::new("A", "concept").with_source(src("1"));
        assembler.merge(&result(vec![entity.clone()], vec![]));
        assembler.merge(&result(vec![entity], vec![]));
        assert_eq!(assembler.store().entity("A").unwrap().sources.len(), 1);
    }

    #[test]
    fn test_relationship_endpoints_are_auto_created() {
        let mut assembler = GraphAssembler::new();
        let summary = assembler.merge(&result(
            vec![],
            vec![ExtractedRelationship::new("Fusion 360", "Gridfinity", "used_in")],
        ));

        assert_eq!(summary.placeholders_created, 2);
        assert_eq!(assembler.store().entity("Gridfinity").unwrap().entity_type, PLACEHOLDER_TYPE);

        assembler.merge(&result(vec![ExtractedEntity::new("gridfinity", "project")], vec![]));
        assert_eq!(assembler.store().entity("Gridfinity").unwrap().entity_type, "project");
        assert_eq!(assembler.store().node_count(), 2);
    }

    #[test]
    fn test_parallel_edges_are_kept() {
        let mut assembler = GraphAssembler::new();
        let rel = ExtractedRelationship::new("A", "B", "uses");
        assembler.merge(&result(vec![], vec![rel.clone(), rel]));
        assert_eq!(assembler.store().edge_count(), 2);
        assert_eq!(assembler.store().node_count(), 2);
    }

    #[test]
    fn test_blank_names_are_skipped() {
        let mut assembler = GraphAssembler::new();
        let summary = assembler.merge(&result(
            vec![ExtractedEntity::new("  ", "concept")],
            vec![ExtractedRelationship::new("A", " ", "uses")],
        ));
        assert_eq!(summary.skipped, 2);
        assert!(assembler.store().is_empty());
    }

    #[test]
    fn test_merge_is_deterministic() {
        let batch = vec![
            result(
                vec![
                    ExtractedEntity::new("A", "concept").with_source(src("1")),
                    ExtractedEntity::new("B", "person"),
                ],
                vec![ExtractedRelationship::new("A", "B", "relates_to")],
            ),
            result(
                vec![ExtractedEntity::new("b", "unknown").with_property("importance", "high")],
                vec![ExtractedRelationship::new("b", "C", "leads_to")],
            ),
        ];

        let mut first = GraphAssembler::new();
        first.merge_all(&batch);
        let mut second = GraphAssembler::new();
        second.merge_all(&batch);

        assert_eq!(first.store().to_snapshot(), second.store().to_snapshot());
    }

    #[test]
    fn test_merge_store_combines_partial_graphs() {
        let mut left = GraphAssembler::new();
        left.merge(&result(
            vec![ExtractedEntity::new("A", "concept").with_source(src("1"))],
            vec![ExtractedRelationship::new("A", "B", "uses")],
        ));

        let mut right = GraphAssembler::new();
        right.merge(&result(
            vec![ExtractedEntity::new("a", "concept").with_source(src("2"))],
            vec![ExtractedRelationship::new("B", "C", "creates")],
        ));

        let summary = left.merge_store(right.store());
        assert_eq!(summary.relationships_added, 1);
        assert_eq!(left.store().node_count(), 3);
        assert_eq!(left.store().edge_count(), 2);
        assert_eq!(left.store().entity("A").unwrap().sources, vec![src("1"), src("2")]);
    }

    #[test]
    fn test_from_store_rebuilds_aliases() {
        let mut assembler = GraphAssembler::new();
        assembler.merge(&result(vec![ExtractedEntity::new("Obsidian Vault", "project")], vec![]));
        let store = assembler.into_store();

        let restored = GraphAssembler::from_store(store);
        assert_eq!(restored.aliases().resolve("OBSIDIAN VAULT"), Some("Obsidian Vault"));
    }
}
