//! Repository boundary and in-memory implementation.
//!
//! The cache only ever reads from the repository: to materialise a snapshot,
//! to reload a branch after a structural change, or to seed a preview
//! overlay. Writes happen elsewhere and reach the cache as change payloads.

use async_trait::async_trait;
use folio_core::{
    ContentData, ContentType, ContentTypeId, DataType, DataTypeId, DomainBinding, DomainId,
    ItemKind, NodeId, NodeRecord, RepositoryError, RepositoryResult,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Read-only access to the durable content repository.
///
/// Implementations must be safe to call concurrently from independent
/// rebuilds. Node lists may come back in any order; the cache orders them
/// parent-first itself.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// All content types of both item kinds.
    async fn content_types(&self) -> RepositoryResult<Vec<ContentType>>;

    async fn content_type(&self, id: ContentTypeId) -> RepositoryResult<Option<ContentType>>;

    async fn data_types(&self) -> RepositoryResult<Vec<DataType>>;

    async fn data_type(&self, id: DataTypeId) -> RepositoryResult<Option<DataType>>;

    async fn domains(&self) -> RepositoryResult<Vec<DomainBinding>>;

    async fn domain(&self, id: DomainId) -> RepositoryResult<Option<DomainBinding>>;

    /// Every node of the given kind, trashed ones included.
    async fn tree(&self, kind: ItemKind) -> RepositoryResult<Vec<NodeRecord>>;

    async fn node(&self, kind: ItemKind, id: NodeId) -> RepositoryResult<Option<NodeRecord>>;

    /// The node and all of its descendants. Empty when the node does not exist.
    async fn branch(&self, kind: ItemKind, id: NodeId) -> RepositoryResult<Vec<NodeRecord>>;

    /// Every node whose content type is one of `types`.
    async fn nodes_of_types(
        &self,
        kind: ItemKind,
        types: &[ContentTypeId],
    ) -> RepositoryResult<Vec<NodeRecord>>;
}

// ============================================================================
// IN-MEMORY REPOSITORY
// ============================================================================

#[derive(Debug, Default)]
struct RepositoryState {
    content: BTreeMap<NodeId, NodeRecord>,
    media: BTreeMap<NodeId, NodeRecord>,
    content_types: BTreeMap<ContentTypeId, ContentType>,
    data_types: BTreeMap<DataTypeId, DataType>,
    domains: BTreeMap<DomainId, DomainBinding>,
}

impl RepositoryState {
    fn nodes(&self, kind: ItemKind) -> &BTreeMap<NodeId, NodeRecord> {
        match kind {
            ItemKind::Content => &self.content,
            ItemKind::Media => &self.media,
        }
    }

    fn nodes_mut(&mut self, kind: ItemKind) -> &mut BTreeMap<NodeId, NodeRecord> {
        match kind {
            ItemKind::Content => &mut self.content,
            ItemKind::Media => &mut self.media,
        }
    }

    /// The node and its descendants, parents before children. Each node is
    /// listed once even when parent links form a cycle.
    fn branch_ids(&self, kind: ItemKind, id: NodeId) -> Vec<NodeId> {
        let nodes = self.nodes(kind);
        if !nodes.contains_key(&id) {
            return Vec::new();
        }
        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for record in nodes.values() {
            if let Some(parent) = record.parent_id {
                children.entry(parent).or_default().push(record.id);
            }
        }
        let mut ids = vec![id];
        let mut seen = HashSet::from([id]);
        let mut cursor = 0;
        while cursor < ids.len() {
            if let Some(kids) = children.get(&ids[cursor]) {
                ids.extend(kids.iter().copied().filter(|kid| seen.insert(*kid)));
            }
            cursor += 1;
        }
        ids
    }

    fn record_mut(&mut self, kind: ItemKind, id: NodeId) -> RepositoryResult<&mut NodeRecord> {
        self.nodes_mut(kind)
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound {
                entity: kind.to_string(),
                id: id.0,
            })
    }
}

/// In-memory repository for tests and embedding.
///
/// Mutation helpers model what the writing subsystem does to the durable
/// store. They never notify the cache; callers send the matching payloads.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: RwLock<RepositoryState>,
    fail_reads: AtomicBool,
}

impl InMemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read fail until switched off again.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self) -> RepositoryResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(RepositoryError::ReadFailed {
                reason: "repository unavailable".to_string(),
            });
        }
        Ok(())
    }

    // === Node writes ===

    /// Insert or replace a node record.
    pub async fn save_node(&self, record: NodeRecord) {
        let mut state = self.state.write().await;
        state.nodes_mut(record.kind).insert(record.id, record);
    }

    /// Replace the draft of a content node, bumping its version.
    pub async fn save_draft(&self, id: NodeId, mut data: ContentData) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let record = state.record_mut(ItemKind::Content, id)?;
        let previous = record
            .draft
            .as_ref()
            .or(record.published.as_ref())
            .map(|d| d.version)
            .unwrap_or(0);
        data.version = previous + 1;
        record.draft = Some(data);
        Ok(())
    }

    /// Publish the current draft of a content node.
    pub async fn publish(&self, id: NodeId) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let record = state.record_mut(ItemKind::Content, id)?;
        record.published = record.draft.clone();
        Ok(())
    }

    /// Publish a node and all of its descendants.
    pub async fn publish_branch(&self, id: NodeId) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let ids = state.branch_ids(ItemKind::Content, id);
        if ids.is_empty() {
            return Err(RepositoryError::NotFound {
                entity: ItemKind::Content.to_string(),
                id: id.0,
            });
        }
        for node_id in ids {
            let record = state.record_mut(ItemKind::Content, node_id)?;
            record.published = record.draft.clone();
        }
        Ok(())
    }

    pub async fn unpublish(&self, id: NodeId) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let record = state.record_mut(ItemKind::Content, id)?;
        record.published = None;
        Ok(())
    }

    /// Replace the data of a media node.
    pub async fn save_media(&self, id: NodeId, data: ContentData) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let record = state.record_mut(ItemKind::Media, id)?;
        record.draft = Some(data.clone());
        record.published = Some(data);
        Ok(())
    }

    pub async fn move_node(
        &self,
        kind: ItemKind,
        id: NodeId,
        new_parent: Option<NodeId>,
    ) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        if let Some(parent) = new_parent {
            if state.branch_ids(kind, id).contains(&parent) {
                return Err(RepositoryError::InvalidData {
                    entity: kind.to_string(),
                    id: id.0,
                    reason: format!("cannot move below its own descendant {}", parent),
                });
            }
        }
        let record = state.record_mut(kind, id)?;
        record.parent_id = new_parent;
        Ok(())
    }

    pub async fn set_sort_order(
        &self,
        kind: ItemKind,
        id: NodeId,
        sort_order: i32,
    ) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        state.record_mut(kind, id)?.sort_order = sort_order;
        Ok(())
    }

    /// Move a node and its descendants to the recycle bin.
    pub async fn trash(&self, kind: ItemKind, id: NodeId) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        let ids = state.branch_ids(kind, id);
        if ids.is_empty() {
            return Err(RepositoryError::NotFound {
                entity: kind.to_string(),
                id: id.0,
            });
        }
        for node_id in ids {
            state.record_mut(kind, node_id)?.trashed = true;
        }
        Ok(())
    }

    /// Permanently delete a node and its descendants.
    pub async fn delete_node(&self, kind: ItemKind, id: NodeId) -> Vec<NodeId> {
        let mut state = self.state.write().await;
        let ids = state.branch_ids(kind, id);
        let nodes = state.nodes_mut(kind);
        for node_id in &ids {
            nodes.remove(node_id);
        }
        ids
    }

    // === Schema writes ===

    pub async fn save_content_type(&self, content_type: ContentType) {
        let mut state = self.state.write().await;
        state.content_types.insert(content_type.id, content_type);
    }

    /// Remove a content type, deleting every node of that type with its
    /// descendants and dropping it from other types' compositions.
    pub async fn remove_content_type(&self, id: ContentTypeId) -> Vec<NodeId> {
        let mut state = self.state.write().await;
        let Some(removed) = state.content_types.remove(&id) else {
            return Vec::new();
        };
        for content_type in state.content_types.values_mut() {
            content_type.compositions.retain(|c| *c != id);
        }
        let kind = removed.kind;
        let roots: Vec<NodeId> = state
            .nodes(kind)
            .values()
            .filter(|r| r.content_type_id == id)
            .map(|r| r.id)
            .collect();
        let mut deleted = BTreeSet::new();
        for root in roots {
            for node_id in state.branch_ids(kind, root) {
                deleted.insert(node_id);
            }
        }
        let nodes = state.nodes_mut(kind);
        for node_id in &deleted {
            nodes.remove(node_id);
        }
        deleted.into_iter().collect()
    }

    pub async fn save_data_type(&self, data_type: DataType) {
        let mut state = self.state.write().await;
        state.data_types.insert(data_type.id, data_type);
    }

    /// Remove a data type and every property type that uses it.
    ///
    /// Returns the content types that lost properties.
    pub async fn remove_data_type(&self, id: DataTypeId) -> Vec<ContentTypeId> {
        let mut state = self.state.write().await;
        state.data_types.remove(&id);
        let mut touched = Vec::new();
        for content_type in state.content_types.values_mut() {
            let before = content_type.properties.len();
            content_type.properties.retain(|p| p.data_type_id != id);
            if content_type.properties.len() != before {
                touched.push(content_type.id);
            }
        }
        touched
    }

    // === Domain writes ===

    pub async fn save_domain(&self, domain: DomainBinding) {
        let mut state = self.state.write().await;
        state.domains.insert(domain.id, domain);
    }

    pub async fn remove_domain(&self, id: DomainId) -> bool {
        let mut state = self.state.write().await;
        state.domains.remove(&id).is_some()
    }

    // === Inspection ===

    pub async fn node_count(&self, kind: ItemKind) -> usize {
        self.state.read().await.nodes(kind).len()
    }
}

#[async_trait]
impl ContentRepository for InMemoryRepository {
    async fn content_types(&self) -> RepositoryResult<Vec<ContentType>> {
        self.check_reads()?;
        let state = self.state.read().await;
        Ok(state.content_types.values().cloned().collect())
    }

    async fn content_type(&self, id: ContentTypeId) -> RepositoryResult<Option<ContentType>> {
        self.check_reads()?;
        let state = self.state.read().await;
        Ok(state.content_types.get(&id).cloned())
    }

    async fn data_types(&self) -> RepositoryResult<Vec<DataType>> {
        self.check_reads()?;
        let state = self.state.read().await;
        Ok(state.data_types.values().cloned().collect())
    }

    async fn data_type(&self, id: DataTypeId) -> RepositoryResult<Option<DataType>> {
        self.check_reads()?;
        let state = self.state.read().await;
        Ok(state.data_types.get(&id).cloned())
    }

    async fn domains(&self) -> RepositoryResult<Vec<DomainBinding>> {
        self.check_reads()?;
        let state = self.state.read().await;
        Ok(state.domains.values().cloned().collect())
    }

    async fn domain(&self, id: DomainId) -> RepositoryResult<Option<DomainBinding>> {
        self.check_reads()?;
        let state = self.state.read().await;
        Ok(state.domains.get(&id).cloned())
    }

    async fn tree(&self, kind: ItemKind) -> RepositoryResult<Vec<NodeRecord>> {
        self.check_reads()?;
        let state = self.state.read().await;
        Ok(state.nodes(kind).values().cloned().collect())
    }

    async fn node(&self, kind: ItemKind, id: NodeId) -> RepositoryResult<Option<NodeRecord>> {
        self.check_reads()?;
        let state = self.state.read().await;
        Ok(state.nodes(kind).get(&id).cloned())
    }

    async fn branch(&self, kind: ItemKind, id: NodeId) -> RepositoryResult<Vec<NodeRecord>> {
        self.check_reads()?;
        let state = self.state.read().await;
        let nodes = state.nodes(kind);
        Ok(state
            .branch_ids(kind, id)
            .into_iter()
            .filter_map(|node_id| nodes.get(&node_id).cloned())
            .collect())
    }

    async fn nodes_of_types(
        &self,
        kind: ItemKind,
        types: &[ContentTypeId],
    ) -> RepositoryResult<Vec<NodeRecord>> {
        self.check_reads()?;
        let state = self.state.read().await;
        Ok(state
            .nodes(kind)
            .values()
            .filter(|r| types.contains(&r.content_type_id))
            .cloned()
            .collect())
    }
}
