//! SnapshotStore: owner of the live CacheSet.
//!
//! Readers take a reference copy of the current set and never wait on a
//! rebuild. Writers serialise per domain, build the replacement caches from
//! the repository off to the side, and swap the new set in under a brief
//! write lock. A failed build leaves the previous set current.
//!
//! Domain writer locks are always taken in the order schema, content,
//! media, domain.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use folio_core::{
    CacheConfig, ChangeBatch, ChangeDomain, ContentTypeId, ContentTypePayload, DataTypeId,
    DataTypePayload, DomainChangeKind, DomainPayload, FolioError, FolioResult, ItemKind, NodeId,
    NodePayload, NodeView, RepositoryError, SchemaChangeKind, SchemaInvalidation, SnapshotError,
    TreeChangeKind,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::repository::ContentRepository;
use crate::snapshot::{
    CacheSet, ContentCache, DomainCache, EditError, Generation, GenerationCounter, InPlace,
    MediaCache, PublishedTree, SchemaSnapshot, TreeEditor,
};

// ============================================================================
// OUTCOMES
// ============================================================================

/// What a content batch changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentChanges {
    pub draft_changed: bool,
    pub published_changed: bool,
    /// Ids named by the batch, in delivery order.
    pub affected_ids: Vec<NodeId>,
    pub full_rebuild: bool,
    pub diagnostics: Vec<SnapshotError>,
    pub generation: Generation,
}

/// What a media batch changed.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaChanges {
    pub changed: bool,
    pub affected_ids: Vec<NodeId>,
    pub full_rebuild: bool,
    pub diagnostics: Vec<SnapshotError>,
    pub generation: Generation,
}

/// What a content-type or data-type batch changed.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaChanges {
    pub schema_changed: bool,
    pub draft_changed: bool,
    pub content_changed: bool,
    pub media_changed: bool,
    /// Content types whose nodes were recomputed.
    pub affected_types: BTreeSet<ContentTypeId>,
    pub full_rebuild: bool,
    pub diagnostics: Vec<SnapshotError>,
    pub generation: Generation,
}

/// What a domain batch changed.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainChanges {
    pub changed: bool,
    pub full_rebuild: bool,
    pub diagnostics: Vec<SnapshotError>,
    pub generation: Generation,
}

/// Point-in-time statistics about the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub generation: u64,
    pub content_nodes: usize,
    pub draft_nodes: usize,
    pub media_nodes: usize,
    pub domains: usize,
    pub content_types: usize,
    pub data_types: usize,
    pub full_rebuilds: u64,
    pub partial_updates: u64,
    pub failed_rebuilds: u64,
    pub preview_sessions: usize,
}

// ============================================================================
// STORE
// ============================================================================

/// Why a single payload could not be applied incrementally.
enum Step {
    /// Fall back to a full rebuild of the domain.
    Escalate(String),
    /// The repository failed; nothing is published.
    Failed(RepositoryError),
}

impl From<EditError> for Step {
    fn from(err: EditError) -> Self {
        match err {
            EditError::Orphaned { .. } => Step::Escalate(err.to_string()),
            EditError::Invalid(e) => Step::Failed(e),
        }
    }
}

/// Holds the live CacheSet and the draft tree previews are seeded from.
pub struct SnapshotStore<R: ContentRepository + ?Sized> {
    repository: Arc<R>,
    config: CacheConfig,
    current: RwLock<Arc<CacheSet>>,
    draft: RwLock<Arc<ContentCache>>,
    generations: GenerationCounter,
    schema_lock: Mutex<()>,
    content_lock: Mutex<()>,
    media_lock: Mutex<()>,
    domain_lock: Mutex<()>,
    full_rebuilds: AtomicU64,
    partial_updates: AtomicU64,
    failed_rebuilds: AtomicU64,
}

impl<R: ContentRepository + ?Sized> SnapshotStore<R> {
    /// Create a store holding an empty set. Call [`create_snapshot`] before
    /// serving readers.
    ///
    /// [`create_snapshot`]: SnapshotStore::create_snapshot
    pub fn new(repository: Arc<R>, config: CacheConfig) -> Self {
        Self {
            repository,
            config,
            current: RwLock::new(Arc::new(CacheSet::empty())),
            draft: RwLock::new(Arc::new(ContentCache::new(PublishedTree::default(), true))),
            generations: GenerationCounter::new(),
            schema_lock: Mutex::new(()),
            content_lock: Mutex::new(()),
            media_lock: Mutex::new(()),
            domain_lock: Mutex::new(()),
            full_rebuilds: AtomicU64::new(0),
            partial_updates: AtomicU64::new(0),
            failed_rebuilds: AtomicU64::new(0),
        }
    }

    /// Validate the configuration and build the first snapshot.
    pub async fn load(repository: Arc<R>, config: CacheConfig) -> FolioResult<Self> {
        config.validate()?;
        let store = Self::new(repository, config);
        store.create_snapshot().await?;
        Ok(store)
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The currently published set. Never waits for a rebuild.
    pub fn current(&self) -> Arc<CacheSet> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// The draft view of the content tree.
    pub fn draft_content(&self) -> Arc<ContentCache> {
        Arc::clone(&self.draft.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// The published set together with the draft tree it was published
    /// with. Never pairs a new draft with an older set or the reverse.
    pub fn live_with_draft(&self) -> (Arc<CacheSet>, Arc<ContentCache>) {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        let draft = self.draft.read().unwrap_or_else(PoisonError::into_inner);
        (Arc::clone(&current), Arc::clone(&draft))
    }

    /// Swap the draft tree alone, for changes that publish nothing.
    fn set_draft(&self, tree: PublishedTree) {
        let mut guard = self.draft.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(ContentCache::new(tree, true));
    }

    /// Swap in a set derived from the latest current one. The generation is
    /// allocated under the write lock so publication order and generation
    /// order agree. A new `draft` is swapped under the same lock.
    ///
    /// Lock order is current then draft.
    fn publish(
        &self,
        draft: Option<PublishedTree>,
        update: impl FnOnce(&CacheSet, Generation) -> CacheSet,
    ) -> Arc<CacheSet> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let generation = self.generations.advance();
        let next = Arc::new(update(&guard, generation));
        if let Some(tree) = draft {
            let mut draft_guard = self.draft.write().unwrap_or_else(PoisonError::into_inner);
            *draft_guard = Arc::new(ContentCache::new(tree, true));
        }
        *guard = Arc::clone(&next);
        next
    }

    fn failed(&self, domain: ChangeDomain, err: RepositoryError) -> FolioError {
        self.failed_rebuilds.fetch_add(1, Ordering::Relaxed);
        error!(domain = %domain, error = %err, "Rebuild failed, keeping previous snapshot");
        SnapshotError::rebuild(domain, err).into()
    }

    fn escalation_reason(
        &self,
        len: usize,
        refresh_all: bool,
        diagnostics: &[SnapshotError],
    ) -> Option<String> {
        if !diagnostics.is_empty() {
            Some(format!("{} malformed entries", diagnostics.len()))
        } else if len > self.config.max_batch_size {
            Some(format!(
                "batch of {} exceeds max_batch_size {}",
                len, self.config.max_batch_size
            ))
        } else if refresh_all {
            Some("refresh-all requested".to_string())
        } else {
            None
        }
    }

    // === Full builds ===

    /// Build a fresh live set from the repository's current state and make
    /// it current.
    pub async fn create_snapshot(&self) -> FolioResult<Arc<CacheSet>> {
        let _schema = self.schema_lock.lock().await;
        let _content = self.content_lock.lock().await;
        let _media = self.media_lock.lock().await;
        let _domain = self.domain_lock.lock().await;

        let repo = &self.repository;
        let content_types = repo
            .content_types()
            .await
            .map_err(|e| self.failed(ChangeDomain::ContentType, e))?;
        let data_types = repo
            .data_types()
            .await
            .map_err(|e| self.failed(ChangeDomain::DataType, e))?;
        let schema = SchemaSnapshot::new(content_types, data_types);
        let (draft, published) = self.build_content(&schema).await?;
        let media = self.build_media(&schema).await?;
        let domains = repo
            .domains()
            .await
            .map_err(|e| self.failed(ChangeDomain::Domain, e))?;

        let set = self.publish(Some(draft), |_, generation| {
            CacheSet::new(
                generation,
                Arc::new(ContentCache::new(published, false)),
                Arc::new(MediaCache::new(media)),
                Arc::new(DomainCache::new(domains)),
                Arc::new(schema),
            )
        });
        self.full_rebuilds.fetch_add(1, Ordering::Relaxed);
        info!(
            generation = set.generation().sequence,
            content_nodes = set.content().len(),
            media_nodes = set.media().len(),
            "Snapshot created"
        );
        Ok(set)
    }

    async fn build_content(
        &self,
        schema: &SchemaSnapshot,
    ) -> FolioResult<(PublishedTree, PublishedTree)> {
        let domain = ChangeDomain::Content;
        let records = self
            .repository
            .tree(ItemKind::Content)
            .await
            .map_err(|e| self.failed(domain, e))?;
        let draft = PublishedTree::build(&records, NodeView::Draft, schema, true)
            .map_err(|e| self.failed(domain, e))?;
        let published = PublishedTree::build(&records, NodeView::Published, schema, false)
            .map_err(|e| self.failed(domain, e))?;
        Ok((draft, published))
    }

    async fn build_media(&self, schema: &SchemaSnapshot) -> FolioResult<PublishedTree> {
        let domain = ChangeDomain::Media;
        let records = self
            .repository
            .tree(ItemKind::Media)
            .await
            .map_err(|e| self.failed(domain, e))?;
        PublishedTree::build(&records, NodeView::Published, schema, true)
            .map_err(|e| self.failed(domain, e))
    }

    // === Content ===

    /// Apply an ordered batch of content changes.
    pub async fn apply_content_change(
        &self,
        payloads: &[NodePayload],
    ) -> FolioResult<ContentChanges> {
        self.apply_content(payloads, Vec::new()).await
    }

    pub(crate) async fn apply_content(
        &self,
        payloads: &[NodePayload],
        mut diagnostics: Vec<SnapshotError>,
    ) -> FolioResult<ContentChanges> {
        let _content = self.content_lock.lock().await;
        let affected_ids: Vec<NodeId> = payloads.iter().map(|p| p.id).collect();
        diagnostics.extend(ChangeBatch::Content(payloads.to_vec()).malformed_entries());

        let refresh_all = payloads.iter().any(|p| p.kind == TreeChangeKind::RefreshAll);
        if let Some(reason) = self.escalation_reason(payloads.len(), refresh_all, &diagnostics) {
            warn!(domain = %ChangeDomain::Content, reason = %reason, "Escalating to full rebuild");
            return self.rebuild_content(affected_ids, diagnostics).await;
        }

        let live = self.current();
        let draft = self.draft_content();
        let schema = Arc::clone(live.schema_arc());
        let mut draft_editor = TreeEditor::new(draft.tree(), NodeView::Draft, &schema, true);
        let mut published_editor =
            TreeEditor::new(live.content().tree(), NodeView::Published, &schema, false);

        for payload in payloads {
            let step = self
                .apply_node_payload(
                    ItemKind::Content,
                    payload,
                    &mut [&mut draft_editor, &mut published_editor],
                )
                .await;
            match step {
                Ok(()) => {}
                Err(Step::Escalate(reason)) => {
                    warn!(domain = %ChangeDomain::Content, node_id = %payload.id, reason = %reason, "Escalating to full rebuild");
                    return self.rebuild_content(affected_ids, diagnostics).await;
                }
                Err(Step::Failed(e)) => return Err(self.failed(ChangeDomain::Content, e)),
            }
        }

        let (draft_tree, draft_changed) = draft_editor.finish();
        let (published_tree, published_changed) = published_editor.finish();
        let generation = if published_changed {
            self.publish(draft_changed.then_some(draft_tree), |latest, generation| {
                latest.with_content(generation, ContentCache::new(published_tree, false))
            })
            .generation()
        } else {
            if draft_changed {
                self.set_draft(draft_tree);
            }
            self.current().generation()
        };
        self.partial_updates.fetch_add(1, Ordering::Relaxed);
        debug!(
            domain = %ChangeDomain::Content,
            generation = generation.sequence,
            draft_changed,
            published_changed,
            "Content changes applied"
        );
        Ok(ContentChanges {
            draft_changed,
            published_changed,
            affected_ids,
            full_rebuild: false,
            diagnostics,
            generation,
        })
    }

    /// Caller holds the content lock.
    async fn rebuild_content(
        &self,
        affected_ids: Vec<NodeId>,
        diagnostics: Vec<SnapshotError>,
    ) -> FolioResult<ContentChanges> {
        let live = self.current();
        let draft = self.draft_content();
        let (draft_tree, published_tree) = self.build_content(live.schema()).await?;
        let draft_changed = draft_tree != *draft.tree();
        let published_changed = published_tree != *live.content().tree();
        let set = self.publish(Some(draft_tree), |latest, generation| {
            latest.with_content(generation, ContentCache::new(published_tree, false))
        });
        self.full_rebuilds.fetch_add(1, Ordering::Relaxed);
        info!(
            domain = %ChangeDomain::Content,
            generation = set.generation().sequence,
            "Full rebuild complete"
        );
        Ok(ContentChanges {
            draft_changed,
            published_changed,
            affected_ids,
            full_rebuild: true,
            diagnostics,
            generation: set.generation(),
        })
    }

    // === Media ===

    pub async fn apply_media_change(&self, payloads: &[NodePayload]) -> FolioResult<MediaChanges> {
        self.apply_media(payloads, Vec::new()).await
    }

    pub(crate) async fn apply_media(
        &self,
        payloads: &[NodePayload],
        mut diagnostics: Vec<SnapshotError>,
    ) -> FolioResult<MediaChanges> {
        let _media = self.media_lock.lock().await;
        let affected_ids: Vec<NodeId> = payloads.iter().map(|p| p.id).collect();
        diagnostics.extend(ChangeBatch::Media(payloads.to_vec()).malformed_entries());

        let refresh_all = payloads.iter().any(|p| p.kind == TreeChangeKind::RefreshAll);
        if let Some(reason) = self.escalation_reason(payloads.len(), refresh_all, &diagnostics) {
            warn!(domain = %ChangeDomain::Media, reason = %reason, "Escalating to full rebuild");
            return self.rebuild_media(affected_ids, diagnostics).await;
        }

        let live = self.current();
        let schema = Arc::clone(live.schema_arc());
        let mut editor = TreeEditor::new(live.media().tree(), NodeView::Published, &schema, true);
        for payload in payloads {
            match self
                .apply_node_payload(ItemKind::Media, payload, &mut [&mut editor])
                .await
            {
                Ok(()) => {}
                Err(Step::Escalate(reason)) => {
                    warn!(domain = %ChangeDomain::Media, node_id = %payload.id, reason = %reason, "Escalating to full rebuild");
                    return self.rebuild_media(affected_ids, diagnostics).await;
                }
                Err(Step::Failed(e)) => return Err(self.failed(ChangeDomain::Media, e)),
            }
        }

        let (tree, changed) = editor.finish();
        let generation = if changed {
            self.publish(None, |latest, generation| latest.with_media(generation, MediaCache::new(tree)))
                .generation()
        } else {
            self.current().generation()
        };
        self.partial_updates.fetch_add(1, Ordering::Relaxed);
        debug!(domain = %ChangeDomain::Media, generation = generation.sequence, changed, "Media changes applied");
        Ok(MediaChanges {
            changed,
            affected_ids,
            full_rebuild: false,
            diagnostics,
            generation,
        })
    }

    /// Caller holds the media lock.
    async fn rebuild_media(
        &self,
        affected_ids: Vec<NodeId>,
        diagnostics: Vec<SnapshotError>,
    ) -> FolioResult<MediaChanges> {
        let live = self.current();
        let tree = self.build_media(live.schema()).await?;
        let changed = tree != *live.media().tree();
        let set = self.publish(None, |latest, generation| latest.with_media(generation, MediaCache::new(tree)));
        self.full_rebuilds.fetch_add(1, Ordering::Relaxed);
        info!(domain = %ChangeDomain::Media, generation = set.generation().sequence, "Full rebuild complete");
        Ok(MediaChanges {
            changed,
            affected_ids,
            full_rebuild: true,
            diagnostics,
            generation: set.generation(),
        })
    }

    // === Shared node handling ===

    async fn apply_node_payload(
        &self,
        kind: ItemKind,
        payload: &NodePayload,
        editors: &mut [&mut TreeEditor<'_>],
    ) -> Result<(), Step> {
        let id = payload.id;
        match payload.kind {
            TreeChangeKind::Deleted => {
                for editor in editors.iter_mut() {
                    editor.remove_branch(id);
                }
                Ok(())
            }
            TreeChangeKind::Updated => {
                let record = self
                    .repository
                    .node(kind, id)
                    .await
                    .map_err(Step::Failed)?
                    .ok_or_else(|| Step::Escalate(format!("updated {} {} does not exist", kind, id)))?;
                let mut needs_branch = !self.config.in_place_value_updates;
                if !needs_branch {
                    for editor in editors.iter_mut() {
                        if editor.update_in_place(&record)? == InPlace::NeedsBranch {
                            needs_branch = true;
                        }
                    }
                }
                if needs_branch {
                    self.reload_branch(kind, id, editors).await?;
                }
                Ok(())
            }
            TreeChangeKind::Created | TreeChangeKind::Moved | TreeChangeKind::Sorted => {
                self.reload_branch(kind, id, editors).await
            }
            TreeChangeKind::RefreshAll => Err(Step::Escalate("refresh-all requested".to_string())),
        }
    }

    async fn reload_branch(
        &self,
        kind: ItemKind,
        id: NodeId,
        editors: &mut [&mut TreeEditor<'_>],
    ) -> Result<(), Step> {
        let records = self
            .repository
            .branch(kind, id)
            .await
            .map_err(Step::Failed)?;
        for editor in editors.iter_mut() {
            if records.is_empty() {
                editor.remove_branch(id);
            } else {
                editor.replace_branch(id, &records)?;
            }
        }
        Ok(())
    }

    /// Recompute every node of the given types in place. Nodes whose record
    /// disappeared are removed; nodes whose slot moved reload their branch.
    async fn recompute_types(
        &self,
        kind: ItemKind,
        types: &BTreeSet<ContentTypeId>,
        editors: &mut [&mut TreeEditor<'_>],
    ) -> Result<(), Step> {
        if types.is_empty() {
            return Ok(());
        }
        let type_list: Vec<ContentTypeId> = types.iter().copied().collect();
        let records = self
            .repository
            .nodes_of_types(kind, &type_list)
            .await
            .map_err(Step::Failed)?;
        let present: HashSet<NodeId> = records.iter().map(|r| r.id).collect();

        for editor in editors.iter_mut() {
            let vanished: Vec<NodeId> = editor
                .tree()
                .iter()
                .filter(|n| types.contains(&n.content_type_id) && !present.contains(&n.id))
                .map(|n| n.id)
                .collect();
            for id in vanished {
                editor.remove_branch(id);
            }
            for record in &records {
                if editor.update_in_place(record)? == InPlace::NeedsBranch {
                    let branch = self
                        .repository
                        .branch(kind, record.id)
                        .await
                        .map_err(Step::Failed)?;
                    editor.replace_branch(record.id, &branch)?;
                }
            }
        }
        Ok(())
    }

    // === Schema ===

    /// Apply content-type changes and recompute the content built from them.
    pub async fn apply_content_type_change(
        &self,
        payloads: &[ContentTypePayload],
    ) -> FolioResult<SchemaChanges> {
        self.apply_content_types(payloads, Vec::new()).await
    }

    pub(crate) async fn apply_content_types(
        &self,
        payloads: &[ContentTypePayload],
        mut diagnostics: Vec<SnapshotError>,
    ) -> FolioResult<SchemaChanges> {
        let domain = ChangeDomain::ContentType;
        let _schema = self.schema_lock.lock().await;
        let _content = self.content_lock.lock().await;
        let _media = self.media_lock.lock().await;
        diagnostics.extend(ChangeBatch::ContentType(payloads.to_vec()).malformed_entries());

        if let Some(reason) = self.escalation_reason(payloads.len(), false, &diagnostics) {
            warn!(domain = %domain, reason = %reason, "Escalating to full rebuild");
            return self.rebuild_schema(domain, BTreeSet::new(), diagnostics).await;
        }

        let live = self.current();
        let mut schema = live.schema().clone();
        let mut changed = BTreeSet::new();
        for payload in payloads {
            changed.insert(payload.id);
            schema = match payload.kind {
                SchemaChangeKind::Removed => schema.without_content_type(payload.id),
                SchemaChangeKind::Created | SchemaChangeKind::Updated => {
                    match self
                        .repository
                        .content_type(payload.id)
                        .await
                        .map_err(|e| self.failed(domain, e))?
                    {
                        Some(content_type) if content_type.kind != payload.item_kind => {
                            let reason = format!(
                                "content type {} is {}, notified as {}",
                                payload.id, content_type.kind, payload.item_kind
                            );
                            warn!(domain = %domain, reason = %reason, "Escalating to full rebuild");
                            return self.rebuild_schema(domain, BTreeSet::new(), diagnostics).await;
                        }
                        Some(content_type) => schema.with_content_type(content_type),
                        None => schema.without_content_type(payload.id),
                    }
                }
            };
        }
        let mut affected = live.schema().composing_types(&changed);
        affected.extend(schema.composing_types(&changed));
        self.recompute_schema(domain, live, schema, affected, diagnostics)
            .await
    }

    /// Apply data-type changes and recompute every type using them.
    pub async fn apply_data_type_change(
        &self,
        payloads: &[DataTypePayload],
    ) -> FolioResult<SchemaChanges> {
        self.apply_data_types(payloads, Vec::new()).await
    }

    pub(crate) async fn apply_data_types(
        &self,
        payloads: &[DataTypePayload],
        mut diagnostics: Vec<SnapshotError>,
    ) -> FolioResult<SchemaChanges> {
        let domain = ChangeDomain::DataType;
        let _schema = self.schema_lock.lock().await;
        let _content = self.content_lock.lock().await;
        let _media = self.media_lock.lock().await;
        diagnostics.extend(ChangeBatch::DataType(payloads.to_vec()).malformed_entries());

        if let Some(reason) = self.escalation_reason(payloads.len(), false, &diagnostics) {
            warn!(domain = %domain, reason = %reason, "Escalating to full rebuild");
            return self.rebuild_schema(domain, BTreeSet::new(), diagnostics).await;
        }

        let live = self.current();
        let mut schema = live.schema().clone();
        let mut changed: BTreeSet<DataTypeId> = BTreeSet::new();
        for payload in payloads {
            changed.insert(payload.id);
            schema = match payload.kind {
                SchemaChangeKind::Removed => schema.without_data_type(payload.id),
                SchemaChangeKind::Created | SchemaChangeKind::Updated => {
                    match self
                        .repository
                        .data_type(payload.id)
                        .await
                        .map_err(|e| self.failed(domain, e))?
                    {
                        Some(data_type) => schema.with_data_type(data_type),
                        None => schema.without_data_type(payload.id),
                    }
                }
            };
        }
        let mut affected = live.schema().types_using_data_types(&changed);
        affected.extend(schema.types_using_data_types(&changed));

        // Removing a data type also strips property types from content types.
        for id in &affected {
            schema = match self
                .repository
                .content_type(*id)
                .await
                .map_err(|e| self.failed(domain, e))?
            {
                Some(content_type) => schema.with_content_type(content_type),
                None => schema.without_content_type(*id),
            };
        }
        self.recompute_schema(domain, live, schema, affected, diagnostics)
            .await
    }

    /// Caller holds the schema, content and media locks.
    async fn recompute_schema(
        &self,
        domain: ChangeDomain,
        live: Arc<CacheSet>,
        schema: SchemaSnapshot,
        affected: BTreeSet<ContentTypeId>,
        diagnostics: Vec<SnapshotError>,
    ) -> FolioResult<SchemaChanges> {
        if self.config.schema_invalidation == SchemaInvalidation::FullRebuild {
            return self
                .publish_schema_rebuild(domain, live, schema, affected, diagnostics)
                .await;
        }

        let draft = self.draft_content();
        let mut draft_editor = TreeEditor::new(draft.tree(), NodeView::Draft, &schema, true);
        let mut published_editor =
            TreeEditor::new(live.content().tree(), NodeView::Published, &schema, false);
        let mut media_editor =
            TreeEditor::new(live.media().tree(), NodeView::Published, &schema, true);

        let content_step = self
            .recompute_types(
                ItemKind::Content,
                &affected,
                &mut [&mut draft_editor, &mut published_editor],
            )
            .await;
        let step = match content_step {
            Ok(()) => {
                self.recompute_types(ItemKind::Media, &affected, &mut [&mut media_editor])
                    .await
            }
            Err(step) => Err(step),
        };
        match step {
            Ok(()) => {}
            Err(Step::Escalate(reason)) => {
                warn!(domain = %domain, reason = %reason, "Escalating to full rebuild");
                drop((draft_editor, published_editor, media_editor));
                return self
                    .publish_schema_rebuild(domain, live, schema, affected, diagnostics)
                    .await;
            }
            Err(Step::Failed(e)) => return Err(self.failed(domain, e)),
        }

        let (draft_tree, draft_changed) = draft_editor.finish();
        let (published_tree, content_changed) = published_editor.finish();
        let (media_tree, media_changed) = media_editor.finish();
        let schema_changed = schema != *live.schema();

        let generation = if schema_changed || content_changed || media_changed {
            let content = content_changed.then(|| ContentCache::new(published_tree, false));
            let media = media_changed.then(|| MediaCache::new(media_tree));
            self.publish(draft_changed.then_some(draft_tree), |latest, generation| {
                latest.with_schema(generation, schema, content, media)
            })
            .generation()
        } else {
            if draft_changed {
                self.set_draft(draft_tree);
            }
            live.generation()
        };
        self.partial_updates.fetch_add(1, Ordering::Relaxed);
        info!(
            domain = %domain,
            generation = generation.sequence,
            affected_types = affected.len(),
            content_changed,
            media_changed,
            "Schema changes applied"
        );
        Ok(SchemaChanges {
            schema_changed,
            draft_changed,
            content_changed,
            media_changed,
            affected_types: affected,
            full_rebuild: false,
            diagnostics,
            generation,
        })
    }

    /// Reload the whole schema from the repository, then rebuild.
    /// Caller holds the schema, content and media locks.
    async fn rebuild_schema(
        &self,
        domain: ChangeDomain,
        affected: BTreeSet<ContentTypeId>,
        diagnostics: Vec<SnapshotError>,
    ) -> FolioResult<SchemaChanges> {
        let live = self.current();
        let content_types = self
            .repository
            .content_types()
            .await
            .map_err(|e| self.failed(domain, e))?;
        let data_types = self
            .repository
            .data_types()
            .await
            .map_err(|e| self.failed(domain, e))?;
        let schema = SchemaSnapshot::new(content_types, data_types);
        self.publish_schema_rebuild(domain, live, schema, affected, diagnostics)
            .await
    }

    async fn publish_schema_rebuild(
        &self,
        domain: ChangeDomain,
        live: Arc<CacheSet>,
        schema: SchemaSnapshot,
        affected: BTreeSet<ContentTypeId>,
        diagnostics: Vec<SnapshotError>,
    ) -> FolioResult<SchemaChanges> {
        let draft = self.draft_content();
        let (draft_tree, published_tree) = self.build_content(&schema).await?;
        let media_tree = self.build_media(&schema).await?;

        let schema_changed = schema != *live.schema();
        let draft_changed = draft_tree != *draft.tree();
        let content_changed = published_tree != *live.content().tree();
        let media_changed = media_tree != *live.media().tree();

        let set = self.publish(Some(draft_tree), |latest, generation| {
            latest.with_schema(
                generation,
                schema,
                Some(ContentCache::new(published_tree, false)),
                Some(MediaCache::new(media_tree)),
            )
        });
        self.full_rebuilds.fetch_add(1, Ordering::Relaxed);
        info!(domain = %domain, generation = set.generation().sequence, "Full rebuild complete");
        Ok(SchemaChanges {
            schema_changed,
            draft_changed,
            content_changed,
            media_changed,
            affected_types: affected,
            full_rebuild: true,
            diagnostics,
            generation: set.generation(),
        })
    }

    // === Domains ===

    pub async fn apply_domain_change(&self, payloads: &[DomainPayload]) -> FolioResult<DomainChanges> {
        self.apply_domains(payloads, Vec::new()).await
    }

    pub(crate) async fn apply_domains(
        &self,
        payloads: &[DomainPayload],
        mut diagnostics: Vec<SnapshotError>,
    ) -> FolioResult<DomainChanges> {
        let domain = ChangeDomain::Domain;
        let _domain = self.domain_lock.lock().await;
        diagnostics.extend(ChangeBatch::Domain(payloads.to_vec()).malformed_entries());
        let live = self.current();

        let refresh_all = payloads
            .iter()
            .any(|p| p.kind == DomainChangeKind::RefreshAll);
        let escalation = self.escalation_reason(payloads.len(), refresh_all, &diagnostics);
        let full_rebuild = escalation.is_some();

        let bindings = match escalation {
            Some(reason) => {
                warn!(domain = %domain, reason = %reason, "Escalating to full rebuild");
                self.repository
                    .domains()
                    .await
                    .map_err(|e| self.failed(domain, e))?
            }
            None => {
                let mut bindings = live.domains().bindings().to_vec();
                for payload in payloads {
                    bindings.retain(|d| d.id != payload.id);
                    if payload.kind == DomainChangeKind::Saved {
                        if let Some(binding) = self
                            .repository
                            .domain(payload.id)
                            .await
                            .map_err(|e| self.failed(domain, e))?
                        {
                            bindings.push(binding);
                        }
                    }
                }
                bindings
            }
        };

        let domains = DomainCache::new(bindings);
        let changed = domains != *live.domains();
        let generation = if changed || full_rebuild {
            self.publish(None, |latest, generation| latest.with_domains(generation, domains))
                .generation()
        } else {
            live.generation()
        };
        if full_rebuild {
            self.full_rebuilds.fetch_add(1, Ordering::Relaxed);
        } else {
            self.partial_updates.fetch_add(1, Ordering::Relaxed);
        }
        debug!(domain = %domain, generation = generation.sequence, changed, "Domain changes applied");
        Ok(DomainChanges {
            changed,
            full_rebuild,
            diagnostics,
            generation,
        })
    }

    // === Status ===

    pub fn status(&self) -> SnapshotStatus {
        let (live, draft) = self.live_with_draft();
        SnapshotStatus {
            generation: live.generation().sequence,
            content_nodes: live.content().len(),
            draft_nodes: draft.len(),
            media_nodes: live.media().len(),
            domains: live.domains().len(),
            content_types: live.schema().content_type_count(),
            data_types: live.schema().data_type_count(),
            full_rebuilds: self.full_rebuilds.load(Ordering::Relaxed),
            partial_updates: self.partial_updates.load(Ordering::Relaxed),
            failed_rebuilds: self.failed_rebuilds.load(Ordering::Relaxed),
            preview_sessions: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::snapshot::TEXT_BOX;
    use chrono::Utc;
    use folio_core::{
        ContentData, ContentType, DataType, DomainBinding, DomainId, NodeRecord, PropertyType,
    };
    use serde_json::json;

    async fn repository() -> Arc<InMemoryRepository> {
        let repo = Arc::new(InMemoryRepository::new());
        repo.save_data_type(DataType::new(DataTypeId(1), "Text", TEXT_BOX))
            .await;
        repo.save_content_type(
            ContentType::new(ContentTypeId(1), "page", ItemKind::Content)
                .with_property(PropertyType::new("title", DataTypeId(1))),
        )
        .await;
        repo.save_content_type(ContentType::new(ContentTypeId(2), "folder", ItemKind::Media))
            .await;
        for (id, parent, name) in [(1, None, "Home"), (2, Some(1), "About"), (3, Some(1), "Blog")] {
            let mut record = NodeRecord::content(
                NodeId(id),
                parent.map(NodeId),
                id,
                ContentTypeId(1),
                ContentData::new(name, Utc::now()).with_value("title", json!(name)),
            );
            record.published = record.draft.clone();
            repo.save_node(record).await;
        }
        repo.save_node(NodeRecord::media(
            NodeId(100),
            None,
            0,
            ContentTypeId(2),
            ContentData::new("Images", Utc::now()),
        ))
        .await;
        repo.save_domain(DomainBinding::new(DomainId(1), "example.com", NodeId(1)))
            .await;
        repo
    }

    async fn store() -> (Arc<InMemoryRepository>, SnapshotStore<InMemoryRepository>) {
        let repo = repository().await;
        let store = SnapshotStore::load(Arc::clone(&repo), CacheConfig::default())
            .await
            .expect("load");
        (repo, store)
    }

    #[tokio::test]
    async fn test_load_builds_every_cache() {
        let (_repo, store) = store().await;
        let set = store.current();
        assert_eq!(set.content().len(), 3);
        assert_eq!(set.media().len(), 1);
        assert_eq!(set.domains().len(), 1);
        assert_eq!(set.generation().sequence, 1);
        let status = store.status();
        assert_eq!(status.full_rebuilds, 1);
        assert_eq!(status.draft_nodes, 3);
    }

    #[tokio::test]
    async fn test_draft_edit_changes_only_draft() {
        let (repo, store) = store().await;
        let before = store.current();
        repo.save_draft(NodeId(2), ContentData::new("About us", Utc::now()))
            .await
            .expect("save draft");
        let changes = store
            .apply_content_change(&[NodePayload::new(2, TreeChangeKind::Updated)])
            .await
            .expect("apply");
        assert!(changes.draft_changed);
        assert!(!changes.published_changed);
        assert!(!changes.full_rebuild);
        assert!(Arc::ptr_eq(&before, &store.current()));
        assert_eq!(
            store.draft_content().get(NodeId(2)).map(|n| n.name.clone()),
            Some("About us".to_string())
        );
    }

    #[tokio::test]
    async fn test_publish_swaps_new_set_and_keeps_old_intact() {
        let (repo, store) = store().await;
        let before = store.current();
        repo.save_draft(NodeId(2), ContentData::new("About us", Utc::now()))
            .await
            .expect("save draft");
        repo.publish(NodeId(2)).await.expect("publish");
        let changes = store
            .apply_content_change(&[NodePayload::new(2, TreeChangeKind::Updated)])
            .await
            .expect("apply");
        assert!(changes.published_changed);
        let after = store.current();
        assert!(after.generation().is_newer_than(&before.generation()));
        assert_eq!(after.content().get(NodeId(2)).map(|n| n.name.as_str()), Some("About us"));
        assert_eq!(before.content().get(NodeId(2)).map(|n| n.name.as_str()), Some("About"));
    }

    #[tokio::test]
    async fn test_unknown_update_escalates() {
        let (_repo, store) = store().await;
        let changes = store
            .apply_content_change(&[NodePayload::new(77, TreeChangeKind::Updated)])
            .await
            .expect("apply");
        assert!(changes.full_rebuild);
        assert!(!changes.published_changed);
    }

    #[tokio::test]
    async fn test_malformed_entry_escalates_with_diagnostic() {
        let (_repo, store) = store().await;
        let changes = store
            .apply_content_change(&[NodePayload::new(-4, TreeChangeKind::Created)])
            .await
            .expect("apply");
        assert!(changes.full_rebuild);
        assert_eq!(changes.diagnostics.len(), 1);
        assert_eq!(store.status().full_rebuilds, 2);
    }

    #[tokio::test]
    async fn test_failed_read_keeps_previous_snapshot() {
        let (repo, store) = store().await;
        let before = store.current();
        repo.set_fail_reads(true);
        let result = store
            .apply_content_change(&[NodePayload::new(2, TreeChangeKind::Moved)])
            .await;
        assert!(result.expect_err("read fails").is_rebuild_failure());
        assert!(Arc::ptr_eq(&before, &store.current()));
        assert_eq!(store.status().failed_rebuilds, 1);
    }

    #[tokio::test]
    async fn test_delete_and_media_independent() {
        let (repo, store) = store().await;
        repo.delete_node(ItemKind::Content, NodeId(3)).await;
        let content = store
            .apply_content_change(&[NodePayload::new(3, TreeChangeKind::Deleted)])
            .await
            .expect("apply");
        assert!(content.published_changed);
        assert!(content.draft_changed);

        let media = store
            .apply_media_change(&[NodePayload::new(100, TreeChangeKind::Updated)])
            .await
            .expect("apply");
        assert!(!media.changed);
        assert_eq!(store.current().content().len(), 2);
    }

    #[tokio::test]
    async fn test_data_type_change_recomputes_values() {
        let (repo, store) = store().await;
        repo.save_data_type(
            DataType::new(DataTypeId(1), "Text", TEXT_BOX).with_configuration(json!({"maxChars": 2})),
        )
        .await;
        let changes = store
            .apply_data_type_change(&[DataTypePayload::new(1, SchemaChangeKind::Updated)])
            .await
            .expect("apply");
        assert!(changes.schema_changed);
        assert!(changes.content_changed);
        assert_eq!(changes.affected_types, BTreeSet::from([ContentTypeId(1)]));
        let set = store.current();
        assert_eq!(
            set.content().get(NodeId(2)).and_then(|n| n.value("title")).cloned(),
            Some(json!("Ab"))
        );
    }

    #[tokio::test]
    async fn test_content_type_of_other_kind_escalates() {
        let (_repo, store) = store().await;
        let changes = store
            .apply_content_type_change(&[ContentTypePayload::new(
                1,
                ItemKind::Media,
                SchemaChangeKind::Updated,
            )])
            .await
            .expect("apply");
        assert!(changes.full_rebuild);
        assert_eq!(store.current().content().len(), 3);

        let changes = store
            .apply_content_type_change(&[ContentTypePayload::new(
                1,
                ItemKind::Content,
                SchemaChangeKind::Updated,
            )])
            .await
            .expect("apply");
        assert!(!changes.full_rebuild);
    }

    #[tokio::test]
    async fn test_domain_change() {
        let (repo, store) = store().await;
        repo.save_domain(DomainBinding::new(DomainId(2), "blog.example.com", NodeId(3)))
            .await;
        let changes = store
            .apply_domain_change(&[DomainPayload::new(2, DomainChangeKind::Saved)])
            .await
            .expect("apply");
        assert!(changes.changed);
        assert_eq!(
            store.current().domains().by_name("blog.example.com").map(|d| d.id),
            Some(DomainId(2))
        );

        let unchanged = store
            .apply_domain_change(&[DomainPayload::new(2, DomainChangeKind::Saved)])
            .await
            .expect("apply");
        assert!(!unchanged.changed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_draft_and_live_publish_together() {
        let (repo, store) = store().await;
        let store = Arc::new(store);

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for round in 0..50 {
                    repo.save_draft(NodeId(2), ContentData::new(format!("Rev {}", round), Utc::now()))
                        .await
                        .expect("save draft");
                    repo.publish(NodeId(2)).await.expect("publish");
                    store
                        .apply_content_change(&[NodePayload::new(2, TreeChangeKind::Updated)])
                        .await
                        .expect("apply");
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for _ in 0..500 {
                        let (live, draft) = store.live_with_draft();
                        assert_eq!(
                            live.content().get(NodeId(2)).map(|n| n.name.clone()),
                            draft.get(NodeId(2)).map(|n| n.name.clone()),
                            "draft paired with generation {}",
                            live.generation()
                        );
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        writer.await.expect("writer");
        for reader in readers {
            reader.await.expect("reader");
        }
        let (live, draft) = store.live_with_draft();
        assert_eq!(live.content().get(NodeId(2)).map(|n| n.name.as_str()), Some("Rev 49"));
        assert_eq!(draft.get(NodeId(2)).map(|n| n.name.as_str()), Some("Rev 49"));
    }
}
