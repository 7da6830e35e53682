//! ChangeNotifier: the single entry point for change batches.
//!
//! Every batch is applied to the store under its domain's writer lock, then
//! preview sessions whose overlays may now differ are marked stale.

use std::collections::BTreeSet;
use std::sync::Arc;

use folio_core::{
    ChangeBatch, ChangeDomain, ContentTypeId, ContentTypePayload, DataTypePayload, DomainPayload,
    FolioResult, NodePayload, PreviewScope, SnapshotError, WireBatch,
};
use tracing::{debug, info, warn};

use crate::preview::{PreviewRegistry, PreviewSession};
use crate::repository::ContentRepository;
use crate::store::{ContentChanges, DomainChanges, MediaChanges, SchemaChanges, SnapshotStore};

/// Domain-specific result of one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedChanges {
    Content(ContentChanges),
    Media(MediaChanges),
    ContentType(SchemaChanges),
    DataType(SchemaChanges),
    Domain(DomainChanges),
}

/// Result of [`ChangeNotifier::notify`].
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyOutcome {
    pub changes: AppliedChanges,
    /// Preview sessions marked stale by this batch.
    pub stale_previews: usize,
}

impl NotifyOutcome {
    pub fn domain(&self) -> ChangeDomain {
        match &self.changes {
            AppliedChanges::Content(_) => ChangeDomain::Content,
            AppliedChanges::Media(_) => ChangeDomain::Media,
            AppliedChanges::ContentType(_) => ChangeDomain::ContentType,
            AppliedChanges::DataType(_) => ChangeDomain::DataType,
            AppliedChanges::Domain(_) => ChangeDomain::Domain,
        }
    }

    pub fn full_rebuild(&self) -> bool {
        match &self.changes {
            AppliedChanges::Content(c) => c.full_rebuild,
            AppliedChanges::Media(c) => c.full_rebuild,
            AppliedChanges::ContentType(c) | AppliedChanges::DataType(c) => c.full_rebuild,
            AppliedChanges::Domain(c) => c.full_rebuild,
        }
    }

    pub fn diagnostics(&self) -> &[SnapshotError] {
        match &self.changes {
            AppliedChanges::Content(c) => &c.diagnostics,
            AppliedChanges::Media(c) => &c.diagnostics,
            AppliedChanges::ContentType(c) | AppliedChanges::DataType(c) => &c.diagnostics,
            AppliedChanges::Domain(c) => &c.diagnostics,
        }
    }

    /// `(draft_changed, published_changed)` for a content batch.
    pub fn content_flags(&self) -> Option<(bool, bool)> {
        match &self.changes {
            AppliedChanges::Content(c) => Some((c.draft_changed, c.published_changed)),
            _ => None,
        }
    }
}

/// Routes change batches to the store and keeps previews honest.
pub struct ChangeNotifier<R: ContentRepository + ?Sized> {
    store: Arc<SnapshotStore<R>>,
    previews: Arc<PreviewRegistry>,
}

impl<R: ContentRepository + ?Sized> ChangeNotifier<R> {
    pub fn new(store: Arc<SnapshotStore<R>>, previews: Arc<PreviewRegistry>) -> Self {
        Self { store, previews }
    }

    /// Apply a typed batch.
    pub async fn notify(&self, batch: ChangeBatch) -> FolioResult<NotifyOutcome> {
        self.dispatch(batch, Vec::new()).await
    }

    /// Classify and apply a batch as delivered by the transport. Entries that
    /// cannot be classified escalate the domain to a full rebuild.
    pub async fn notify_wire(&self, wire: WireBatch) -> FolioResult<NotifyOutcome> {
        let classified = wire.classify();
        for diagnostic in &classified.malformed {
            warn!(domain = %diagnostic.domain(), error = %diagnostic, "Unclassifiable payload");
        }
        self.dispatch(classified.batch, classified.malformed).await
    }

    async fn dispatch(
        &self,
        batch: ChangeBatch,
        malformed: Vec<SnapshotError>,
    ) -> FolioResult<NotifyOutcome> {
        info!(domain = %batch.domain(), payloads = batch.len(), "Change batch received");
        let (changes, stale_previews) = match batch {
            ChangeBatch::Content(payloads) => {
                let (changes, stale) = self.content(&payloads, malformed).await?;
                (AppliedChanges::Content(changes), stale)
            }
            ChangeBatch::Media(payloads) => {
                let (changes, stale) = self.media(&payloads, malformed).await?;
                (AppliedChanges::Media(changes), stale)
            }
            ChangeBatch::ContentType(payloads) => {
                let (changes, stale) = self.content_types(&payloads, malformed).await?;
                (AppliedChanges::ContentType(changes), stale)
            }
            ChangeBatch::DataType(payloads) => {
                let (changes, stale) = self.data_types(&payloads, malformed).await?;
                (AppliedChanges::DataType(changes), stale)
            }
            ChangeBatch::Domain(payloads) => {
                let (changes, stale) = self.domains(&payloads, malformed).await?;
                (AppliedChanges::Domain(changes), stale)
            }
        };
        Ok(NotifyOutcome {
            changes,
            stale_previews,
        })
    }

    pub async fn notify_content(&self, payloads: &[NodePayload]) -> FolioResult<ContentChanges> {
        Ok(self.content(payloads, Vec::new()).await?.0)
    }

    pub async fn notify_media(&self, payloads: &[NodePayload]) -> FolioResult<MediaChanges> {
        Ok(self.media(payloads, Vec::new()).await?.0)
    }

    pub async fn notify_content_type(
        &self,
        payloads: &[ContentTypePayload],
    ) -> FolioResult<SchemaChanges> {
        Ok(self.content_types(payloads, Vec::new()).await?.0)
    }

    pub async fn notify_data_type(&self, payloads: &[DataTypePayload]) -> FolioResult<SchemaChanges> {
        Ok(self.data_types(payloads, Vec::new()).await?.0)
    }

    pub async fn notify_domain(&self, payloads: &[DomainPayload]) -> FolioResult<DomainChanges> {
        Ok(self.domains(payloads, Vec::new()).await?.0)
    }

    async fn content(
        &self,
        payloads: &[NodePayload],
        malformed: Vec<SnapshotError>,
    ) -> FolioResult<(ContentChanges, usize)> {
        let changes = self.store.apply_content(payloads, malformed).await?;
        let stale = self.invalidate_content(&changes);
        self.settle(stale).await;
        Ok((changes, stale))
    }

    async fn media(
        &self,
        payloads: &[NodePayload],
        malformed: Vec<SnapshotError>,
    ) -> FolioResult<(MediaChanges, usize)> {
        let changes = self.store.apply_media(payloads, malformed).await?;
        let stale = if changes.changed || changes.full_rebuild {
            self.previews.mark_all_stale()
        } else {
            0
        };
        self.settle(stale).await;
        Ok((changes, stale))
    }

    async fn content_types(
        &self,
        payloads: &[ContentTypePayload],
        malformed: Vec<SnapshotError>,
    ) -> FolioResult<(SchemaChanges, usize)> {
        let changes = self.store.apply_content_types(payloads, malformed).await?;
        let stale = self.invalidate_schema(&changes);
        self.settle(stale).await;
        Ok((changes, stale))
    }

    async fn data_types(
        &self,
        payloads: &[DataTypePayload],
        malformed: Vec<SnapshotError>,
    ) -> FolioResult<(SchemaChanges, usize)> {
        let changes = self.store.apply_data_types(payloads, malformed).await?;
        let stale = self.invalidate_schema(&changes);
        self.settle(stale).await;
        Ok((changes, stale))
    }

    async fn domains(
        &self,
        payloads: &[DomainPayload],
        malformed: Vec<SnapshotError>,
    ) -> FolioResult<(DomainChanges, usize)> {
        let changes = self.store.apply_domains(payloads, malformed).await?;
        let stale = if changes.changed || changes.full_rebuild {
            self.previews.mark_all_stale()
        } else {
            0
        };
        self.settle(stale).await;
        Ok((changes, stale))
    }

    /// Rebuild stale overlays now unless they are left for their next resolve.
    async fn settle(&self, stale: usize) {
        if stale > 0 && !self.store.config().lazy_preview_rebuild {
            let rebuilt = self.previews.rebuild_stale(&self.store).await;
            debug!(stale, rebuilt, "Stale previews rebuilt eagerly");
        }
    }

    // === Preview invalidation ===

    fn invalidate_content(&self, changes: &ContentChanges) -> usize {
        if changes.published_changed || changes.full_rebuild {
            return self.previews.mark_all_stale();
        }
        if !changes.draft_changed {
            return 0;
        }
        if self.store.config().preview_scope == PreviewScope::WholeTree {
            return self.previews.mark_all_stale();
        }
        let draft = self.store.draft_content();
        self.previews.mark_stale(|session| {
            changes.affected_ids.iter().any(|id| {
                session.overlay().content().contains(*id)
                    || draft
                        .get(*id)
                        .is_some_and(|node| node.path.iter().any(|p| session.roots().contains(p)))
            })
        })
    }

    fn invalidate_schema(&self, changes: &SchemaChanges) -> usize {
        if changes.full_rebuild || changes.content_changed || changes.media_changed {
            return self.previews.mark_all_stale();
        }
        if !(changes.schema_changed || changes.draft_changed) {
            return 0;
        }
        let affected = &changes.affected_types;
        self.previews.mark_stale(|session| uses_types(session, affected))
    }
}

fn uses_types(session: &PreviewSession, types: &BTreeSet<ContentTypeId>) -> bool {
    session
        .overlay()
        .content()
        .iter()
        .any(|node| types.contains(&node.content_type_id))
}
