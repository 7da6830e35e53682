//! Published cache service: the public surface over store, previews and
//! notifications.

use std::sync::Arc;

use folio_core::{
    CacheConfig, ChangeBatch, ContentTypePayload, DataTypePayload, DomainPayload, FolioResult,
    NodeId, NodePayload, PreviewToken, UserId, WireBatch,
};
use tracing::info;

use crate::context::{ContextResolver, OperationContext};
use crate::notifier::{ChangeNotifier, NotifyOutcome};
use crate::preview::PreviewRegistry;
use crate::repository::ContentRepository;
use crate::snapshot::CacheSet;
use crate::store::{
    ContentChanges, DomainChanges, MediaChanges, SchemaChanges, SnapshotStatus, SnapshotStore,
};

/// Snapshot-consistent published content cache with preview overlays.
pub struct PublishedCacheService<R: ContentRepository + ?Sized> {
    store: Arc<SnapshotStore<R>>,
    previews: Arc<PreviewRegistry>,
    notifier: ChangeNotifier<R>,
    resolver: ContextResolver<R>,
}

impl<R: ContentRepository + ?Sized> PublishedCacheService<R> {
    /// Validate `config`, build the first snapshot and start serving.
    pub async fn start(repository: Arc<R>, config: CacheConfig) -> FolioResult<Self> {
        let store = Arc::new(SnapshotStore::load(repository, config).await?);
        let previews = Arc::new(PreviewRegistry::new());
        info!(generation = store.current().generation().sequence, "Published cache started");
        Ok(Self {
            notifier: ChangeNotifier::new(Arc::clone(&store), Arc::clone(&previews)),
            resolver: ContextResolver::new(Arc::clone(&store), Arc::clone(&previews)),
            store,
            previews,
        })
    }

    pub fn store(&self) -> &Arc<SnapshotStore<R>> {
        &self.store
    }

    pub fn previews(&self) -> &Arc<PreviewRegistry> {
        &self.previews
    }

    pub fn config(&self) -> &CacheConfig {
        self.store.config()
    }

    // === Readers ===

    /// The live set, or the overlay of `preview` when it names a session.
    pub async fn create_published_caches(&self, preview: Option<&PreviewToken>) -> Arc<CacheSet> {
        match preview {
            Some(token) => self.resolver.preview_or_live(token).await,
            None => self.store.current(),
        }
    }

    /// The set bound to `ctx`.
    pub async fn current_caches(&self, ctx: &OperationContext) -> Arc<CacheSet> {
        self.resolver.current_cache_set(ctx).await
    }

    // === Preview ===

    pub async fn enter_preview(&self, user: UserId, content_id: NodeId) -> PreviewToken {
        self.previews
            .enter_preview(&self.store, user, content_id)
            .await
    }

    pub async fn refresh_preview(&self, token: &PreviewToken, content_id: NodeId) -> FolioResult<()> {
        self.previews
            .refresh_preview(&self.store, token, content_id)
            .await
    }

    pub fn exit_preview(&self, token: &PreviewToken) {
        self.previews.exit_preview(token);
    }

    /// The overlay of an active session; `UnknownToken` otherwise.
    pub async fn resolve_preview(&self, token: &PreviewToken) -> FolioResult<Arc<CacheSet>> {
        self.previews.resolve(&self.store, token).await
    }

    // === Notifications ===

    pub async fn notify(&self, batch: ChangeBatch) -> FolioResult<NotifyOutcome> {
        self.notifier.notify(batch).await
    }

    pub async fn notify_wire(&self, wire: WireBatch) -> FolioResult<NotifyOutcome> {
        self.notifier.notify_wire(wire).await
    }

    pub async fn notify_content(&self, payloads: &[NodePayload]) -> FolioResult<ContentChanges> {
        self.notifier.notify_content(payloads).await
    }

    pub async fn notify_media(&self, payloads: &[NodePayload]) -> FolioResult<MediaChanges> {
        self.notifier.notify_media(payloads).await
    }

    pub async fn notify_content_type(
        &self,
        payloads: &[ContentTypePayload],
    ) -> FolioResult<SchemaChanges> {
        self.notifier.notify_content_type(payloads).await
    }

    pub async fn notify_data_type(&self, payloads: &[DataTypePayload]) -> FolioResult<SchemaChanges> {
        self.notifier.notify_data_type(payloads).await
    }

    pub async fn notify_domain(&self, payloads: &[DomainPayload]) -> FolioResult<DomainChanges> {
        self.notifier.notify_domain(payloads).await
    }

    // === Maintenance ===

    /// Rebuild every domain from the repository. Every preview goes stale.
    pub async fn rebuild_all(&self) -> FolioResult<Arc<CacheSet>> {
        let set = self.store.create_snapshot().await?;
        self.previews.mark_all_stale();
        Ok(set)
    }

    pub fn status(&self) -> SnapshotStatus {
        SnapshotStatus {
            preview_sessions: self.previews.len(),
            ..self.store.status()
        }
    }
}
