//! Preview sessions.
//!
//! Each session owns a private overlay CacheSet: the live set with the draft
//! state of the previewed content layered over it. Sessions are keyed by an
//! opaque token in a concurrent map, so lookups for one token never block
//! writers of another.
//!
//! Map guards are never held across an `.await`. Overlay builds run off the
//! map and are written back with a revision check; a session touched in the
//! meantime is marked stale instead of being overwritten.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use folio_core::{
    ChangeDomain, FolioError, FolioResult, ItemKind, NodeId, NodeView, PreviewError, PreviewScope,
    PreviewToken, SnapshotError, UserId,
};
use tracing::{debug, info, warn};

use crate::repository::ContentRepository;
use crate::snapshot::{CacheSet, ContentCache, EditError, TreeEditor};
use crate::store::SnapshotStore;

/// One active preview session.
#[derive(Debug, Clone)]
pub struct PreviewSession {
    token: PreviewToken,
    user: UserId,
    content_id: NodeId,
    created_at: DateTime<Utc>,
    /// Nodes whose draft branches are layered over the live tree.
    roots: BTreeSet<NodeId>,
    overlay: Arc<CacheSet>,
    stale: bool,
    /// Bumped on every write to the session.
    revision: u64,
}

impl PreviewSession {
    pub fn token(&self) -> &PreviewToken {
        &self.token
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// The node the session was entered for.
    pub fn content_id(&self) -> NodeId {
        self.content_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn roots(&self) -> &BTreeSet<NodeId> {
        &self.roots
    }

    /// The last built overlay. May be stale; use
    /// [`PreviewRegistry::resolve`] to read through a rebuild.
    pub fn overlay(&self) -> &Arc<CacheSet> {
        &self.overlay
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }
}

fn unknown(token: &PreviewToken) -> FolioError {
    PreviewError::UnknownToken {
        token: token.to_string(),
    }
    .into()
}

fn preview_failure(err: impl std::fmt::Display) -> FolioError {
    SnapshotError::rebuild(ChangeDomain::Content, err).into()
}

impl From<EditError> for FolioError {
    fn from(err: EditError) -> Self {
        preview_failure(err)
    }
}

/// Registry of preview sessions keyed by token.
#[derive(Debug, Default)]
pub struct PreviewRegistry {
    sessions: DashMap<PreviewToken, PreviewSession>,
    issued: AtomicU64,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session for `user` previewing `content_id`.
    ///
    /// Never fails: when the overlay cannot be built the session starts on
    /// the live set, marked stale, and the build is retried on resolve.
    ///
    /// The session is registered stale before its overlay is built, so an
    /// invalidation landing during the build is not lost.
    pub async fn enter_preview<R: ContentRepository + ?Sized>(
        &self,
        store: &SnapshotStore<R>,
        user: UserId,
        content_id: NodeId,
    ) -> PreviewToken {
        let token = PreviewToken::issue(self.issued.fetch_add(1, Ordering::SeqCst) + 1);
        let roots = BTreeSet::from([content_id]);
        self.sessions.insert(
            token.clone(),
            PreviewSession {
                token: token.clone(),
                user: user.clone(),
                content_id,
                created_at: Utc::now(),
                roots: roots.clone(),
                overlay: live_fallback(store, &token),
                stale: true,
                revision: 0,
            },
        );

        match build_overlay(store, &token, None, &roots).await {
            Ok(built) => {
                let generation = built.generation().sequence;
                let installed = self.install(store, &token, 0, built);
                info!(token = %token, user = %user, node_id = %content_id, generation, stale = !installed, "Preview entered");
            }
            Err(err) => {
                warn!(token = %token, node_id = %content_id, error = %err, "Preview overlay build failed, serving live content");
            }
        }
        token
    }

    /// Install `built` as the session's overlay if nothing wrote to the
    /// session since `revision` and the live set has not moved past the
    /// overlay's generation. An outpaced overlay leaves the session stale.
    fn install<R: ContentRepository + ?Sized>(
        &self,
        store: &SnapshotStore<R>,
        token: &PreviewToken,
        revision: u64,
        built: Arc<CacheSet>,
    ) -> bool {
        let live = store.current().generation();
        let Some(mut session) = self.sessions.get_mut(token) else {
            return false;
        };
        if session.revision != revision {
            return false;
        }
        if built.generation() != live {
            session.stale = true;
            return false;
        }
        session.overlay = built;
        session.stale = false;
        session.revision += 1;
        true
    }

    /// Rebuild the overlay's data for `content_id`, keeping the session.
    pub async fn refresh_preview<R: ContentRepository + ?Sized>(
        &self,
        store: &SnapshotStore<R>,
        token: &PreviewToken,
        content_id: NodeId,
    ) -> FolioResult<()> {
        let (revision, stale, mut roots, overlay) = {
            let session = self.sessions.get(token).ok_or_else(|| unknown(token))?;
            (
                session.revision,
                session.stale,
                session.roots.clone(),
                Arc::clone(&session.overlay),
            )
        };
        roots.insert(content_id);

        let live = store.current();
        let patchable = !stale && shares_live_caches(&overlay, &live);
        let built = if patchable {
            build_overlay(store, token, Some(&overlay), &BTreeSet::from([content_id])).await
        } else {
            build_overlay(store, token, None, &roots).await
        };

        let live = store.current().generation();
        let mut session = self.sessions.get_mut(token).ok_or_else(|| unknown(token))?;
        let untouched = session.revision == revision;
        session.roots.insert(content_id);
        session.revision += 1;
        match built {
            Ok(built) if untouched && built.generation() == live => {
                session.overlay = built;
                session.stale = false;
                debug!(token = %token, node_id = %content_id, patched = patchable, "Preview refreshed");
                Ok(())
            }
            Ok(_) => {
                // Written concurrently or outpaced by a publish; the next
                // resolve rebuilds from scratch.
                session.stale = true;
                Ok(())
            }
            Err(err) => {
                session.stale = true;
                Err(err)
            }
        }
    }

    /// Release a session. Unknown and already-exited tokens are a no-op.
    pub fn exit_preview(&self, token: &PreviewToken) -> bool {
        let removed = self.sessions.remove(token).is_some();
        if removed {
            info!(token = %token, "Preview exited");
        }
        removed
    }

    /// The overlay for an active session, rebuilt first when stale.
    ///
    /// A failed rebuild keeps serving the last good overlay.
    pub async fn resolve<R: ContentRepository + ?Sized>(
        &self,
        store: &SnapshotStore<R>,
        token: &PreviewToken,
    ) -> FolioResult<Arc<CacheSet>> {
        let (revision, stale, roots, overlay) = {
            let session = self.sessions.get(token).ok_or_else(|| unknown(token))?;
            (
                session.revision,
                session.stale,
                session.roots.clone(),
                Arc::clone(&session.overlay),
            )
        };
        if !stale {
            return Ok(overlay);
        }

        match build_overlay(store, token, None, &roots).await {
            Ok(built) => {
                if !self.sessions.contains_key(token) {
                    return Err(unknown(token));
                }
                self.install(store, token, revision, Arc::clone(&built));
                debug!(token = %token, generation = built.generation().sequence, "Stale preview rebuilt");
                Ok(built)
            }
            Err(err) => {
                warn!(token = %token, error = %err, "Preview rebuild failed, serving last overlay");
                Ok(overlay)
            }
        }
    }

    /// Mark every session matching `predicate` stale. Returns how many.
    pub fn mark_stale(&self, predicate: impl Fn(&PreviewSession) -> bool) -> usize {
        let mut marked = 0;
        for mut session in self.sessions.iter_mut() {
            if predicate(&session) {
                session.stale = true;
                session.revision += 1;
                marked += 1;
            }
        }
        marked
    }

    pub fn mark_all_stale(&self) -> usize {
        self.mark_stale(|_| true)
    }

    /// Rebuild every stale session now. Returns how many were rebuilt.
    pub async fn rebuild_stale<R: ContentRepository + ?Sized>(
        &self,
        store: &SnapshotStore<R>,
    ) -> usize {
        let stale: Vec<PreviewToken> = self
            .sessions
            .iter()
            .filter(|s| s.stale)
            .map(|s| s.key().clone())
            .collect();
        let mut rebuilt = 0;
        for token in stale {
            if self.resolve(store, &token).await.is_ok() && self.session(&token).is_some_and(|s| !s.stale) {
                rebuilt += 1;
            }
        }
        rebuilt
    }

    /// Exit every session created more than `age` ago.
    pub fn exit_older_than(&self, age: Duration) -> Vec<PreviewToken> {
        let cutoff = Utc::now() - age;
        let mut exited = Vec::new();
        self.sessions.retain(|token, session| {
            let keep = session.created_at >= cutoff;
            if !keep {
                exited.push(token.clone());
            }
            keep
        });
        if !exited.is_empty() {
            info!(count = exited.len(), "Expired preview sessions exited");
        }
        exited
    }

    pub fn sessions_for_user(&self, user: &UserId) -> Vec<PreviewToken> {
        self.sessions
            .iter()
            .filter(|s| s.user == *user)
            .map(|s| s.key().clone())
            .collect()
    }

    /// A copy of the session's current state.
    pub fn session(&self, token: &PreviewToken) -> Option<PreviewSession> {
        self.sessions.get(token).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Whether an overlay was seeded from the live generation and still sits on
/// its media, domains and schema.
fn shares_live_caches(overlay: &CacheSet, live: &CacheSet) -> bool {
    overlay.generation() == live.generation()
        && Arc::ptr_eq(overlay.schema_arc(), live.schema_arc())
        && Arc::ptr_eq(overlay.media_arc(), live.media_arc())
        && Arc::ptr_eq(overlay.domains_arc(), live.domains_arc())
}

fn live_fallback<R: ContentRepository + ?Sized>(
    store: &SnapshotStore<R>,
    token: &PreviewToken,
) -> Arc<CacheSet> {
    let live = store.current();
    let content = ContentCache::new(live.content().tree().clone(), true);
    Arc::new(live.as_ref().clone().into_preview(token.clone(), content))
}

/// Build an overlay. With `base` the listed roots are patched into that
/// overlay; without it the overlay is rebuilt from the live set.
async fn build_overlay<R: ContentRepository + ?Sized>(
    store: &SnapshotStore<R>,
    token: &PreviewToken,
    base: Option<&Arc<CacheSet>>,
    roots: &BTreeSet<NodeId>,
) -> FolioResult<Arc<CacheSet>> {
    let (seed, content) = match (base, store.config().preview_scope) {
        (Some(overlay), _) => (Arc::clone(overlay), Arc::clone(overlay.content_arc())),
        (None, PreviewScope::Subtree) => {
            let live = store.current();
            let content = Arc::clone(live.content_arc());
            (live, content)
        }
        (None, PreviewScope::WholeTree) => store.live_with_draft(),
    };

    let mut editor = TreeEditor::new(content.tree(), NodeView::Draft, seed.schema(), false);
    for root in roots {
        overlay_branch(store.repository().as_ref(), &mut editor, *root).await?;
    }
    let (tree, _) = editor.finish();
    let overlay = seed
        .as_ref()
        .clone()
        .into_preview(token.clone(), ContentCache::new(tree, true));
    Ok(Arc::new(overlay))
}

/// Layer the draft branch of `root` over the editor's tree, chaining in any
/// draft-only ancestors it needs to hang from.
async fn overlay_branch<R: ContentRepository + ?Sized>(
    repository: &R,
    editor: &mut TreeEditor<'_>,
    root: NodeId,
) -> FolioResult<()> {
    let kind = ItemKind::Content;
    let Some(record) = repository.node(kind, root).await.map_err(preview_failure)? else {
        editor.remove_branch(root);
        return Ok(());
    };

    let mut chain = Vec::new();
    let mut visited = HashSet::from([root]);
    let mut cursor = record.parent_id;
    while let Some(parent_id) = cursor {
        if editor.tree().contains(parent_id) || !visited.insert(parent_id) {
            break;
        }
        match repository.node(kind, parent_id).await.map_err(preview_failure)? {
            Some(parent) => {
                cursor = parent.parent_id;
                chain.push(parent);
            }
            None => break,
        }
    }
    chain.reverse();
    editor.insert_records(&chain)?;

    let branch = repository.branch(kind, root).await.map_err(preview_failure)?;
    editor.replace_branch(root, &branch)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use chrono::Utc;
    use folio_core::{CacheConfig, ContentData, ContentType, ContentTypeId, NodeRecord};

    async fn store(config: CacheConfig) -> (Arc<InMemoryRepository>, SnapshotStore<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        repo.save_content_type(ContentType::new(ContentTypeId(1), "page", ItemKind::Content))
            .await;
        let mut home = NodeRecord::content(NodeId(1), None, 0, ContentTypeId(1), ContentData::new("Home", Utc::now()));
        home.published = home.draft.clone();
        repo.save_node(home).await;
        let mut news = NodeRecord::content(NodeId(2), Some(NodeId(1)), 0, ContentTypeId(1), ContentData::new("News", Utc::now()));
        news.published = news.draft.clone();
        repo.save_node(news).await;
        // Draft-only folder with a draft-only child.
        repo.save_node(NodeRecord::content(NodeId(3), Some(NodeId(1)), 1, ContentTypeId(1), ContentData::new("Events", Utc::now())))
            .await;
        repo.save_node(NodeRecord::content(NodeId(4), Some(NodeId(3)), 0, ContentTypeId(1), ContentData::new("Launch", Utc::now())))
            .await;
        let store = SnapshotStore::load(Arc::clone(&repo), config).await.expect("load");
        (repo, store)
    }

    #[tokio::test]
    async fn test_subtree_overlay_chains_draft_ancestors() {
        let (_repo, store) = store(CacheConfig::default()).await;
        let previews = PreviewRegistry::new();
        let token = previews
            .enter_preview(&store, UserId::from("alice"), NodeId(4))
            .await;
        let overlay = previews.resolve(&store, &token).await.expect("resolve");
        assert!(overlay.is_preview());
        assert_eq!(overlay.preview_token(), Some(&token));
        assert_eq!(overlay.content().by_route("/home/events/launch").map(|n| n.id), Some(NodeId(4)));
        assert!(!store.current().content().contains(NodeId(4)));
    }

    #[tokio::test]
    async fn test_whole_tree_scope_includes_all_drafts() {
        let config = CacheConfig::default().with_preview_scope(PreviewScope::WholeTree);
        let (_repo, store) = store(config).await;
        let previews = PreviewRegistry::new();
        let token = previews
            .enter_preview(&store, UserId::from("bob"), NodeId(2))
            .await;
        let overlay = previews.resolve(&store, &token).await.expect("resolve");
        assert!(overlay.content().contains(NodeId(3)));
        assert!(overlay.content().contains(NodeId(4)));
    }

    #[tokio::test]
    async fn test_stale_session_rebuilds_on_resolve() {
        let (repo, store) = store(CacheConfig::default()).await;
        let previews = PreviewRegistry::new();
        let token = previews
            .enter_preview(&store, UserId::from("alice"), NodeId(2))
            .await;
        repo.save_draft(NodeId(2), ContentData::new("Latest news", Utc::now()))
            .await
            .expect("save draft");

        let before = previews.resolve(&store, &token).await.expect("resolve");
        assert_eq!(before.content().get(NodeId(2)).map(|n| n.name.as_str()), Some("News"));

        assert_eq!(previews.mark_stale(|s| s.roots().contains(&NodeId(2))), 1);
        let after = previews.resolve(&store, &token).await.expect("resolve");
        assert_eq!(after.content().get(NodeId(2)).map(|n| n.name.as_str()), Some("Latest news"));
        assert!(!previews.session(&token).expect("session").is_stale());
    }

    #[tokio::test]
    async fn test_failed_rebuild_serves_last_overlay() {
        let (repo, store) = store(CacheConfig::default()).await;
        let previews = PreviewRegistry::new();
        let token = previews
            .enter_preview(&store, UserId::from("alice"), NodeId(2))
            .await;
        let first = previews.resolve(&store, &token).await.expect("resolve");
        previews.mark_all_stale();
        repo.set_fail_reads(true);
        let served = previews.resolve(&store, &token).await.expect("resolve");
        assert!(Arc::ptr_eq(&first, &served));
        assert!(previews.session(&token).expect("session").is_stale());
    }

    #[tokio::test]
    async fn test_enter_never_fails() {
        let (repo, store) = store(CacheConfig::default()).await;
        repo.set_fail_reads(true);
        let previews = PreviewRegistry::new();
        let token = previews
            .enter_preview(&store, UserId::from("carol"), NodeId(2))
            .await;
        let session = previews.session(&token).expect("session");
        assert!(session.is_stale());
        assert!(session.overlay().is_preview());
    }

    #[tokio::test]
    async fn test_refresh_after_publish_rebuilds_from_new_generation() {
        let (repo, store) = store(CacheConfig::default()).await;
        let previews = PreviewRegistry::new();
        let token = previews
            .enter_preview(&store, UserId::from("alice"), NodeId(2))
            .await;

        // Published without telling the registry.
        repo.save_draft(NodeId(1), ContentData::new("Start", Utc::now()))
            .await
            .expect("save draft");
        repo.publish(NodeId(1)).await.expect("publish");
        store
            .apply_content_change(&[folio_core::NodePayload::new(1, folio_core::TreeChangeKind::Updated)])
            .await
            .expect("apply");
        let session = previews.session(&token).expect("session");
        assert!(!shares_live_caches(session.overlay(), &store.current()));

        previews.refresh_preview(&store, &token, NodeId(2)).await.expect("refresh");
        let overlay = previews.resolve(&store, &token).await.expect("resolve");
        assert_eq!(overlay.generation(), store.current().generation());
        assert_eq!(overlay.content().get(NodeId(1)).map(|n| n.name.as_str()), Some("Start"));
    }

    #[tokio::test]
    async fn test_outpaced_overlay_is_not_installed() {
        let (repo, store) = store(CacheConfig::default()).await;
        let previews = PreviewRegistry::new();
        let token = previews
            .enter_preview(&store, UserId::from("alice"), NodeId(2))
            .await;
        let session = previews.session(&token).expect("session");
        assert!(!session.is_stale());
        let built = build_overlay(&store, &token, None, session.roots())
            .await
            .expect("build");

        repo.save_draft(NodeId(1), ContentData::new("Start", Utc::now()))
            .await
            .expect("save draft");
        repo.publish(NodeId(1)).await.expect("publish");
        store
            .apply_content_change(&[folio_core::NodePayload::new(1, folio_core::TreeChangeKind::Updated)])
            .await
            .expect("apply");

        assert!(!previews.install(&store, &token, session.revision(), built));
        assert!(previews.session(&token).expect("session").is_stale());
        let overlay = previews.resolve(&store, &token).await.expect("resolve");
        assert_eq!(overlay.content().get(NodeId(1)).map(|n| n.name.as_str()), Some("Start"));
    }

    #[tokio::test]
    async fn test_housekeeping() {
        let (_repo, store) = store(CacheConfig::default()).await;
        let previews = PreviewRegistry::new();
        let alice = UserId::from("alice");
        let first = previews.enter_preview(&store, alice.clone(), NodeId(2)).await;
        let second = previews.enter_preview(&store, alice.clone(), NodeId(2)).await;
        previews.enter_preview(&store, UserId::from("bob"), NodeId(1)).await;
        assert_ne!(first, second);

        let mut mine = previews.sessions_for_user(&alice);
        mine.sort();
        let mut expected = vec![first.clone(), second.clone()];
        expected.sort();
        assert_eq!(mine, expected);

        assert!(previews.exit_older_than(Duration::hours(1)).is_empty());
        assert_eq!(previews.exit_older_than(Duration::zero() - Duration::seconds(1)).len(), 3);
        assert!(previews.is_empty());
        assert!(!previews.exit_preview(&first));
    }
}
