//! Preview Session Tests
//!
//! Drafts are visible through a preview token and nowhere else:
//! - The token's overlay shows the draft, the live set keeps the published values
//! - Sessions never see each other's nodes
//! - Exited tokens resolve to `UnknownToken`
//! - Refreshing without repository changes yields an identical overlay

use folio_cache::{CacheBinding, OperationContext};
use folio_core::{CacheConfig, NodePayload, PreviewScope, PreviewToken, TreeChangeKind, UserId};
use folio_test_utils::assertions::assert_unknown_token;
use folio_test_utils::fixtures::{
    article_draft, sample_service, ARTICLES_ID, ARTICLE_ID, DRAFT_ARTICLE_ID, HOME_ID,
};
use folio_test_utils::init_test_tracing;
use serde_json::json;

#[tokio::test]
async fn test_preview_shows_draft_while_live_keeps_published() {
    init_test_tracing();
    let (repo, service) = sample_service(CacheConfig::default()).await.unwrap();

    let token = service
        .enter_preview(UserId::new("alice"), ARTICLE_ID)
        .await;
    let before = service.resolve_preview(&token).await.unwrap();
    assert_eq!(
        before.content().get(ARTICLE_ID).unwrap().value("title"),
        Some(&json!("Hello World"))
    );

    // Edited after entering; only the refresh brings it into the overlay.
    repo.save_draft(ARTICLE_ID, article_draft("Draft Title"))
        .await
        .unwrap();
    service.refresh_preview(&token, ARTICLE_ID).await.unwrap();

    let overlay = service.resolve_preview(&token).await.unwrap();
    let node = overlay.content().get(ARTICLE_ID).unwrap();
    assert_eq!(node.value("title"), Some(&json!("Draft Title")));
    assert!(node.is_draft);
    assert_eq!(overlay.preview_token(), Some(&token));

    let live = service.create_published_caches(None).await;
    let node = live.content().get(ARTICLE_ID).unwrap();
    assert_eq!(node.value("title"), Some(&json!("Hello World")));
    assert!(!live.is_preview());
}

#[tokio::test]
async fn test_preview_overlay_keeps_unrelated_published_nodes() {
    let (_repo, service) = sample_service(CacheConfig::default()).await.unwrap();
    let token = service
        .enter_preview(UserId::new("alice"), ARTICLE_ID)
        .await;
    let overlay = service.resolve_preview(&token).await.unwrap();

    assert!(overlay.content().contains(HOME_ID));
    assert!(overlay.content().contains(ARTICLES_ID));
    // Draft-only siblings stay out of a subtree preview of another node.
    assert!(!overlay.content().contains(DRAFT_ARTICLE_ID));
    // Media and domains are shared with the live set.
    let live = service.store().current();
    assert_eq!(overlay.media().len(), live.media().len());
    assert_eq!(overlay.domains().len(), live.domains().len());
}

#[tokio::test]
async fn test_preview_of_draft_only_node() {
    let (_repo, service) = sample_service(CacheConfig::default()).await.unwrap();
    assert!(!service.store().current().content().contains(DRAFT_ARTICLE_ID));

    let token = service
        .enter_preview(UserId::new("alice"), DRAFT_ARTICLE_ID)
        .await;
    let overlay = service.resolve_preview(&token).await.unwrap();
    let node = overlay.content().get(DRAFT_ARTICLE_ID).unwrap();
    assert_eq!(node.parent_id, Some(ARTICLES_ID));
    assert_eq!(node.value("title"), Some(&json!("Coming Soon")));
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (_repo, service) = sample_service(CacheConfig::default()).await.unwrap();
    let alice = service
        .enter_preview(UserId::new("alice"), DRAFT_ARTICLE_ID)
        .await;
    let bob = service.enter_preview(UserId::new("bob"), ARTICLE_ID).await;
    assert_ne!(alice, bob);

    let alice_view = service.resolve_preview(&alice).await.unwrap();
    let bob_view = service.resolve_preview(&bob).await.unwrap();
    assert!(alice_view.content().contains(DRAFT_ARTICLE_ID));
    assert!(!bob_view.content().contains(DRAFT_ARTICLE_ID));

    assert_eq!(
        service.previews().sessions_for_user(&UserId::new("alice")),
        vec![alice.clone()]
    );
    assert_eq!(service.status().preview_sessions, 2);
}

#[tokio::test]
async fn test_exit_then_resolve_is_unknown_token() {
    let (_repo, service) = sample_service(CacheConfig::default()).await.unwrap();
    let token = service
        .enter_preview(UserId::new("alice"), ARTICLE_ID)
        .await;

    service.exit_preview(&token);
    assert_unknown_token(&service.resolve_preview(&token).await);
    assert_unknown_token(&service.refresh_preview(&token, ARTICLE_ID).await);

    // A second exit is a no-op.
    service.exit_preview(&token);
    assert!(!service.previews().exit_preview(&token));
    assert!(service.previews().is_empty());
}

#[tokio::test]
async fn test_unknown_token_falls_back_to_live_for_readers() {
    let (_repo, service) = sample_service(CacheConfig::default()).await.unwrap();
    let token = PreviewToken::from_transport("never-issued");

    let set = service.create_published_caches(Some(&token)).await;
    assert!(!set.is_preview());
    assert_eq!(
        set.generation(),
        service.store().current().generation()
    );

    let ctx = OperationContext::with_preview(token);
    assert!(!service.current_caches(&ctx).await.is_preview());
}

#[tokio::test]
async fn test_operation_context_binding() {
    let (repo, service) = sample_service(CacheConfig::default()).await.unwrap();
    repo.save_draft(ARTICLE_ID, article_draft("Bound"))
        .await
        .unwrap();
    let token = service
        .enter_preview(UserId::new("alice"), ARTICLE_ID)
        .await;

    let mut ctx = OperationContext::new();
    assert!(!service.current_caches(&ctx).await.is_preview());

    ctx.bind_override(CacheBinding::Preview(token.clone()));
    let bound = service.current_caches(&ctx).await;
    assert_eq!(
        bound.content().get(ARTICLE_ID).unwrap().value("title"),
        Some(&json!("Bound"))
    );

    let pinned = service.store().current();
    let previous = ctx.bind_override(CacheBinding::CacheSet(pinned.clone()));
    assert!(matches!(previous, Some(CacheBinding::Preview(_))));
    assert_eq!(
        service.current_caches(&ctx).await.generation(),
        pinned.generation()
    );

    ctx.unbind_override();
    assert!(ctx.binding().is_none());
}

#[tokio::test]
async fn test_refresh_without_changes_is_idempotent() {
    let (repo, service) = sample_service(CacheConfig::default()).await.unwrap();
    repo.save_draft(ARTICLE_ID, article_draft("Once"))
        .await
        .unwrap();
    let token = service
        .enter_preview(UserId::new("alice"), ARTICLE_ID)
        .await;

    service.refresh_preview(&token, ARTICLE_ID).await.unwrap();
    let first = service.resolve_preview(&token).await.unwrap().fingerprint();
    service.refresh_preview(&token, ARTICLE_ID).await.unwrap();
    let second = service.resolve_preview(&token).await.unwrap().fingerprint();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_draft_notification_marks_preview_stale_and_resolve_rebuilds() {
    let (repo, service) = sample_service(CacheConfig::default()).await.unwrap();
    let token = service
        .enter_preview(UserId::new("alice"), ARTICLE_ID)
        .await;

    repo.save_draft(ARTICLE_ID, article_draft("Edited Elsewhere"))
        .await
        .unwrap();
    let changes = service
        .notify_content(&[NodePayload::new(ARTICLE_ID, TreeChangeKind::Updated)])
        .await
        .unwrap();
    assert!(changes.draft_changed);
    assert!(!changes.published_changed);
    assert!(service.previews().session(&token).unwrap().is_stale());

    let overlay = service.resolve_preview(&token).await.unwrap();
    assert_eq!(
        overlay.content().get(ARTICLE_ID).unwrap().value("title"),
        Some(&json!("Edited Elsewhere"))
    );
    assert!(!service.previews().session(&token).unwrap().is_stale());
}

#[tokio::test]
async fn test_eager_rebuild_refreshes_stale_sessions_on_notify() {
    let config = CacheConfig::default().with_lazy_preview_rebuild(false);
    let (repo, service) = sample_service(config).await.unwrap();
    let token = service
        .enter_preview(UserId::new("alice"), ARTICLE_ID)
        .await;

    repo.save_draft(ARTICLE_ID, article_draft("Eager"))
        .await
        .unwrap();
    service
        .notify_content(&[NodePayload::new(ARTICLE_ID, TreeChangeKind::Updated)])
        .await
        .unwrap();
    let session = service.previews().session(&token).unwrap();
    assert!(!session.is_stale());
    assert_eq!(
        session.overlay().content().get(ARTICLE_ID).unwrap().value("title"),
        Some(&json!("Eager"))
    );
}

#[tokio::test]
async fn test_whole_tree_scope_shows_every_draft() {
    let config = CacheConfig::default().with_preview_scope(PreviewScope::WholeTree);
    let (_repo, service) = sample_service(config).await.unwrap();
    let token = service
        .enter_preview(UserId::new("alice"), ARTICLE_ID)
        .await;
    let overlay = service.resolve_preview(&token).await.unwrap();
    assert!(overlay.content().contains(DRAFT_ARTICLE_ID));
    assert!(overlay.content().get(HOME_ID).unwrap().is_draft);
}

#[tokio::test]
async fn test_preview_enter_survives_repository_failure() {
    let (repo, service) = sample_service(CacheConfig::default()).await.unwrap();
    repo.set_fail_reads(true);
    let token = service
        .enter_preview(UserId::new("alice"), ARTICLE_ID)
        .await;
    let session = service.previews().session(&token).unwrap();
    assert!(session.is_stale());

    // Still served, from the live content.
    let overlay = service.resolve_preview(&token).await.unwrap();
    assert_eq!(
        overlay.content().get(ARTICLE_ID).unwrap().value("title"),
        Some(&json!("Hello World"))
    );

    repo.set_fail_reads(false);
    assert!(service.resolve_preview(&token).await.is_ok());
    assert!(!service.previews().session(&token).unwrap().is_stale());
}
