//! Folio Test Utilities
//!
//! Shared test infrastructure for the Folio workspace:
//! - Proptest generators for payloads and configuration
//! - A sample site fixture seeded into an in-memory repository
//! - Assertions for Folio error variants
//! - Test tracing initialisation

pub use folio_cache::{InMemoryRepository, PublishedCacheService};
pub use folio_core::{
    CacheConfig, ChangeBatch, ChangeDomain, ContentData, ContentType, ContentTypeId,
    ContentTypePayload, DataType, DataTypeId, DataTypePayload, DomainBinding, DomainChangeKind,
    DomainId, DomainPayload, FolioError, FolioResult, ItemKind, NodeId, NodePayload, NodeRecord,
    PreviewScope, PropertyType, SchemaChangeKind, SchemaInvalidation, TreeChangeKind, UserId,
};

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for payloads and configuration.

    use super::*;
    use proptest::prelude::*;

    /// A node id within the sample site's id range.
    pub fn arb_node_id() -> impl Strategy<Value = NodeId> {
        (1i32..64).prop_map(NodeId)
    }

    pub fn arb_tree_change_kind() -> impl Strategy<Value = TreeChangeKind> {
        prop_oneof![
            4 => Just(TreeChangeKind::Updated),
            2 => Just(TreeChangeKind::Created),
            1 => Just(TreeChangeKind::Moved),
            1 => Just(TreeChangeKind::Sorted),
            1 => Just(TreeChangeKind::Deleted),
        ]
    }

    pub fn arb_node_payload() -> impl Strategy<Value = NodePayload> {
        (arb_node_id(), arb_tree_change_kind()).prop_map(|(id, kind)| NodePayload::new(id, kind))
    }

    /// A well-formed content batch of 1 to `max` entries.
    pub fn arb_content_batch(max: usize) -> impl Strategy<Value = ChangeBatch> {
        prop::collection::vec(arb_node_payload(), 1..=max.max(1)).prop_map(ChangeBatch::Content)
    }

    pub fn arb_schema_change_kind() -> impl Strategy<Value = SchemaChangeKind> {
        prop_oneof![
            Just(SchemaChangeKind::Created),
            Just(SchemaChangeKind::Updated),
            Just(SchemaChangeKind::Removed),
        ]
    }

    pub fn arb_preview_scope() -> impl Strategy<Value = PreviewScope> {
        prop_oneof![Just(PreviewScope::Subtree), Just(PreviewScope::WholeTree)]
    }

    pub fn arb_schema_invalidation() -> impl Strategy<Value = SchemaInvalidation> {
        prop_oneof![
            Just(SchemaInvalidation::AffectedContent),
            Just(SchemaInvalidation::FullRebuild),
        ]
    }

    /// A configuration that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = CacheConfig> {
        (
            arb_preview_scope(),
            any::<bool>(),
            any::<bool>(),
            arb_schema_invalidation(),
            1usize..20_000,
        )
            .prop_map(|(scope, lazy, in_place, invalidation, max)| {
                CacheConfig::default()
                    .with_preview_scope(scope)
                    .with_lazy_preview_rebuild(lazy)
                    .with_in_place_updates(in_place)
                    .with_schema_invalidation(invalidation)
                    .with_max_batch_size(max)
            })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! A small site used across integration tests.
    //!
    //! ```text
    //! 1  Home                 (home, published)
    //! ├─ 40 Articles          (folder page, published)
    //! │  ├─ 42 Hello World    (article, published)
    //! │  └─ 43 Coming Soon    (article, draft only)
    //! └─ 50 About             (page, published)
    //! media: 1000 Images > 1001 Logo
    //! domains: example.com -> 1
    //! ```

    use super::*;
    use chrono::{DateTime, Utc};
    use folio_cache::snapshot::{INTEGER, TAGS, TEXT_BOX, TRUE_FALSE};
    use serde_json::json;
    use std::sync::Arc;

    pub const HOME_ID: NodeId = NodeId(1);
    pub const ARTICLES_ID: NodeId = NodeId(40);
    pub const ARTICLE_ID: NodeId = NodeId(42);
    pub const DRAFT_ARTICLE_ID: NodeId = NodeId(43);
    pub const ABOUT_ID: NodeId = NodeId(50);
    pub const IMAGES_ID: NodeId = NodeId(1000);
    pub const LOGO_ID: NodeId = NodeId(1001);

    pub const TEXT_TYPE: DataTypeId = DataTypeId(1);
    pub const NUMBER_TYPE: DataTypeId = DataTypeId(2);
    pub const FLAG_TYPE: DataTypeId = DataTypeId(3);
    pub const TAGS_TYPE: DataTypeId = DataTypeId(4);

    pub const SEO_TYPE: ContentTypeId = ContentTypeId(10);
    pub const PAGE_TYPE: ContentTypeId = ContentTypeId(11);
    pub const ARTICLE_TYPE: ContentTypeId = ContentTypeId(12);
    pub const FOLDER_TYPE: ContentTypeId = ContentTypeId(20);
    pub const IMAGE_TYPE: ContentTypeId = ContentTypeId(21);

    pub const SITE_DOMAIN: DomainId = DomainId(1);

    /// A fixed timestamp so fixture data compares equal across builds.
    pub fn fixture_time() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    pub fn data_types() -> Vec<DataType> {
        vec![
            DataType::new(TEXT_TYPE, "Short text", TEXT_BOX).with_configuration(json!({"maxChars": 80})),
            DataType::new(NUMBER_TYPE, "Number", INTEGER),
            DataType::new(FLAG_TYPE, "Checkbox", TRUE_FALSE),
            DataType::new(TAGS_TYPE, "Tags", TAGS).with_configuration(json!({"delimiter": ","})),
        ]
    }

    pub fn content_types() -> Vec<ContentType> {
        vec![
            ContentType::new(SEO_TYPE, "seo", ItemKind::Content)
                .with_property(PropertyType::new("metaTitle", TEXT_TYPE))
                .with_property(PropertyType::new("hideFromSearch", FLAG_TYPE)),
            ContentType::new(PAGE_TYPE, "page", ItemKind::Content)
                .with_composition(SEO_TYPE)
                .with_property(PropertyType::new("title", TEXT_TYPE)),
            article_type(),
            ContentType::new(FOLDER_TYPE, "folder", ItemKind::Media),
            ContentType::new(IMAGE_TYPE, "image", ItemKind::Media)
                .with_property(PropertyType::new("altText", TEXT_TYPE)),
        ]
    }

    /// The "article" content type as first seeded.
    pub fn article_type() -> ContentType {
        ContentType::new(ARTICLE_TYPE, "article", ItemKind::Content)
            .with_composition(SEO_TYPE)
            .with_property(PropertyType::new("title", TEXT_TYPE))
            .with_property(PropertyType::new("readingTime", NUMBER_TYPE))
    }

    pub fn page(id: NodeId, parent: Option<NodeId>, sort_order: i32, name: &str) -> NodeRecord {
        let data = ContentData::new(name, fixture_time())
            .with_value("title", json!(name))
            .with_writer("editor");
        let mut record = NodeRecord::content(id, parent, sort_order, PAGE_TYPE, data);
        record.published = record.draft.clone();
        record
    }

    pub fn article(id: NodeId, name: &str, published: bool) -> NodeRecord {
        let data = ContentData::new(name, fixture_time())
            .with_value("title", json!(name))
            .with_value("readingTime", json!("7"))
            .with_value("tags", json!("rust, cache"))
            .with_writer("alice");
        let mut record = NodeRecord::content(id, Some(ARTICLES_ID), id.0, ARTICLE_TYPE, data);
        if published {
            record.published = record.draft.clone();
        }
        record
    }

    /// Seed the sample site into `repository`.
    pub async fn seed_sample_site(repository: &InMemoryRepository) {
        for data_type in data_types() {
            repository.save_data_type(data_type).await;
        }
        for content_type in content_types() {
            repository.save_content_type(content_type).await;
        }
        repository.save_node(page(HOME_ID, None, 0, "Home")).await;
        repository
            .save_node(page(ARTICLES_ID, Some(HOME_ID), 0, "Articles"))
            .await;
        repository
            .save_node(article(ARTICLE_ID, "Hello World", true))
            .await;
        repository
            .save_node(article(DRAFT_ARTICLE_ID, "Coming Soon", false))
            .await;
        repository
            .save_node(page(ABOUT_ID, Some(HOME_ID), 1, "About"))
            .await;
        repository
            .save_node(NodeRecord::media(
                IMAGES_ID,
                None,
                0,
                FOLDER_TYPE,
                ContentData::new("Images", fixture_time()),
            ))
            .await;
        repository
            .save_node(NodeRecord::media(
                LOGO_ID,
                Some(IMAGES_ID),
                0,
                IMAGE_TYPE,
                ContentData::new("Logo", fixture_time()).with_value("altText", json!("Folio logo")),
            ))
            .await;
        repository
            .save_domain(DomainBinding::new(SITE_DOMAIN, "example.com", HOME_ID).with_culture("en-US"))
            .await;
    }

    pub async fn sample_repository() -> Arc<InMemoryRepository> {
        let repository = Arc::new(InMemoryRepository::new());
        seed_sample_site(&repository).await;
        repository
    }

    /// A started service over the sample site, with its repository.
    pub async fn sample_service(
        config: CacheConfig,
    ) -> FolioResult<(
        Arc<InMemoryRepository>,
        PublishedCacheService<InMemoryRepository>,
    )> {
        let repository = sample_repository().await;
        let service = PublishedCacheService::start(Arc::clone(&repository), config).await?;
        Ok((repository, service))
    }

    /// Replacement draft data for an article, keeping its other values.
    pub fn article_draft(title: &str) -> ContentData {
        ContentData::new("Hello World", Utc::now())
            .with_value("title", json!(title))
            .with_value("readingTime", json!("7"))
            .with_value("tags", json!("rust, cache"))
            .with_writer("alice")
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Folio error variants.

    use super::*;

    #[track_caller]
    pub fn assert_unknown_token<T: std::fmt::Debug>(result: &FolioResult<T>) {
        match result {
            Err(err) if err.is_unknown_token() => {}
            other => panic!("Expected UnknownToken, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_rebuild_failure<T: std::fmt::Debug>(result: &FolioResult<T>) {
        match result {
            Err(err) if err.is_rebuild_failure() => {}
            other => panic!("Expected RebuildFailure, got: {:?}", other),
        }
    }
}
