//! Folio Core - Entity Types
//!
//! Pure data structures shared by the cache and its collaborators: repository
//! entities, the published model, change payloads, errors and configuration.
//! This crate contains no caching logic.

pub mod config;
pub mod entities;
pub mod error;
pub mod identity;
pub mod payload;
pub mod published;

pub use config::{CacheConfig, PreviewScope, SchemaInvalidation};
pub use entities::{
    ContentData, ContentType, DataType, DomainBinding, ItemKind, NodeRecord, NodeView,
    PropertyType,
};
pub use error::{
    ConfigError, FolioError, FolioResult, PreviewError, RepositoryError, RepositoryResult,
    SnapshotError,
};
pub use identity::{
    compute_content_hash, content_hash_hex, ContentHash, ContentTypeId, DataTypeId, DomainId,
    EntityIdType, NodeId, PreviewToken, Timestamp, UserId,
};
pub use payload::{
    ChangeBatch, ChangeDomain, ClassifiedBatch, ContentTypePayload, DataTypePayload,
    DomainChangeKind, DomainPayload, NodePayload, SchemaChangeKind, TreeChangeKind, WireBatch,
};
pub use published::{url_segment, PublishedContent, PublishedProperty};
