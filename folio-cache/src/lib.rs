//! Folio Cache - Snapshot-Consistent Published Content Cache
//!
//! Serves concurrent readers a stable, point-in-time view of a hierarchical
//! content repository while change notifications arrive from the write path,
//! and keeps isolated draft overlays for preview sessions.
//!
//! - [`SnapshotStore`] owns the live [`CacheSet`] and swaps it on rebuild.
//! - [`PreviewRegistry`] keeps one overlay per preview token.
//! - [`ChangeNotifier`] is the single funnel for change batches.
//! - [`ContextResolver`] picks the set an [`OperationContext`] reads.
//! - [`PublishedCacheService`] ties them together.

pub mod context;
pub mod notifier;
pub mod preview;
pub mod repository;
pub mod service;
pub mod snapshot;
pub mod store;

pub use context::{CacheBinding, ContextResolver, OperationContext};
pub use notifier::{AppliedChanges, ChangeNotifier, NotifyOutcome};
pub use preview::{PreviewRegistry, PreviewSession};
pub use repository::{ContentRepository, InMemoryRepository};
pub use service::PublishedCacheService;
pub use snapshot::{
    CacheSet, ContentCache, DomainCache, Generation, MediaCache, PublishedTree, SchemaSnapshot,
};
pub use store::{
    ContentChanges, DomainChanges, MediaChanges, SchemaChanges, SnapshotStatus, SnapshotStore,
};
