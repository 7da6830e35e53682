//! The read-only CacheSet handle and the caches it composes.

use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use folio_core::{
    compute_content_hash, ContentHash, DomainBinding, DomainId, NodeId, PreviewToken,
    PublishedContent,
};

use super::generation::Generation;
use super::schema::SchemaSnapshot;
use super::tree::PublishedTree;

/// The content tree as seen by readers of one CacheSet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentCache {
    tree: PublishedTree,
    preview: bool,
}

impl ContentCache {
    pub fn new(tree: PublishedTree, preview: bool) -> Self {
        Self { tree, preview }
    }

    /// True when this cache exposes draft data.
    pub fn is_preview(&self) -> bool {
        self.preview
    }

    pub fn tree(&self) -> &PublishedTree {
        &self.tree
    }
}

impl Deref for ContentCache {
    type Target = PublishedTree;

    fn deref(&self) -> &PublishedTree {
        &self.tree
    }
}

/// The media tree. Media has no draft state, so previews share it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaCache(PublishedTree);

impl MediaCache {
    pub fn new(tree: PublishedTree) -> Self {
        Self(tree)
    }

    pub fn tree(&self) -> &PublishedTree {
        &self.0
    }
}

impl Deref for MediaCache {
    type Target = PublishedTree;

    fn deref(&self) -> &PublishedTree {
        &self.0
    }
}

/// Domain bindings ordered by sort order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainCache(Vec<DomainBinding>);

impl DomainCache {
    pub fn new(mut bindings: Vec<DomainBinding>) -> Self {
        bindings.sort_by_key(|d| (d.sort_order, d.id));
        Self(bindings)
    }

    pub fn get(&self, id: DomainId) -> Option<&DomainBinding> {
        self.0.iter().find(|d| d.id == id)
    }

    /// Bindings rooted at the given content node.
    pub fn for_content(&self, id: NodeId) -> Vec<&DomainBinding> {
        self.0
            .iter()
            .filter(|d| d.root_content_id == Some(id))
            .collect()
    }

    /// Host names compare case-insensitively.
    pub fn by_name(&self, name: &str) -> Option<&DomainBinding> {
        self.0
            .iter()
            .find(|d| !d.is_wildcard && d.name.eq_ignore_ascii_case(name))
    }

    /// The closest non-wildcard binding on the node's path.
    pub fn nearest(&self, node: &PublishedContent) -> Option<&DomainBinding> {
        node.path.iter().rev().find_map(|id| {
            self.0
                .iter()
                .find(|d| !d.is_wildcard && d.root_content_id == Some(*id))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainBinding> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn bindings(&self) -> &[DomainBinding] {
        &self.0
    }
}

/// An immutable, point-in-time bundle of the content, media and domain
/// caches plus the schema they were materialised with.
///
/// A CacheSet never changes after construction. Updates build a new set that
/// shares every unchanged cache with its predecessor through `Arc`.
#[derive(Debug, Clone)]
pub struct CacheSet {
    generation: Generation,
    content: Arc<ContentCache>,
    media: Arc<MediaCache>,
    domains: Arc<DomainCache>,
    schema: Arc<SchemaSnapshot>,
    preview: Option<PreviewToken>,
    created_at: DateTime<Utc>,
}

impl CacheSet {
    pub fn new(
        generation: Generation,
        content: Arc<ContentCache>,
        media: Arc<MediaCache>,
        domains: Arc<DomainCache>,
        schema: Arc<SchemaSnapshot>,
    ) -> Self {
        Self {
            generation,
            content,
            media,
            domains,
            schema,
            preview: None,
            created_at: Utc::now(),
        }
    }

    /// An empty set, used before the first build completes.
    pub fn empty() -> Self {
        Self::new(
            Generation::zero(),
            Arc::default(),
            Arc::default(),
            Arc::default(),
            Arc::default(),
        )
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn content(&self) -> &ContentCache {
        &self.content
    }

    pub fn media(&self) -> &MediaCache {
        &self.media
    }

    pub fn domains(&self) -> &DomainCache {
        &self.domains
    }

    pub fn schema(&self) -> &SchemaSnapshot {
        &self.schema
    }

    /// The preview session this set is the overlay of, if any.
    pub fn preview_token(&self) -> Option<&PreviewToken> {
        self.preview.as_ref()
    }

    pub fn is_preview(&self) -> bool {
        self.preview.is_some()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn content_arc(&self) -> &Arc<ContentCache> {
        &self.content
    }

    pub(crate) fn media_arc(&self) -> &Arc<MediaCache> {
        &self.media
    }

    pub(crate) fn domains_arc(&self) -> &Arc<DomainCache> {
        &self.domains
    }

    pub(crate) fn schema_arc(&self) -> &Arc<SchemaSnapshot> {
        &self.schema
    }

    /// Same caches, next generation.
    pub(crate) fn with_generation(&self, generation: Generation) -> Self {
        Self {
            generation,
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    pub(crate) fn with_content(&self, generation: Generation, content: ContentCache) -> Self {
        Self {
            content: Arc::new(content),
            ..self.with_generation(generation)
        }
    }

    pub(crate) fn with_media(&self, generation: Generation, media: MediaCache) -> Self {
        Self {
            media: Arc::new(media),
            ..self.with_generation(generation)
        }
    }

    pub(crate) fn with_domains(&self, generation: Generation, domains: DomainCache) -> Self {
        Self {
            domains: Arc::new(domains),
            ..self.with_generation(generation)
        }
    }

    /// Replace the schema together with the caches recomputed from it.
    pub(crate) fn with_schema(
        &self,
        generation: Generation,
        schema: SchemaSnapshot,
        content: Option<ContentCache>,
        media: Option<MediaCache>,
    ) -> Self {
        let base = self.with_generation(generation);
        Self {
            schema: Arc::new(schema),
            content: content.map(Arc::new).unwrap_or_else(|| Arc::clone(&base.content)),
            media: media.map(Arc::new).unwrap_or_else(|| Arc::clone(&base.media)),
            ..base
        }
    }

    /// Mark this set as the overlay of a preview session.
    pub(crate) fn into_preview(mut self, token: PreviewToken, content: ContentCache) -> Self {
        self.preview = Some(token);
        self.content = Arc::new(content);
        self.created_at = Utc::now();
        self
    }

    /// Digest of everything a reader can observe: nodes of both trees and
    /// the domain bindings. Generation and timestamps are not included.
    pub fn fingerprint(&self) -> ContentHash {
        let mut buffer = Vec::new();
        for tree in [self.content.tree(), self.media.tree()] {
            let mut nodes: Vec<&Arc<PublishedContent>> = tree.iter().collect();
            nodes.sort_by_key(|n| n.id);
            for node in nodes {
                if let Ok(bytes) = serde_json::to_vec(node.as_ref()) {
                    buffer.extend_from_slice(&bytes);
                }
                for child in tree.children(node.id) {
                    buffer.extend_from_slice(&child.id.0.to_le_bytes());
                }
            }
            buffer.push(0);
        }
        for binding in self.domains.bindings() {
            if let Ok(bytes) = serde_json::to_vec(binding) {
                buffer.extend_from_slice(&bytes);
            }
        }
        compute_content_hash(&buffer)
    }
}

impl Default for CacheSet {
    fn default() -> Self {
        Self::empty()
    }
}
