//! Operation context and current-CacheSet resolution.
//!
//! The context is an explicit value carried through the call chain of one
//! logical operation. Cloning it for a spawned task copies the binding, so an
//! override never leaks into an unrelated operation.

use std::sync::Arc;

use folio_core::PreviewToken;
use tracing::warn;

use crate::preview::PreviewRegistry;
use crate::repository::ContentRepository;
use crate::snapshot::CacheSet;
use crate::store::SnapshotStore;

/// What an operation reads from instead of the live set.
#[derive(Debug, Clone)]
pub enum CacheBinding {
    /// A fixed set, typically pinned by a test.
    CacheSet(Arc<CacheSet>),
    /// The overlay of a preview session.
    Preview(PreviewToken),
}

/// Per-operation context. The default reads the live set.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    binding: Option<CacheBinding>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_set(set: Arc<CacheSet>) -> Self {
        Self {
            binding: Some(CacheBinding::CacheSet(set)),
        }
    }

    pub fn with_preview(token: PreviewToken) -> Self {
        Self {
            binding: Some(CacheBinding::Preview(token)),
        }
    }

    /// Bind an override, returning the one it replaces.
    pub fn bind_override(&mut self, binding: CacheBinding) -> Option<CacheBinding> {
        self.binding.replace(binding)
    }

    pub fn unbind_override(&mut self) -> Option<CacheBinding> {
        self.binding.take()
    }

    pub fn binding(&self) -> Option<&CacheBinding> {
        self.binding.as_ref()
    }

    pub fn preview_token(&self) -> Option<&PreviewToken> {
        match &self.binding {
            Some(CacheBinding::Preview(token)) => Some(token),
            _ => None,
        }
    }
}

/// Resolves the CacheSet an operation should read.
pub struct ContextResolver<R: ContentRepository + ?Sized> {
    store: Arc<SnapshotStore<R>>,
    previews: Arc<PreviewRegistry>,
}

impl<R: ContentRepository + ?Sized> ContextResolver<R> {
    pub fn new(store: Arc<SnapshotStore<R>>, previews: Arc<PreviewRegistry>) -> Self {
        Self { store, previews }
    }

    /// The override bound in `ctx`, else the live set.
    ///
    /// A preview binding whose session is gone falls back to the live set.
    pub async fn current_cache_set(&self, ctx: &OperationContext) -> Arc<CacheSet> {
        match ctx.binding() {
            None => self.store.current(),
            Some(CacheBinding::CacheSet(set)) => Arc::clone(set),
            Some(CacheBinding::Preview(token)) => self.preview_or_live(token).await,
        }
    }

    /// The overlay for `token`, or the live set when the token is unknown.
    pub async fn preview_or_live(&self, token: &PreviewToken) -> Arc<CacheSet> {
        match self.previews.resolve(&self.store, token).await {
            Ok(set) => set,
            Err(err) => {
                warn!(token = %token, error = %err, "Preview binding unresolvable, serving live snapshot");
                self.store.current()
            }
        }
    }
}
