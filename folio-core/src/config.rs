//! Configuration types

use crate::error::{ConfigError, FolioError, FolioResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How much draft data a preview overlay pulls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewScope {
    /// Live tree plus the draft of the previewed node and its descendants.
    #[default]
    Subtree,
    /// The complete draft tree.
    WholeTree,
}

impl FromStr for PreviewScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "subtree" => Ok(PreviewScope::Subtree),
            "whole_tree" | "wholetree" => Ok(PreviewScope::WholeTree),
            other => Err(ConfigError::InvalidValue {
                field: "preview_scope".to_string(),
                value: other.to_string(),
                reason: "expected subtree or whole_tree".to_string(),
            }),
        }
    }
}

impl fmt::Display for PreviewScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreviewScope::Subtree => f.write_str("subtree"),
            PreviewScope::WholeTree => f.write_str("whole_tree"),
        }
    }
}

/// Scope of recomputation after a content-type or data-type change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaInvalidation {
    /// Recompute every cached node whose content type is affected.
    #[default]
    AffectedContent,
    /// Rebuild all content and media.
    FullRebuild,
}

impl FromStr for SchemaInvalidation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "affected_content" => Ok(SchemaInvalidation::AffectedContent),
            "full_rebuild" => Ok(SchemaInvalidation::FullRebuild),
            other => Err(ConfigError::InvalidValue {
                field: "schema_invalidation".to_string(),
                value: other.to_string(),
                reason: "expected affected_content or full_rebuild".to_string(),
            }),
        }
    }
}

/// Configuration for the published content cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub preview_scope: PreviewScope,
    /// Stale preview overlays rebuild on their next resolve instead of
    /// immediately when the change arrives.
    pub lazy_preview_rebuild: bool,
    /// Pure value edits patch the node's existing slot instead of reloading
    /// its branch.
    pub in_place_value_updates: bool,
    pub schema_invalidation: SchemaInvalidation,
    /// Batches with more entries than this degrade to a full domain rebuild.
    pub max_batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            preview_scope: PreviewScope::Subtree,
            lazy_preview_rebuild: true,
            in_place_value_updates: true,
            schema_invalidation: SchemaInvalidation::AffectedContent,
            max_batch_size: 10_000,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_preview_scope(mut self, scope: PreviewScope) -> Self {
        self.preview_scope = scope;
        self
    }

    pub fn with_lazy_preview_rebuild(mut self, lazy: bool) -> Self {
        self.lazy_preview_rebuild = lazy;
        self
    }

    pub fn with_in_place_updates(mut self, enabled: bool) -> Self {
        self.in_place_value_updates = enabled;
        self
    }

    pub fn with_schema_invalidation(mut self, mode: SchemaInvalidation) -> Self {
        self.schema_invalidation = mode;
        self
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `FOLIO_PREVIEW_SCOPE`: `subtree` or `whole_tree` (default: subtree)
    /// - `FOLIO_LAZY_PREVIEW_REBUILD`: bool (default: true)
    /// - `FOLIO_IN_PLACE_UPDATES`: bool (default: true)
    /// - `FOLIO_SCHEMA_INVALIDATION`: `affected_content` or `full_rebuild`
    /// - `FOLIO_MAX_BATCH_SIZE`: positive integer (default: 10000)
    ///
    /// Unparseable values fall back to the default; the result is validated.
    pub fn from_env() -> FolioResult<Self> {
        let defaults = Self::default();

        let config = Self {
            preview_scope: env_parse("FOLIO_PREVIEW_SCOPE").unwrap_or(defaults.preview_scope),
            lazy_preview_rebuild: env_parse("FOLIO_LAZY_PREVIEW_REBUILD")
                .unwrap_or(defaults.lazy_preview_rebuild),
            in_place_value_updates: env_parse("FOLIO_IN_PLACE_UPDATES")
                .unwrap_or(defaults.in_place_value_updates),
            schema_invalidation: env_parse("FOLIO_SCHEMA_INVALIDATION")
                .unwrap_or(defaults.schema_invalidation),
            max_batch_size: env_parse("FOLIO_MAX_BATCH_SIZE").unwrap_or(defaults.max_batch_size),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - max_batch_size > 0
    pub fn validate(&self) -> FolioResult<()> {
        if self.max_batch_size == 0 {
            return Err(FolioError::Config(ConfigError::InvalidValue {
                field: "max_batch_size".to_string(),
                value: self.max_batch_size.to_string(),
                reason: "max_batch_size must be greater than 0".to_string(),
            }));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

// =============================================================================
// TESTS
// =============================================================================
