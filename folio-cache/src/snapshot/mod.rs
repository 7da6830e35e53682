//! Snapshot model.
//!
//! A snapshot is a [`CacheSet`]: content, media and domain caches plus the
//! schema they were materialised with. Nothing in this module mutates a
//! published value; every edit goes through a working copy
//! ([`TreeEditor`]) and ends in a new set.

mod cache_set;
mod convert;
mod generation;
mod schema;
mod tree;

pub use cache_set::{CacheSet, ContentCache, DomainCache, MediaCache};
pub use convert::{convert_value, INTEGER, TAGS, TEXT_BOX, TRUE_FALSE};
pub use generation::{Generation, GenerationCounter};
pub use schema::SchemaSnapshot;
pub use tree::PublishedTree;

pub(crate) use tree::{EditError, InPlace, TreeEditor};
