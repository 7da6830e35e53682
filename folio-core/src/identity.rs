//! Identity types for Folio entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash for snapshot fingerprints.
pub type ContentHash = [u8; 32];

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Lowercase hex rendering of a content hash.
pub fn content_hash_hex(hash: &ContentHash) -> String {
    hex::encode(hash)
}

/// Common behaviour of the integer-backed repository identifiers.
pub trait EntityIdType: Copy + Eq + std::hash::Hash + fmt::Debug {
    /// Raw repository value.
    fn as_i32(&self) -> i32;

    /// Repository identifiers are positive; anything else cannot name an entity.
    fn is_valid(&self) -> bool {
        self.as_i32() > 0
    }
}

macro_rules! repository_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i32);

        impl $name {
            pub const fn new(value: i32) -> Self {
                Self(value)
            }
        }

        impl EntityIdType for $name {
            fn as_i32(&self) -> i32 {
                self.0
            }
        }

        impl From<i32> for $name {
            fn from(value: i32) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

repository_id!(
    /// Identifier of a content or media node.
    NodeId
);
repository_id!(
    /// Identifier of a content type (document or media schema).
    ContentTypeId
);
repository_id!(
    /// Identifier of a data type (property editor + configuration).
    DataTypeId
);
repository_id!(
    /// Identifier of a domain binding.
    DomainId
);

/// Already-resolved identity of the user who owns a preview session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque preview token handed to the token transport.
///
/// Tokens combine 122 random bits with a process-wide issue sequence, so a
/// token is unguessable and never issued twice by the same registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreviewToken(String);

impl PreviewToken {
    /// Issue a fresh token for the given sequence number.
    pub fn issue(sequence: u64) -> Self {
        Self(format!("{}{:08x}", Uuid::new_v4().simple(), sequence))
    }

    /// Wrap a token string received from the token transport.
    pub fn from_transport(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PreviewToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_id_validity() {
        assert!(NodeId::new(42).is_valid());
        assert!(!NodeId::new(0).is_valid());
        assert!(!ContentTypeId::new(-1).is_valid());
    }

    #[test]
    fn test_preview_tokens_are_distinct() {
        let a = PreviewToken::issue(1);
        let b = PreviewToken::issue(1);
        let c = PreviewToken::issue(2);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 40);
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = compute_content_hash(b"home");
        let b = compute_content_hash(b"home");
        let c = compute_content_hash(b"about");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(content_hash_hex(&a).len(), 64);
    }
}
