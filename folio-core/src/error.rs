//! Error types for Folio operations

use crate::payload::ChangeDomain;
use thiserror::Error;

/// Repository boundary errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("Repository read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("{entity} {id} not found in repository")]
    NotFound { entity: String, id: i32 },

    #[error("Invalid {entity} {id} in repository: {reason}")]
    InvalidData {
        entity: String,
        id: i32,
        reason: String,
    },
}

/// Snapshot build and change application errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Rebuild of {domain} cache failed: {reason}")]
    RebuildFailure { domain: ChangeDomain, reason: String },

    #[error("Malformed {domain} payload at index {index}: {reason}")]
    MalformedPayload {
        domain: ChangeDomain,
        index: usize,
        reason: String,
    },
}

impl SnapshotError {
    pub fn rebuild(domain: ChangeDomain, source: impl std::fmt::Display) -> Self {
        SnapshotError::RebuildFailure {
            domain,
            reason: source.to_string(),
        }
    }

    pub fn domain(&self) -> ChangeDomain {
        match self {
            SnapshotError::RebuildFailure { domain, .. } => *domain,
            SnapshotError::MalformedPayload { domain, .. } => *domain,
        }
    }
}

/// Preview session errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PreviewError {
    #[error("Unknown preview token: {token}")]
    UnknownToken { token: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Folio errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FolioError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Preview error: {0}")]
    Preview(#[from] PreviewError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl FolioError {
    pub fn is_unknown_token(&self) -> bool {
        matches!(self, FolioError::Preview(PreviewError::UnknownToken { .. }))
    }

    pub fn is_rebuild_failure(&self) -> bool {
        matches!(
            self,
            FolioError::Snapshot(SnapshotError::RebuildFailure { .. })
        )
    }
}

/// Result type alias for Folio operations.
pub type FolioResult<T> = Result<T, FolioError>;

/// Result type alias for repository reads.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display_not_found() {
        let err = RepositoryError::NotFound {
            entity: "content".to_string(),
            id: 42,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("content 42 not found"));
    }

    #[test]
    fn test_snapshot_error_display_rebuild_failure() {
        let err = SnapshotError::rebuild(
            ChangeDomain::Media,
            RepositoryError::ReadFailed {
                reason: "connection reset".to_string(),
            },
        );
        let msg = format!("{}", err);
        assert!(msg.contains("Rebuild of media cache failed"));
        assert!(msg.contains("connection reset"));
        assert_eq!(err.domain(), ChangeDomain::Media);
    }

    #[test]
    fn test_snapshot_error_display_malformed() {
        let err = SnapshotError::MalformedPayload {
            domain: ChangeDomain::ContentType,
            index: 3,
            reason: "unknown variant".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("content-type"));
        assert!(msg.contains("index 3"));
    }

    #[test]
    fn test_preview_error_display_unknown_token() {
        let err = PreviewError::UnknownToken {
            token: "abc".to_string(),
        };
        assert_eq!(format!("{}", err), "Unknown preview token: abc");
    }

    #[test]
    fn test_folio_error_from_variants() {
        let preview = FolioError::from(PreviewError::UnknownToken {
            token: "t".to_string(),
        });
        assert!(preview.is_unknown_token());
        assert!(!preview.is_rebuild_failure());

        let snapshot = FolioError::from(SnapshotError::rebuild(ChangeDomain::Content, "boom"));
        assert!(snapshot.is_rebuild_failure());

        let repository = FolioError::from(RepositoryError::ReadFailed {
            reason: "offline".to_string(),
        });
        assert!(matches!(repository, FolioError::Repository(_)));

        let config = FolioError::from(ConfigError::InvalidValue {
            field: "max_batch_size".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        });
        assert!(matches!(config, FolioError::Config(_)));
    }
}
