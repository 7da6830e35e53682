//! Change payloads delivered to the cache.
//!
//! Every notification is a [`ChangeBatch`]: one domain's ordered sequence of
//! payloads. The set of domains is closed, and so is each domain's set of
//! change kinds.

use crate::entities::ItemKind;
use crate::error::SnapshotError;
use crate::identity::{ContentTypeId, DataTypeId, DomainId, EntityIdType, NodeId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The five independent change domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDomain {
    Content,
    Media,
    ContentType,
    DataType,
    Domain,
}

impl fmt::Display for ChangeDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeDomain::Content => "content",
            ChangeDomain::Media => "media",
            ChangeDomain::ContentType => "content-type",
            ChangeDomain::DataType => "data-type",
            ChangeDomain::Domain => "domain",
        };
        f.write_str(name)
    }
}

/// What happened to a content or media node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeChangeKind {
    /// A new node (and possibly descendants) exists.
    Created,
    /// Values of an existing node changed, including publish/unpublish.
    Updated,
    /// The node moved to another parent (trashing is a move).
    Moved,
    /// The children of the node were re-ordered.
    Sorted,
    /// The node and its descendants are gone.
    Deleted,
    /// Everything in the domain must be reloaded; the id is ignored.
    RefreshAll,
}

impl TreeChangeKind {
    /// Changes that alter the shape of the tree rather than a node's values.
    pub fn is_structural(&self) -> bool {
        !matches!(self, TreeChangeKind::Updated)
    }
}

/// One changed content or media node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePayload {
    pub id: NodeId,
    pub kind: TreeChangeKind,
}

impl NodePayload {
    pub fn new(id: impl Into<NodeId>, kind: TreeChangeKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn refresh_all() -> Self {
        Self {
            id: NodeId(0),
            kind: TreeChangeKind::RefreshAll,
        }
    }

    fn check(&self) -> Result<(), String> {
        if self.kind != TreeChangeKind::RefreshAll && !self.id.is_valid() {
            return Err(format!("node id {} cannot name a node", self.id));
        }
        Ok(())
    }
}

/// What happened to a content type or data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaChangeKind {
    Created,
    Updated,
    Removed,
}

/// One changed content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentTypePayload {
    pub id: ContentTypeId,
    /// Which tree the type's nodes live in. Must agree with the repository.
    pub item_kind: ItemKind,
    pub kind: SchemaChangeKind,
}

impl ContentTypePayload {
    pub fn new(id: impl Into<ContentTypeId>, item_kind: ItemKind, kind: SchemaChangeKind) -> Self {
        Self {
            id: id.into(),
            item_kind,
            kind,
        }
    }

    fn check(&self) -> Result<(), String> {
        if !self.id.is_valid() {
            return Err(format!("content type id {} is not valid", self.id));
        }
        Ok(())
    }
}

/// One changed data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTypePayload {
    pub id: DataTypeId,
    pub kind: SchemaChangeKind,
}

impl DataTypePayload {
    pub fn new(id: impl Into<DataTypeId>, kind: SchemaChangeKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    fn check(&self) -> Result<(), String> {
        if !self.id.is_valid() {
            return Err(format!("data type id {} is not valid", self.id));
        }
        Ok(())
    }
}

/// What happened to a domain binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainChangeKind {
    Saved,
    Removed,
    RefreshAll,
}

/// One changed domain binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPayload {
    pub id: DomainId,
    pub kind: DomainChangeKind,
}

impl DomainPayload {
    pub fn new(id: impl Into<DomainId>, kind: DomainChangeKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    fn check(&self) -> Result<(), String> {
        if self.kind != DomainChangeKind::RefreshAll && !self.id.is_valid() {
            return Err(format!("domain id {} is not valid", self.id));
        }
        Ok(())
    }
}

/// A batch of changes for exactly one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "domain", content = "payloads", rename_all = "snake_case")]
pub enum ChangeBatch {
    Content(Vec<NodePayload>),
    Media(Vec<NodePayload>),
    ContentType(Vec<ContentTypePayload>),
    DataType(Vec<DataTypePayload>),
    Domain(Vec<DomainPayload>),
}

impl ChangeBatch {
    pub fn domain(&self) -> ChangeDomain {
        match self {
            ChangeBatch::Content(_) => ChangeDomain::Content,
            ChangeBatch::Media(_) => ChangeDomain::Media,
            ChangeBatch::ContentType(_) => ChangeDomain::ContentType,
            ChangeBatch::DataType(_) => ChangeDomain::DataType,
            ChangeBatch::Domain(_) => ChangeDomain::Domain,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ChangeBatch::Content(p) | ChangeBatch::Media(p) => p.len(),
            ChangeBatch::ContentType(p) => p.len(),
            ChangeBatch::DataType(p) => p.len(),
            ChangeBatch::Domain(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries that are well-formed but cannot name an entity, indexed by
    /// their position in this batch.
    pub fn malformed_entries(&self) -> Vec<SnapshotError> {
        let domain = self.domain();
        let checks: Vec<Result<(), String>> = match self {
            ChangeBatch::Content(p) | ChangeBatch::Media(p) => p.iter().map(|p| p.check()).collect(),
            ChangeBatch::ContentType(p) => p.iter().map(|p| p.check()).collect(),
            ChangeBatch::DataType(p) => p.iter().map(|p| p.check()).collect(),
            ChangeBatch::Domain(p) => p.iter().map(|p| p.check()).collect(),
        };
        checks
            .into_iter()
            .enumerate()
            .filter_map(|(index, check)| {
                check.err().map(|reason| SnapshotError::MalformedPayload {
                    domain,
                    index,
                    reason,
                })
            })
            .collect()
    }
}

/// A batch as carried by the notification transport: entries are untyped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBatch {
    pub domain: ChangeDomain,
    pub payloads: Vec<serde_json::Value>,
}

/// Result of classifying a [`WireBatch`].
#[derive(Debug, Clone)]
pub struct ClassifiedBatch {
    /// Well-formed entries, in delivery order.
    pub batch: ChangeBatch,
    /// Everything else, unparseable or naming no entity, indexed by position
    /// in the wire batch.
    pub malformed: Vec<SnapshotError>,
}

impl WireBatch {
    pub fn new(domain: ChangeDomain, payloads: Vec<serde_json::Value>) -> Self {
        Self { domain, payloads }
    }

    /// Type every entry for this batch's domain.
    pub fn classify(self) -> ClassifiedBatch {
        let domain = self.domain;
        let mut malformed = Vec::new();
        let batch = match domain {
            ChangeDomain::Content => {
                ChangeBatch::Content(parse_entries(
                    domain,
                    self.payloads,
                    NodePayload::check,
                    &mut malformed,
                ))
            }
            ChangeDomain::Media => {
                ChangeBatch::Media(parse_entries(
                    domain,
                    self.payloads,
                    NodePayload::check,
                    &mut malformed,
                ))
            }
            ChangeDomain::ContentType => {
                ChangeBatch::ContentType(parse_entries(
                    domain,
                    self.payloads,
                    ContentTypePayload::check,
                    &mut malformed,
                ))
            }
            ChangeDomain::DataType => {
                ChangeBatch::DataType(parse_entries(
                    domain,
                    self.payloads,
                    DataTypePayload::check,
                    &mut malformed,
                ))
            }
            ChangeDomain::Domain => {
                ChangeBatch::Domain(parse_entries(
                    domain,
                    self.payloads,
                    DomainPayload::check,
                    &mut malformed,
                ))
            }
        };
        ClassifiedBatch { batch, malformed }
    }
}

fn parse_entries<T: DeserializeOwned>(
    domain: ChangeDomain,
    values: Vec<serde_json::Value>,
    check: fn(&T) -> Result<(), String>,
    malformed: &mut Vec<SnapshotError>,
) -> Vec<T> {
    let mut parsed = Vec::with_capacity(values.len());
    for (index, value) in values.into_iter().enumerate() {
        let entry = serde_json::from_value::<T>(value)
            .map_err(|e| e.to_string())
            .and_then(|entry| check(&entry).map(|()| entry));
        match entry {
            Ok(entry) => parsed.push(entry),
            Err(reason) => malformed.push(SnapshotError::MalformedPayload {
                domain,
                index,
                reason,
            }),
        }
    }
    parsed
}
