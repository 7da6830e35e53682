//! Repository entity types.
//!
//! These are the shapes the durable repository hands to the cache. They are
//! plain data: the cache never mutates them, it only materialises published
//! views from them.

use crate::identity::{ContentTypeId, DataTypeId, DomainId, NodeId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which tree a node or schema belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Content,
    Media,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Content => f.write_str("content"),
            ItemKind::Media => f.write_str("media"),
        }
    }
}

/// One version of a node's editable data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentData {
    pub name: String,
    /// Raw property values keyed by property alias, before conversion.
    pub values: BTreeMap<String, serde_json::Value>,
    pub version: u32,
    pub updated_at: Timestamp,
    pub writer: String,
}

impl ContentData {
    pub fn new(name: impl Into<String>, updated_at: Timestamp) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
            version: 1,
            updated_at,
            writer: String::new(),
        }
    }

    pub fn with_value(mut self, alias: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(alias.into(), value);
        self
    }

    pub fn with_writer(mut self, writer: impl Into<String>) -> Self {
        self.writer = writer.into();
        self
    }
}

/// A node as persisted by the repository.
///
/// Content nodes carry an optional draft and an optional published version.
/// Media has no publishing workflow: its single version is stored in both
/// slots (see [`NodeRecord::media`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub kind: ItemKind,
    pub parent_id: Option<NodeId>,
    pub sort_order: i32,
    pub content_type_id: ContentTypeId,
    pub trashed: bool,
    pub draft: Option<ContentData>,
    pub published: Option<ContentData>,
}

impl NodeRecord {
    /// A content node with a draft and no published version yet.
    pub fn content(
        id: NodeId,
        parent_id: Option<NodeId>,
        sort_order: i32,
        content_type_id: ContentTypeId,
        draft: ContentData,
    ) -> Self {
        Self {
            id,
            kind: ItemKind::Content,
            parent_id,
            sort_order,
            content_type_id,
            trashed: false,
            draft: Some(draft),
            published: None,
        }
    }

    /// A media node; media is visible as soon as it is saved.
    pub fn media(
        id: NodeId,
        parent_id: Option<NodeId>,
        sort_order: i32,
        content_type_id: ContentTypeId,
        data: ContentData,
    ) -> Self {
        Self {
            id,
            kind: ItemKind::Media,
            parent_id,
            sort_order,
            content_type_id,
            trashed: false,
            draft: Some(data.clone()),
            published: Some(data),
        }
    }

    /// Data for the requested view, `None` when the node is not part of it.
    pub fn data(&self, view: NodeView) -> Option<&ContentData> {
        if self.trashed {
            return None;
        }
        match view {
            NodeView::Draft => self.draft.as_ref(),
            NodeView::Published => self.published.as_ref(),
        }
    }

    pub fn is_published(&self) -> bool {
        !self.trashed && self.published.is_some()
    }
}

/// The two materialised views of the node tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeView {
    Draft,
    Published,
}

/// A property on a content type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyType {
    pub alias: String,
    pub name: String,
    pub data_type_id: DataTypeId,
    pub mandatory: bool,
}

impl PropertyType {
    pub fn new(alias: impl Into<String>, data_type_id: DataTypeId) -> Self {
        let alias = alias.into();
        Self {
            name: alias.clone(),
            alias,
            data_type_id,
            mandatory: false,
        }
    }
}

/// Schema of a content or media node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentType {
    pub id: ContentTypeId,
    pub alias: String,
    pub kind: ItemKind,
    pub properties: Vec<PropertyType>,
    /// Content types whose properties this type also exposes.
    pub compositions: Vec<ContentTypeId>,
}

impl ContentType {
    pub fn new(id: ContentTypeId, alias: impl Into<String>, kind: ItemKind) -> Self {
        Self {
            id,
            alias: alias.into(),
            kind,
            properties: Vec::new(),
            compositions: Vec::new(),
        }
    }

    pub fn with_property(mut self, property: PropertyType) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_composition(mut self, composition: ContentTypeId) -> Self {
        self.compositions.push(composition);
        self
    }
}

/// A property editor bound to its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataType {
    pub id: DataTypeId,
    pub name: String,
    pub editor_alias: String,
    pub configuration: serde_json::Value,
}

impl DataType {
    pub fn new(id: DataTypeId, name: impl Into<String>, editor_alias: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            editor_alias: editor_alias.into(),
            configuration: serde_json::Value::Null,
        }
    }

    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = configuration;
        self
    }
}

/// Routing binding of a host name to a content root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainBinding {
    pub id: DomainId,
    /// Host name (optionally with a path prefix), or `*<root id>` for wildcards.
    pub name: String,
    pub root_content_id: Option<NodeId>,
    pub culture: Option<String>,
    pub is_wildcard: bool,
    pub sort_order: i32,
}

impl DomainBinding {
    pub fn new(id: DomainId, name: impl Into<String>, root_content_id: NodeId) -> Self {
        Self {
            id,
            name: name.into(),
            root_content_id: Some(root_content_id),
            culture: None,
            is_wildcard: false,
            sort_order: 0,
        }
    }

    pub fn with_culture(mut self, culture: impl Into<String>) -> Self {
        self.culture = Some(culture.into());
        self
    }

    pub fn wildcard(mut self) -> Self {
        self.is_wildcard = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_trashed_record_has_no_view_data() {
        let mut record = NodeRecord::content(
            NodeId(1),
            None,
            0,
            ContentTypeId(10),
            ContentData::new("Home", Utc::now()),
        );
        record.published = record.draft.clone();
        assert!(record.data(NodeView::Draft).is_some());
        assert!(record.is_published());

        record.trashed = true;
        assert!(record.data(NodeView::Draft).is_none());
        assert!(record.data(NodeView::Published).is_none());
        assert!(!record.is_published());
    }

    #[test]
    fn test_media_record_is_visible_in_both_views() {
        let record = NodeRecord::media(
            NodeId(2000),
            None,
            0,
            ContentTypeId(20),
            ContentData::new("Images", Utc::now()),
        );
        assert_eq!(record.kind, ItemKind::Media);
        assert_eq!(
            record.data(NodeView::Draft),
            record.data(NodeView::Published)
        );
    }
}
