//! Published model: what readers of a CacheSet see.

use crate::entities::ItemKind;
use crate::identity::{ContentTypeId, NodeId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A property value after conversion by its data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedProperty {
    pub alias: String,
    pub editor_alias: String,
    pub value: serde_json::Value,
}

impl PublishedProperty {
    pub fn has_value(&self) -> bool {
        match &self.value {
            serde_json::Value::Null => false,
            serde_json::Value::String(s) => !s.is_empty(),
            serde_json::Value::Array(items) => !items.is_empty(),
            _ => true,
        }
    }
}

/// A materialised content or media node.
///
/// Instances are immutable once placed in a cache; an update always produces
/// a new `PublishedContent` in a new cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedContent {
    pub id: NodeId,
    pub kind: ItemKind,
    pub parent_id: Option<NodeId>,
    pub level: u32,
    pub sort_order: i32,
    /// Ancestor ids from the root down, ending with this node's id.
    pub path: Vec<NodeId>,
    pub name: String,
    pub url_segment: String,
    pub content_type_id: ContentTypeId,
    pub content_type_alias: String,
    pub properties: BTreeMap<String, PublishedProperty>,
    pub version: u32,
    pub updated_at: Timestamp,
    pub writer: String,
    /// True when materialised from the draft version.
    pub is_draft: bool,
}

impl PublishedContent {
    pub fn property(&self, alias: &str) -> Option<&PublishedProperty> {
        self.properties.get(alias)
    }

    pub fn value(&self, alias: &str) -> Option<&serde_json::Value> {
        self.properties.get(alias).map(|p| &p.value)
    }

    pub fn is_ancestor_of(&self, other: &PublishedContent) -> bool {
        other.id != self.id && other.path.contains(&self.id)
    }
}

/// Url segment derived from a node name: lowercase, ascii alphanumerics, dashes.
pub fn url_segment(name: &str) -> String {
    let mut segment = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !segment.is_empty() {
                segment.push('-');
            }
            pending_dash = false;
            segment.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    segment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_segment() {
        assert_eq!(url_segment("Home"), "home");
        assert_eq!(url_segment("About  Us!"), "about-us");
        assert_eq!(url_segment("  Blog / 2024 "), "blog-2024");
        assert_eq!(url_segment("---"), "");
    }

    #[test]
    fn test_property_has_value() {
        let mut p = PublishedProperty {
            alias: "title".to_string(),
            editor_alias: "Folio.TextBox".to_string(),
            value: serde_json::Value::Null,
        };
        assert!(!p.has_value());
        p.value = serde_json::json!("");
        assert!(!p.has_value());
        p.value = serde_json::json!("Hello");
        assert!(p.has_value());
        p.value = serde_json::json!(false);
        assert!(p.has_value());
    }
}
