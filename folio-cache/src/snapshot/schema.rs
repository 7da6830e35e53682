//! Schema snapshot: content types, data types, and node materialisation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use folio_core::{
    url_segment, ContentData, ContentType, ContentTypeId, DataType, DataTypeId, NodeRecord,
    NodeView, PropertyType, PublishedContent, PublishedProperty, RepositoryError,
};

use super::convert::convert_value;

/// Immutable view of the content-type and data-type schema.
///
/// Updates are copy-on-write: `with_*`/`without_*` return a new snapshot and
/// leave the receiver untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSnapshot {
    content_types: HashMap<ContentTypeId, Arc<ContentType>>,
    aliases: HashMap<String, ContentTypeId>,
    data_types: HashMap<DataTypeId, Arc<DataType>>,
}

impl SchemaSnapshot {
    pub fn new(content_types: Vec<ContentType>, data_types: Vec<DataType>) -> Self {
        let mut schema = Self::default();
        for content_type in content_types {
            schema.insert_content_type(content_type);
        }
        for data_type in data_types {
            schema.data_types.insert(data_type.id, Arc::new(data_type));
        }
        schema
    }

    fn insert_content_type(&mut self, content_type: ContentType) {
        if let Some(previous) = self.content_types.get(&content_type.id) {
            self.aliases.remove(&previous.alias);
        }
        self.aliases
            .insert(content_type.alias.clone(), content_type.id);
        self.content_types
            .insert(content_type.id, Arc::new(content_type));
    }

    pub fn content_type(&self, id: ContentTypeId) -> Option<&Arc<ContentType>> {
        self.content_types.get(&id)
    }

    pub fn content_type_by_alias(&self, alias: &str) -> Option<&Arc<ContentType>> {
        self.aliases
            .get(alias)
            .and_then(|id| self.content_types.get(id))
    }

    pub fn data_type(&self, id: DataTypeId) -> Option<&Arc<DataType>> {
        self.data_types.get(&id)
    }

    pub fn content_type_count(&self) -> usize {
        self.content_types.len()
    }

    pub fn data_type_count(&self) -> usize {
        self.data_types.len()
    }

    pub fn with_content_type(&self, content_type: ContentType) -> Self {
        let mut next = self.clone();
        next.insert_content_type(content_type);
        next
    }

    pub fn without_content_type(&self, id: ContentTypeId) -> Self {
        let mut next = self.clone();
        if let Some(removed) = next.content_types.remove(&id) {
            next.aliases.remove(&removed.alias);
        }
        next
    }

    pub fn with_data_type(&self, data_type: DataType) -> Self {
        let mut next = self.clone();
        next.data_types.insert(data_type.id, Arc::new(data_type));
        next
    }

    pub fn without_data_type(&self, id: DataTypeId) -> Self {
        let mut next = self.clone();
        next.data_types.remove(&id);
        next
    }

    /// `changed` plus every type that composes one of them, transitively.
    pub fn composing_types(&self, changed: &BTreeSet<ContentTypeId>) -> BTreeSet<ContentTypeId> {
        let mut affected = changed.clone();
        loop {
            let before = affected.len();
            for content_type in self.content_types.values() {
                if content_type
                    .compositions
                    .iter()
                    .any(|c| affected.contains(c))
                {
                    affected.insert(content_type.id);
                }
            }
            if affected.len() == before {
                return affected;
            }
        }
    }

    /// Every type using one of the data types, directly or through a composition.
    pub fn types_using_data_types(&self, data_types: &BTreeSet<DataTypeId>) -> BTreeSet<ContentTypeId> {
        let direct: BTreeSet<ContentTypeId> = self
            .content_types
            .values()
            .filter(|ct| {
                ct.properties
                    .iter()
                    .any(|p| data_types.contains(&p.data_type_id))
            })
            .map(|ct| ct.id)
            .collect();
        self.composing_types(&direct)
    }

    /// Flattened property types of a content type, compositions first.
    ///
    /// A property declared on the type itself wins over a composed property
    /// with the same alias. Composition cycles are tolerated.
    pub fn property_types(&self, id: ContentTypeId) -> Vec<&PropertyType> {
        let mut ordered: Vec<&PropertyType> = Vec::new();
        let mut visited = BTreeSet::new();
        self.collect_properties(id, &mut visited, &mut ordered);

        let mut by_alias: BTreeMap<&str, usize> = BTreeMap::new();
        for (index, property) in ordered.iter().enumerate() {
            by_alias.insert(property.alias.as_str(), index);
        }
        ordered
            .iter()
            .enumerate()
            .filter(|(index, p)| by_alias.get(p.alias.as_str()) == Some(index))
            .map(|(_, p)| *p)
            .collect()
    }

    fn collect_properties<'a>(
        &'a self,
        id: ContentTypeId,
        visited: &mut BTreeSet<ContentTypeId>,
        out: &mut Vec<&'a PropertyType>,
    ) {
        if !visited.insert(id) {
            return;
        }
        let Some(content_type) = self.content_types.get(&id) else {
            return;
        };
        for composition in &content_type.compositions {
            self.collect_properties(*composition, visited, out);
        }
        out.extend(content_type.properties.iter());
    }

    /// Build the published form of one node version.
    ///
    /// `parent` must be the already-materialised parent in the same view, or
    /// `None` for a root.
    pub fn materialize(
        &self,
        record: &NodeRecord,
        data: &ContentData,
        view: NodeView,
        parent: Option<&PublishedContent>,
    ) -> Result<PublishedContent, RepositoryError> {
        let content_type =
            self.content_types
                .get(&record.content_type_id)
                .ok_or_else(|| RepositoryError::InvalidData {
                    entity: record.kind.to_string(),
                    id: record.id.0,
                    reason: format!("unknown content type {}", record.content_type_id),
                })?;
        if content_type.kind != record.kind {
            return Err(RepositoryError::InvalidData {
                entity: record.kind.to_string(),
                id: record.id.0,
                reason: format!(
                    "content type {} is a {} type",
                    content_type.alias, content_type.kind
                ),
            });
        }

        let mut properties = BTreeMap::new();
        for property_type in self.property_types(content_type.id) {
            // A property whose data type is gone is dropped until the schema
            // catches up.
            let Some(data_type) = self.data_types.get(&property_type.data_type_id) else {
                continue;
            };
            let value = convert_value(data_type, data.values.get(&property_type.alias));
            properties.insert(
                property_type.alias.clone(),
                PublishedProperty {
                    alias: property_type.alias.clone(),
                    editor_alias: data_type.editor_alias.clone(),
                    value,
                },
            );
        }

        let (level, mut path) = match parent {
            Some(p) => (p.level + 1, p.path.clone()),
            None => (1, Vec::new()),
        };
        path.push(record.id);

        Ok(PublishedContent {
            id: record.id,
            kind: record.kind,
            parent_id: record.parent_id,
            level,
            sort_order: record.sort_order,
            path,
            name: data.name.clone(),
            url_segment: url_segment(&data.name),
            content_type_id: content_type.id,
            content_type_alias: content_type.alias.clone(),
            properties,
            version: data.version,
            updated_at: data.updated_at,
            writer: data.writer.clone(),
            is_draft: view == NodeView::Draft,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::convert::{TEXT_BOX, TRUE_FALSE};
    use chrono::Utc;
    use folio_core::{ItemKind, NodeId};
    use serde_json::json;

    fn schema() -> SchemaSnapshot {
        let seo = ContentType::new(ContentTypeId(1), "seo", ItemKind::Content)
            .with_property(PropertyType::new("metaTitle", DataTypeId(10)))
            .with_property(PropertyType::new("hideFromSearch", DataTypeId(11)));
        let article = ContentType::new(ContentTypeId(2), "article", ItemKind::Content)
            .with_composition(ContentTypeId(1))
            .with_property(PropertyType::new("title", DataTypeId(10)))
            .with_property(PropertyType::new("metaTitle", DataTypeId(11)));
        let news = ContentType::new(ContentTypeId(3), "news", ItemKind::Content)
            .with_composition(ContentTypeId(2));
        SchemaSnapshot::new(
            vec![seo, article, news],
            vec![
                DataType::new(DataTypeId(10), "Short text", TEXT_BOX)
                    .with_configuration(json!({"maxChars": 4})),
                DataType::new(DataTypeId(11), "Checkbox", TRUE_FALSE),
            ],
        )
    }

    #[test]
    fn test_composing_types_is_transitive() {
        let schema = schema();
        let affected = schema.composing_types(&BTreeSet::from([ContentTypeId(1)]));
        assert_eq!(
            affected,
            BTreeSet::from([ContentTypeId(1), ContentTypeId(2), ContentTypeId(3)])
        );
        let leaf = schema.composing_types(&BTreeSet::from([ContentTypeId(3)]));
        assert_eq!(leaf, BTreeSet::from([ContentTypeId(3)]));
    }

    #[test]
    fn test_types_using_data_types() {
        let schema = schema();
        let affected = schema.types_using_data_types(&BTreeSet::from([DataTypeId(10)]));
        assert_eq!(
            affected,
            BTreeSet::from([ContentTypeId(1), ContentTypeId(2), ContentTypeId(3)])
        );
        let none = schema.types_using_data_types(&BTreeSet::from([DataTypeId(99)]));
        assert!(none.is_empty());
    }

    #[test]
    fn test_own_property_overrides_composition() {
        let schema = schema();
        let properties = schema.property_types(ContentTypeId(2));
        let aliases: Vec<&str> = properties.iter().map(|p| p.alias.as_str()).collect();
        assert_eq!(aliases, vec!["hideFromSearch", "title", "metaTitle"]);
        let meta = properties
            .iter()
            .find(|p| p.alias == "metaTitle")
            .expect("metaTitle present");
        assert_eq!(meta.data_type_id, DataTypeId(11));
    }

    #[test]
    fn test_materialize_converts_values() {
        let schema = schema();
        let record = NodeRecord::content(
            NodeId(5),
            None,
            0,
            ContentTypeId(3),
            ContentData::new("Breaking News", Utc::now())
                .with_value("title", json!("Headline"))
                .with_value("hideFromSearch", json!("1")),
        );
        let data = record.draft.clone().expect("draft");
        let node = schema
            .materialize(&record, &data, NodeView::Draft, None)
            .expect("materialize");
        assert_eq!(node.level, 1);
        assert_eq!(node.path, vec![NodeId(5)]);
        assert_eq!(node.url_segment, "breaking-news");
        assert_eq!(node.content_type_alias, "news");
        assert_eq!(node.value("title"), Some(&json!("Head")));
        assert_eq!(node.value("hideFromSearch"), Some(&json!(true)));
        assert!(node.is_draft);
    }

    #[test]
    fn test_materialize_unknown_type_is_invalid() {
        let schema = schema();
        let record = NodeRecord::content(
            NodeId(6),
            None,
            0,
            ContentTypeId(404),
            ContentData::new("Orphan", Utc::now()),
        );
        let data = record.draft.clone().expect("draft");
        let result = schema.materialize(&record, &data, NodeView::Published, None);
        assert!(matches!(result, Err(RepositoryError::InvalidData { .. })));
    }

    #[test]
    fn test_copy_on_write_updates() {
        let schema = schema();
        let renamed = schema.with_content_type(ContentType::new(
            ContentTypeId(3),
            "newsItem",
            ItemKind::Content,
        ));
        assert!(schema.content_type_by_alias("news").is_some());
        assert!(renamed.content_type_by_alias("news").is_none());
        assert!(renamed.content_type_by_alias("newsItem").is_some());

        let without = renamed.without_data_type(DataTypeId(10));
        assert_eq!(without.data_type_count(), 1);
        assert_eq!(renamed.data_type_count(), 2);
    }
}
