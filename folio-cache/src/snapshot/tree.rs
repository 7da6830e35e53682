//! Published node trees and the copy-on-rebuild editor that produces them.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use folio_core::{NodeId, NodeRecord, NodeView, PublishedContent, RepositoryError};
use thiserror::Error;

use super::schema::SchemaSnapshot;

/// An immutable tree of published nodes for one view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishedTree {
    nodes: HashMap<NodeId, Arc<PublishedContent>>,
    children: HashMap<NodeId, Vec<NodeId>>,
    roots: Vec<NodeId>,
}

impl PublishedTree {
    /// Materialise a complete tree from repository records.
    ///
    /// In a strict build every record that has data for the view must hang
    /// off a record that exists; a dangling parent reference is invalid data.
    pub fn build(
        records: &[NodeRecord],
        view: NodeView,
        schema: &SchemaSnapshot,
        strict: bool,
    ) -> Result<Self, RepositoryError> {
        let empty = PublishedTree::default();
        let mut editor = TreeEditor::new(&empty, view, schema, strict);
        match editor.insert_records(records) {
            Ok(()) => Ok(editor.finish().0),
            Err(EditError::Invalid(e)) => Err(e),
            Err(EditError::Orphaned { id, parent }) => Err(RepositoryError::InvalidData {
                entity: "node".to_string(),
                id: id.0,
                reason: format!("parent {} does not exist", parent),
            }),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Arc<PublishedContent>> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Root nodes in sort order.
    pub fn roots(&self) -> Vec<&Arc<PublishedContent>> {
        self.roots.iter().filter_map(|id| self.nodes.get(id)).collect()
    }

    /// Direct children in sort order.
    pub fn children(&self, id: NodeId) -> Vec<&Arc<PublishedContent>> {
        self.children
            .get(&id)
            .map(|ids| ids.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    /// All descendants, depth-first in sort order, excluding the node itself.
    pub fn descendants(&self, id: NodeId) -> Vec<&Arc<PublishedContent>> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self
            .children
            .get(&id)
            .map(|ids| ids.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.get(&next) {
                out.push(node);
            }
            if let Some(kids) = self.children.get(&next) {
                stack.extend(kids.iter().rev().copied());
            }
        }
        out
    }

    /// Ancestors from the root down, excluding the node itself.
    pub fn ancestors(&self, id: NodeId) -> Vec<&Arc<PublishedContent>> {
        self.nodes
            .get(&id)
            .map(|node| {
                node.path
                    .iter()
                    .filter(|p| **p != id)
                    .filter_map(|p| self.nodes.get(p))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Look a node up by its url-segment route, e.g. `/home/about-us`.
    pub fn by_route(&self, route: &str) -> Option<&Arc<PublishedContent>> {
        let mut candidates: &[NodeId] = &self.roots;
        let mut found = None;
        for segment in route.split('/').filter(|s| !s.is_empty()) {
            let next = candidates
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .find(|node| node.url_segment == segment)?;
            candidates = self
                .children
                .get(&next.id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            found = Some(next);
        }
        found
    }

    /// Every node, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PublishedContent>> {
        self.nodes.values()
    }

    fn branch_ids(&self, id: NodeId) -> Vec<NodeId> {
        if !self.nodes.contains_key(&id) {
            return Vec::new();
        }
        let mut ids = vec![id];
        let mut cursor = 0;
        while cursor < ids.len() {
            if let Some(kids) = self.children.get(&ids[cursor]) {
                ids.extend(kids.iter().copied());
            }
            cursor += 1;
        }
        ids
    }
}

/// Why an edit could not be applied to the working tree.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EditError {
    /// A record hangs off a parent that is in neither the tree nor the batch.
    #[error("node {id} has no parent {parent} in the tree")]
    Orphaned { id: NodeId, parent: NodeId },
    /// The record could not be materialised.
    #[error(transparent)]
    Invalid(RepositoryError),
}

/// Outcome of an attempted in-place value update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InPlace {
    Applied,
    /// The node is not part of this view before or after the change.
    NotInView,
    /// The node's slot is missing or its position changed: reload the branch.
    NeedsBranch,
}

/// Working copy of a tree. Edits never touch the base tree; `finish` yields
/// the new tree and whether anything observable changed.
pub struct TreeEditor<'a> {
    base: &'a PublishedTree,
    tree: PublishedTree,
    view: NodeView,
    schema: &'a SchemaSnapshot,
    strict: bool,
    touched: BTreeSet<NodeId>,
    roots_touched: bool,
}

impl<'a> TreeEditor<'a> {
    pub fn new(
        base: &'a PublishedTree,
        view: NodeView,
        schema: &'a SchemaSnapshot,
        strict: bool,
    ) -> Self {
        Self {
            base,
            tree: base.clone(),
            view,
            schema,
            strict,
            touched: BTreeSet::new(),
            roots_touched: false,
        }
    }

    pub fn tree(&self) -> &PublishedTree {
        &self.tree
    }

    /// Remove a node and its descendants. Unknown ids are a no-op.
    pub fn remove_branch(&mut self, id: NodeId) -> bool {
        let ids = self.tree.branch_ids(id);
        let Some(root) = ids.first().and_then(|i| self.tree.nodes.get(i)).cloned() else {
            return false;
        };
        for node_id in &ids {
            self.tree.nodes.remove(node_id);
            self.tree.children.remove(node_id);
            self.touched.insert(*node_id);
        }
        match root.parent_id {
            Some(parent) => {
                if let Some(siblings) = self.tree.children.get_mut(&parent) {
                    siblings.retain(|s| *s != id);
                }
                self.touched.insert(parent);
            }
            None => {
                self.tree.roots.retain(|r| *r != id);
                self.roots_touched = true;
            }
        }
        true
    }

    /// Replace whatever the tree holds for `id` with the given branch records.
    pub fn replace_branch(&mut self, id: NodeId, records: &[NodeRecord]) -> Result<(), EditError> {
        self.remove_branch(id);
        self.insert_records(records)
    }

    /// Insert records parent-first. Records without data for this view are
    /// skipped together with everything below them.
    pub fn insert_records(&mut self, records: &[NodeRecord]) -> Result<(), EditError> {
        let known: HashSet<NodeId> = records.iter().map(|r| r.id).collect();
        for record in parent_first(records) {
            let Some(data) = record.data(self.view) else {
                continue;
            };
            let parent = match record.parent_id {
                None => None,
                Some(parent_id) => match self.tree.nodes.get(&parent_id) {
                    Some(parent) => Some(Arc::clone(parent)),
                    // Parent is in the batch but not in this view.
                    None if known.contains(&parent_id) => continue,
                    None if self.strict => {
                        return Err(EditError::Orphaned {
                            id: record.id,
                            parent: parent_id,
                        })
                    }
                    // Not visible because an ancestor is outside this view.
                    None => continue,
                },
            };
            let node = self
                .schema
                .materialize(record, data, self.view, parent.as_deref())
                .map_err(EditError::Invalid)?;
            self.attach(node);
        }
        Ok(())
    }

    /// Recompute a node's values in its existing slot.
    pub fn update_in_place(&mut self, record: &NodeRecord) -> Result<InPlace, EditError> {
        let existing = self.tree.nodes.get(&record.id).cloned();
        let data = record.data(self.view);
        let (existing, data) = match (existing, data) {
            (None, None) => return Ok(InPlace::NotInView),
            (Some(existing), Some(data)) => (existing, data),
            _ => return Ok(InPlace::NeedsBranch),
        };
        if existing.parent_id != record.parent_id || existing.sort_order != record.sort_order {
            return Ok(InPlace::NeedsBranch);
        }
        let parent = record
            .parent_id
            .and_then(|p| self.tree.nodes.get(&p))
            .cloned();
        let node = self
            .schema
            .materialize(record, data, self.view, parent.as_deref())
            .map_err(EditError::Invalid)?;
        if *existing != node {
            self.tree.nodes.insert(record.id, Arc::new(node));
            self.touched.insert(record.id);
        }
        Ok(InPlace::Applied)
    }

    fn attach(&mut self, node: PublishedContent) {
        let id = node.id;
        let parent = node.parent_id;
        if let Some(previous) = self.tree.nodes.get(&id) {
            if previous.parent_id != parent {
                match previous.parent_id {
                    Some(old) => {
                        if let Some(siblings) = self.tree.children.get_mut(&old) {
                            siblings.retain(|s| *s != id);
                        }
                        self.touched.insert(old);
                    }
                    None => {
                        self.tree.roots.retain(|r| *r != id);
                        self.roots_touched = true;
                    }
                }
            }
        }
        self.tree.nodes.insert(id, Arc::new(node));
        self.touched.insert(id);
        let nodes = &self.tree.nodes;
        let siblings = match parent {
            Some(parent_id) => {
                self.touched.insert(parent_id);
                self.tree.children.entry(parent_id).or_default()
            }
            None => {
                self.roots_touched = true;
                &mut self.tree.roots
            }
        };
        if !siblings.contains(&id) {
            siblings.push(id);
        }
        siblings.sort_by_key(|s| {
            nodes
                .get(s)
                .map(|n| (n.sort_order, n.id))
                .unwrap_or((i32::MAX, *s))
        });
    }

    /// Whether the working tree differs observably from the base.
    pub fn has_changes(&self) -> bool {
        if self.roots_touched && self.tree.roots != self.base.roots {
            return true;
        }
        self.touched.iter().any(|id| {
            self.tree.nodes.get(id) != self.base.nodes.get(id)
                || self.tree.children.get(id).filter(|c| !c.is_empty())
                    != self.base.children.get(id).filter(|c| !c.is_empty())
        })
    }

    pub fn finish(self) -> (PublishedTree, bool) {
        let changed = self.has_changes();
        (self.tree, changed)
    }
}

/// Order records so every parent comes before its children; siblings by
/// sort order. Records caught in a parent cycle are dropped.
fn parent_first(records: &[NodeRecord]) -> Vec<&NodeRecord> {
    let ids: HashSet<NodeId> = records.iter().map(|r| r.id).collect();
    let mut by_parent: HashMap<NodeId, Vec<&NodeRecord>> = HashMap::new();
    let mut tops: Vec<&NodeRecord> = Vec::new();
    for record in records {
        match record.parent_id {
            Some(parent) if ids.contains(&parent) && parent != record.id => {
                by_parent.entry(parent).or_default().push(record)
            }
            _ => tops.push(record),
        }
    }
    let key = |r: &&NodeRecord| (r.sort_order, r.id);
    tops.sort_by_key(key);
    for kids in by_parent.values_mut() {
        kids.sort_by_key(key);
    }

    let mut ordered = Vec::with_capacity(records.len());
    let mut queue: VecDeque<&NodeRecord> = tops.into();
    while let Some(record) = queue.pop_front() {
        ordered.push(record);
        if let Some(kids) = by_parent.remove(&record.id) {
            queue.extend(kids);
        }
    }
    ordered
}
