//! Classification categories with materialized paths.
//!
//! Categories form a forest (multiple roots, no cycles). Each node stores a
//! materialized path - its ancestor chain encoded as `/id/id/.../` - which
//! makes descendant checks a string prefix comparison and filter expansion a
//! linear scan, with no recursive queries.
//!
//! Moves recompute the paths of the moved node and all of its descendants as
//! one staged update: the new paths are computed fully before any of them is
//! applied, so readers never observe a partially re-pathed subtree.

use crate::error::TaxonomyError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Identifier of a classification category.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CategoryId(u64);

impl CategoryId {
    /// Creates a `CategoryId` from a raw u64 value.
    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value of this id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CategoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single category node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    /// Node identifier.
    pub id: CategoryId,
    /// Parent node, `None` for roots.
    pub parent_id: Option<CategoryId>,
    /// Materialized ancestor chain including this node, e.g. `/1/4/9/`.
    /// Always the parent's path with this node's id appended.
    pub path: String,
    /// Depth in the tree, roots are level 1.
    pub level: u32,
}

/// In-memory category forest.
#[derive(Debug, Default, Clone)]
pub struct Taxonomy {
    nodes: HashMap<CategoryId, Category>,
}

impl Taxonomy {
    /// Creates an empty taxonomy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a taxonomy from persisted nodes.
    ///
    /// Paths are taken as stored; they were validated when written.
    pub fn from_nodes(nodes: impl IntoIterator<Item = Category>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    /// Number of categories.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the taxonomy has no categories.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a category by id.
    pub fn get(&self, id: CategoryId) -> Option<&Category> {
        self.nodes.get(&id)
    }

    /// Returns `true` if the category exists.
    pub fn contains(&self, id: CategoryId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Adds a new category under `parent_id` (or as a root when `None`).
    ///
    /// Returns the created node. Fails on duplicate ids and unknown parents;
    /// insertion cannot create a cycle because the new node has no children.
    pub fn add(
        &mut self,
        id: CategoryId,
        parent_id: Option<CategoryId>,
    ) -> Result<Category, TaxonomyError> {
        if self.nodes.contains_key(&id) {
            return Err(TaxonomyError::DuplicateCategory(id));
        }
        let (path, level) = match parent_id {
            Some(pid) => {
                let parent = self
                    .nodes
                    .get(&pid)
                    .ok_or(TaxonomyError::UnknownParent(pid))?;
                (format!("{}{}/", parent.path, id.as_u64()), parent.level + 1)
            }
            None => (format!("/{}/", id.as_u64()), 1),
        };
        let node = Category {
            id,
            parent_id,
            path,
            level,
        };
        self.nodes.insert(id, node.clone());
        Ok(node)
    }

    /// Moves a category (and implicitly its whole subtree) under a new
    /// parent, or to the root when `new_parent` is `None`.
    ///
    /// Returns every node whose path changed (the moved node and all its
    /// descendants) so the caller can persist them as one batch. The new
    /// paths are staged before any node is touched - a failed validation
    /// leaves the taxonomy unchanged.
    pub fn move_to(
        &mut self,
        id: CategoryId,
        new_parent: Option<CategoryId>,
    ) -> Result<Vec<Category>, TaxonomyError> {
        let node = self
            .nodes
            .get(&id)
            .ok_or(TaxonomyError::UnknownCategory(id))?;
        let old_path = node.path.clone();

        let (parent_path, parent_level) = match new_parent {
            Some(pid) => {
                let parent = self
                    .nodes
                    .get(&pid)
                    .ok_or(TaxonomyError::UnknownParent(pid))?;
                // A node may not move under itself or any of its descendants.
                if parent.path.starts_with(&old_path) {
                    return Err(TaxonomyError::CycleDetected {
                        category: id,
                        new_parent: pid,
                    });
                }
                (parent.path.clone(), parent.level)
            }
            None => (String::from("/"), 0),
        };

        let new_path = format!("{}{}/", parent_path, id.as_u64());
        let level_delta = (parent_level + 1) as i64 - node.level as i64;

        // Stage the full set of updates before applying any of them.
        let mut updated = Vec::new();
        for cat in self.nodes.values() {
            if !cat.path.starts_with(&old_path) {
                continue;
            }
            let mut next = cat.clone();
            next.path = format!("{}{}", new_path, &cat.path[old_path.len()..]);
            next.level = (cat.level as i64 + level_delta) as u32;
            if next.id == id {
                next.parent_id = new_parent;
            }
            updated.push(next);
        }

        for cat in &updated {
            self.nodes.insert(cat.id, cat.clone());
        }
        Ok(updated)
    }

    /// Removes a leaf category. Categories with descendants cannot be
    /// removed; move or remove the children first.
    pub fn remove(&mut self, id: CategoryId) -> Result<Category, TaxonomyError> {
        let node = self
            .nodes
            .get(&id)
            .ok_or(TaxonomyError::UnknownCategory(id))?;
        let prefix = node.path.clone();
        let has_children = self
            .nodes
            .values()
            .any(|c| c.id != id && c.path.starts_with(&prefix));
        if has_children {
            return Err(TaxonomyError::HasDescendants(id));
        }
        self.nodes
            .remove(&id)
            .ok_or(TaxonomyError::UnknownCategory(id))
    }

    /// Returns `true` when `category_id` equals `ancestor_id` or lies in its
    /// subtree, via materialized-path prefix comparison.
    pub fn is_descendant_or_self(
        &self,
        category_id: CategoryId,
        ancestor_id: CategoryId,
    ) -> bool {
        match (self.nodes.get(&category_id), self.nodes.get(&ancestor_id)) {
            (Some(cat), Some(anc)) => cat.path.starts_with(&anc.path),
            _ => false,
        }
    }

    /// Expands a filter set to the given categories plus all descendants.
    ///
    /// Fails with `UnknownCategory` if any filter id does not exist - a
    /// malformed filter is a caller error, not an empty result.
    pub fn expand_filter(
        &self,
        category_ids: &BTreeSet<CategoryId>,
    ) -> Result<HashSet<CategoryId>, TaxonomyError> {
        let mut prefixes = Vec::with_capacity(category_ids.len());
        for id in category_ids {
            let node = self
                .nodes
                .get(id)
                .ok_or(TaxonomyError::UnknownCategory(*id))?;
            prefixes.push(node.path.as_str());
        }
        let expanded = self
            .nodes
            .values()
            .filter(|c| prefixes.iter().any(|p| c.path.starts_with(p)))
            .map(|c| c.id)
            .collect();
        Ok(expanded)
    }

    /// All nodes, for persistence.
    pub fn nodes(&self) -> impl Iterator<Item = &Category> {
        self.nodes.values()
    }
}
