//! Composite collections of domain objects.
//!
//! Tasks, categories and notes form trees. A [`Collection`] owns the root
//! items; children live inside their parent. Lookups are by id anywhere in
//! the tree.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Base, SyncStatus};

/// Attribute name → encoded value. Used to diff objects and to copy single
/// attributes between two copies of the same object.
pub type FieldMap = BTreeMap<String, String>;

/// The three kinds of top-level collection a document holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Task,
    Category,
    Note,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Task => "task",
            ObjectKind::Category => "category",
            ObjectKind::Note => "note",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Anything addressable by a string id.
pub trait Identified {
    fn id(&self) -> &str;
}

/// A persisted object with an id, a sync status, children, and a field map.
pub trait DomainObject: Identified + Clone + fmt::Debug {
    const KIND: ObjectKind;

    fn base(&self) -> &Base;
    fn base_mut(&mut self) -> &mut Base;
    fn children(&self) -> &[Self];
    fn children_mut(&mut self) -> &mut Vec<Self>;

    /// Serialize every persisted attribute (children excluded).
    fn fields(&self) -> FieldMap;

    /// Inverse of [`DomainObject::fields`] for a single attribute.
    ///
    /// Returns `false` for unknown names. Values that do not decode leave the
    /// attribute unchanged.
    fn apply_field(&mut self, name: &str, value: &str) -> bool;

    fn status(&self) -> SyncStatus {
        self.base().status
    }

    fn set_status(&mut self, status: SyncStatus) {
        self.base_mut().status = status;
    }

    fn is_deleted(&self) -> bool {
        self.status() == SyncStatus::Deleted
    }

    /// A copy of this object with no children.
    fn without_children(&self) -> Self {
        let mut copy = self.clone();
        copy.children_mut().clear();
        copy
    }
}

fn find<'a, T: DomainObject>(items: &'a [T], id: &str) -> Option<&'a T> {
    for item in items {
        if item.id() == id {
            return Some(item);
        }
        if let Some(found) = find(item.children(), id) {
            return Some(found);
        }
    }
    None
}

fn find_mut<'a, T: DomainObject>(items: &'a mut [T], id: &str) -> Option<&'a mut T> {
    for item in items.iter_mut() {
        if item.id() == id {
            return Some(item);
        }
        if let Some(found) = find_mut(item.children_mut(), id) {
            return Some(found);
        }
    }
    None
}

fn find_parent<'a, T: DomainObject>(items: &'a [T], id: &str) -> Option<&'a T> {
    for item in items {
        if item.children().iter().any(|c| c.id() == id) {
            return Some(item);
        }
        if let Some(found) = find_parent(item.children(), id) {
            return Some(found);
        }
    }
    None
}

fn remove_from<T: DomainObject>(items: &mut Vec<T>, id: &str) -> Option<T> {
    if let Some(pos) = items.iter().position(|i| i.id() == id) {
        return Some(items.remove(pos));
    }
    for item in items.iter_mut() {
        if let Some(removed) = remove_from(item.children_mut(), id) {
            return Some(removed);
        }
    }
    None
}

/// A forest of domain objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collection<T> {
    roots: Vec<T>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self { roots: Vec::new() }
    }
}

impl<T: DomainObject> Collection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_roots(roots: Vec<T>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[T] {
        &self.roots
    }

    pub fn roots_mut(&mut self) -> &mut Vec<T> {
        &mut self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Number of objects, descendants included.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        find(&self.roots, id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        find_mut(&mut self.roots, id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// The direct parent of `id`, `None` for roots and unknown ids.
    pub fn parent_of(&self, id: &str) -> Option<&T> {
        find_parent(&self.roots, id)
    }

    /// Insert `item` under `parent`, or as a root when the parent is absent
    /// or unknown. An existing object with the same id is replaced.
    pub fn insert(&mut self, item: T, parent: Option<&str>) {
        if self.contains(item.id()) {
            self.remove(item.id());
        }
        match parent.and_then(|p| find_mut(&mut self.roots, p)) {
            Some(parent) => parent.children_mut().push(item),
            None => self.roots.push(item),
        }
    }

    /// Remove an object together with its subtree.
    pub fn remove(&mut self, id: &str) -> Option<T> {
        remove_from(&mut self.roots, id)
    }

    /// Pre-order traversal over every object.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            stack: self.roots.iter().rev().collect(),
        }
    }

    /// Ids of `id` and every descendant, pre-order. Empty for unknown ids.
    pub fn subtree_ids(&self, id: &str) -> Vec<String> {
        let stack = self.get(id).into_iter().collect();
        Iter { stack }.map(|item| item.id().to_string()).collect()
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.iter().map(|item| item.id().to_string()).collect()
    }

    /// Drop every object, returning the former roots.
    pub fn clear(&mut self) -> Vec<T> {
        std::mem::take(&mut self.roots)
    }

    /// Mutable pre-order visit over every object.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut T)) {
        fn visit<T: DomainObject>(items: &mut [T], f: &mut impl FnMut(&mut T)) {
            for item in items.iter_mut() {
                f(item);
                visit(item.children_mut(), f);
            }
        }
        visit(&mut self.roots, &mut f);
    }
}

/// Pre-order iterator over a [`Collection`].
pub struct Iter<'a, T> {
    stack: Vec<&'a T>,
}

impl<'a, T: DomainObject> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.stack.pop()?;
        self.stack.extend(item.children().iter().rev());
        Some(item)
    }
}
