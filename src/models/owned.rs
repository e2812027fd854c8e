//! Objects owned by another object: notes of a task, attachments of a note,
//! efforts of a task.
//!
//! Owned collections are persisted inside their owner and travel through
//! change tracking as a single JSON-encoded attribute of the owner.

use serde::{Deserialize, Serialize};

use super::collection::Identified;

/// An id-keyed list kept in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnedCollection<T> {
    items: Vec<T>,
}

impl<T> Default for OwnedCollection<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> FromIterator<T> for OwnedCollection<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<T: Identified> OwnedCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item, replacing one with the same id.
    pub fn add(&mut self, item: T) {
        match self.items.iter_mut().find(|i| i.id() == item.id()) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let pos = self.items.iter().position(|i| i.id() == id)?;
        Some(self.items.remove(pos))
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.iter().find(|i| i.id() == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.items.iter_mut().find(|i| i.id() == id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items ordered by id, the order they are written in.
    pub fn sorted_by_id(&self) -> Vec<&T> {
        let mut sorted: Vec<&T> = self.items.iter().collect();
        sorted.sort_by(|a, b| a.id().cmp(b.id()));
        sorted
    }

    /// JSON form used as the owner's attribute value.
    pub fn to_field(&self) -> String
    where
        T: Serialize,
    {
        serde_json::to_string(&self.items).unwrap_or_default()
    }

    /// Decode [`OwnedCollection::to_field`] output; `None` if it is not valid.
    pub fn from_field(value: &str) -> Option<Self>
    where
        T: for<'de> Deserialize<'de>,
    {
        if value.is_empty() {
            return Some(Self::default());
        }
        serde_json::from_str::<Vec<T>>(value)
            .ok()
            .map(|items| Self { items })
    }
}

impl<'a, T> IntoIterator for &'a OwnedCollection<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
