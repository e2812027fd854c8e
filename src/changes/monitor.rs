//! Per-device change ledger.
//!
//! A [`ChangeMonitor`] maps object ids to the names of the attributes that
//! changed. Additions and removals are recorded under the reserved names
//! [`ADDED`] and [`REMOVED`]. Events are only recorded for monitored
//! collections (add/remove) and monitored classes (attribute changes), and
//! are dropped while the monitor is frozen.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::models::{ObjectKind, new_id};

/// Reserved attribute name recorded when an object is added.
pub const ADDED: &str = "__add__";
/// Reserved attribute name recorded when an object is removed.
pub const REMOVED: &str = "__del__";

/// Whether an attribute name is one of the add/remove markers.
pub fn is_marker(name: &str) -> bool {
    name == ADDED || name == REMOVED
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeMonitor {
    guid: String,
    changes: BTreeMap<String, BTreeSet<String>>,
    #[serde(skip)]
    monitored_collections: BTreeSet<ObjectKind>,
    #[serde(skip)]
    monitored_classes: BTreeSet<ObjectKind>,
    #[serde(skip)]
    frozen: u32,
    #[serde(skip)]
    suppressed: usize,
}

impl Default for ChangeMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeMonitor {
    /// A monitor for a freshly generated device id.
    pub fn new() -> Self {
        Self::with_guid(new_id())
    }

    pub fn with_guid(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            changes: BTreeMap::new(),
            monitored_collections: BTreeSet::new(),
            monitored_classes: BTreeSet::new(),
            frozen: 0,
            suppressed: 0,
        }
    }

    /// A monitor recording every kind of event for every object kind.
    pub fn monitoring_all(guid: impl Into<String>) -> Self {
        let mut monitor = Self::with_guid(guid);
        for kind in [ObjectKind::Task, ObjectKind::Category, ObjectKind::Note] {
            monitor.monitor_collection(kind);
            monitor.monitor_class(kind);
        }
        monitor
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Start recording additions and removals for a collection.
    pub fn monitor_collection(&mut self, kind: ObjectKind) {
        self.monitored_collections.insert(kind);
    }

    /// Start recording attribute changes for a class of objects.
    pub fn monitor_class(&mut self, kind: ObjectKind) {
        self.monitored_classes.insert(kind);
    }

    /// Replace the recorded changes of one object.
    pub fn set_changes<I, S>(&mut self, id: impl Into<String>, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changes
            .insert(id.into(), names.into_iter().map(Into::into).collect());
    }

    fn accepts(&mut self, enabled: bool) -> bool {
        if self.frozen > 0 {
            self.suppressed += 1;
            return false;
        }
        enabled
    }

    /// Record attribute changes of an object.
    pub fn mark_changed<I, S>(&mut self, kind: ObjectKind, id: &str, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let enabled = self.monitored_classes.contains(&kind);
        if !self.accepts(enabled) {
            return;
        }
        self.changes
            .entry(id.to_string())
            .or_default()
            .extend(names.into_iter().map(Into::into));
    }

    /// Record that an object joined a monitored collection.
    pub fn object_added(&mut self, kind: ObjectKind, id: &str) {
        let enabled = self.monitored_collections.contains(&kind);
        if !self.accepts(enabled) {
            return;
        }
        let entry = self.changes.entry(id.to_string()).or_default();
        entry.remove(REMOVED);
        entry.insert(ADDED.to_string());
    }

    /// Record that an object left a monitored collection.
    pub fn object_removed(&mut self, kind: ObjectKind, id: &str) {
        let enabled = self.monitored_collections.contains(&kind);
        if !self.accepts(enabled) {
            return;
        }
        self.changes
            .entry(id.to_string())
            .or_default()
            .insert(REMOVED.to_string());
    }

    pub fn changes_for(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.changes.get(id)
    }

    /// Attribute changes of an object, add/remove markers excluded.
    pub fn attributes_for(&self, id: &str) -> BTreeSet<&str> {
        self.changes
            .get(id)
            .map(|names| {
                names
                    .iter()
                    .map(String::as_str)
                    .filter(|n| !is_marker(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_change(&self, id: &str, name: &str) -> bool {
        self.changes.get(id).is_some_and(|names| names.contains(name))
    }

    /// Whether anything at all was recorded for `id`.
    pub fn is_touched(&self, id: &str) -> bool {
        self.changes.get(id).is_some_and(|names| !names.is_empty())
    }

    pub fn is_removed(&self, id: &str) -> bool {
        self.has_change(id, REMOVED)
    }

    pub fn all_changes(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.changes
    }

    /// `true` when no object has a pending change.
    pub fn is_empty(&self) -> bool {
        self.changes.values().all(BTreeSet::is_empty)
    }

    /// Forget one object entirely.
    pub fn remove(&mut self, id: &str) {
        self.changes.remove(id);
    }

    /// Empty every entry but keep the ids; removed objects are forgotten.
    pub fn reset_all_changes(&mut self) {
        self.changes.retain(|_, names| !names.contains(REMOVED));
        for names in self.changes.values_mut() {
            names.clear();
        }
    }

    /// Forget every entry.
    pub fn reset(&mut self) {
        self.changes.clear();
    }

    /// Union another ledger into this one.
    pub fn merge(&mut self, other: &ChangeMonitor) {
        for (id, names) in &other.changes {
            self.changes
                .entry(id.clone())
                .or_default()
                .extend(names.iter().cloned());
        }
    }

    /// Suspend recording. Nests.
    pub fn freeze(&mut self) {
        self.frozen += 1;
    }

    /// Resume recording once every `freeze` has been matched.
    pub fn thaw(&mut self) {
        if self.frozen == 0 {
            return;
        }
        self.frozen -= 1;
        if self.frozen == 0 && self.suppressed > 0 {
            debug!(
                guid = %self.guid,
                suppressed = self.suppressed,
                "Dropped change events while frozen"
            );
            self.suppressed = 0;
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen > 0
    }
}
