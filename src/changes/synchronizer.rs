//! Merge the on-disk copy of a collection into the in-memory copy.
//!
//! Two ledgers drive the merge: the local monitor (edits made in this
//! process and not yet published) and the inbound ledger (edits other
//! devices made that this device has not merged yet). Local edits win at
//! attribute granularity.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, warn};

use super::monitor::{ChangeMonitor, REMOVED};
use crate::models::{Collection, DomainObject, ObjectKind, SyncStatus};

/// An attribute changed both locally and on another device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Conflict {
    pub kind: ObjectKind,
    pub id: String,
    pub attribute: String,
}

/// What a synchronization run changed in memory.
///
/// Only real mutations are listed, so running the same merge twice reports
/// nothing the second time. Conflicts are informational and repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Objects inserted from disk
    pub added: Vec<String>,
    /// Objects removed because another device deleted them
    pub removed: Vec<String>,
    /// Objects kept despite a remote deletion because they changed locally
    pub resurrected: Vec<String>,
    /// Attributes copied from disk, per object
    pub updated: BTreeMap<String, BTreeSet<String>>,
    /// Memory-only objects re-flagged as new
    pub marked_new: Vec<String>,
    pub conflicts: Vec<Conflict>,
}

impl SyncReport {
    /// `true` when the merge did not mutate anything.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.resurrected.is_empty()
            && self.updated.is_empty()
            && self.marked_new.is_empty()
    }

    pub fn mutation_count(&self) -> usize {
        self.added.len()
            + self.removed.len()
            + self.resurrected.len()
            + self.updated.values().map(BTreeSet::len).sum::<usize>()
            + self.marked_new.len()
    }
}

pub struct ChangeSynchronizer<'a> {
    local: &'a ChangeMonitor,
    inbound: &'a ChangeMonitor,
    report: SyncReport,
}

impl<'a> ChangeSynchronizer<'a> {
    pub fn new(local: &'a ChangeMonitor, inbound: &'a ChangeMonitor) -> Self {
        Self {
            local,
            inbound,
            report: SyncReport::default(),
        }
    }

    pub fn report(&self) -> &SyncReport {
        &self.report
    }

    pub fn into_report(self) -> SyncReport {
        self.report
    }

    /// Merge `disk` into `memory`.
    pub fn sync<T: DomainObject>(&mut self, memory: &mut Collection<T>, disk: &Collection<T>) {
        self.apply_remote_removals(memory);
        self.apply_disk_objects(memory, disk);
        self.flag_memory_only(memory, disk);
    }

    fn apply_remote_removals<T: DomainObject>(&mut self, memory: &mut Collection<T>) {
        let removed: Vec<String> = self
            .inbound
            .all_changes()
            .iter()
            .filter(|(_, names)| names.contains(REMOVED))
            .map(|(id, _)| id.clone())
            .filter(|id| memory.contains(id))
            .collect();

        for id in removed {
            // Removing an object takes its subtree, so a local edit anywhere
            // below it keeps the whole chain.
            let subtree = memory.subtree_ids(&id);
            if subtree.is_empty() {
                continue;
            }
            let edited_below = subtree
                .iter()
                .any(|sub| self.local.is_touched(sub) && !self.local.is_removed(sub));
            if edited_below {
                if let Some(item) = memory.get_mut(&id) {
                    if item.status() != SyncStatus::New {
                        item.set_status(SyncStatus::New);
                        debug!(
                            kind = %T::KIND,
                            id = %id,
                            "Kept remotely deleted object with local edits"
                        );
                        self.report.resurrected.push(id);
                    }
                }
            } else if memory.remove(&id).is_some() {
                debug!(kind = %T::KIND, id = %id, "Removed object deleted on another device");
                self.report.removed.push(id);
            }
        }
    }

    fn apply_disk_objects<T: DomainObject>(
        &mut self,
        memory: &mut Collection<T>,
        disk: &Collection<T>,
    ) {
        for disk_item in disk.iter() {
            let id = disk_item.id();
            if memory.contains(id) {
                self.merge_attributes(memory, disk_item);
                continue;
            }
            if self.local.is_removed(id) || self.inbound.is_removed(id) {
                continue;
            }
            let parent = disk.parent_of(id).map(|p| p.id().to_string());
            if let Some(parent_id) = &parent {
                // Children of a subtree we dropped stay dropped
                if !memory.contains(parent_id) {
                    continue;
                }
            }
            memory.insert(disk_item.without_children(), parent.as_deref());
            debug!(kind = %T::KIND, id = %id, "Inserted object from disk");
            self.report.added.push(id.to_string());
        }
    }

    fn merge_attributes<T: DomainObject>(&mut self, memory: &mut Collection<T>, disk_item: &T) {
        let id = disk_item.id();
        let inbound = self.inbound.attributes_for(id);
        if inbound.is_empty() {
            return;
        }
        let Some(item) = memory.get_mut(id) else {
            return;
        };

        let disk_fields = disk_item.fields();
        let memory_fields = item.fields();
        let mut copied = BTreeSet::new();

        for name in inbound {
            if name == "modificationDateTime" {
                continue;
            }
            let Some(disk_value) = disk_fields.get(name) else {
                continue;
            };
            if memory_fields.get(name) == Some(disk_value) {
                continue;
            }
            if self.local.has_change(id, name) {
                self.report.conflicts.push(Conflict {
                    kind: T::KIND,
                    id: id.to_string(),
                    attribute: name.to_string(),
                });
                continue;
            }
            if item.apply_field(name, disk_value) {
                copied.insert(name.to_string());
            } else {
                warn!(
                    kind = %T::KIND,
                    id = %id,
                    attribute = name,
                    "Ignoring unknown attribute in change ledger"
                );
            }
        }

        if !copied.is_empty() {
            let disk_modified = disk_item.base().modification;
            if disk_modified > item.base().modification {
                item.base_mut().modification = disk_modified;
            }
            debug!(kind = %T::KIND, id = %id, attributes = ?copied, "Copied attributes from disk");
            self.report.updated.insert(id.to_string(), copied);
        }
    }

    fn flag_memory_only<T: DomainObject>(
        &mut self,
        memory: &mut Collection<T>,
        disk: &Collection<T>,
    ) {
        let disk_ids = disk.ids();
        let inbound = self.inbound;
        let report = &mut self.report;
        memory.for_each_mut(|item| {
            let id = item.id().to_string();
            if disk_ids.contains(&id) || inbound.is_removed(&id) {
                return;
            }
            if item.status() != SyncStatus::New && !item.is_deleted() {
                item.set_status(SyncStatus::New);
                report.marked_new.push(id);
            }
        });
    }
}
