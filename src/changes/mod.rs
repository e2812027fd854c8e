//! Change tracking and merging between devices sharing one task file.
//!
//! Each process owns a [`ChangeMonitor`] for its own edits. The `.delta`
//! sidecar stores a [`ChangeMap`]: for every device, the changes other
//! devices made that it has not merged yet. Saving publishes the local
//! monitor into every other device's ledger; merging consumes this
//! device's ledger through the [`ChangeSynchronizer`].

pub mod monitor;
pub mod synchronizer;

use std::collections::BTreeMap;

pub use monitor::{ADDED, ChangeMonitor, REMOVED};
pub use synchronizer::{ChangeSynchronizer, Conflict, SyncReport};

/// Device GUID → ledger of changes that device still has to merge.
pub type ChangeMap = BTreeMap<String, ChangeMonitor>;

/// Publish `local` into every ledger except the one of its own device.
pub fn publish(map: &mut ChangeMap, local: &ChangeMonitor) {
    for (guid, ledger) in map.iter_mut() {
        if guid != local.guid() {
            ledger.merge(local);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObjectKind;

    #[test]
    fn test_publish_skips_own_ledger() {
        let mut local = ChangeMonitor::monitoring_all("me");
        local.mark_changed(ObjectKind::Task, "t1", ["subject"]);

        let mut map = ChangeMap::new();
        map.insert("me".into(), ChangeMonitor::with_guid("me"));
        map.insert("other".into(), ChangeMonitor::with_guid("other"));

        publish(&mut map, &local);
        assert!(map["me"].all_changes().is_empty());
        assert!(map["other"].has_change("t1", "subject"));
    }
}
