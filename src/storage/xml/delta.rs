//! The `.delta` sidecar: per-device change ledgers.
//!
//! ```xml
//! <changes>
//! <device guid="...">
//! <obj id="task-id">subject,duedate</obj>
//! </device>
//! </changes>
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use tracing::warn;

use crate::Result;
use crate::changes::{ChangeMap, ChangeMonitor};

/// Sidecar path for a task file (`<file>.delta`).
pub fn delta_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".delta");
    PathBuf::from(name)
}

/// Parse ledger XML.
pub fn parse(text: &str) -> Result<ChangeMap> {
    let mut map = ChangeMap::new();
    if text.trim().is_empty() {
        return Ok(map);
    }
    let doc = roxmltree::Document::parse(text)?;
    for device in doc
        .root_element()
        .children()
        .filter(|n| n.has_tag_name("device"))
    {
        let Some(guid) = device.attribute("guid") else {
            continue;
        };
        let mut ledger = ChangeMonitor::with_guid(guid);
        for obj in device.children().filter(|n| n.has_tag_name("obj")) {
            let Some(id) = obj.attribute("id") else {
                continue;
            };
            let names = obj
                .text()
                .unwrap_or("")
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty());
            ledger.set_changes(id, names);
        }
        map.insert(guid.to_string(), ledger);
    }
    Ok(map)
}

/// Read a sidecar. Missing, empty and unreadable sidecars are an empty map.
pub fn read_file(path: &Path) -> ChangeMap {
    match fs::read_to_string(path) {
        Ok(text) => parse(&text).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable change ledger");
            ChangeMap::new()
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => ChangeMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read change ledger");
            ChangeMap::new()
        }
    }
}

/// Serialize ledgers, devices and ids in sorted order.
pub fn to_bytes(map: &ChangeMap) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;
    writer.write_event(Event::Start(BytesStart::new("changes")))?;
    writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;
    for (guid, ledger) in map {
        let mut device = BytesStart::new("device");
        device.push_attribute(("guid", guid.as_str()));
        writer.write_event(Event::Start(device))?;
        writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;
        for (id, names) in ledger.all_changes() {
            let mut obj = BytesStart::new("obj");
            obj.push_attribute(("id", id.as_str()));
            if names.is_empty() {
                writer.write_event(Event::Empty(obj))?;
            } else {
                let joined: Vec<&str> = names.iter().map(String::as_str).collect();
                writer.write_event(Event::Start(obj))?;
                writer.write_event(Event::Text(BytesText::new(&joined.join(","))))?;
                writer.write_event(Event::End(BytesEnd::new("obj")))?;
            }
            writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("device")))?;
        writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("changes")))?;
    writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;
    Ok(writer.into_inner())
}
