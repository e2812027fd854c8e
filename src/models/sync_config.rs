//! SyncML-style configuration tree stored at the end of the task file.
//!
//! The engine does not interpret it; it only has to survive load/save
//! unchanged. Nodes carry ordered `name = value` properties and named
//! children.

use serde::{Deserialize, Serialize};

/// A node of the configuration tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<(String, String)>,
    #[serde(default)]
    pub children: Vec<SyncConfig>,
}

impl SyncConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            children: Vec::new(),
        }
    }

    /// The configuration a fresh document starts with.
    ///
    /// ```text
    /// root
    /// └── TaskCoach-<guid>
    ///     └── spds
    ///         ├── sources
    ///         │   ├── TaskCoach-<guid>.Tasks
    ///         │   └── TaskCoach-<guid>.Notes
    ///         └── syncml
    ///             ├── Auth
    ///             └── Conn
    /// ```
    pub fn default_for(guid: &str) -> Self {
        let device = format!("TaskCoach-{}", guid);

        let mut sources = SyncConfig::new("sources");
        for (suffix, uri) in [("Tasks", "task"), ("Notes", "note")] {
            let mut source = SyncConfig::new(format!("{}.{}", device, suffix));
            source.set("dirty", "0");
            source.set("preferredsyncmode", "two-way");
            source.set("uri", uri);
            sources.children.push(source);
        }

        let mut syncml = SyncConfig::new("syncml");
        let mut auth = SyncConfig::new("Auth");
        auth.set("username", "");
        auth.set("password", "");
        let mut conn = SyncConfig::new("Conn");
        conn.set("syncUrl", "");
        syncml.children.push(auth);
        syncml.children.push(conn);

        let mut spds = SyncConfig::new("spds");
        spds.children.push(sources);
        spds.children.push(syncml);

        let mut device_node = SyncConfig::new(device);
        device_node.children.push(spds);

        let mut root = SyncConfig::new("root");
        root.children.push(device_node);
        root
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set a property, keeping its position when it already exists.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.properties.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.properties.push((name, value)),
        }
    }

    pub fn child(&self, name: &str) -> Option<&SyncConfig> {
        self.children.iter().find(|c| c.name == name)
    }

    /// The child called `name`, created at the end if missing.
    pub fn child_mut_or_insert(&mut self, name: &str) -> &mut SyncConfig {
        let pos = match self.children.iter().position(|c| c.name == name) {
            Some(pos) => pos,
            None => {
                self.children.push(SyncConfig::new(name));
                self.children.len() - 1
            }
        };
        &mut self.children[pos]
    }
}
