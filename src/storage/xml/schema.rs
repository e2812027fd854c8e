//! Where each field lives in a given format revision.
//!
//! The task file format has been revised many times. Instead of scattering
//! version comparisons through the reader, every difference is captured once
//! in a [`SchemaLayout`] selected by [`SchemaLayout::for_version`].

/// Format revision written by this crate.
pub const CURRENT_VERSION: u32 = 37;

/// Release string written into the `<?taskcoach?>` processing instruction.
pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

/// How categories are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryStorage {
    /// `<category>name</category>` text children of task nodes
    InlineInTasks,
    /// `<category>` nodes at top level or under `<categories>`
    Nodes,
}

/// How recurrence rules are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurrenceStorage {
    /// `recurrence`, `recurrenceCount`, `recurrenceFrequency`,
    /// `maxRecurrenceCount` attributes on the task node
    TaskAttributes,
    /// A `<recurrence>` child node
    Node,
}

/// How attachments are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentStorage {
    /// Node text is the location
    Text,
    /// `<data>` text names a file in `<doc>_attachments`, kind in `type`
    DataFile,
    /// Full object node, `location` relative to `<doc>_attachments`
    RelativeLocation,
    /// Full object node, absolute `location` or base64 `<data>`
    Inline,
}

/// Field layout of one format revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaLayout {
    pub version: u32,
    /// Description is an attribute instead of a `<description>` child
    pub description_attribute: bool,
    /// Text nodes carry one leading and one trailing newline
    pub trims_text: bool,
    pub bg_color_attribute: &'static str,
    /// Objects carry a `status` attribute
    pub has_status: bool,
    pub categories: CategoryStorage,
    pub category_members_attribute: &'static str,
    pub recurrence: RecurrenceStorage,
    pub attachments: AttachmentStorage,
    /// Notes and categories may own attachments
    pub owned_attachments: bool,
    pub effort_has_status: bool,
    pub effort_has_id: bool,
    pub syncml_element: &'static str,
    pub planned_start_attribute: &'static str,
}

impl SchemaLayout {
    pub fn for_version(version: u32) -> Self {
        Self {
            version,
            description_attribute: version <= 6,
            trims_text: version >= 24,
            bg_color_attribute: if version <= 27 { "color" } else { "bgColor" },
            has_status: version >= 22,
            categories: if version <= 13 {
                CategoryStorage::InlineInTasks
            } else {
                CategoryStorage::Nodes
            },
            category_members_attribute: if version < 19 {
                "tasks"
            } else {
                "categorizables"
            },
            recurrence: if version <= 19 {
                RecurrenceStorage::TaskAttributes
            } else {
                RecurrenceStorage::Node
            },
            attachments: match version {
                0..=16 => AttachmentStorage::Text,
                17..=20 => AttachmentStorage::DataFile,
                21..=22 => AttachmentStorage::RelativeLocation,
                _ => AttachmentStorage::Inline,
            },
            owned_attachments: version > 20,
            effort_has_status: version >= 22,
            effort_has_id: version >= 29,
            syncml_element: if version < 25 { "syncml" } else { "syncmlconfig" },
            planned_start_attribute: if version <= 33 {
                "startdate"
            } else {
                "plannedstartdate"
            },
        }
    }

    pub fn current() -> Self {
        Self::for_version(CURRENT_VERSION)
    }
}
