//! Data models for task file entities.
//!
//! This module defines the persisted domain objects:
//! - `Task` - Work items with dates, budget, efforts and prerequisites
//! - `Category` - Labels that categorize tasks, notes and attachments
//! - `Note` - Free-form text, standalone or owned by another object
//! - `Attachment` - Files, URIs and mail messages attached to an object
//! - `Effort` - Time tracked against a task
//!
//! Only persisted attributes live here; every object can be turned into a
//! [`FieldMap`] and single attributes can be applied back, which is what
//! change tracking and merging operate on.

pub mod collection;
pub mod owned;
pub mod sync_config;
pub mod values;

use std::collections::BTreeSet;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub use collection::{Collection, DomainObject, FieldMap, Identified, ObjectKind};
pub use owned::OwnedCollection;
pub use sync_config::SyncConfig;
pub use values::Color;

/// Generate a fresh object or device identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Synchronization status of a persisted object.
///
/// Written to the file as its integer code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Known to every device
    None,
    /// Created since the last synchronization
    #[default]
    New,
    Changed,
    /// Removed, kept until every device has seen the removal
    Deleted,
}

impl SyncStatus {
    pub fn code(&self) -> i64 {
        match self {
            SyncStatus::None => 0,
            SyncStatus::New => 1,
            SyncStatus::Changed => 2,
            SyncStatus::Deleted => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SyncStatus::None),
            1 => Some(SyncStatus::New),
            2 => Some(SyncStatus::Changed),
            3 => Some(SyncStatus::Deleted),
            _ => None,
        }
    }
}

/// Attributes shared by every persisted object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Base {
    pub id: String,
    #[serde(default)]
    pub status: SyncStatus,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fg_color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_color: Option<Color>,
    /// Native font description, kept opaque
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub selected_icon: String,
    #[serde(default)]
    pub ordering: i64,
}

impl Base {
    pub fn new(id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            creation: Some(values::now()),
            ..Self::default()
        }
    }

    fn write_fields(&self, map: &mut FieldMap) {
        map.insert("status".into(), self.status.code().to_string());
        map.insert("subject".into(), self.subject.clone());
        map.insert("description".into(), self.description.clone());
        map.insert(
            "creationDateTime".into(),
            values::format_optional_datetime(&self.creation),
        );
        map.insert(
            "modificationDateTime".into(),
            values::format_optional_datetime(&self.modification),
        );
        map.insert("fgColor".into(), format_color(&self.fg_color));
        map.insert("bgColor".into(), format_color(&self.bg_color));
        map.insert("font".into(), self.font.clone().unwrap_or_default());
        map.insert("icon".into(), self.icon.clone());
        map.insert("selectedIcon".into(), self.selected_icon.clone());
        map.insert("ordering".into(), self.ordering.to_string());
    }

    fn apply_field(&mut self, name: &str, value: &str) -> bool {
        match name {
            "status" => {
                if let Some(status) = values::parse_int(value)
                    .ok()
                    .and_then(SyncStatus::from_code)
                {
                    self.status = status;
                }
            }
            "subject" => self.subject = value.to_string(),
            "description" => self.description = value.to_string(),
            "creationDateTime" => {
                if let Ok(dt) = values::parse_datetime(value) {
                    self.creation = dt;
                }
            }
            "modificationDateTime" => {
                if let Ok(dt) = values::parse_datetime(value) {
                    self.modification = dt;
                }
            }
            "fgColor" => {
                if let Some(color) = decode_color(value) {
                    self.fg_color = color;
                }
            }
            "bgColor" => {
                if let Some(color) = decode_color(value) {
                    self.bg_color = color;
                }
            }
            "font" => self.font = non_empty(value),
            "icon" => self.icon = value.to_string(),
            "selectedIcon" => self.selected_icon = value.to_string(),
            "ordering" => {
                if let Ok(ordering) = values::parse_int(value) {
                    self.ordering = ordering;
                }
            }
            _ => return false,
        }
        true
    }
}

fn format_color(color: &Option<Color>) -> String {
    color.map(|c| c.to_string()).unwrap_or_default()
}

/// `Some(None)` clears, `None` means the value did not decode.
fn decode_color(value: &str) -> Option<Option<Color>> {
    if value.is_empty() {
        Some(None)
    } else {
        Color::parse(value).ok().map(Some)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn write_expanded_contexts(contexts: &[String], map: &mut FieldMap) {
    let encoded = if contexts.is_empty() {
        String::new()
    } else {
        values::format_string_tuple(contexts)
    };
    map.insert("expandedContexts".into(), encoded);
}

fn apply_expanded_contexts(contexts: &mut Vec<String>, value: &str) {
    if value.is_empty() {
        contexts.clear();
    } else if let Ok(parsed) = values::parse_string_tuple(value) {
        *contexts = parsed;
    }
}

fn format_ids(ids: &BTreeSet<String>) -> String {
    ids.iter().cloned().collect::<Vec<_>>().join(" ")
}

mod duration_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::seconds(i64::deserialize(deserializer)?))
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(D::Error::custom)
    }
}

/// Recurrence rule of a task. An empty unit means "does not recur".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    /// `daily`, `weekly`, `monthly`, `yearly` or empty
    pub unit: String,
    pub amount: i64,
    /// Number of recurrences so far
    pub count: i64,
    /// Maximum number of recurrences, 0 for unlimited
    pub max: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_datetime: Option<NaiveDateTime>,
    #[serde(default)]
    pub same_weekday: bool,
    #[serde(default)]
    pub recur_based_on_completion: bool,
}

impl Default for Recurrence {
    fn default() -> Self {
        Self {
            unit: String::new(),
            amount: 1,
            count: 0,
            max: 0,
            stop_datetime: None,
            same_weekday: false,
            recur_based_on_completion: false,
        }
    }
}

impl Recurrence {
    pub fn is_active(&self) -> bool {
        !self.unit.is_empty()
    }
}

/// Time tracked against a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Effort {
    pub id: String,
    #[serde(default)]
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<NaiveDateTime>,
    #[serde(default)]
    pub description: String,
}

impl Identified for Effort {
    fn id(&self) -> &str {
        &self.id
    }
}

/// What an attachment points at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    #[default]
    File,
    Uri,
    Mail,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::File => "file",
            AttachmentKind::Uri => "uri",
            AttachmentKind::Mail => "mail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(AttachmentKind::File),
            "uri" => Some(AttachmentKind::Uri),
            "mail" => Some(AttachmentKind::Mail),
            _ => None,
        }
    }
}

/// Attachment payload stored inside the task file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedData {
    /// File extension including the dot, e.g. `.eml`
    pub extension: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

/// A file, URI or mail message attached to a task, note or category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(flatten)]
    pub base: Base,
    pub kind: AttachmentKind,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EmbeddedData>,
    #[serde(default)]
    pub notes: OwnedCollection<Note>,
    /// Derived from the categories' member lists
    #[serde(skip)]
    pub categories: BTreeSet<String>,
}

impl Attachment {
    pub fn new(kind: AttachmentKind, location: impl Into<String>) -> Self {
        let location = location.into();
        Self {
            base: Base::new(new_id(), location.clone()),
            kind,
            location,
            data: None,
            notes: OwnedCollection::new(),
            categories: BTreeSet::new(),
        }
    }
}

impl Identified for Attachment {
    fn id(&self) -> &str {
        &self.base.id
    }
}

/// Free-form text. Standalone notes live in the document's note
/// collection; others are owned by a task, category or attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    #[serde(flatten)]
    pub base: Base,
    #[serde(default)]
    pub expanded_contexts: Vec<String>,
    #[serde(default)]
    pub children: Vec<Note>,
    #[serde(default)]
    pub attachments: OwnedCollection<Attachment>,
    #[serde(skip)]
    pub categories: BTreeSet<String>,
}

impl Note {
    pub fn new(subject: impl Into<String>) -> Self {
        Self::with_id(new_id(), subject)
    }

    pub fn with_id(id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            base: Base::new(id, subject),
            expanded_contexts: Vec::new(),
            children: Vec::new(),
            attachments: OwnedCollection::new(),
            categories: BTreeSet::new(),
        }
    }
}

impl Identified for Note {
    fn id(&self) -> &str {
        &self.base.id
    }
}

impl DomainObject for Note {
    const KIND: ObjectKind = ObjectKind::Note;

    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn children(&self) -> &[Self] {
        &self.children
    }

    fn children_mut(&mut self) -> &mut Vec<Self> {
        &mut self.children
    }

    fn fields(&self) -> FieldMap {
        let mut map = FieldMap::new();
        self.base.write_fields(&mut map);
        write_expanded_contexts(&self.expanded_contexts, &mut map);
        map.insert("attachments".into(), self.attachments.to_field());
        map
    }

    fn apply_field(&mut self, name: &str, value: &str) -> bool {
        match name {
            "expandedContexts" => apply_expanded_contexts(&mut self.expanded_contexts, value),
            "attachments" => {
                if let Some(attachments) = OwnedCollection::from_field(value) {
                    self.attachments = attachments;
                }
            }
            _ => return self.base.apply_field(name, value),
        }
        true
    }
}

/// A label with an authoritative member list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    #[serde(flatten)]
    pub base: Base,
    #[serde(default)]
    pub expanded_contexts: Vec<String>,
    #[serde(default)]
    pub children: Vec<Category>,
    #[serde(default)]
    pub notes: OwnedCollection<Note>,
    #[serde(default)]
    pub attachments: OwnedCollection<Attachment>,
    #[serde(default)]
    pub filtered: bool,
    #[serde(default)]
    pub exclusive_subcategories: bool,
    /// Ids of the tasks, notes and attachments in this category
    #[serde(default)]
    pub categorizables: BTreeSet<String>,
}

impl Category {
    pub fn new(subject: impl Into<String>) -> Self {
        Self::with_id(new_id(), subject)
    }

    pub fn with_id(id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            base: Base::new(id, subject),
            expanded_contexts: Vec::new(),
            children: Vec::new(),
            notes: OwnedCollection::new(),
            attachments: OwnedCollection::new(),
            filtered: false,
            exclusive_subcategories: false,
            categorizables: BTreeSet::new(),
        }
    }
}

impl Identified for Category {
    fn id(&self) -> &str {
        &self.base.id
    }
}

impl DomainObject for Category {
    const KIND: ObjectKind = ObjectKind::Category;

    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn children(&self) -> &[Self] {
        &self.children
    }

    fn children_mut(&mut self) -> &mut Vec<Self> {
        &mut self.children
    }

    fn fields(&self) -> FieldMap {
        let mut map = FieldMap::new();
        self.base.write_fields(&mut map);
        write_expanded_contexts(&self.expanded_contexts, &mut map);
        map.insert("notes".into(), self.notes.to_field());
        map.insert("attachments".into(), self.attachments.to_field());
        map.insert(
            "filtered".into(),
            values::format_bool(self.filtered).to_string(),
        );
        map.insert(
            "exclusiveSubcategories".into(),
            values::format_bool(self.exclusive_subcategories).to_string(),
        );
        map.insert("categorizables".into(), format_ids(&self.categorizables));
        map
    }

    fn apply_field(&mut self, name: &str, value: &str) -> bool {
        match name {
            "expandedContexts" => apply_expanded_contexts(&mut self.expanded_contexts, value),
            "notes" => {
                if let Some(notes) = OwnedCollection::from_field(value) {
                    self.notes = notes;
                }
            }
            "attachments" => {
                if let Some(attachments) = OwnedCollection::from_field(value) {
                    self.attachments = attachments;
                }
            }
            "filtered" => {
                if let Ok(filtered) = values::parse_bool(value) {
                    self.filtered = filtered;
                }
            }
            "exclusiveSubcategories" => {
                if let Ok(exclusive) = values::parse_bool(value) {
                    self.exclusive_subcategories = exclusive;
                }
            }
            "categorizables" => {
                self.categorizables = values::parse_id_list(value).into_iter().collect();
            }
            _ => return self.base.apply_field(name, value),
        }
        true
    }
}

/// A work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(flatten)]
    pub base: Base,
    #[serde(default)]
    pub expanded_contexts: Vec<String>,
    #[serde(default)]
    pub children: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_start: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_start: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<NaiveDateTime>,
    #[serde(default)]
    pub percentage_complete: i64,
    #[serde(with = "duration_seconds")]
    pub budget: Duration,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub hourly_fee: f64,
    #[serde(default)]
    pub fixed_fee: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder_before_snooze: Option<NaiveDateTime>,
    /// Ids of tasks that must complete first
    #[serde(default)]
    pub prerequisites: BTreeSet<String>,
    /// Reverse of `prerequisites`, rebuilt after every load and merge
    #[serde(skip)]
    pub dependencies: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_mark_completed: Option<bool>,
    #[serde(default)]
    pub recurrence: Recurrence,
    #[serde(default)]
    pub efforts: OwnedCollection<Effort>,
    #[serde(default)]
    pub notes: OwnedCollection<Note>,
    #[serde(default)]
    pub attachments: OwnedCollection<Attachment>,
    /// Derived from the categories' member lists
    #[serde(skip)]
    pub categories: BTreeSet<String>,
}

impl Task {
    pub fn new(subject: impl Into<String>) -> Self {
        Self::with_id(new_id(), subject)
    }

    pub fn with_id(id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            base: Base::new(id, subject),
            expanded_contexts: Vec::new(),
            children: Vec::new(),
            planned_start: None,
            due: None,
            actual_start: None,
            completion: None,
            percentage_complete: 0,
            budget: Duration::zero(),
            priority: 0,
            hourly_fee: 0.0,
            fixed_fee: 0.0,
            reminder: None,
            reminder_before_snooze: None,
            prerequisites: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            should_mark_completed: None,
            recurrence: Recurrence::default(),
            efforts: OwnedCollection::new(),
            notes: OwnedCollection::new(),
            attachments: OwnedCollection::new(),
            categories: BTreeSet::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_some()
    }
}

impl Identified for Task {
    fn id(&self) -> &str {
        &self.base.id
    }
}

fn apply_datetime(target: &mut Option<NaiveDateTime>, value: &str) {
    if let Ok(dt) = values::parse_datetime(value) {
        *target = dt;
    }
}

impl DomainObject for Task {
    const KIND: ObjectKind = ObjectKind::Task;

    fn base(&self) -> &Base {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Base {
        &mut self.base
    }

    fn children(&self) -> &[Self] {
        &self.children
    }

    fn children_mut(&mut self) -> &mut Vec<Self> {
        &mut self.children
    }

    fn fields(&self) -> FieldMap {
        let mut map = FieldMap::new();
        self.base.write_fields(&mut map);
        write_expanded_contexts(&self.expanded_contexts, &mut map);
        for (name, value) in [
            ("plannedstartdate", &self.planned_start),
            ("duedate", &self.due),
            ("actualstartdate", &self.actual_start),
            ("completiondate", &self.completion),
            ("reminder", &self.reminder),
            ("reminderBeforeSnooze", &self.reminder_before_snooze),
        ] {
            map.insert(name.into(), values::format_optional_datetime(value));
        }
        map.insert(
            "percentageComplete".into(),
            self.percentage_complete.to_string(),
        );
        map.insert("budget".into(), values::format_budget(&self.budget));
        map.insert("priority".into(), self.priority.to_string());
        map.insert("hourlyFee".into(), values::format_float(self.hourly_fee));
        map.insert("fixedFee".into(), values::format_float(self.fixed_fee));
        map.insert("prerequisites".into(), format_ids(&self.prerequisites));
        map.insert(
            "shouldMarkCompletedWhenAllChildrenCompleted".into(),
            self.should_mark_completed
                .map(|b| values::format_bool(b).to_string())
                .unwrap_or_default(),
        );
        map.insert(
            "recurrence".into(),
            serde_json::to_string(&self.recurrence).unwrap_or_default(),
        );
        map.insert("efforts".into(), self.efforts.to_field());
        map.insert("notes".into(), self.notes.to_field());
        map.insert("attachments".into(), self.attachments.to_field());
        map
    }

    fn apply_field(&mut self, name: &str, value: &str) -> bool {
        match name {
            "expandedContexts" => apply_expanded_contexts(&mut self.expanded_contexts, value),
            "plannedstartdate" => apply_datetime(&mut self.planned_start, value),
            "duedate" => apply_datetime(&mut self.due, value),
            "actualstartdate" => apply_datetime(&mut self.actual_start, value),
            "completiondate" => apply_datetime(&mut self.completion, value),
            "reminder" => apply_datetime(&mut self.reminder, value),
            "reminderBeforeSnooze" => apply_datetime(&mut self.reminder_before_snooze, value),
            "percentageComplete" => {
                if let Ok(pct) = values::parse_int(value) {
                    self.percentage_complete = pct;
                }
            }
            "budget" => {
                if let Ok(budget) = values::parse_budget(value) {
                    self.budget = budget;
                }
            }
            "priority" => {
                if let Ok(priority) = values::parse_int(value) {
                    self.priority = priority;
                }
            }
            "hourlyFee" => {
                if let Ok(fee) = values::parse_float(value) {
                    self.hourly_fee = fee;
                }
            }
            "fixedFee" => {
                if let Ok(fee) = values::parse_float(value) {
                    self.fixed_fee = fee;
                }
            }
            "prerequisites" => {
                self.prerequisites = values::parse_id_list(value).into_iter().collect();
            }
            "shouldMarkCompletedWhenAllChildrenCompleted" => {
                if value.is_empty() {
                    self.should_mark_completed = None;
                } else if let Ok(flag) = values::parse_bool(value) {
                    self.should_mark_completed = Some(flag);
                }
            }
            "recurrence" => {
                if let Ok(recurrence) = serde_json::from_str(value) {
                    self.recurrence = recurrence;
                }
            }
            "efforts" => {
                if let Some(efforts) = OwnedCollection::from_field(value) {
                    self.efforts = efforts;
                }
            }
            "notes" => {
                if let Some(notes) = OwnedCollection::from_field(value) {
                    self.notes = notes;
                }
            }
            "attachments" => {
                if let Some(attachments) = OwnedCollection::from_field(value) {
                    self.attachments = attachments;
                }
            }
            _ => return self.base.apply_field(name, value),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        for status in [
            SyncStatus::None,
            SyncStatus::New,
            SyncStatus::Changed,
            SyncStatus::Deleted,
        ] {
            assert_eq!(SyncStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(SyncStatus::from_code(7), None);
        assert_eq!(SyncStatus::default(), SyncStatus::New);
    }

    #[test]
    fn test_task_fields_apply_back() {
        let mut source = Task::with_id("t1", "Write report");
        source.priority = 3;
        source.budget = Duration::hours(2);
        source.prerequisites.insert("t0".into());
        source.should_mark_completed = Some(true);
        source.recurrence.unit = "weekly".into();
        source.notes.add(Note::with_id("n1", "remember"));

        let mut target = Task::with_id("t1", "");
        for (name, value) in source.fields() {
            assert!(target.apply_field(&name, &value), "unknown field {}", name);
        }
        assert_eq!(target.fields(), source.fields());
        assert_eq!(target.notes.get("n1").unwrap().base.subject, "remember");
    }

    #[test]
    fn test_apply_unknown_field() {
        let mut task = Task::with_id("t1", "x");
        assert!(!task.apply_field("nonsense", "1"));
    }

    #[test]
    fn test_apply_invalid_value_keeps_current() {
        let mut task = Task::with_id("t1", "x");
        task.priority = 4;
        assert!(task.apply_field("priority", "high"));
        assert_eq!(task.priority, 4);
    }

    #[test]
    fn test_category_fields_include_members() {
        let mut category = Category::with_id("c1", "Work");
        category.categorizables.insert("t2".into());
        category.categorizables.insert("t1".into());
        assert_eq!(category.fields()["categorizables"], "t1 t2");

        let mut other = Category::with_id("c1", "Work");
        other.apply_field("categorizables", "t3");
        assert_eq!(other.categorizables.len(), 1);
    }

    #[test]
    fn test_attachment_serde_embeds_base64() {
        let mut attachment = Attachment::new(AttachmentKind::Mail, "message.eml");
        attachment.data = Some(EmbeddedData {
            extension: ".eml".into(),
            bytes: b"hello".to_vec(),
        });
        let json = serde_json::to_string(&attachment).unwrap();
        assert!(json.contains("aGVsbG8="));
        let back: Attachment = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data.unwrap().bytes, b"hello");
    }

    #[test]
    fn test_note_expanded_contexts_field() {
        let mut note = Note::with_id("n", "x");
        note.expanded_contexts = vec!["noteviewer".into()];
        assert_eq!(note.fields()["expandedContexts"], "('noteviewer',)");
        note.apply_field("expandedContexts", "");
        assert!(note.expanded_contexts.is_empty());
    }
}
