//! Reader for every historical revision of the task file format.
//!
//! The format revision is taken from the `<?taskcoach tskversion="N"?>`
//! processing instruction in the prolog. Files newer than
//! [`CURRENT_VERSION`] are refused before anything is built; older files
//! are read through the [`SchemaLayout`] of their revision.
//!
//! Individual values that do not parse never fail the read. They fall back
//! to the field's default and are reported as [`ReadIssue`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{NaiveDateTime, NaiveTime};
use regex::Regex;
use roxmltree::Node;
use serde::Serialize;
use tracing::{debug, warn};

use super::delta;
use super::schema::{
    AttachmentStorage, CURRENT_VERSION, CategoryStorage, RecurrenceStorage, SchemaLayout,
};
use crate::changes::ChangeMap;
use crate::models::values::{self, InvalidValue};
use crate::models::{
    Attachment, AttachmentKind, Base, Category, Collection, Color, DomainObject, Effort,
    EmbeddedData, Note, OwnedCollection, Recurrence, SyncConfig, SyncStatus, Task, new_id,
};
use crate::{Error, Result};

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"tskversion=['"](\d+)['"]"#).expect("Invalid regex"));

const BROKEN_SYNCML_MARKER: &str = "><spds><sources><TaskCoach-";

const BOM: char = '\u{FEFF}';

/// A recoverable problem found while reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReadIssue {
    /// A value that did not parse; the field got its default.
    MalformedField {
        object_id: String,
        field: String,
        value: String,
    },
    /// A reference to an object that does not exist; it was dropped.
    DanglingReference {
        from: String,
        to: String,
        kind: String,
    },
}

impl std::fmt::Display for ReadIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadIssue::MalformedField {
                object_id,
                field,
                value,
            } => write!(f, "{}: malformed {} {:?}", object_id, field, value),
            ReadIssue::DanglingReference { from, to, kind } => {
                write!(f, "{}: unknown {} {}", from, kind, to)
            }
        }
    }
}

/// Everything a task file contains.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub version: u32,
    pub tasks: Collection<Task>,
    pub categories: Collection<Category>,
    pub notes: Collection<Note>,
    pub sync_config: SyncConfig,
    /// Contents of the `.delta` sidecar, empty when read from text
    pub changes: ChangeMap,
    pub guid: String,
    pub issues: Vec<ReadIssue>,
}

impl ParsedDocument {
    /// An empty document with a fresh GUID.
    pub fn empty() -> Self {
        let guid = new_id();
        Self {
            version: CURRENT_VERSION,
            tasks: Collection::new(),
            categories: Collection::new(),
            notes: Collection::new(),
            sync_config: SyncConfig::default_for(&guid),
            changes: ChangeMap::new(),
            guid,
            issues: Vec::new(),
        }
    }
}

/// Format revision declared in the prolog, 1 when absent.
pub fn detect_version(text: &str) -> u32 {
    text.trim_start_matches(BOM)
        .lines()
        .map(str::trim)
        .take_while(|line| line.is_empty() || line.starts_with("<?"))
        .find_map(|line| VERSION_RE.captures(line).and_then(|c| c[1].parse().ok()))
        .unwrap_or(1)
}

/// Rejoin SyncML element names that an old release split across lines.
fn repair_broken_lines(text: &str) -> String {
    text.split_inclusive('\n')
        .map(|line| {
            let content = line.trim_end_matches(['\r', '\n']);
            if content.ends_with("<TaskCoach-") || content.ends_with("</TaskCoach-") {
                content
            } else {
                line
            }
        })
        .collect()
}

fn has_broken_syncml(text: &str) -> bool {
    text.match_indices(BROKEN_SYNCML_MARKER).any(|(at, marker)| {
        let rest = &text[at + marker.len()..];
        rest.starts_with('\n') || rest.starts_with("\r\n")
    })
}

/// Parses one task file.
pub struct XmlReader<'a> {
    text: &'a str,
    source: Option<PathBuf>,
}

impl<'a> XmlReader<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, source: None }
    }

    /// Path the text was read from; legacy attachment locations are
    /// resolved against it.
    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }

    pub fn read(self) -> Result<ParsedDocument> {
        let text = self.text.trim_start_matches(BOM);
        if text.trim().is_empty() {
            return Ok(ParsedDocument::empty());
        }

        let repaired;
        let text = if has_broken_syncml(text) {
            debug!("Repairing broken SyncML lines");
            repaired = repair_broken_lines(text);
            repaired.as_str()
        } else {
            text
        };

        let version = detect_version(text);
        if version > CURRENT_VERSION {
            return Err(Error::FormatTooNew {
                found: version,
                supported: CURRENT_VERSION,
            });
        }

        let xml = roxmltree::Document::parse(text)?;
        let root = xml.root_element();
        let mut parser = NodeParser::new(SchemaLayout::for_version(version), self.source);

        let tasks: Vec<Task> = element_children(root, "task")
            .map(|node| parser.task(node))
            .collect();
        let notes: Vec<Note> = element_children(root, "note")
            .map(|node| parser.note(node))
            .collect();
        let categories = match parser.layout.categories {
            CategoryStorage::InlineInTasks => parser.inline_categories(),
            CategoryStorage::Nodes => element_children(root, "category")
                .chain(
                    element_children(root, "categories")
                        .flat_map(|group| element_children(group, "category")),
                )
                .map(|node| parser.category(node))
                .collect(),
        };

        let mut tasks = Collection::from_roots(tasks);
        let mut categories = Collection::from_roots(categories);
        let mut notes = Collection::from_roots(notes);
        parser.issues.extend(resolve_prerequisites(
            &mut tasks,
            &std::mem::take(&mut parser.prerequisites),
        ));
        let members = std::mem::take(&mut parser.members);
        for (category_id, ids) in members {
            if let Some(category) = categories.get_mut(&category_id) {
                category.categorizables.extend(ids);
            }
        }
        parser
            .issues
            .extend(link_categories(&mut categories, &mut tasks, &mut notes));

        let guid = element_children(root, "guid")
            .next()
            .map(|node| parser.text(Some(node)).trim().to_string())
            .filter(|g| !g.is_empty())
            .unwrap_or_else(new_id);
        let mut sync_config = SyncConfig::default_for(&guid);
        for node in element_children(root, parser.layout.syncml_element) {
            parser.sync_config(node, &mut sync_config);
        }

        for issue in &parser.issues {
            warn!(version, "{}", issue);
        }
        debug!(
            version,
            tasks = tasks.len(),
            categories = categories.len(),
            notes = notes.len(),
            "Parsed task file"
        );

        Ok(ParsedDocument {
            version,
            tasks,
            categories,
            notes,
            sync_config,
            changes: ChangeMap::new(),
            guid,
            issues: parser.issues,
        })
    }
}

/// Read a task file and its `.delta` sidecar.
pub fn read_file(path: &Path) -> Result<ParsedDocument> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let mut parsed = XmlReader::new(&text).with_source(path).read()?;
    parsed.changes = delta::read_file(&delta::delta_path_for(path));
    Ok(parsed)
}

fn element_children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children()
        .filter(move |child| child.is_element() && child.has_tag_name(name))
}

fn first_child<'a, 'input>(node: Node<'a, 'input>, name: &'static str) -> Option<Node<'a, 'input>> {
    element_children(node, name).next()
}

/// Per-read state: the layout and everything resolved after the first pass.
struct NodeParser {
    layout: SchemaLayout,
    source: Option<PathBuf>,
    issues: Vec<ReadIssue>,
    /// Task id → prerequisite ids as written
    prerequisites: BTreeMap<String, Vec<String>>,
    /// Category id → member ids as written
    members: BTreeMap<String, Vec<String>>,
    /// Inline category subjects in first-seen order, with their task ids
    inline: Vec<(String, Vec<String>)>,
}

impl NodeParser {
    fn new(layout: SchemaLayout, source: Option<PathBuf>) -> Self {
        Self {
            layout,
            source,
            issues: Vec::new(),
            prerequisites: BTreeMap::new(),
            members: BTreeMap::new(),
            inline: Vec::new(),
        }
    }

    fn malformed(&mut self, object_id: &str, field: &str, err: InvalidValue) {
        self.issues.push(ReadIssue::MalformedField {
            object_id: object_id.to_string(),
            field: field.to_string(),
            value: err.value,
        });
    }

    /// Run `parse` on an attribute, reporting failures and using `default`.
    fn parse_attr<T>(
        &mut self,
        node: Node,
        id: &str,
        name: &str,
        default: T,
        parse: impl FnOnce(&str) -> std::result::Result<T, InvalidValue>,
    ) -> T {
        match node.attribute(name) {
            None => default,
            Some(text) => match parse(text) {
                Ok(value) => value,
                Err(err) => {
                    self.malformed(id, name, err);
                    default
                }
            },
        }
    }

    fn datetime(
        &mut self,
        node: Node,
        id: &str,
        name: &str,
        default_time: NaiveTime,
    ) -> Option<NaiveDateTime> {
        self.parse_attr(node, id, name, None, |text| {
            values::parse_datetime_or(text, default_time)
        })
    }

    fn int(&mut self, node: Node, id: &str, name: &str, default: i64) -> i64 {
        self.parse_attr(node, id, name, default, values::parse_int)
    }

    fn optional_bool(&mut self, node: Node, id: &str, name: &str) -> Option<bool> {
        self.parse_attr(node, id, name, None, |text| {
            if text.is_empty() {
                Ok(None)
            } else {
                values::parse_bool(text).map(Some)
            }
        })
    }

    fn flag(&mut self, node: Node, id: &str, name: &str) -> bool {
        self.optional_bool(node, id, name).unwrap_or(false)
    }

    fn text(&self, node: Option<Node>) -> String {
        let text = node.and_then(|n| n.text()).unwrap_or("");
        if self.layout.trims_text {
            let text = text.strip_prefix('\n').unwrap_or(text);
            text.strip_suffix('\n').unwrap_or(text).to_string()
        } else {
            text.to_string()
        }
    }

    fn description(&self, node: Node) -> String {
        if self.layout.description_attribute {
            node.attribute("description").unwrap_or("").to_string()
        } else {
            self.text(first_child(node, "description"))
        }
    }

    fn color(&mut self, node: Node, id: &str, name: &str) -> Option<Color> {
        self.parse_attr(node, id, name, None, |text| {
            if text.is_empty() {
                Ok(None)
            } else {
                Color::parse(text).map(Some)
            }
        })
    }

    fn expanded_contexts(&mut self, node: Node, id: &str) -> Vec<String> {
        self.parse_attr(node, id, "expandedContexts", Vec::new(), |text| {
            if text.is_empty() {
                Ok(Vec::new())
            } else {
                values::parse_string_tuple(text)
            }
        })
    }

    fn base(&mut self, node: Node) -> Base {
        let id = node
            .attribute("id")
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_id);

        let status = if self.layout.has_status {
            let code = self.int(node, &id, "status", SyncStatus::New.code());
            SyncStatus::from_code(code).unwrap_or_else(|| {
                self.malformed(
                    &id,
                    "status",
                    InvalidValue {
                        kind: "status",
                        value: code.to_string(),
                    },
                );
                SyncStatus::New
            })
        } else {
            SyncStatus::New
        };

        let start = values::start_of_day();
        Base {
            status,
            subject: node.attribute("subject").unwrap_or("").to_string(),
            description: self.description(node),
            creation: self.datetime(node, &id, "creationDateTime", start),
            modification: self.datetime(node, &id, "modificationDateTime", start),
            fg_color: self.color(node, &id, "fgColor"),
            bg_color: self.color(node, &id, self.layout.bg_color_attribute),
            font: node
                .attribute("font")
                .filter(|f| !f.is_empty())
                .map(str::to_string),
            icon: values::normalize_icon(node.attribute("icon").unwrap_or("")),
            selected_icon: values::normalize_icon(node.attribute("selectedIcon").unwrap_or("")),
            ordering: self.int(node, &id, "ordering", 0),
            id,
        }
    }

    fn owned_attachments(&mut self, node: Node) -> OwnedCollection<Attachment> {
        if self.layout.owned_attachments {
            element_children(node, "attachment")
                .filter_map(|child| self.attachment(child))
                .collect()
        } else {
            self.legacy_attachments(node)
        }
    }

    fn notes_of(&mut self, node: Node) -> Vec<Note> {
        element_children(node, "note")
            .map(|child| self.note(child))
            .collect()
    }

    fn task(&mut self, node: Node) -> Task {
        let base = self.base(node);
        let id = base.id.clone();
        let start = values::start_of_day();
        let end = values::end_of_day();

        let mut task = Task::with_id(id.clone(), "");
        task.base = base;
        task.children = element_children(node, "task")
            .map(|child| self.task(child))
            .collect();
        task.expanded_contexts = self.expanded_contexts(node, &id);
        task.planned_start = self.datetime(node, &id, self.layout.planned_start_attribute, start);
        task.due = self
            .datetime(node, &id, "duedate", end)
            .map(values::widen_end_of_day);
        task.actual_start = self.datetime(node, &id, "actualstartdate", start);
        task.completion = self.datetime(node, &id, "completiondate", end);
        task.percentage_complete = self.int(node, &id, "percentageComplete", 0);
        task.budget = self.parse_attr(
            node,
            &id,
            "budget",
            chrono::Duration::zero(),
            values::parse_budget,
        );
        task.priority = self.int(node, &id, "priority", 0);
        task.hourly_fee = self.parse_attr(node, &id, "hourlyFee", 0.0, values::parse_float);
        task.fixed_fee = self.parse_attr(node, &id, "fixedFee", 0.0, values::parse_float);
        task.reminder = self.datetime(node, &id, "reminder", start);
        task.reminder_before_snooze = self.datetime(node, &id, "reminderBeforeSnooze", start);
        task.should_mark_completed =
            self.optional_bool(node, &id, "shouldMarkCompletedWhenAllChildrenCompleted");
        task.recurrence = self.recurrence(node, &id);
        task.efforts = element_children(node, "effort")
            .map(|child| self.effort(child))
            .collect();
        task.notes = self.notes_of(node).into_iter().collect();
        task.attachments = self.owned_attachments(node);

        let prerequisites = values::parse_id_list(node.attribute("prerequisites").unwrap_or(""));
        if !prerequisites.is_empty() {
            self.prerequisites.insert(id.clone(), prerequisites);
        }

        if self.layout.categories == CategoryStorage::InlineInTasks {
            for category in element_children(node, "category") {
                let subject = category.text().unwrap_or("").trim();
                if subject.is_empty() {
                    continue;
                }
                match self.inline.iter_mut().find(|(s, _)| s == subject) {
                    Some((_, ids)) => ids.push(id.clone()),
                    None => self.inline.push((subject.to_string(), vec![id.clone()])),
                }
            }
        }
        task
    }

    fn recurrence(&mut self, node: Node, id: &str) -> Recurrence {
        match self.layout.recurrence {
            RecurrenceStorage::TaskAttributes => Recurrence {
                unit: node.attribute("recurrence").unwrap_or("").to_string(),
                count: self.int(node, id, "recurrenceCount", 0),
                amount: self.int(node, id, "recurrenceFrequency", 1),
                max: self.int(node, id, "maxRecurrenceCount", 0),
                ..Recurrence::default()
            },
            RecurrenceStorage::Node => match first_child(node, "recurrence") {
                None => Recurrence::default(),
                Some(rec) => Recurrence {
                    unit: rec.attribute("unit").unwrap_or("").to_string(),
                    amount: self.int(rec, id, "amount", 1),
                    count: self.int(rec, id, "count", 0),
                    max: self.int(rec, id, "max", 0),
                    stop_datetime: self.datetime(rec, id, "stop_datetime", values::start_of_day()),
                    same_weekday: self.flag(rec, id, "sameWeekday"),
                    recur_based_on_completion: self.flag(rec, id, "recurBasedOnCompletion"),
                },
            },
        }
    }

    fn effort(&mut self, node: Node) -> Effort {
        let id = if self.layout.effort_has_id {
            node.attribute("id")
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        } else {
            None
        }
        .unwrap_or_else(new_id);
        let status = if self.layout.effort_has_status {
            let code = self.int(node, &id, "status", SyncStatus::New.code());
            SyncStatus::from_code(code).unwrap_or_default()
        } else {
            SyncStatus::New
        };
        let start = values::start_of_day();
        Effort {
            start: self.datetime(node, &id, "start", start),
            stop: self.datetime(node, &id, "stop", start),
            description: self.description(node),
            status,
            id,
        }
    }

    fn note(&mut self, node: Node) -> Note {
        let base = self.base(node);
        let id = base.id.clone();
        let mut note = Note::with_id(id.clone(), "");
        note.base = base;
        note.children = self.notes_of(node);
        note.expanded_contexts = self.expanded_contexts(node, &id);
        note.attachments = self.owned_attachments(node);
        note
    }

    fn category(&mut self, node: Node) -> Category {
        let base = self.base(node);
        let id = base.id.clone();
        let mut category = Category::with_id(id.clone(), "");
        category.base = base;
        category.children = element_children(node, "category")
            .map(|child| self.category(child))
            .collect();
        category.expanded_contexts = self.expanded_contexts(node, &id);
        category.notes = self.notes_of(node).into_iter().collect();
        category.filtered = self.flag(node, &id, "filtered");
        category.exclusive_subcategories = self.flag(node, &id, "exclusiveSubcategories");
        category.attachments = self.owned_attachments(node);

        let members = values::parse_id_list(
            node.attribute(self.layout.category_members_attribute)
                .unwrap_or(""),
        );
        if !members.is_empty() {
            self.members.entry(id).or_default().extend(members);
        }
        category
    }

    /// Categories of revisions that stored them as task children.
    fn inline_categories(&mut self) -> Vec<Category> {
        std::mem::take(&mut self.inline)
            .into_iter()
            .map(|(subject, task_ids)| {
                let category = Category::new(subject);
                self.members
                    .entry(category.base.id.clone())
                    .or_default()
                    .extend(task_ids);
                category
            })
            .collect()
    }

    fn attachment_dir(&self) -> PathBuf {
        let source = self.source.clone().unwrap_or_default();
        let dir = match source.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        dir.join(format!("{}_attachments", stem))
    }

    /// Attachments of revisions before full attachment objects.
    fn legacy_attachments(&mut self, node: Node) -> OwnedCollection<Attachment> {
        let mut attachments = OwnedCollection::new();
        for child in element_children(node, "attachment") {
            let attachment = match self.layout.attachments {
                AttachmentStorage::Text => {
                    let location = child.text().unwrap_or("");
                    if location.is_empty() {
                        continue;
                    }
                    attachment_from_location(location)
                }
                _ => {
                    let data = first_child(child, "data").and_then(|d| d.text()).unwrap_or("");
                    if data.is_empty() {
                        continue;
                    }
                    let location = self.attachment_dir().join(data);
                    let kind = self.attachment_kind(child, "");
                    let description = self.description(child);
                    let mut attachment =
                        Attachment::new(kind, location.to_string_lossy().into_owned());
                    attachment.base.subject = description.clone();
                    attachment.base.description = description;
                    attachment
                }
            };
            attachments.add(attachment);
        }
        attachments
    }

    fn attachment_kind(&mut self, node: Node, id: &str) -> AttachmentKind {
        let text = node.attribute("type").unwrap_or("file");
        AttachmentKind::parse(text).unwrap_or_else(|| {
            self.malformed(
                id,
                "type",
                InvalidValue {
                    kind: "attachment type",
                    value: text.to_string(),
                },
            );
            AttachmentKind::File
        })
    }

    fn attachment(&mut self, node: Node) -> Option<Attachment> {
        let base = self.base(node);
        let id = base.id.clone();
        let kind = self.attachment_kind(node, &id);

        let (location, data) = if self.layout.attachments == AttachmentStorage::RelativeLocation {
            let relative = node.attribute("location").unwrap_or("");
            let location = self.attachment_dir().join(relative);
            (location.to_string_lossy().into_owned(), None)
        } else if let Some(location) = node.attribute("location") {
            (location.to_string(), None)
        } else if let Some(data_node) = first_child(node, "data") {
            let encoded: String = self
                .text(Some(data_node))
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            match STANDARD.decode(encoded.as_bytes()) {
                Ok(bytes) => {
                    let extension = data_node.attribute("extension").unwrap_or("").to_string();
                    (String::new(), Some(EmbeddedData { extension, bytes }))
                }
                Err(_) => {
                    self.malformed(
                        &id,
                        "data",
                        InvalidValue {
                            kind: "base64",
                            value: encoded,
                        },
                    );
                    return None;
                }
            }
        } else {
            self.malformed(
                &id,
                "location",
                InvalidValue {
                    kind: "attachment location",
                    value: String::new(),
                },
            );
            return None;
        };

        Some(Attachment {
            base,
            kind,
            location,
            data,
            notes: self.notes_of(node).into_iter().collect(),
            categories: BTreeSet::new(),
        })
    }

    fn sync_config(&self, node: Node, config: &mut SyncConfig) {
        for child in node.children().filter(Node::is_element) {
            let tag = child.tag_name().name();
            if tag == "property" {
                if let Some(name) = child.attribute("name") {
                    config.set(name, self.text(Some(child)));
                }
            } else {
                self.sync_config(child, config.child_mut_or_insert(tag));
            }
        }
    }
}

/// `URI:`, `FILE:` and `MAIL:` prefixes select the kind; files otherwise.
fn attachment_from_location(location: &str) -> Attachment {
    let (kind, location) = if let Some(rest) = location.strip_prefix("URI:") {
        (AttachmentKind::Uri, rest)
    } else if let Some(rest) = location.strip_prefix("FILE:") {
        (AttachmentKind::File, rest)
    } else if let Some(rest) = location.strip_prefix("MAIL:") {
        (AttachmentKind::Mail, rest)
    } else {
        (AttachmentKind::File, location)
    };
    let mut attachment = Attachment::new(kind, location);
    attachment.base.description = location.to_string();
    attachment
}

/// Turn prerequisite ids into links and fill the reverse `dependencies`.
///
/// Forward references are fine. Deleted tasks and everything below them get
/// no prerequisites. Unknown ids are dropped and reported.
pub fn resolve_prerequisites(
    tasks: &mut Collection<Task>,
    written: &BTreeMap<String, Vec<String>>,
) -> Vec<ReadIssue> {
    let known = tasks.ids();
    let mut deleted = BTreeSet::new();
    collect_deleted_subtrees(tasks.roots(), false, &mut deleted);

    let mut issues = Vec::new();
    let mut resolved: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (task_id, ids) in written {
        if deleted.contains(task_id) || !known.contains(task_id) {
            continue;
        }
        for prerequisite in ids {
            if known.contains(prerequisite) {
                resolved
                    .entry(task_id.clone())
                    .or_default()
                    .insert(prerequisite.clone());
            } else {
                issues.push(ReadIssue::DanglingReference {
                    from: task_id.clone(),
                    to: prerequisite.clone(),
                    kind: "prerequisite".into(),
                });
            }
        }
    }

    let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (task_id, prerequisites) in &resolved {
        for prerequisite in prerequisites {
            dependencies
                .entry(prerequisite.clone())
                .or_default()
                .insert(task_id.clone());
        }
    }

    tasks.for_each_mut(|task| {
        task.prerequisites = resolved.remove(&task.base.id).unwrap_or_default();
        task.dependencies = dependencies.remove(&task.base.id).unwrap_or_default();
    });
    issues
}

fn collect_deleted_subtrees(tasks: &[Task], inside_deleted: bool, out: &mut BTreeSet<String>) {
    for task in tasks {
        let deleted = inside_deleted || task.is_deleted();
        if deleted {
            out.insert(task.base.id.clone());
        }
        collect_deleted_subtrees(&task.children, deleted, out);
    }
}

/// Where a categorizable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Holder {
    Task,
    Note,
    Attachment,
}

fn map_notes(notes: &[&Note], out: &mut BTreeMap<String, Holder>) {
    for note in notes {
        out.insert(note.base.id.clone(), Holder::Note);
        map_notes(&note.children.iter().collect::<Vec<_>>(), out);
        map_attachments(&note.attachments, out);
    }
}

fn map_attachments(attachments: &OwnedCollection<Attachment>, out: &mut BTreeMap<String, Holder>) {
    for attachment in attachments {
        out.insert(attachment.base.id.clone(), Holder::Attachment);
        map_notes(&attachment.notes.iter().collect::<Vec<_>>(), out);
    }
}

/// Every categorizable id in the document: tasks, notes and attachments,
/// including those nested under other objects.
pub(crate) fn categorizable_ids(
    categories: &Collection<Category>,
    tasks: &Collection<Task>,
    notes: &Collection<Note>,
) -> BTreeMap<String, Holder> {
    let mut map = BTreeMap::new();
    for category in categories.iter() {
        map_notes(&category.notes.iter().collect::<Vec<_>>(), &mut map);
        map_attachments(&category.attachments, &mut map);
    }
    for task in tasks.iter() {
        map.insert(task.base.id.clone(), Holder::Task);
        map_notes(&task.notes.iter().collect::<Vec<_>>(), &mut map);
        map_attachments(&task.attachments, &mut map);
    }
    map_notes(&notes.iter().collect::<Vec<_>>(), &mut map);
    map
}

fn add_category_to_note(note: &mut Note, member: &str, category: &str) -> bool {
    if note.base.id == member {
        note.categories.insert(category.to_string());
        return true;
    }
    note.children
        .iter_mut()
        .any(|child| add_category_to_note(child, member, category))
        || note
            .attachments
            .iter_mut()
            .any(|a| add_category_to_attachment(a, member, category))
}

fn add_category_to_attachment(attachment: &mut Attachment, member: &str, category: &str) -> bool {
    if attachment.base.id == member {
        attachment.categories.insert(category.to_string());
        return true;
    }
    attachment
        .notes
        .iter_mut()
        .any(|note| add_category_to_note(note, member, category))
}

/// Link every category with its members in both directions.
///
/// The category's member list is authoritative; the members' `categories`
/// sets are rebuilt from it. Unknown member ids are dropped and reported.
pub fn link_categories(
    categories: &mut Collection<Category>,
    tasks: &mut Collection<Task>,
    notes: &mut Collection<Note>,
) -> Vec<ReadIssue> {
    let known = categorizable_ids(categories, tasks, notes);
    let mut issues = Vec::new();
    let mut links: Vec<(String, String)> = Vec::new();

    categories.for_each_mut(|category| {
        let category_id = category.base.id.clone();
        category.categorizables.retain(|member| {
            if known.contains_key(member) {
                links.push((category_id.clone(), member.clone()));
                true
            } else {
                issues.push(ReadIssue::DanglingReference {
                    from: category_id.clone(),
                    to: member.clone(),
                    kind: "categorizable".into(),
                });
                false
            }
        });
    });

    tasks.for_each_mut(|task| {
        task.categories.clear();
        task.notes.iter_mut().for_each(clear_note_categories);
        task.attachments.iter_mut().for_each(clear_attachment_categories);
    });
    notes.for_each_mut(|note| {
        note.categories.clear();
        note.attachments.iter_mut().for_each(clear_attachment_categories);
    });
    categories.for_each_mut(|category| {
        category.notes.iter_mut().for_each(clear_note_categories);
        category
            .attachments
            .iter_mut()
            .for_each(clear_attachment_categories);
    });

    for (category_id, member) in links {
        match known.get(&member) {
            Some(Holder::Task) => {
                if let Some(task) = tasks.get_mut(&member) {
                    task.categories.insert(category_id);
                }
            }
            Some(Holder::Note) | Some(Holder::Attachment) => {
                let mut linked = false;
                notes.for_each_mut(|note| {
                    if !linked && note.base.id == member {
                        note.categories.insert(category_id.clone());
                        linked = true;
                    }
                    if !linked {
                        linked = note
                            .attachments
                            .iter_mut()
                            .any(|a| add_category_to_attachment(a, &member, &category_id));
                    }
                });
                if !linked {
                    tasks.for_each_mut(|task| {
                        if !linked {
                            linked = task
                                .notes
                                .iter_mut()
                                .any(|n| add_category_to_note(n, &member, &category_id))
                                || task
                                    .attachments
                                    .iter_mut()
                                    .any(|a| add_category_to_attachment(a, &member, &category_id));
                        }
                    });
                }
                if !linked {
                    categories.for_each_mut(|category| {
                        if !linked {
                            linked = category
                                .notes
                                .iter_mut()
                                .any(|n| add_category_to_note(n, &member, &category_id))
                                || category
                                    .attachments
                                    .iter_mut()
                                    .any(|a| add_category_to_attachment(a, &member, &category_id));
                        }
                    });
                }
            }
            None => {}
        }
    }
    issues
}

fn clear_note_categories(note: &mut Note) {
    note.categories.clear();
    note.children.iter_mut().for_each(clear_note_categories);
    note.attachments
        .iter_mut()
        .for_each(clear_attachment_categories);
}

fn clear_attachment_categories(attachment: &mut Attachment) {
    attachment.categories.clear();
    attachment.notes.iter_mut().for_each(clear_note_categories);
}
