//! Writer for the current task file format.
//!
//! Objects are written sorted by id so that saving an unchanged document
//! produces identical bytes. Every element sits on its own line and text
//! content is wrapped in newlines, which keeps the file diff-friendly.

use std::collections::BTreeMap;
use std::io::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Writer;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::reader::{Holder, categorizable_ids};
use super::schema::{CURRENT_VERSION, RELEASE};
use crate::Result;
use crate::models::values;
use crate::models::{
    Attachment, Base, Category, Collection, Effort, Identified, Note, Recurrence, SyncConfig, Task,
};

/// What goes into a task file.
#[derive(Debug, Clone, Copy)]
pub struct Contents<'a> {
    pub tasks: &'a Collection<Task>,
    pub categories: &'a Collection<Category>,
    pub notes: &'a Collection<Note>,
    pub sync_config: Option<&'a SyncConfig>,
    pub guid: Option<&'a str>,
}

/// In-memory element, serialized once complete.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(&'static str, String)>,
    text: Option<String>,
    children: Vec<Element>,
}

impl Element {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    fn attr(&mut self, name: &'static str, value: impl Into<String>) {
        self.attributes.push((name, value.into()));
    }

    fn text_child(&mut self, name: &str, text: &str) {
        let mut child = Element::new(name);
        child.text = Some(text.to_string());
        self.children.push(child);
    }
}

/// Escape an attribute value, including the whitespace that attribute
/// normalization would otherwise turn into spaces.
fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            '\t' => out.push_str("&#09;"),
            _ => out.push(c),
        }
    }
    out
}

fn emit<W: Write>(writer: &mut Writer<W>, element: &Element) -> Result<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (name, value) in &element.attributes {
        let escaped = escape_attribute(value);
        start.push_attribute(Attribute::from((name.as_bytes(), escaped.as_bytes())));
    }

    let text = element.text.as_deref().filter(|t| !t.is_empty());
    if text.is_none() && element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
    } else {
        writer.write_event(Event::Start(start))?;
        match text {
            Some(text) => {
                let wrapped = format!("\n{}\n", text);
                writer.write_event(Event::Text(BytesText::new(&wrapped)))?;
            }
            None => newline(writer)?,
        }
        for child in &element.children {
            emit(writer, child)?;
        }
        writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    }
    newline(writer)
}

fn newline<W: Write>(writer: &mut Writer<W>) -> Result<()> {
    writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;
    Ok(())
}

fn sorted<T: Identified>(items: &[T]) -> Vec<&T> {
    let mut sorted: Vec<&T> = items.iter().collect();
    sorted.sort_by(|a, b| a.id().cmp(b.id()));
    sorted
}

/// Builds the element tree of a document.
struct TreeBuilder {
    /// Ids a category may list as members
    categorizables: BTreeMap<String, Holder>,
}

impl TreeBuilder {
    fn base_element(&self, name: &str, base: &Base) -> Element {
        let mut node = Element::new(name);
        node.attr("id", base.id.clone());
        node.attr("status", base.status.code().to_string());
        if let Some(creation) = &base.creation {
            node.attr("creationDateTime", values::format_datetime(creation));
        }
        if let Some(modification) = &base.modification {
            node.attr("modificationDateTime", values::format_datetime(modification));
        }
        if !base.subject.is_empty() {
            node.attr("subject", base.subject.clone());
        }
        if !base.description.is_empty() {
            node.text_child("description", &base.description);
        }
        if let Some(color) = &base.fg_color {
            node.attr("fgColor", color.to_string());
        }
        if let Some(color) = &base.bg_color {
            node.attr("bgColor", color.to_string());
        }
        if let Some(font) = &base.font {
            node.attr("font", font.clone());
        }
        if !base.icon.is_empty() {
            node.attr("icon", base.icon.clone());
        }
        if !base.selected_icon.is_empty() {
            node.attr("selectedIcon", base.selected_icon.clone());
        }
        if base.ordering != 0 {
            node.attr("ordering", base.ordering.to_string());
        }
        node
    }

    fn expanded_contexts(node: &mut Element, contexts: &[String]) {
        if !contexts.is_empty() {
            node.attr("expandedContexts", values::format_string_tuple(contexts));
        }
    }

    fn task(&self, task: &Task) -> Element {
        let mut node = self.base_element("task", &task.base);
        Self::expanded_contexts(&mut node, &task.expanded_contexts);
        for child in sorted(&task.children) {
            node.children.push(self.task(child));
        }

        for (name, value) in [
            ("plannedstartdate", &task.planned_start),
            ("duedate", &task.due),
            ("actualstartdate", &task.actual_start),
            ("completiondate", &task.completion),
        ] {
            if let Some(dt) = value {
                node.attr(name, values::format_datetime(dt));
            }
        }
        if task.percentage_complete != 0 {
            node.attr("percentageComplete", task.percentage_complete.to_string());
        }
        if task.recurrence.is_active() {
            node.children.push(recurrence(&task.recurrence));
        }
        if task.budget != chrono::Duration::zero() {
            node.attr("budget", values::format_budget(&task.budget));
        }
        if task.priority != 0 {
            node.attr("priority", task.priority.to_string());
        }
        if task.hourly_fee != 0.0 {
            node.attr("hourlyFee", values::format_float(task.hourly_fee));
        }
        if task.fixed_fee != 0.0 {
            node.attr("fixedFee", values::format_float(task.fixed_fee));
        }
        if let Some(reminder) = &task.reminder {
            node.attr("reminder", values::format_datetime(reminder));
            if let Some(before) = &task.reminder_before_snooze {
                if before < reminder {
                    node.attr("reminderBeforeSnooze", values::format_datetime(before));
                }
            }
        }
        if !task.prerequisites.is_empty() {
            let ids: Vec<&str> = task.prerequisites.iter().map(String::as_str).collect();
            node.attr("prerequisites", ids.join(" "));
        }
        if let Some(flag) = task.should_mark_completed {
            node.attr(
                "shouldMarkCompletedWhenAllChildrenCompleted",
                values::format_bool(flag),
            );
        }

        for effort in task.efforts.sorted_by_id() {
            node.children.push(effort_element(effort));
        }
        for note in task.notes.sorted_by_id() {
            node.children.push(self.note(note));
        }
        for attachment in task.attachments.sorted_by_id() {
            node.children.push(self.attachment(attachment));
        }
        node
    }

    fn category(&self, category: &Category) -> Element {
        let mut node = self.base_element("category", &category.base);
        Self::expanded_contexts(&mut node, &category.expanded_contexts);
        for child in sorted(&category.children) {
            node.children.push(self.category(child));
        }
        if category.filtered {
            node.attr("filtered", values::format_bool(true));
        }
        if category.exclusive_subcategories {
            node.attr("exclusiveSubcategories", values::format_bool(true));
        }
        for note in category.notes.sorted_by_id() {
            node.children.push(self.note(note));
        }
        for attachment in category.attachments.sorted_by_id() {
            node.children.push(self.attachment(attachment));
        }
        let members: Vec<&str> = category
            .categorizables
            .iter()
            .filter(|id| self.categorizables.contains_key(*id))
            .map(String::as_str)
            .collect();
        if !members.is_empty() {
            node.attr("categorizables", members.join(" "));
        }
        node
    }

    fn note(&self, note: &Note) -> Element {
        let mut node = self.base_element("note", &note.base);
        Self::expanded_contexts(&mut node, &note.expanded_contexts);
        for child in sorted(&note.children) {
            node.children.push(self.note(child));
        }
        for attachment in note.attachments.sorted_by_id() {
            node.children.push(self.attachment(attachment));
        }
        node
    }

    fn attachment(&self, attachment: &Attachment) -> Element {
        let mut node = self.base_element("attachment", &attachment.base);
        node.attr("type", attachment.kind.as_str());
        match &attachment.data {
            None => node.attr("location", attachment.location.clone()),
            Some(data) => {
                let mut data_node = Element::new("data");
                data_node.attr("extension", data.extension.clone());
                data_node.text = Some(STANDARD.encode(&data.bytes));
                node.children.push(data_node);
            }
        }
        for note in attachment.notes.sorted_by_id() {
            node.children.push(self.note(note));
        }
        node
    }
}

fn recurrence(recurrence: &Recurrence) -> Element {
    let mut node = Element::new("recurrence");
    node.attr("unit", recurrence.unit.clone());
    if recurrence.amount > 1 {
        node.attr("amount", recurrence.amount.to_string());
    }
    if recurrence.count > 0 {
        node.attr("count", recurrence.count.to_string());
    }
    if recurrence.max > 0 {
        node.attr("max", recurrence.max.to_string());
    }
    if let Some(stop) = &recurrence.stop_datetime {
        node.attr("stop_datetime", values::format_datetime(stop));
    }
    if recurrence.same_weekday {
        node.attr("sameWeekday", values::format_bool(true));
    }
    if recurrence.recur_based_on_completion {
        node.attr("recurBasedOnCompletion", values::format_bool(true));
    }
    node
}

fn effort_element(effort: &Effort) -> Element {
    let mut node = Element::new("effort");
    node.attr("id", effort.id.clone());
    node.attr("status", effort.status.code().to_string());
    if let Some(start) = &effort.start {
        let formatted_start = values::format_effort_datetime(start);
        if let Some(stop) = &effort.stop {
            let mut formatted_stop = values::format_effort_datetime(stop);
            // Zero-length efforts would read back as still running
            if formatted_stop == formatted_start {
                formatted_stop =
                    values::format_effort_datetime(&(*stop + chrono::Duration::seconds(1)));
            }
            node.attr("start", formatted_start);
            node.attr("stop", formatted_stop);
        } else {
            node.attr("start", formatted_start);
        }
    }
    if !effort.description.is_empty() {
        node.text_child("description", &effort.description);
    }
    node
}

fn sync_config_element(name: &str, config: &SyncConfig) -> Element {
    let mut node = Element::new(name);
    for (key, value) in &config.properties {
        let mut property = Element::new("property");
        property.attr("name", key.clone());
        property.text = Some(value.clone());
        node.children.push(property);
    }
    for child in &config.children {
        node.children.push(sync_config_element(&child.name, child));
    }
    node
}

/// Serialize a document in the current format.
pub fn write<W: Write>(out: W, contents: &Contents<'_>) -> Result<()> {
    let builder = TreeBuilder {
        categorizables: categorizable_ids(contents.categories, contents.tasks, contents.notes),
    };

    let mut root = Element::new("tasks");
    for task in sorted(contents.tasks.roots()) {
        root.children.push(builder.task(task));
    }
    for category in sorted(contents.categories.roots()) {
        root.children.push(builder.category(category));
    }
    for note in sorted(contents.notes.roots()) {
        root.children.push(builder.note(note));
    }
    if let Some(config) = contents.sync_config {
        root.children
            .push(sync_config_element("syncmlconfig", config));
    }
    if let Some(guid) = contents.guid {
        root.text_child("guid", guid);
    }

    let mut writer = Writer::new(out);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    newline(&mut writer)?;
    write!(
        writer.get_mut(),
        "<?taskcoach release=\"{}\" tskversion=\"{}\"?>\n",
        RELEASE, CURRENT_VERSION
    )?;
    emit(&mut writer, &root)?;
    writer.get_mut().flush()?;
    Ok(())
}

/// [`write`] into a buffer.
pub fn to_bytes(contents: &Contents<'_>) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    write(&mut buffer, contents)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttachmentKind, EmbeddedData, SyncStatus};
    use crate::models::collection::DomainObject;
    use crate::storage::xml::reader::XmlReader;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn render(
        tasks: &Collection<Task>,
        categories: &Collection<Category>,
        notes: &Collection<Note>,
    ) -> String {
        let contents = Contents {
            tasks,
            categories,
            notes,
            sync_config: None,
            guid: Some("doc-guid"),
        };
        String::from_utf8(to_bytes(&contents).unwrap()).unwrap()
    }

    #[test]
    fn test_header_and_layout() {
        let text = render(&Collection::new(), &Collection::new(), &Collection::new());
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("<?xml"));
        assert_eq!(
            lines.next().unwrap(),
            format!(
                "<?taskcoach release=\"{}\" tskversion=\"{}\"?>",
                RELEASE, CURRENT_VERSION
            )
        );
        assert_eq!(lines.next().unwrap(), "<tasks>");
        assert_eq!(lines.next().unwrap(), "<guid>");
        assert_eq!(lines.next().unwrap(), "doc-guid");
    }

    #[test]
    fn test_children_sorted_by_id() {
        let tasks = Collection::from_roots(vec![Task::with_id("b", "B"), Task::with_id("a", "A")]);
        let text = render(&tasks, &Collection::new(), &Collection::new());
        let a = text.find("id=\"a\"").unwrap();
        let b = text.find("id=\"b\"").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_defaults_are_omitted() {
        let mut task = Task::with_id("t", "");
        task.base.creation = None;
        let text = render(
            &Collection::from_roots(vec![task]),
            &Collection::new(),
            &Collection::new(),
        );
        assert!(text.contains("<task id=\"t\" status=\"1\"/>"));
    }

    #[test]
    fn test_attribute_newlines_escaped() {
        let task = Task::with_id("t", "two\nlines & more");
        let text = render(
            &Collection::from_roots(vec![task]),
            &Collection::new(),
            &Collection::new(),
        );
        assert!(text.contains("subject=\"two&#10;lines &amp; more\""));
    }

    #[test]
    fn test_zero_length_effort_gets_one_second() {
        let mut task = Task::with_id("t", "x");
        task.efforts.add(Effort {
            id: "e".into(),
            start: Some(at(9, 0, 0)),
            stop: Some(at(9, 0, 0)),
            ..Effort::default()
        });
        let text = render(
            &Collection::from_roots(vec![task]),
            &Collection::new(),
            &Collection::new(),
        );
        assert!(text.contains("start=\"2024-05-01 09:00:00\" stop=\"2024-05-01 09:00:01\""));
    }

    #[test]
    fn test_dangling_members_not_written() {
        let mut category = Category::with_id("c", "Work");
        category.categorizables.insert("t".into());
        category.categorizables.insert("gone".into());
        let text = render(
            &Collection::from_roots(vec![Task::with_id("t", "x")]),
            &Collection::from_roots(vec![category]),
            &Collection::new(),
        );
        assert!(text.contains("categorizables=\"t\""));
    }

    #[test]
    fn test_round_trip_is_stable() {
        let mut task = Task::with_id("t1", "Report");
        task.base.description = "Quarterly\nnumbers".into();
        task.base.status = SyncStatus::Changed;
        task.due = Some(at(17, 0, 0));
        task.budget = chrono::Duration::hours(3);
        task.priority = 2;
        task.recurrence.unit = "monthly".into();
        task.prerequisites.insert("t2".into());
        task.children.push(Task::with_id("t1a", "Draft"));
        let mut attachment = Attachment::new(AttachmentKind::Mail, "");
        attachment.data = Some(EmbeddedData {
            extension: ".eml".into(),
            bytes: b"From: me".to_vec(),
        });
        task.attachments.add(attachment);
        task.notes.add(Note::with_id("tn", "Remember"));

        let mut category = Category::with_id("c", "Work");
        category.categorizables.insert("t1".into());
        category.filtered = true;

        let tasks = Collection::from_roots(vec![task, Task::with_id("t2", "First")]);
        let categories = Collection::from_roots(vec![category]);
        let notes = Collection::from_roots(vec![Note::with_id("n", "Standalone")]);
        let config = SyncConfig::default_for("doc-guid");
        let contents = Contents {
            tasks: &tasks,
            categories: &categories,
            notes: &notes,
            sync_config: Some(&config),
            guid: Some("doc-guid"),
        };
        let first = to_bytes(&contents).unwrap();

        let text = String::from_utf8(first.clone()).unwrap();
        let parsed = XmlReader::new(&text).read().unwrap();
        assert!(parsed.issues.is_empty(), "{:?}", parsed.issues);
        assert_eq!(parsed.guid, "doc-guid");
        assert_eq!(parsed.sync_config, config);
        let read_task = parsed.tasks.get("t1").unwrap();
        assert_eq!(read_task.base.description, "Quarterly\nnumbers");
        assert_eq!(read_task.fields(), tasks.get("t1").unwrap().fields());

        let again = to_bytes(&Contents {
            tasks: &parsed.tasks,
            categories: &parsed.categories,
            notes: &parsed.notes,
            sync_config: Some(&parsed.sync_config),
            guid: Some(&parsed.guid),
        })
        .unwrap();
        assert_eq!(first, again);
    }
}
