//! Persistence for `.tsk` task files.
//!
//! A [`Document`] owns the tasks, categories and notes of one task file and
//! keeps them in step with the file on disk:
//!
//! - **Writes** go through [`atomic::AtomicWriter`], so other readers never
//!   see a half-written file.
//! - **Locking**: every load, save and merge runs under the `<file>.lock`
//!   sidecar ([`lock::FileLock`]).
//! - **Sharing**: the `<file>.delta` sidecar holds one change ledger per
//!   device. Saving publishes this device's edits into every other ledger
//!   and merges whatever is waiting in its own.
//! - **Backups** of the previous version are kept per document
//!   ([`backup::BackupStore`]).

pub mod atomic;
pub mod backup;
pub mod lock;
pub mod watcher;
pub mod xml;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::changes::{ChangeMap, ChangeMonitor, ChangeSynchronizer, SyncReport, publish};
use crate::config::resolver::{
    DEFAULT_BACKUP_MIN_COUNT, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_POLL_INTERVAL_MS,
};
use crate::config::{EngineConfig, WatchMode};
use crate::models::{
    Category, Collection, DomainObject, Note, ObjectKind, SyncConfig, SyncStatus, Task, new_id,
    values,
};
use crate::{Error, Result};

use atomic::{AtomicWriter, WriteDurability};
use backup::BackupStore;
use lock::FileLock;
use watcher::{FileWatcher, Fingerprint};
use xml::reader::{self, ParsedDocument, ReadIssue};
use xml::{Contents, delta, writer};

/// Engine settings a document runs with.
#[derive(Debug, Clone)]
pub struct DocumentSettings {
    pub lock_timeout: Duration,
    pub durability: WriteDurability,
    /// `None` disables backups
    pub backups: Option<BackupStore>,
    pub watch_mode: WatchMode,
    pub poll_interval: Duration,
}

impl From<EngineConfig> for DocumentSettings {
    fn from(config: EngineConfig) -> Self {
        let backups = if config.backups.unwrap_or(true) {
            config
                .backup_dir
                .clone()
                .or_else(|| crate::config::data_dir().ok().map(|dir| dir.join("backups")))
                .map(|dir| {
                    BackupStore::new(dir).with_min_count(
                        config.backup_min_count.unwrap_or(DEFAULT_BACKUP_MIN_COUNT),
                    )
                })
        } else {
            None
        };
        Self {
            lock_timeout: Duration::from_millis(
                config.lock_timeout_ms.unwrap_or(DEFAULT_LOCK_TIMEOUT_MS),
            ),
            durability: config.durability.unwrap_or_default(),
            backups,
            watch_mode: config.watch_mode.unwrap_or_default(),
            poll_interval: Duration::from_millis(
                config.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
        }
    }
}

impl Default for DocumentSettings {
    fn default() -> Self {
        EngineConfig::default().into()
    }
}

/// What a document is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// No file attached
    Closed,
    Loading,
    Idle,
    Saving,
    MergingOnDisk,
}

impl Mode {
    /// Edits made while busy are bookkeeping, not user changes.
    pub fn is_busy(&self) -> bool {
        matches!(self, Mode::Loading | Mode::Saving | Mode::MergingOnDisk)
    }
}

/// Notifications delivered to [`Document::subscribe`] observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    Dirty,
    Clean,
    ChangedOnDisk,
    FilenameChanged(Option<PathBuf>),
    AboutToRead,
    JustRead,
    AboutToSave,
    JustSaved,
    AboutToClear,
    JustCleared,
}

/// Handle returned by [`Document::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(usize);

type Observer = Box<dyn FnMut(&DocumentEvent) + Send>;

/// Options for [`Document::load`].
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Read under the file lock
    pub lock: bool,
    /// Remove an existing lock first, whoever holds it
    pub break_lock: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            lock: true,
            break_lock: false,
        }
    }
}

/// Outcome of the last successful load.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub version: u32,
    /// The file did not exist and the document started empty
    pub created: bool,
    pub issues: Vec<ReadIssue>,
}

/// Outcome of [`Document::import`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    /// Objects taken from the other file, descendants included
    pub added: usize,
    /// Local objects overwritten by an object with the same id
    pub replaced: Vec<String>,
    pub issues: Vec<ReadIssue>,
}

/// One task file, loaded into memory.
pub struct Document {
    settings: DocumentSettings,
    filename: Option<PathBuf>,
    last_filename: Option<PathBuf>,
    tasks: Collection<Task>,
    categories: Collection<Category>,
    notes: Collection<Note>,
    guid: String,
    sync_config: SyncConfig,
    /// This device's edits since the last save
    monitor: ChangeMonitor,
    /// Every device's ledger as last read from or written to `.delta`
    changes: ChangeMap,
    dirty: bool,
    mode: Mode,
    changed_on_disk: bool,
    last_report: LoadReport,
    observers: Vec<(usize, Observer)>,
    next_observer: usize,
    /// Held across operations after [`Document::acquire_lock`]
    lock: Option<FileLock>,
    watcher: Option<FileWatcher>,
    disk_fingerprint: Option<Fingerprint>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("filename", &self.filename)
            .field("guid", &self.guid)
            .field("mode", &self.mode)
            .field("dirty", &self.dirty)
            .field("tasks", &self.tasks.len())
            .field("categories", &self.categories.len())
            .field("notes", &self.notes.len())
            .finish()
    }
}

fn not_found(kind: ObjectKind, id: &str) -> Error {
    Error::NotFound(format!("{} {}", kind, id))
}

fn subtree_ids<T: DomainObject>(item: &T, out: &mut Vec<String>) {
    out.push(item.id().to_string());
    for child in item.children() {
        subtree_ids(child, out);
    }
}

fn add_to<T: DomainObject>(
    collection: &mut Collection<T>,
    monitor: &mut ChangeMonitor,
    item: T,
    parent: Option<&str>,
) -> Result<()> {
    if collection.contains(item.id()) {
        return Err(Error::InvalidInput(format!(
            "{} {} already exists",
            T::KIND,
            item.id()
        )));
    }
    if let Some(parent) = parent {
        if !collection.contains(parent) {
            return Err(not_found(T::KIND, parent));
        }
    }
    let mut ids = Vec::new();
    subtree_ids(&item, &mut ids);
    collection.insert(item, parent);
    for id in &ids {
        monitor.object_added(T::KIND, id);
    }
    Ok(())
}

fn remove_from<T: DomainObject>(
    collection: &mut Collection<T>,
    monitor: &mut ChangeMonitor,
    id: &str,
) -> Result<T> {
    let item = collection.remove(id).ok_or_else(|| not_found(T::KIND, id))?;
    let mut ids = Vec::new();
    subtree_ids(&item, &mut ids);
    for id in &ids {
        monitor.object_removed(T::KIND, id);
    }
    Ok(item)
}

/// Apply `edit` and record the attributes it changed.
fn modify_in<T: DomainObject>(
    collection: &mut Collection<T>,
    monitor: &mut ChangeMonitor,
    id: &str,
    edit: impl FnOnce(&mut T),
) -> Result<BTreeSet<String>> {
    let item = collection.get_mut(id).ok_or_else(|| not_found(T::KIND, id))?;
    let before = item.fields();
    edit(item);
    if item.id() != id {
        item.base_mut().id = id.to_string();
        return Err(Error::InvalidInput(format!(
            "{} {}: ids cannot be changed",
            T::KIND,
            id
        )));
    }

    let mut changed: BTreeSet<String> = item
        .fields()
        .into_iter()
        .filter(|(name, value)| before.get(name) != Some(value))
        .map(|(name, _)| name)
        .collect();
    if changed.is_empty() {
        return Ok(changed);
    }
    item.base_mut().modification = Some(values::now());
    changed.insert("modificationDateTime".into());
    if item.status() == SyncStatus::None {
        item.set_status(SyncStatus::Changed);
    }
    monitor.mark_changed(T::KIND, id, changed.iter().cloned());
    Ok(changed)
}

fn mark_deleted_in<T: DomainObject>(
    collection: &mut Collection<T>,
    monitor: &mut ChangeMonitor,
    id: &str,
) -> Result<Vec<String>> {
    fn visit<T: DomainObject>(item: &mut T, marked: &mut Vec<String>) {
        if !item.is_deleted() {
            item.set_status(SyncStatus::Deleted);
            marked.push(item.id().to_string());
        }
        for child in item.children_mut() {
            visit(child, marked);
        }
    }

    let item = collection.get_mut(id).ok_or_else(|| not_found(T::KIND, id))?;
    let mut marked = Vec::new();
    visit(item, &mut marked);
    for id in &marked {
        monitor.mark_changed(T::KIND, id, ["status"]);
    }
    Ok(marked)
}

/// Move every object of `source` into `target`, replacing same-id objects.
fn import_into<T: DomainObject>(
    target: &mut Collection<T>,
    mut source: Collection<T>,
    monitor: &mut ChangeMonitor,
    replaced: &mut Vec<String>,
) -> usize {
    let incoming = source.ids();
    for id in &incoming {
        if let Some(old) = target.remove(id) {
            replaced.push(id.clone());
            let mut gone = Vec::new();
            subtree_ids(&old, &mut gone);
            for id in gone.iter().filter(|id| !incoming.contains(*id)) {
                monitor.object_removed(T::KIND, id);
            }
        }
    }
    for root in source.clear() {
        target.insert(root, None);
    }
    for id in &incoming {
        monitor.object_added(T::KIND, id);
    }
    incoming.len()
}

impl Document {
    /// An empty document with no file attached.
    pub fn new(settings: DocumentSettings) -> Self {
        let guid = new_id();
        let monitor = ChangeMonitor::monitoring_all(new_id());
        let mut changes = ChangeMap::new();
        changes.insert(monitor.guid().to_string(), monitor.clone());
        Self {
            settings,
            filename: None,
            last_filename: None,
            tasks: Collection::new(),
            categories: Collection::new(),
            notes: Collection::new(),
            sync_config: SyncConfig::default_for(&guid),
            guid,
            monitor,
            changes,
            dirty: false,
            mode: Mode::Closed,
            changed_on_disk: false,
            last_report: LoadReport::default(),
            observers: Vec::new(),
            next_observer: 0,
            lock: None,
            watcher: None,
            disk_fingerprint: None,
        }
    }

    pub fn settings(&self) -> &DocumentSettings {
        &self.settings
    }

    pub fn tasks(&self) -> &Collection<Task> {
        &self.tasks
    }

    pub fn categories(&self) -> &Collection<Category> {
        &self.categories
    }

    pub fn notes(&self) -> &Collection<Note> {
        &self.notes
    }

    /// Identity of the file's contents, kept across saves.
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Identity of this device in the `.delta` ledgers.
    pub fn device_guid(&self) -> &str {
        self.monitor.guid()
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.sync_config
    }

    pub fn set_sync_config(&mut self, config: SyncConfig) {
        if self.sync_config != config {
            self.sync_config = config;
            self.edited();
        }
    }

    /// Ledgers of every device sharing the file.
    pub fn changes(&self) -> &ChangeMap {
        &self.changes
    }

    /// This device's unsaved edits.
    pub fn monitor(&self) -> &ChangeMonitor {
        &self.monitor
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn last_report(&self) -> &LoadReport {
        &self.last_report
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// The current filename, or the previous one after a close.
    pub fn last_filename(&self) -> Option<&Path> {
        self.last_filename.as_deref()
    }

    /// Whether the attached file exists on disk.
    pub fn exists(&self) -> bool {
        self.filename.as_deref().is_some_and(Path::is_file)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.categories.is_empty() && self.notes.is_empty()
    }

    /// Whether any object in the document has `id`, owned ones included.
    pub fn contains(&self, id: &str) -> bool {
        self.categories.contains(id)
            || reader::categorizable_ids(&self.categories, &self.tasks, &self.notes)
                .contains_key(id)
            || self.tasks.iter().any(|task| task.efforts.get(id).is_some())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Dirty and not in the middle of loading, saving or merging.
    pub fn need_save(&self) -> bool {
        self.dirty && !self.mode.is_busy()
    }

    pub fn changed_on_disk(&self) -> bool {
        self.changed_on_disk
    }

    // ---- Observers ----

    pub fn subscribe(
        &mut self,
        observer: impl FnMut(&DocumentEvent) + Send + 'static,
    ) -> SubscriptionId {
        let id = self.next_observer;
        self.next_observer += 1;
        self.observers.push((id, Box::new(observer)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&mut self, subscription: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(id, _)| *id != subscription.0);
        self.observers.len() != before
    }

    fn emit(&mut self, event: DocumentEvent) {
        for (_, observer) in self.observers.iter_mut() {
            observer(&event);
        }
    }

    // ---- Dirty state ----

    /// Flag unsaved changes. Observers hear about the clean to dirty
    /// transition, or every call when `force` is set.
    pub fn mark_dirty(&mut self, force: bool) {
        let was_dirty = self.dirty;
        self.dirty = true;
        if force || !was_dirty {
            self.emit(DocumentEvent::Dirty);
        }
    }

    pub fn mark_clean(&mut self) {
        if self.dirty {
            self.dirty = false;
            self.emit(DocumentEvent::Clean);
        }
    }

    fn edited(&mut self) {
        if !self.mode.is_busy() {
            self.mark_dirty(false);
        }
    }

    fn rest_mode(&self) -> Mode {
        if self.filename.is_some() {
            Mode::Idle
        } else {
            Mode::Closed
        }
    }

    /// Suspend dirty tracking while an external synchronizer edits the
    /// document.
    pub fn begin_sync(&mut self) {
        self.mode = Mode::Loading;
    }

    /// End of an external synchronization; the document counts as edited.
    pub fn end_sync(&mut self) {
        self.mode = self.rest_mode();
        self.mark_dirty(false);
    }

    /// Attach the document to another file without reading or writing it.
    pub fn set_filename(&mut self, filename: Option<PathBuf>) {
        if self.filename == filename {
            return;
        }
        self.last_filename = filename.clone().or_else(|| self.filename.take());
        self.filename = filename.clone();
        if self
            .watcher
            .as_ref()
            .is_some_and(|w| Some(w.path()) != self.filename.as_deref())
        {
            self.watcher = None;
        }
        if !self.mode.is_busy() {
            self.mode = self.rest_mode();
        }
        self.emit(DocumentEvent::FilenameChanged(filename));
    }

    // ---- Locking ----

    /// Run `op` under the lock of `path`. An explicit lock from
    /// [`Document::acquire_lock`] on the same file is reused.
    fn locked<R>(&mut self, path: &Path, op: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let lock_path = lock::lock_path_for(path);
        let held = self
            .lock
            .as_ref()
            .is_some_and(|l| l.path() == lock_path && l.is_locked_by_me());
        if held {
            return op(self);
        }
        let mut lock = FileLock::for_document(path);
        lock.acquire(self.settings.lock_timeout)?;
        let result = op(self);
        let released = lock.release();
        let value = result?;
        released?;
        Ok(value)
    }

    /// Keep the file locked until [`Document::release_lock`] or close.
    pub fn acquire_lock(&mut self) -> Result<()> {
        let path = self.filename.clone().ok_or(Error::NoFilename)?;
        if let Some(lock) = &self.lock {
            if lock.path() == lock::lock_path_for(&path) && lock.is_locked_by_me() {
                return Ok(());
            }
        }
        self.release_lock()?;
        let mut lock = FileLock::for_document(&path);
        lock.acquire(self.settings.lock_timeout)?;
        self.lock = Some(lock);
        Ok(())
    }

    pub fn release_lock(&mut self) -> Result<()> {
        match self.lock.take() {
            Some(mut lock) => lock.release(),
            None => Ok(()),
        }
    }

    /// Remove a lock left behind on the attached file.
    pub fn break_lock(&mut self, force: bool) -> Result<()> {
        let path = self.filename.clone().ok_or(Error::NoFilename)?;
        if let Some(lock) = &self.lock {
            if lock.path() == lock::lock_path_for(&path) {
                self.lock = None;
            }
        }
        FileLock::for_document(&path).break_lock(force)
    }

    pub fn is_locked_by_me(&self) -> bool {
        self.lock.as_ref().is_some_and(FileLock::is_locked_by_me)
    }

    // ---- Disk I/O ----

    fn contents(&self) -> Contents<'_> {
        Contents {
            tasks: &self.tasks,
            categories: &self.categories,
            notes: &self.notes,
            sync_config: Some(&self.sync_config),
            guid: Some(&self.guid),
        }
    }

    fn write_delta(&self, path: &Path, changes: &ChangeMap) -> Result<()> {
        let bytes = delta::to_bytes(changes)?;
        AtomicWriter::new(delta::delta_path_for(path))
            .with_durability(self.settings.durability)
            .write(&bytes)?;
        Ok(())
    }

    /// Rebuild prerequisite and category links, dropping dangling ids.
    fn relink(&mut self) -> Vec<ReadIssue> {
        let written: BTreeMap<String, Vec<String>> = self
            .tasks
            .iter()
            .filter(|task| !task.prerequisites.is_empty())
            .map(|task| {
                (
                    task.base.id.clone(),
                    task.prerequisites.iter().cloned().collect(),
                )
            })
            .collect();
        let mut issues = reader::resolve_prerequisites(&mut self.tasks, &written);
        issues.extend(reader::link_categories(
            &mut self.categories,
            &mut self.tasks,
            &mut self.notes,
        ));
        for issue in &issues {
            debug!(%issue, "Dropped dangling reference");
        }
        issues
    }

    /// Load `path`, replacing the current contents. A missing file gives
    /// an empty document that will be created on the first save.
    pub fn load(&mut self, path: &Path, options: LoadOptions) -> Result<LoadReport> {
        self.emit(DocumentEvent::AboutToRead);
        self.mode = Mode::Loading;
        self.watcher = None;

        let result = self.load_with(path, options);
        match result {
            Ok(report) => {
                self.mode = Mode::Idle;
                self.mark_clean();
                self.changed_on_disk = false;
                self.last_report = report.clone();
                self.disk_fingerprint = Fingerprint::of(path);
                self.ensure_watcher();
                info!(
                    path = %path.display(),
                    version = report.version,
                    tasks = self.tasks.len(),
                    issues = report.issues.len(),
                    "Loaded task file"
                );
                self.emit(DocumentEvent::JustRead);
                Ok(report)
            }
            Err(e) => {
                self.set_filename(None);
                self.mode = self.rest_mode();
                self.mark_clean();
                Err(e)
            }
        }
    }

    fn load_with(&mut self, path: &Path, options: LoadOptions) -> Result<LoadReport> {
        if options.break_lock {
            FileLock::for_document(path).break_lock(true)?;
        }
        self.set_filename(Some(path.to_path_buf()));
        if options.lock {
            self.locked(path, |doc| doc.load_locked(path))
        } else {
            self.load_locked(path)
        }
    }

    fn load_locked(&mut self, path: &Path) -> Result<LoadReport> {
        let exists = path.exists();
        let parsed = if exists {
            reader::read_file(path)?
        } else {
            ParsedDocument::empty()
        };
        let ParsedDocument {
            version,
            tasks,
            categories,
            notes,
            sync_config,
            mut changes,
            guid,
            issues,
        } = parsed;

        self.tasks = tasks;
        self.categories = categories;
        self.notes = notes;
        self.guid = guid;
        self.sync_config = sync_config;
        self.monitor.reset();
        changes.insert(self.monitor.guid().to_string(), self.monitor.clone());
        if exists {
            self.write_delta(path, &changes)?;
        }
        self.changes = changes;

        Ok(LoadReport {
            version,
            created: !exists,
            issues,
        })
    }

    /// Merge `inbound` and the objects read from disk into memory.
    fn synchronize(
        &mut self,
        inbound: &ChangeMonitor,
        tasks: &Collection<Task>,
        categories: &Collection<Category>,
        notes: &Collection<Note>,
    ) -> SyncReport {
        self.monitor.freeze();
        let mut sync = ChangeSynchronizer::new(&self.monitor, inbound);
        sync.sync(&mut self.categories, categories);
        sync.sync(&mut self.tasks, tasks);
        sync.sync(&mut self.notes, notes);
        let report = sync.into_report();
        self.monitor.thaw();

        if !report.is_empty() {
            self.relink();
        }
        for conflict in &report.conflicts {
            info!(
                kind = %conflict.kind,
                id = %conflict.id,
                attribute = %conflict.attribute,
                "Kept local value over change from another device"
            );
        }
        report
    }

    /// Save to the attached file, merging changes other devices made since
    /// it was read.
    pub fn save(&mut self) -> Result<SyncReport> {
        let path = self.filename.clone().ok_or(Error::NoFilename)?;
        self.locked(&path, |doc| doc.save_locked(&path))
    }

    fn save_locked(&mut self, path: &Path) -> Result<SyncReport> {
        self.emit(DocumentEvent::AboutToSave);
        self.mode = Mode::Saving;
        let result = self.merge_and_write(path);
        self.mode = self.rest_mode();
        let report = result?;

        self.mark_clean();
        self.changed_on_disk = false;
        self.disk_fingerprint = Fingerprint::of(path);
        self.ensure_watcher();
        if let Some(watcher) = &self.watcher {
            watcher.drain();
        }
        info!(
            path = %path.display(),
            merged = report.mutation_count(),
            conflicts = report.conflicts.len(),
            "Saved task file"
        );
        self.emit(DocumentEvent::JustSaved);
        Ok(report)
    }

    fn merge_and_write(&mut self, path: &Path) -> Result<SyncReport> {
        if let Some(store) = &self.settings.backups {
            if let Err(e) = store.backup(path) {
                warn!(path = %path.display(), error = %e, "Could not back up task file");
            }
        }

        let own = self.monitor.guid().to_string();
        let existed = path.exists();
        let (mut changes, report) = if existed {
            let parsed = reader::read_file(path)?;
            let mut changes = parsed.changes;
            publish(&mut changes, &self.monitor);
            let inbound = changes
                .remove(&own)
                .unwrap_or_else(|| ChangeMonitor::with_guid(own.as_str()));
            let report =
                self.synchronize(&inbound, &parsed.tasks, &parsed.categories, &parsed.notes);
            (changes, report)
        } else {
            (ChangeMap::new(), SyncReport::default())
        };

        if self.dirty || !existed || !report.is_empty() {
            let bytes = writer::to_bytes(&self.contents())?;
            AtomicWriter::new(path)
                .with_durability(self.settings.durability)
                .write(&bytes)?;
        }

        let mut published = self.monitor.clone();
        published.reset_all_changes();
        changes.insert(own, published);
        self.write_delta(path, &changes)?;
        self.monitor.reset_all_changes();
        self.changes = changes;
        Ok(report)
    }

    /// Save under a new name. An existing file there is backed up and
    /// replaced, together with its ledgers.
    pub fn save_as(&mut self, path: &Path) -> Result<SyncReport> {
        if self.filename.as_deref() != Some(path) {
            let backups = self.settings.backups.clone();
            self.locked(path, |_| {
                if path.exists() {
                    if let Some(store) = &backups {
                        store.backup(path)?;
                    }
                    fs::remove_file(path)?;
                }
                let delta_path = delta::delta_path_for(path);
                if delta_path.exists() {
                    fs::remove_file(delta_path)?;
                }
                Ok(())
            })?;
            self.set_filename(Some(path.to_path_buf()));
        }
        self.save()
    }

    /// Merge what other devices saved without writing the task file.
    ///
    /// Local edits stay pending and are published by the next save.
    pub fn merge_disk_changes(&mut self) -> Result<SyncReport> {
        let path = self.filename.clone().ok_or(Error::NoFilename)?;
        let report = self.locked(&path, |doc| {
            doc.mode = Mode::MergingOnDisk;
            let result = doc.merge_from_disk(&path);
            doc.mode = doc.rest_mode();
            result
        })?;

        self.changed_on_disk = false;
        self.disk_fingerprint = Fingerprint::of(&path);
        if !report.resurrected.is_empty() || !report.marked_new.is_empty() {
            self.mark_dirty(false);
        }
        debug!(
            path = %path.display(),
            merged = report.mutation_count(),
            "Merged changes from disk"
        );
        Ok(report)
    }

    fn merge_from_disk(&mut self, path: &Path) -> Result<SyncReport> {
        if !path.exists() {
            return Ok(SyncReport::default());
        }
        let parsed = reader::read_file(path)?;
        let mut changes = parsed.changes;
        let own = self.monitor.guid().to_string();
        let mut inbound = changes
            .remove(&own)
            .unwrap_or_else(|| ChangeMonitor::with_guid(own.as_str()));
        let report = self.synchronize(&inbound, &parsed.tasks, &parsed.categories, &parsed.notes);

        inbound.reset_all_changes();
        changes.insert(own, inbound);
        self.write_delta(path, &changes)?;
        self.changes = changes;
        Ok(report)
    }

    /// Take every object of another task file into this document. Objects
    /// with an id already present replace the local ones.
    pub fn import(&mut self, path: &Path) -> Result<ImportReport> {
        let parsed = {
            let mut lock = FileLock::for_document(path);
            lock.acquire(self.settings.lock_timeout)?;
            let parsed = reader::read_file(path);
            lock.release()?;
            parsed?
        };

        let previous = self.mode;
        self.mode = Mode::Loading;
        let memberships: Vec<(String, BTreeSet<String>)> = self
            .categories
            .iter()
            .map(|c| (c.base.id.clone(), c.categorizables.clone()))
            .collect();

        let mut replaced = Vec::new();
        let mut added = import_into(
            &mut self.categories,
            parsed.categories,
            &mut self.monitor,
            &mut replaced,
        );
        added += import_into(&mut self.tasks, parsed.tasks, &mut self.monitor, &mut replaced);
        added += import_into(&mut self.notes, parsed.notes, &mut self.monitor, &mut replaced);

        let known = reader::categorizable_ids(&self.categories, &self.tasks, &self.notes);
        for (id, members) in memberships {
            if let Some(category) = self.categories.get_mut(&id) {
                category
                    .categorizables
                    .extend(members.into_iter().filter(|m| known.contains_key(m)));
            }
        }
        let mut issues = parsed.issues;
        issues.extend(self.relink());

        self.mode = previous;
        self.mark_dirty(true);
        info!(path = %path.display(), added, replaced = replaced.len(), "Imported task file");
        Ok(ImportReport {
            added,
            replaced,
            issues,
        })
    }

    /// Detach from the file: drop this device's ledger from `.delta`,
    /// release any lock and start over empty.
    pub fn close(&mut self) -> Result<()> {
        if let Some(path) = self.filename.clone() {
            if path.exists() {
                let own = self.monitor.guid().to_string();
                self.locked(&path, |doc| {
                    let mut changes = delta::read_file(&delta::delta_path_for(&path));
                    if changes.remove(&own).is_some() {
                        doc.write_delta(&path, &changes)?;
                    }
                    Ok(())
                })?;
            }
        }
        self.watcher = None;
        self.disk_fingerprint = None;
        self.release_lock()?;
        self.set_filename(None);

        self.mode = Mode::Loading;
        self.clear(true);
        self.monitor.reset();
        self.changes = ChangeMap::new();
        self.changes
            .insert(self.monitor.guid().to_string(), self.monitor.clone());
        self.mode = Mode::Closed;
        self.mark_clean();
        self.changed_on_disk = false;
        Ok(())
    }

    /// Remove every object. With `regenerate_guid` the document also gets
    /// a new identity and a fresh sync configuration.
    pub fn clear(&mut self, regenerate_guid: bool) {
        self.emit(DocumentEvent::AboutToClear);
        for (kind, id) in self.object_ids() {
            self.monitor.object_removed(kind, &id);
        }
        self.tasks.clear();
        self.categories.clear();
        self.notes.clear();
        if regenerate_guid {
            self.guid = new_id();
            self.sync_config = SyncConfig::default_for(&self.guid);
        }
        self.edited();
        self.emit(DocumentEvent::JustCleared);
    }

    fn object_ids(&self) -> Vec<(ObjectKind, String)> {
        let tasks = self.tasks.ids().into_iter().map(|id| (ObjectKind::Task, id));
        let categories = self
            .categories
            .ids()
            .into_iter()
            .map(|id| (ObjectKind::Category, id));
        let notes = self.notes.ids().into_iter().map(|id| (ObjectKind::Note, id));
        tasks.chain(categories).chain(notes).collect()
    }

    // ---- Change detection ----

    /// Record that the file changed underneath us. Ignored while our own
    /// save is writing it.
    pub fn on_file_changed(&mut self) {
        if self.mode == Mode::Saving {
            return;
        }
        self.changed_on_disk = true;
        self.emit(DocumentEvent::ChangedOnDisk);
    }

    fn ensure_watcher(&mut self) {
        let Some(path) = self.filename.clone() else {
            self.watcher = None;
            return;
        };
        if self.watcher.as_ref().is_some_and(|w| w.path() == path) {
            return;
        }
        self.watcher =
            match FileWatcher::start(&path, self.settings.watch_mode, self.settings.poll_interval) {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Falling back to checking file metadata"
                    );
                    None
                }
            };
    }

    /// Check whether someone else changed the file since we last read or
    /// wrote it. Returns true when a new change was detected.
    pub fn poll_disk_changes(&mut self) -> bool {
        let Some(path) = self.filename.clone() else {
            return false;
        };
        let signalled = match &self.watcher {
            Some(watcher) => watcher.take_changed(),
            None => true,
        };
        if !signalled {
            return false;
        }
        let current = Fingerprint::of(&path);
        if current == self.disk_fingerprint {
            return false;
        }
        self.disk_fingerprint = current;
        self.on_file_changed();
        true
    }

    /// Block up to `timeout` for a change on disk.
    pub fn wait_for_disk_change(&mut self, timeout: Duration) -> bool {
        match &self.watcher {
            Some(watcher) => {
                watcher.wait(timeout);
            }
            None => std::thread::sleep(timeout.min(self.settings.poll_interval)),
        }
        self.poll_disk_changes()
    }

    // ---- Editing ----

    fn categorizable_keys(&self) -> BTreeSet<String> {
        reader::categorizable_ids(&self.categories, &self.tasks, &self.notes)
            .into_keys()
            .collect()
    }

    /// Drop references to objects that no longer exist, recording the
    /// attributes that changed.
    fn forget_removed(&mut self, before: BTreeSet<String>) {
        let after = self.categorizable_keys();
        let removed: BTreeSet<&String> = before.difference(&after).collect();
        if removed.is_empty() {
            return;
        }
        let monitor = &mut self.monitor;
        self.tasks.for_each_mut(|task| {
            let count = task.prerequisites.len();
            task.prerequisites.retain(|id| !removed.contains(id));
            if task.prerequisites.len() != count {
                monitor.mark_changed(ObjectKind::Task, &task.base.id, ["prerequisites"]);
            }
        });
        self.categories.for_each_mut(|category| {
            let count = category.categorizables.len();
            category.categorizables.retain(|id| !removed.contains(id));
            if category.categorizables.len() != count {
                monitor.mark_changed(ObjectKind::Category, &category.base.id, ["categorizables"]);
            }
        });
    }

    pub fn add_task(&mut self, task: Task, parent: Option<&str>) -> Result<()> {
        add_to(&mut self.tasks, &mut self.monitor, task, parent)?;
        self.relink();
        self.edited();
        Ok(())
    }

    pub fn add_category(&mut self, category: Category, parent: Option<&str>) -> Result<()> {
        add_to(&mut self.categories, &mut self.monitor, category, parent)?;
        self.relink();
        self.edited();
        Ok(())
    }

    pub fn add_note(&mut self, note: Note, parent: Option<&str>) -> Result<()> {
        add_to(&mut self.notes, &mut self.monitor, note, parent)?;
        self.relink();
        self.edited();
        Ok(())
    }

    /// Remove a task and its subtree. Prerequisites and category
    /// memberships pointing at them are dropped.
    pub fn remove_task(&mut self, id: &str) -> Result<Task> {
        let before = self.categorizable_keys();
        let task = remove_from(&mut self.tasks, &mut self.monitor, id)?;
        self.forget_removed(before);
        self.relink();
        self.edited();
        Ok(task)
    }

    pub fn remove_category(&mut self, id: &str) -> Result<Category> {
        let before = self.categorizable_keys();
        let category = remove_from(&mut self.categories, &mut self.monitor, id)?;
        self.forget_removed(before);
        self.relink();
        self.edited();
        Ok(category)
    }

    pub fn remove_note(&mut self, id: &str) -> Result<Note> {
        let before = self.categorizable_keys();
        let note = remove_from(&mut self.notes, &mut self.monitor, id)?;
        self.forget_removed(before);
        self.relink();
        self.edited();
        Ok(note)
    }

    /// Edit a task in place. Returns the attributes that changed.
    pub fn modify_task(
        &mut self,
        id: &str,
        edit: impl FnOnce(&mut Task),
    ) -> Result<BTreeSet<String>> {
        let changed = modify_in(&mut self.tasks, &mut self.monitor, id, edit)?;
        if !changed.is_empty() {
            self.edited();
        }
        Ok(changed)
    }

    pub fn modify_category(
        &mut self,
        id: &str,
        edit: impl FnOnce(&mut Category),
    ) -> Result<BTreeSet<String>> {
        let changed = modify_in(&mut self.categories, &mut self.monitor, id, edit)?;
        if changed.contains("categorizables") {
            self.relink();
        }
        if !changed.is_empty() {
            self.edited();
        }
        Ok(changed)
    }

    pub fn modify_note(
        &mut self,
        id: &str,
        edit: impl FnOnce(&mut Note),
    ) -> Result<BTreeSet<String>> {
        let changed = modify_in(&mut self.notes, &mut self.monitor, id, edit)?;
        if !changed.is_empty() {
            self.edited();
        }
        Ok(changed)
    }

    /// Flag a task and its subtree as deleted without removing them, so
    /// the deletion reaches a sync peer first.
    pub fn mark_task_deleted(&mut self, id: &str) -> Result<Vec<String>> {
        let marked = mark_deleted_in(&mut self.tasks, &mut self.monitor, id)?;
        self.relink();
        if !marked.is_empty() {
            self.edited();
        }
        Ok(marked)
    }

    pub fn mark_category_deleted(&mut self, id: &str) -> Result<Vec<String>> {
        let marked = mark_deleted_in(&mut self.categories, &mut self.monitor, id)?;
        if !marked.is_empty() {
            self.edited();
        }
        Ok(marked)
    }

    pub fn mark_note_deleted(&mut self, id: &str) -> Result<Vec<String>> {
        let marked = mark_deleted_in(&mut self.notes, &mut self.monitor, id)?;
        if !marked.is_empty() {
            self.edited();
        }
        Ok(marked)
    }

    /// Put a task, note or attachment in a category. Returns false when it
    /// already was.
    pub fn link_category(&mut self, category_id: &str, member: &str) -> Result<bool> {
        if !self.categories.contains(category_id) {
            return Err(not_found(ObjectKind::Category, category_id));
        }
        if !self.categorizable_keys().contains(member) {
            return Err(Error::NotFound(format!("categorizable {}", member)));
        }
        let linked = self
            .categories
            .get_mut(category_id)
            .is_some_and(|c| c.categorizables.insert(member.to_string()));
        if linked {
            self.monitor
                .mark_changed(ObjectKind::Category, category_id, ["categorizables"]);
            self.relink();
            self.edited();
        }
        Ok(linked)
    }

    pub fn unlink_category(&mut self, category_id: &str, member: &str) -> Result<bool> {
        let category = self
            .categories
            .get_mut(category_id)
            .ok_or_else(|| not_found(ObjectKind::Category, category_id))?;
        let unlinked = category.categorizables.remove(member);
        if unlinked {
            self.monitor
                .mark_changed(ObjectKind::Category, category_id, ["categorizables"]);
            self.relink();
            self.edited();
        }
        Ok(unlinked)
    }

    /// Replace the prerequisites of a task and rebuild dependencies.
    pub fn set_prerequisites<I, S>(
        &mut self,
        task_id: &str,
        prerequisites: I,
    ) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prerequisites: BTreeSet<String> = prerequisites.into_iter().map(Into::into).collect();
        if prerequisites.contains(task_id) {
            return Err(Error::InvalidInput(format!(
                "task {} cannot be its own prerequisite",
                task_id
            )));
        }
        if let Some(unknown) = prerequisites.iter().find(|id| !self.tasks.contains(id)) {
            return Err(not_found(ObjectKind::Task, unknown));
        }
        let changed = modify_in(&mut self.tasks, &mut self.monitor, task_id, |task| {
            task.prerequisites = prerequisites
        })?;
        if !changed.is_empty() {
            self.relink();
            self.edited();
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestEnv;
    use std::sync::{Arc, Mutex};

    fn recorder(doc: &mut Document) -> Arc<Mutex<Vec<DocumentEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        doc.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    fn saved_file(env: &TestEnv, name: &str, tasks: &[(&str, &str)]) -> PathBuf {
        let path = env.file(name);
        let mut doc = env.document();
        doc.load(&path, LoadOptions::default()).unwrap();
        for (id, subject) in tasks {
            doc.add_task(Task::with_id(*id, *subject), None).unwrap();
        }
        doc.save().unwrap();
        doc.close().unwrap();
        path
    }

    #[test]
    fn test_new_document_is_closed_and_clean() {
        let env = TestEnv::new();
        let doc = env.document();
        assert_eq!(doc.mode(), Mode::Closed);
        assert!(!doc.is_dirty());
        assert!(doc.is_empty());
        assert!(doc.filename().is_none());
        assert!(doc.changes().contains_key(doc.device_guid()));
    }

    #[test]
    fn test_load_missing_file_starts_empty() {
        let env = TestEnv::new();
        let mut doc = env.document();
        let path = env.file("new.tsk");

        let report = doc.load(&path, LoadOptions::default()).unwrap();

        assert!(report.created);
        assert_eq!(report.version, xml::CURRENT_VERSION);
        assert_eq!(doc.mode(), Mode::Idle);
        assert_eq!(doc.filename(), Some(path.as_path()));
        assert!(!path.exists());
        assert!(!delta::delta_path_for(&path).exists());
    }

    #[test]
    fn test_save_without_filename_fails() {
        let env = TestEnv::new();
        let mut doc = env.document();
        doc.add_task(Task::with_id("t1", "Orphan"), None).unwrap();
        assert!(matches!(doc.save(), Err(Error::NoFilename)));
        assert!(doc.is_dirty());
    }

    #[test]
    fn test_save_and_reload() {
        let env = TestEnv::new();
        let path = env.file("work.tsk");
        let mut doc = env.document();
        doc.load(&path, LoadOptions::default()).unwrap();
        doc.add_task(Task::with_id("t1", "Write report"), None).unwrap();
        doc.add_task(Task::with_id("t2", "Outline"), Some("t1")).unwrap();
        doc.add_category(Category::with_id("c1", "Work"), None).unwrap();
        doc.link_category("c1", "t2").unwrap();
        let guid = doc.guid().to_string();
        doc.save().unwrap();
        assert!(!doc.is_dirty());
        assert!(path.exists());
        assert!(delta::delta_path_for(&path).exists());
        assert!(!lock::lock_path_for(&path).exists());

        let mut reloaded = env.document();
        reloaded.load(&path, LoadOptions::default()).unwrap();
        assert_eq!(reloaded.guid(), guid);
        assert_eq!(reloaded.tasks().len(), 2);
        assert_eq!(reloaded.tasks().parent_of("t2").unwrap().base.id, "t1");
        assert!(reloaded.tasks().get("t2").unwrap().categories.contains("c1"));
        assert!(reloaded.last_report().issues.is_empty());
    }

    #[test]
    fn test_unchanged_save_leaves_file_alone() {
        let env = TestEnv::new();
        let path = saved_file(&env, "work.tsk", &[("t1", "One")]);
        let before = fs::read(&path).unwrap();

        let mut doc = env.document();
        doc.load(&path, LoadOptions::default()).unwrap();
        let report = doc.save().unwrap();

        assert!(report.is_empty());
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_dirty_events() {
        let env = TestEnv::new();
        let path = env.file("work.tsk");
        let mut doc = env.document();
        doc.load(&path, LoadOptions::default()).unwrap();
        let events = recorder(&mut doc);

        doc.add_task(Task::with_id("t1", "One"), None).unwrap();
        doc.add_task(Task::with_id("t2", "Two"), None).unwrap();
        assert_eq!(*events.lock().unwrap(), vec![DocumentEvent::Dirty]);
        assert!(doc.need_save());

        doc.mark_dirty(true);
        doc.save().unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                DocumentEvent::Dirty,
                DocumentEvent::Dirty,
                DocumentEvent::AboutToSave,
                DocumentEvent::Clean,
                DocumentEvent::JustSaved,
            ]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let env = TestEnv::new();
        let mut doc = env.document();
        let events = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&events);
        let id = doc.subscribe(move |_| *sink.lock().unwrap() += 1);
        doc.mark_dirty(true);
        assert!(doc.unsubscribe(id));
        doc.mark_dirty(true);
        assert_eq!(*events.lock().unwrap(), 1);
        assert!(!doc.unsubscribe(id));
    }

    #[test]
    fn test_edits_during_sync_do_not_mark_dirty() {
        let env = TestEnv::new();
        let mut doc = env.document();
        doc.begin_sync();
        doc.add_task(Task::with_id("t1", "Synced"), None).unwrap();
        assert!(!doc.is_dirty());
        assert!(!doc.need_save());
        doc.end_sync();
        assert!(doc.is_dirty());
    }

    #[test]
    fn test_two_devices_merge_through_delta() {
        let env = TestEnv::new();
        let path = saved_file(&env, "shared.tsk", &[("t1", "Original")]);

        let mut laptop = env.document();
        laptop.load(&path, LoadOptions::default()).unwrap();
        let mut desktop = env.document();
        desktop.load(&path, LoadOptions::default()).unwrap();

        laptop
            .modify_task("t1", |t| t.base.subject = "Renamed on laptop".into())
            .unwrap();
        laptop.save().unwrap();

        desktop.add_task(Task::with_id("t2", "Added on desktop"), None).unwrap();
        let report = desktop.save().unwrap();

        assert!(report.updated["t1"].contains("subject"));
        assert_eq!(
            desktop.tasks().get("t1").unwrap().base.subject,
            "Renamed on laptop"
        );

        let mut fresh = env.document();
        fresh.load(&path, LoadOptions::default()).unwrap();
        assert_eq!(fresh.tasks().get("t1").unwrap().base.subject, "Renamed on laptop");
        assert!(fresh.tasks().contains("t2"));

        // The laptop picks up the desktop's task on its next merge
        let report = laptop.merge_disk_changes().unwrap();
        assert_eq!(report.added, vec!["t2".to_string()]);
        assert!(laptop.tasks().contains("t2"));
    }

    #[test]
    fn test_remote_removal_is_applied() {
        let env = TestEnv::new();
        let path = saved_file(&env, "shared.tsk", &[("t1", "Keep"), ("t2", "Drop")]);

        let mut a = env.document();
        a.load(&path, LoadOptions::default()).unwrap();
        let mut b = env.document();
        b.load(&path, LoadOptions::default()).unwrap();

        a.remove_task("t2").unwrap();
        a.save().unwrap();

        let report = b.merge_disk_changes().unwrap();
        assert_eq!(report.removed, vec!["t2".to_string()]);
        assert!(!b.tasks().contains("t2"));
    }

    #[test]
    fn test_save_under_foreign_lock_leaves_files_untouched() {
        let env = TestEnv::new();
        let path = saved_file(&env, "locked.tsk", &[("t1", "One")]);
        let mut doc = env.document();
        doc.load(&path, LoadOptions::default()).unwrap();
        doc.add_task(Task::with_id("t2", "Two"), None).unwrap();

        let before = fs::read(&path).unwrap();
        let delta_before = fs::read(delta::delta_path_for(&path)).unwrap();
        let mut foreign = FileLock::for_document(&path);
        foreign.acquire(Duration::from_millis(100)).unwrap();

        let err = doc.save().unwrap_err();
        assert!(err.is_retryable());
        assert!(doc.is_dirty());
        assert_eq!(doc.mode(), Mode::Idle);
        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(fs::read(delta::delta_path_for(&path)).unwrap(), delta_before);

        foreign.release().unwrap();
        doc.save().unwrap();
        assert!(!doc.is_dirty());
    }

    #[test]
    fn test_load_can_break_a_stale_lock() {
        let env = TestEnv::new();
        let path = saved_file(&env, "stale.tsk", &[("t1", "One")]);
        let mut stale = FileLock::for_document(&path);
        stale.acquire(Duration::from_millis(100)).unwrap();

        let mut doc = env.document();
        assert!(doc.load(&path, LoadOptions::default()).is_err());
        assert!(doc.filename().is_none());

        let options = LoadOptions {
            break_lock: true,
            ..LoadOptions::default()
        };
        doc.load(&path, options).unwrap();
        assert!(doc.tasks().contains("t1"));
    }

    #[test]
    fn test_explicit_lock_is_reused() {
        let env = TestEnv::new();
        let path = env.file("held.tsk");
        let mut doc = env.document();
        doc.load(&path, LoadOptions::default()).unwrap();
        doc.acquire_lock().unwrap();
        assert!(doc.is_locked_by_me());

        doc.add_task(Task::with_id("t1", "One"), None).unwrap();
        doc.save().unwrap();
        assert!(doc.is_locked_by_me());

        doc.release_lock().unwrap();
        assert!(!doc.is_locked_by_me());
        assert!(!lock::lock_path_for(&path).exists());
    }

    #[test]
    fn test_close_removes_own_ledger() {
        let env = TestEnv::new();
        let path = saved_file(&env, "work.tsk", &[("t1", "One")]);
        let mut doc = env.document();
        doc.load(&path, LoadOptions::default()).unwrap();
        let device = doc.device_guid().to_string();
        assert!(delta::read_file(&delta::delta_path_for(&path)).contains_key(&device));
        let guid = doc.guid().to_string();

        doc.close().unwrap();

        assert!(!delta::read_file(&delta::delta_path_for(&path)).contains_key(&device));
        assert_eq!(doc.mode(), Mode::Closed);
        assert!(doc.is_empty());
        assert!(!doc.is_dirty());
        assert_ne!(doc.guid(), guid);
        assert_eq!(doc.last_filename(), Some(path.as_path()));
    }

    #[test]
    fn test_save_as_writes_new_file() {
        let env = TestEnv::new();
        let path = saved_file(&env, "a.tsk", &[("t1", "One")]);
        let target = env.file("b.tsk");
        fs::write(&target, "stale contents").unwrap();

        let mut doc = env.document();
        doc.load(&path, LoadOptions::default()).unwrap();
        let events = recorder(&mut doc);
        doc.save_as(&target).unwrap();

        assert_eq!(doc.filename(), Some(target.as_path()));
        assert_eq!(
            events.lock().unwrap()[0],
            DocumentEvent::FilenameChanged(Some(target.clone()))
        );
        let mut copy = env.document();
        copy.load(&target, LoadOptions::default()).unwrap();
        assert!(copy.tasks().contains("t1"));
    }

    #[test]
    fn test_save_makes_backup_of_previous_version() {
        let env = TestEnv::new();
        let path = saved_file(&env, "work.tsk", &[("t1", "One")]);
        let mut doc = env.document();
        doc.load(&path, LoadOptions::default()).unwrap();
        doc.add_task(Task::with_id("t2", "Two"), None).unwrap();
        doc.save().unwrap();

        let store = doc.settings().backups.clone().unwrap();
        assert!(!store.list(&path).unwrap().is_empty());
    }

    #[test]
    fn test_import_replaces_same_ids_and_keeps_memberships() {
        let env = TestEnv::new();
        let other = saved_file(&env, "other.tsk", &[("t1", "Imported"), ("t9", "New")]);

        let mut doc = env.document();
        doc.load(&env.file("main.tsk"), LoadOptions::default()).unwrap();
        doc.add_task(Task::with_id("t1", "Local"), None).unwrap();
        doc.add_category(Category::with_id("c1", "Home"), None).unwrap();
        doc.link_category("c1", "t1").unwrap();
        doc.save().unwrap();

        let events = recorder(&mut doc);
        let report = doc.import(&other).unwrap();

        assert_eq!(report.added, 2);
        assert_eq!(report.replaced, vec!["t1".to_string()]);
        assert_eq!(doc.tasks().get("t1").unwrap().base.subject, "Imported");
        assert!(doc.tasks().get("t1").unwrap().categories.contains("c1"));
        assert!(doc.monitor().has_change("t9", crate::changes::ADDED));
        assert_eq!(*events.lock().unwrap(), vec![DocumentEvent::Dirty]);
    }

    #[test]
    fn test_modify_records_changed_attributes() {
        let env = TestEnv::new();
        let mut doc = env.document();
        let mut task = Task::with_id("t1", "One");
        task.base.status = SyncStatus::None;
        doc.add_task(task, None).unwrap();

        let changed = doc
            .modify_task("t1", |t| {
                t.base.subject = "Uno".into();
                t.priority = 3;
            })
            .unwrap();

        assert!(changed.contains("subject"));
        assert!(changed.contains("priority"));
        assert!(doc.monitor().has_change("t1", "subject"));
        let task = doc.tasks().get("t1").unwrap();
        assert_eq!(task.base.status, SyncStatus::Changed);
        assert!(task.base.modification.is_some());

        assert!(doc.modify_task("t1", |_| {}).unwrap().is_empty());
        assert!(doc.modify_task("missing", |_| {}).is_err());
        assert!(doc.modify_task("t1", |t| t.base.id = "other".into()).is_err());
        assert!(doc.tasks().contains("t1"));
    }

    #[test]
    fn test_add_rejects_duplicates_and_unknown_parents() {
        let env = TestEnv::new();
        let mut doc = env.document();
        doc.add_task(Task::with_id("t1", "One"), None).unwrap();
        assert!(matches!(
            doc.add_task(Task::with_id("t1", "Again"), None),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            doc.add_task(Task::with_id("t2", "Child"), Some("nope")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_drops_references() {
        let env = TestEnv::new();
        let mut doc = env.document();
        doc.add_task(Task::with_id("t1", "First"), None).unwrap();
        doc.add_task(Task::with_id("t2", "Second"), None).unwrap();
        doc.add_category(Category::with_id("c1", "Work"), None).unwrap();
        doc.link_category("c1", "t1").unwrap();
        doc.set_prerequisites("t2", ["t1"]).unwrap();
        assert!(doc.tasks().get("t1").unwrap().dependencies.contains("t2"));

        doc.remove_task("t1").unwrap();

        assert!(doc.tasks().get("t2").unwrap().prerequisites.is_empty());
        assert!(doc.categories().get("c1").unwrap().categorizables.is_empty());
        assert!(doc.monitor().is_removed("t1"));
        assert!(doc.monitor().has_change("c1", "categorizables"));
        assert!(doc.monitor().has_change("t2", "prerequisites"));
    }

    #[test]
    fn test_set_prerequisites_validates_ids() {
        let env = TestEnv::new();
        let mut doc = env.document();
        doc.add_task(Task::with_id("t1", "First"), None).unwrap();
        assert!(doc.set_prerequisites("t1", ["t1"]).is_err());
        assert!(doc.set_prerequisites("t1", ["ghost"]).is_err());
    }

    #[test]
    fn test_mark_deleted_covers_subtree() {
        let env = TestEnv::new();
        let mut doc = env.document();
        doc.add_note(Note::with_id("n1", "Parent"), None).unwrap();
        doc.add_note(Note::with_id("n2", "Child"), Some("n1")).unwrap();

        let marked = doc.mark_note_deleted("n1").unwrap();

        assert_eq!(marked, vec!["n1".to_string(), "n2".to_string()]);
        assert!(doc.notes().get("n2").unwrap().is_deleted());
        assert!(doc.monitor().has_change("n2", "status"));
    }

    #[test]
    fn test_link_category_checks_members() {
        let env = TestEnv::new();
        let mut doc = env.document();
        doc.add_category(Category::with_id("c1", "Work"), None).unwrap();
        doc.add_note(Note::with_id("n1", "Memo"), None).unwrap();

        assert!(doc.link_category("c1", "n1").unwrap());
        assert!(!doc.link_category("c1", "n1").unwrap());
        assert!(doc.notes().get("n1").unwrap().categories.contains("c1"));
        assert!(doc.link_category("c1", "ghost").is_err());
        assert!(doc.link_category("ghost", "n1").is_err());

        assert!(doc.unlink_category("c1", "n1").unwrap());
        assert!(doc.notes().get("n1").unwrap().categories.is_empty());
    }

    #[test]
    fn test_contains_sees_owned_objects() {
        let env = TestEnv::new();
        let mut doc = env.document();
        let mut task = Task::with_id("t1", "Owner");
        task.notes.add(Note::with_id("n-owned", "Inside"));
        doc.add_task(task, None).unwrap();
        assert!(doc.contains("t1"));
        assert!(doc.contains("n-owned"));
        assert!(!doc.contains("ghost"));
    }

    #[test]
    fn test_poll_detects_foreign_write() {
        let env = TestEnv::new();
        let path = saved_file(&env, "work.tsk", &[("t1", "One")]);
        let mut doc = env.document();
        doc.load(&path, LoadOptions::default()).unwrap();
        assert!(!doc.poll_disk_changes());

        let events = recorder(&mut doc);
        let mut other = env.document();
        other.load(&path, LoadOptions::default()).unwrap();
        other.add_task(Task::with_id("t2", "Elsewhere"), None).unwrap();
        other.save().unwrap();

        assert!(doc.poll_disk_changes());
        assert!(doc.changed_on_disk());
        assert_eq!(*events.lock().unwrap(), vec![DocumentEvent::ChangedOnDisk]);

        doc.merge_disk_changes().unwrap();
        assert!(!doc.changed_on_disk());
        assert!(doc.tasks().contains("t2"));
    }

    #[test]
    fn test_clear_records_removals() {
        let env = TestEnv::new();
        let mut doc = env.document();
        doc.add_task(Task::with_id("t1", "One"), None).unwrap();
        let guid = doc.guid().to_string();
        let events = recorder(&mut doc);

        doc.clear(false);

        assert!(doc.is_empty());
        assert_eq!(doc.guid(), guid);
        assert!(doc.monitor().is_removed("t1"));
        let events = events.lock().unwrap();
        assert_eq!(events.first(), Some(&DocumentEvent::AboutToClear));
        assert_eq!(events.last(), Some(&DocumentEvent::JustCleared));
    }
}
