//! Attachment types and data structures.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use vellum_shared::{AttachmentSettings, SaveTriggerSetting};

use crate::storage::PathTemplate;

/// Name of a variant of an attachment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Style(String);

impl Style {
    /// Name of the full-resolution entry.
    pub const ORIGINAL: &'static str = "original";

    /// Create a style from its name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The `original` style.
    #[must_use]
    pub fn original() -> Self {
        Self(Self::ORIGINAL.to_string())
    }

    /// Whether this is the `original` style.
    #[must_use]
    pub fn is_original(&self) -> bool {
        self.0 == Self::ORIGINAL
    }

    /// Style name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Style {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Style {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// File content plus the metadata stores need to write it.
///
/// The bytes are reference counted and immutable, so cloning a blob hands
/// each store an independent handle that no other store can alter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob {
    /// Raw content.
    pub data: Bytes,
    /// MIME type, if known.
    pub content_type: Option<String>,
    /// Name of the uploaded file, if known.
    pub original_filename: Option<String>,
}

impl Blob {
    /// Create a blob from raw content.
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            content_type: None,
            original_filename: None,
        }
    }

    /// Set the MIME type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the uploaded file name.
    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.original_filename = Some(filename.into());
        self
    }

    /// Content length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the content is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Pending writes keyed by style.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteQueue(BTreeMap<Style, Blob>);

impl WriteQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `blob` for `style`, replacing any earlier entry.
    pub fn insert(&mut self, style: Style, blob: Blob) -> Option<Blob> {
        self.0.insert(style, blob)
    }

    /// Entry for `style`.
    #[must_use]
    pub fn get(&self, style: &Style) -> Option<&Blob> {
        self.0.get(style)
    }

    /// Remove the entry for `style`.
    pub fn remove(&mut self, style: &Style) -> Option<Blob> {
        self.0.remove(style)
    }

    /// Whether an entry exists for `style`.
    #[must_use]
    pub fn contains(&self, style: &Style) -> bool {
        self.0.contains_key(style)
    }

    /// A queue holding only the `original` entry, if any.
    #[must_use]
    pub fn original_only(&self) -> Self {
        let original = Style::original();
        let mut queue = Self::new();
        if let Some(blob) = self.0.get(&original) {
            queue.insert(original, blob.clone());
        }
        queue
    }

    /// Drop empty entries, always keeping `original`.
    pub fn retain_non_empty(&mut self) {
        self.0
            .retain(|style, blob| style.is_original() || !blob.is_empty());
    }

    /// Styles in the queue, in order.
    pub fn styles(&self) -> impl Iterator<Item = &Style> {
        self.0.keys()
    }

    /// Entries in style order.
    pub fn iter(&self) -> impl Iterator<Item = (&Style, &Blob)> {
        self.0.iter()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl IntoIterator for WriteQueue {
    type Item = (Style, Blob);
    type IntoIter = std::collections::btree_map::IntoIter<Style, Blob>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(Style, Blob)> for WriteQueue {
    fn from_iter<I: IntoIterator<Item = (Style, Blob)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Writes and deletes waiting for the next flush.
#[derive(Debug, Default)]
pub struct PendingQueues {
    /// Content to write, keyed by style.
    pub writes: WriteQueue,
    /// Previously stored paths to remove, in queue order.
    pub deletes: Vec<String>,
}

impl PendingQueues {
    /// Take the write queue, leaving it empty.
    pub fn take_writes(&mut self) -> WriteQueue {
        std::mem::take(&mut self.writes)
    }

    /// Take the delete queue, leaving it empty.
    pub fn take_deletes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.deletes)
    }
}

/// Lifecycle flags of the owning record.
///
/// Only read or written inside the attachment's status gate. The saving
/// flag lives in a watch channel so waiters are woken when it clears.
#[derive(Debug)]
pub struct LifecycleStatus {
    saving: watch::Sender<bool>,
    dirty: AtomicBool,
    new_record: AtomicBool,
}

impl LifecycleStatus {
    /// Status of a record that is new or already persisted.
    #[must_use]
    pub fn new(new_record: bool) -> Self {
        Self {
            saving: watch::Sender::new(false),
            dirty: AtomicBool::new(false),
            new_record: AtomicBool::new(new_record),
        }
    }

    /// Whether a save is in progress.
    #[must_use]
    pub fn is_saving(&self) -> bool {
        *self.saving.borrow()
    }

    /// Set the saving flag and wake waiters.
    pub fn set_saving(&self, saving: bool) {
        self.saving.send_replace(saving);
    }

    /// Whether attachment changes await a save.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Set the dirty flag.
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    /// Whether the record has never been persisted.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.new_record.load(Ordering::SeqCst)
    }

    /// Set the new-record flag.
    pub fn set_new(&self, new_record: bool) {
        self.new_record.store(new_record, Ordering::SeqCst);
    }

    /// New or dirty: field changes can stay in memory until the next save.
    #[must_use]
    pub fn has_unsaved_changes(&self) -> bool {
        self.is_new() || self.is_dirty()
    }

    /// Receiver that observes the saving flag.
    #[must_use]
    pub fn subscribe_saving(&self) -> watch::Receiver<bool> {
        self.saving.subscribe()
    }
}

/// How a processing worker triggers the save once its style is ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SaveTrigger {
    /// Save and finish on the worker itself.
    #[default]
    Inline,
    /// Save and finish on a spawned task.
    Deferred,
}

impl From<SaveTriggerSetting> for SaveTrigger {
    fn from(setting: SaveTriggerSetting) -> Self {
        match setting {
            SaveTriggerSetting::Inline => Self::Inline,
            SaveTriggerSetting::Deferred => Self::Deferred,
        }
    }
}

/// A style and the processor chain that produces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleDefinition {
    /// Style name.
    pub style: Style,
    /// Processor names, applied in order.
    pub processors: Vec<String>,
    /// Options passed to every processor of the chain.
    pub options: BTreeMap<String, String>,
}

/// Static description of an attachment.
#[derive(Debug, Clone)]
pub struct AttachmentDefinition {
    /// Attachment name, used by `:attachment`.
    pub name: String,
    /// Owning record class, used by `:class`.
    pub class: String,
    /// Path template shared by every store.
    pub path: PathTemplate,
    /// Styles generated from the original.
    pub styles: Vec<StyleDefinition>,
    /// Collect unsupported-input errors.
    pub whiny: bool,
    /// Retry budget for durable updates on a row that is not visible yet.
    pub ensure_created_timeout: Duration,
    /// How workers trigger the save.
    pub save_trigger: SaveTrigger,
}

impl AttachmentDefinition {
    /// Default retry budget.
    pub const DEFAULT_ENSURE_CREATED_TIMEOUT: Duration = Duration::from_secs(5);

    /// Definition with default options and no styles.
    #[must_use]
    pub fn new(name: impl Into<String>, class: impl Into<String>, path: &str) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            path: PathTemplate::new(path),
            styles: Vec::new(),
            whiny: true,
            ensure_created_timeout: Self::DEFAULT_ENSURE_CREATED_TIMEOUT,
            save_trigger: SaveTrigger::Inline,
        }
    }

    /// Build from loaded settings.
    #[must_use]
    pub fn from_settings(settings: &AttachmentSettings) -> Self {
        let styles = settings
            .styles
            .iter()
            .map(|(name, style)| StyleDefinition {
                style: Style::new(name.as_str()),
                processors: style.processors.clone(),
                options: style.options.clone(),
            })
            .collect();

        Self {
            name: settings.name.clone(),
            class: settings.class.clone(),
            path: PathTemplate::new(&settings.path),
            styles,
            whiny: settings.whiny,
            ensure_created_timeout: Duration::from_secs(settings.ensure_created_timeout_secs),
            save_trigger: settings.save_trigger.into(),
        }
    }

    /// Add a style.
    #[must_use]
    pub fn with_style(mut self, style: &str, processors: &[&str]) -> Self {
        self.styles.push(StyleDefinition {
            style: Style::new(style),
            processors: processors.iter().map(ToString::to_string).collect(),
            options: BTreeMap::new(),
        });
        self
    }

    /// Set the save trigger.
    #[must_use]
    pub fn with_save_trigger(mut self, trigger: SaveTrigger) -> Self {
        self.save_trigger = trigger;
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub fn with_ensure_created_timeout(mut self, timeout: Duration) -> Self {
        self.ensure_created_timeout = timeout;
        self
    }

    /// Set whether unsupported-input errors are collected.
    #[must_use]
    pub fn with_whiny(mut self, whiny: bool) -> Self {
        self.whiny = whiny;
        self
    }

    /// Look up a style definition.
    #[must_use]
    pub fn style(&self, style: &Style) -> Option<&StyleDefinition> {
        self.styles.iter().find(|s| &s.style == style)
    }
}
