//! Attachment state engine.
//!
//! Four locks guard four concerns:
//!
//! - **save lock**: one save at a time; not re-entrant.
//! - **processor-info lock**: the [`ProcessorTracker`]; not re-entrant.
//! - **attributes lock**: pending writes and deletes; not re-entrant.
//! - **status lock**: saving, dirty and new flags; re-entrant.
//!
//! The save lock may enclose any of the other three. The other three are
//! never held while acquiring one another.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, error, info, warn};
use vellum_shared::AttachmentSettings;

use super::error::AttachmentError;
use super::lock::{ContextLock, ContextMutex, LockError, ReentrantGate};
use super::record::{AttachmentRecord, FileMetadata, ProcessingUpdate, RecordError, ensure_is_created};
use super::tracker::{ProcessorTracker, Removal};
use super::types::{AttachmentDefinition, Blob, LifecycleStatus, PendingQueues, Style};
use crate::storage::{AttachmentLocator, AttachmentStore, PathResolver, StoreRegistry, build_store};

const DEFAULT_FILE_NAME: &str = "data";

/// An attachment of one loaded record.
pub struct Attachment {
    definition: AttachmentDefinition,
    record: Arc<dyn AttachmentRecord>,
    store: Arc<dyn AttachmentStore>,
    save_lock: ContextLock<()>,
    processor_info: ContextLock<ProcessorTracker>,
    attributes: ContextMutex<PendingQueues>,
    status_gate: ReentrantGate,
    status: LifecycleStatus,
    processing_errors: Mutex<Vec<String>>,
}

/// Raises the saving flag and lowers it again on every exit path.
///
/// A nested guard leaves the flag to the outer one.
struct SavingFlag<'a> {
    attachment: &'a Attachment,
    raised: bool,
}

impl<'a> SavingFlag<'a> {
    fn raise(attachment: &'a Attachment) -> Self {
        let raised = attachment.with_status_lock(|status| {
            let was_saving = status.is_saving();
            status.set_saving(true);
            !was_saving
        });
        Self { attachment, raised }
    }
}

impl Drop for SavingFlag<'_> {
    fn drop(&mut self) {
        if self.raised {
            self.attachment
                .with_status_lock(|status| status.set_saving(false));
        }
    }
}

impl Attachment {
    /// Create an attachment for `record`, stored in `store`.
    ///
    /// Styles already marked processed on the record seed the tracker.
    #[must_use]
    pub fn new(
        definition: AttachmentDefinition,
        record: Arc<dyn AttachmentRecord>,
        store: Arc<dyn AttachmentStore>,
    ) -> Self {
        let mut tracker = ProcessorTracker::new();
        tracker.seed_processed(record.processed_styles().into_iter().map(Style::from));

        Self {
            status: LifecycleStatus::new(record.is_new_record()),
            definition,
            record,
            store,
            save_lock: ContextLock::new("save", ()),
            processor_info: ContextLock::new("processor-info", tracker),
            attributes: ContextMutex::new("attributes", PendingQueues::default()),
            status_gate: ReentrantGate::new("status"),
            processing_errors: Mutex::new(Vec::new()),
        }
    }

    /// Build an attachment and its stores from settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a store definition is invalid.
    pub fn from_settings(
        settings: &AttachmentSettings,
        record: Arc<dyn AttachmentRecord>,
        registry: &StoreRegistry,
    ) -> Result<Self, AttachmentError> {
        let definition = AttachmentDefinition::from_settings(settings);
        let locator: Arc<dyn PathResolver> = Arc::new(AttachmentLocator::new(
            definition.class.clone(),
            definition.name.clone(),
            definition.path.clone(),
            Arc::clone(&record),
        ));
        let store = build_store(settings, registry, &locator)?;
        Ok(Self::new(definition, record, store))
    }

    /// Static description of the attachment.
    #[must_use]
    pub fn definition(&self) -> &AttachmentDefinition {
        &self.definition
    }

    /// The owning record.
    #[must_use]
    pub fn record(&self) -> &Arc<dyn AttachmentRecord> {
        &self.record
    }

    /// The attachment's storage.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AttachmentStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Run `f` holding the save lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Reentrant`] if the calling context already holds
    /// the save lock.
    pub async fn with_save_lock<F, Fut, R>(&self, f: F) -> Result<R, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let _guard = self.save_lock.lock().await?;
        Ok(f().await)
    }

    /// Run `f` with the pending queues.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Reentrant`] when nested inside another
    /// attributes-lock section.
    pub fn with_attributes_lock<R>(
        &self,
        f: impl FnOnce(&mut PendingQueues) -> R,
    ) -> Result<R, LockError> {
        self.attributes.with(f)
    }

    /// Run `f` with the lifecycle flags. May be nested.
    pub fn with_status_lock<R>(&self, f: impl FnOnce(&LifecycleStatus) -> R) -> R {
        self.status_gate.with(|| f(&self.status))
    }

    /// Run `fut` under the save lock, unless this context already holds it.
    async fn under_save_lock<F, R>(&self, fut: F) -> Result<R, AttachmentError>
    where
        F: Future<Output = Result<R, AttachmentError>>,
    {
        if self.save_lock.is_held_by_current() {
            return fut.await;
        }
        let _guard = self.save_lock.lock().await?;
        fut.await
    }

    // ------------------------------------------------------------------
    // Lifecycle flags
    // ------------------------------------------------------------------

    /// Whether a save is in progress.
    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.with_status_lock(LifecycleStatus::is_saving)
    }

    /// Whether changes await a save.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.with_status_lock(LifecycleStatus::is_dirty)
    }

    /// Whether the record has never been persisted.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.with_status_lock(LifecycleStatus::is_new)
    }

    /// Wait until no save is in progress.
    ///
    /// Returns at once when the calling context runs the save itself.
    pub async fn wait_until_saved(&self) {
        if self.save_lock.is_held_by_current() {
            return;
        }
        let mut saving = self.status.subscribe_saving();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = saving.wait_for(|saving| !*saving).await;
    }

    /// Clear the saving and dirty flags once the host transaction ended.
    pub fn mark_saved(&self) {
        self.with_status_lock(|status| {
            status.set_dirty(false);
            status.set_new(self.record.is_new_record());
            status.set_saving(false);
        });
    }

    // ------------------------------------------------------------------
    // Processing state
    // ------------------------------------------------------------------

    /// Mark `style` as being processed and return the styles in flight.
    ///
    /// The first style of a drain cycle sets the record's `processing`
    /// column: in memory when the record has unsaved changes, otherwise with
    /// a row-locked durable update retried until the row is visible.
    ///
    /// # Errors
    ///
    /// Returns a lock error on re-entry, or the record error once the retry
    /// budget is exhausted. The style is not left in flight on error.
    pub async fn processing(&self, style: &Style) -> Result<Vec<Style>, AttachmentError> {
        self.wait_until_saved().await;
        let unsaved = self.with_status_lock(LifecycleStatus::has_unsaved_changes);

        let mut tracker = self.processor_info.lock().await?;
        if tracker.start(style) {
            let update = tracker.update();
            if unsaved {
                self.record.assign_processing(&update);
            } else if let Err(e) = self.persist_durably(&update, true).await {
                tracker.abandon(style);
                error!(attachment = %self.definition.name, %style, error = %e, "could not flag record as processing");
                return Err(e.into());
            }
            info!(attachment = %self.definition.name, %style, durable = !unsaved, "processing started");
        }
        debug!(attachment = %self.definition.name, %style, "style in flight");
        Ok(tracker.in_flight())
    }

    /// Record `style` as processed. A style that is not in flight is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the drained state cannot be persisted.
    pub async fn finished_processing(&self, style: &Style) -> Result<(), AttachmentError> {
        self.complete_style(style, ProcessorTracker::finish).await
    }

    /// Record `style` as failed. A style that is not in flight is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the drained state cannot be persisted.
    pub async fn failed_processing(&self, style: &Style) -> Result<(), AttachmentError> {
        self.complete_style(style, ProcessorTracker::fail).await
    }

    async fn complete_style(
        &self,
        style: &Style,
        complete: fn(&mut ProcessorTracker, &Style) -> Removal,
    ) -> Result<(), AttachmentError> {
        self.under_save_lock(async {
            let unsaved = self.with_status_lock(LifecycleStatus::has_unsaved_changes);
            let mut tracker = self.processor_info.lock().await?;
            match complete(&mut tracker, style) {
                Removal::NotInFlight => {
                    debug!(attachment = %self.definition.name, %style, "style already completed");
                    Ok(())
                }
                Removal::Removed { drained: false } => Ok(()),
                Removal::Removed { drained: true } => {
                    self.save_processing_info(&tracker, unsaved).await
                }
            }
        })
        .await
    }

    /// Persist the drained state. Runs with the processor-info lock held,
    /// so exactly one caller writes per drain.
    async fn save_processing_info(
        &self,
        tracker: &ProcessorTracker,
        unsaved: bool,
    ) -> Result<(), AttachmentError> {
        let update = tracker.update();
        if unsaved {
            self.record.assign_processing(&update);
        } else {
            self.persist_durably(&update, false).await?;
        }
        info!(
            attachment = %self.definition.name,
            processed = ?update.processed_styles,
            durable = !unsaved,
            "processing drained"
        );
        Ok(())
    }

    async fn persist_durably(&self, update: &ProcessingUpdate, row_lock: bool) -> Result<(), RecordError> {
        let timeout = self.definition.ensure_created_timeout;
        if row_lock {
            ensure_is_created(timeout, || self.record.update_with_row_lock(update)).await
        } else {
            ensure_is_created(timeout, || self.record.update_columns(update)).await
        }
    }

    /// Styles in flight.
    ///
    /// # Errors
    ///
    /// Returns a lock error when called while holding the processor-info lock.
    pub async fn in_flight(&self) -> Result<Vec<Style>, LockError> {
        Ok(self.processor_info.lock().await?.in_flight())
    }

    /// Styles processed so far.
    ///
    /// # Errors
    ///
    /// Returns a lock error when called while holding the processor-info lock.
    pub async fn processed_styles(&self) -> Result<Vec<Style>, LockError> {
        Ok(self.processor_info.lock().await?.processed().to_vec())
    }

    /// Note an unsupported-input failure for display to the user.
    pub fn record_processing_error(&self, message: impl Into<String>) {
        self.processing_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.into());
    }

    /// Unsupported-input failures collected so far.
    #[must_use]
    pub fn processing_errors(&self) -> Vec<String> {
        self.processing_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ------------------------------------------------------------------
    // Content
    // ------------------------------------------------------------------

    /// Assign new content.
    ///
    /// Paths of the current file are queued for deletion, the write queue
    /// is replaced by the new original and the file columns are updated in
    /// memory.
    ///
    /// # Errors
    ///
    /// Returns a lock error when nested inside an attributes-lock section.
    pub fn assign(&self, blob: Blob) -> Result<(), AttachmentError> {
        let old_paths = self.stored_paths();
        let file = FileMetadata {
            file_name: blob
                .original_filename
                .clone()
                .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string()),
            content_type: blob.content_type.clone(),
            file_size: i64::try_from(blob.len()).unwrap_or(i64::MAX),
            updated_at: Utc::now(),
        };

        self.with_attributes_lock(|queues| {
            queues.deletes.extend(old_paths);
            queues.writes.clear();
            queues.writes.insert(Style::original(), blob);
        })?;
        self.record.assign_file(Some(file));
        self.with_status_lock(|status| status.set_dirty(true));
        debug!(attachment = %self.definition.name, "content assigned");
        Ok(())
    }

    /// Remove the content: queue every stored path for deletion and clear
    /// the file columns.
    ///
    /// # Errors
    ///
    /// Returns a lock error when nested inside an attributes-lock section.
    pub fn clear(&self) -> Result<(), AttachmentError> {
        self.queue_all_for_delete()?;
        self.with_attributes_lock(|queues| queues.writes.clear())?;
        self.record.assign_file(None);
        self.with_status_lock(|status| status.set_dirty(true));
        Ok(())
    }

    /// Queue the path of every stored style for deletion.
    ///
    /// # Errors
    ///
    /// Returns a lock error when nested inside an attributes-lock section.
    pub fn queue_all_for_delete(&self) -> Result<(), AttachmentError> {
        let paths = self.stored_paths();
        self.with_attributes_lock(|queues| queues.deletes.extend(paths))?;
        Ok(())
    }

    fn stored_paths(&self) -> Vec<String> {
        if self.record.file().is_none() {
            return Vec::new();
        }
        std::iter::once(Style::original())
            .chain(self.definition.styles.iter().map(|s| s.style.clone()))
            .filter_map(|style| self.store.path(&style))
            .filter(|path| !path.is_empty())
            .collect()
    }

    /// The queued original, if any.
    ///
    /// # Errors
    ///
    /// Returns a lock error when nested inside an attributes-lock section.
    pub fn original_blob(&self) -> Result<Option<Blob>, LockError> {
        self.with_attributes_lock(|queues| queues.writes.get(&Style::original()).cloned())
    }

    /// Queue `blob` as the content of `style`.
    ///
    /// # Errors
    ///
    /// Returns a lock error when nested inside an attributes-lock section.
    pub fn queue_write(&self, style: Style, blob: Blob) -> Result<(), LockError> {
        self.with_attributes_lock(|queues| {
            queues.writes.insert(style, blob);
        })
    }

    /// Remove `style` from the write queue.
    ///
    /// # Errors
    ///
    /// Returns a lock error when nested inside an attributes-lock section.
    pub fn drop_write(&self, style: &Style) -> Result<(), LockError> {
        self.with_attributes_lock(|queues| {
            queues.writes.remove(style);
        })
    }

    /// Storage path of `style`.
    #[must_use]
    pub fn path(&self, style: &Style) -> Option<String> {
        self.store.path(style)
    }

    // ------------------------------------------------------------------
    // Saving
    // ------------------------------------------------------------------

    /// Flush pending deletes and writes to storage.
    ///
    /// Empty variants are dropped first; the original is always kept.
    ///
    /// # Errors
    ///
    /// Returns a lock error if this context already holds the save lock, or
    /// the first critical storage failure.
    pub async fn save(&self) -> Result<(), AttachmentError> {
        let _guard = self.save_lock.lock().await?;
        self.save_locked().await
    }

    async fn save_locked(&self) -> Result<(), AttachmentError> {
        let _saving = SavingFlag::raise(self);
        let written: Vec<Style> = self.with_attributes_lock(|queues| {
            queues.writes.retain_non_empty();
            queues.writes.styles().cloned().collect()
        })?;
        self.drop_overwritten_deletes(&written)?;
        self.flush_deletes().await?;
        self.flush_writes().await?;
        self.with_status_lock(|status| status.set_dirty(false));
        Ok(())
    }

    /// Forget queued deletes of paths that `written` styles will replace.
    ///
    /// Mirrors receive deletes and writes on separate tasks, so a delete of
    /// a path that is also being written could land last.
    fn drop_overwritten_deletes(&self, written: &[Style]) -> Result<(), LockError> {
        let overwritten: Vec<String> = written
            .iter()
            .filter_map(|style| self.store.path(style))
            .collect();
        if overwritten.is_empty() {
            return Ok(());
        }
        self.with_attributes_lock(|queues| {
            queues.deletes.retain(|path| !overwritten.contains(path));
        })
    }

    /// Persist the host record and then the attachment, as one save.
    ///
    /// `host` is the record's own save, including its commit. Processing
    /// workers wait for the whole sequence before touching the queues.
    ///
    /// # Errors
    ///
    /// Returns the host error, a lock error on re-entry, or a storage error.
    pub async fn persist_with<F, T>(&self, host: F) -> Result<T, AttachmentError>
    where
        F: Future<Output = Result<T, RecordError>>,
    {
        let _guard = self.save_lock.lock().await?;
        let _saving = SavingFlag::raise(self);

        let output = host.await?;
        self.with_status_lock(|status| status.set_new(self.record.is_new_record()));
        self.save_locked().await?;
        Ok(output)
    }

    /// Destroy the host record, then delete every stored style.
    ///
    /// If `host` fails nothing is deleted and the queued deletes are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns the host error or a storage error from the main store.
    pub async fn destroy_with<F, T>(&self, host: F) -> Result<T, AttachmentError>
    where
        F: Future<Output = Result<T, RecordError>>,
    {
        self.queue_all_for_delete()?;
        match host.await {
            Ok(output) => {
                self.flush_deletes().await?;
                Ok(output)
            }
            Err(e) => {
                let dropped = self.with_attributes_lock(PendingQueues::take_deletes)?;
                warn!(attachment = %self.definition.name, dropped = dropped.len(), error = %e, "destroy failed, deletes dropped");
                Err(e.into())
            }
        }
    }

    /// Hand the write queue to storage. The queue is emptied first, so it
    /// is cleared whether or not the flush succeeds.
    ///
    /// # Errors
    ///
    /// Returns the first critical storage failure.
    pub async fn flush_writes(&self) -> Result<(), AttachmentError> {
        let queue = self.with_attributes_lock(PendingQueues::take_writes)?;
        if queue.is_empty() {
            return Ok(());
        }
        let styles: Vec<String> = queue.styles().map(ToString::to_string).collect();
        if let Err(e) = self.store.flush_writes(queue).await {
            error!(attachment = %self.definition.name, ?styles, error = %e, "flush writes failed");
            return Err(e.into());
        }
        info!(attachment = %self.definition.name, ?styles, "writes flushed");
        Ok(())
    }

    /// Hand the delete queue to storage.
    ///
    /// # Errors
    ///
    /// Returns the main store's failure.
    pub async fn flush_deletes(&self) -> Result<(), AttachmentError> {
        let mut paths = self.with_attributes_lock(PendingQueues::take_deletes)?;
        paths.retain(|path| !path.is_empty());
        if paths.is_empty() {
            return Ok(());
        }
        debug!(attachment = %self.definition.name, count = paths.len(), "flushing deletes");
        self.store.flush_deletes(paths).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Whether `style` is stored.
    ///
    /// # Errors
    ///
    /// Returns the store's failure.
    pub async fn exists(&self, style: &Style) -> Result<bool, AttachmentError> {
        Ok(self.store.exists(style).await?)
    }

    /// Copy `style` to a local file, falling back across stores.
    ///
    /// # Errors
    ///
    /// Returns the store's failure for a single store; a replicated store
    /// reports absence instead.
    pub async fn copy_to_local_file(&self, style: &Style, dest: &Path) -> Result<bool, AttachmentError> {
        Ok(self.store.copy_to_local_file(style, dest).await?)
    }
}
