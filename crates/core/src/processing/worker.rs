//! Per-style processing workers.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, error, info, warn};

use super::processor::ProcessorRegistry;
use crate::attachment::{
    Attachment, AttachmentError, Blob, LifecycleStatus, SaveTrigger, Style,
};

/// How a style ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StyleOutcome {
    /// Generated, queued and finished.
    Finished,
    /// The chain produced nothing; the style was dropped and failed.
    Skipped,
    /// The input is unsupported; the style failed without an error.
    Failed {
        /// Processor message.
        reason: String,
    },
    /// Generated and queued; saving and finishing run on a spawned task.
    Deferred,
}

/// Drives styles of one attachment through processing.
#[derive(Clone)]
pub struct ProcessingWorker {
    attachment: Arc<Attachment>,
    processors: Arc<ProcessorRegistry>,
    deferred: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ProcessingWorker {
    /// Create a worker.
    #[must_use]
    pub fn new(attachment: Arc<Attachment>, processors: Arc<ProcessorRegistry>) -> Self {
        Self {
            attachment,
            processors,
            deferred: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The attachment being processed.
    #[must_use]
    pub fn attachment(&self) -> &Arc<Attachment> {
        &self.attachment
    }

    /// Spawn one task per defined style.
    pub fn spawn_all(&self) -> JoinSet<(Style, Result<StyleOutcome, AttachmentError>)> {
        let mut tasks = JoinSet::new();
        for definition in &self.attachment.definition().styles {
            let worker = self.clone();
            let style = definition.style.clone();
            let span = tracing::info_span!(
                "process",
                attachment = %self.attachment.definition().name,
                style = %style
            );
            tasks.spawn(
                async move {
                    let result = worker.process(&style).await;
                    (style, result)
                }
                .instrument(span),
            );
        }
        tasks
    }

    /// Run every defined style to completion, including deferred saves.
    pub async fn run_all(&self) -> Vec<(Style, Result<StyleOutcome, AttachmentError>)> {
        let mut tasks = self.spawn_all();
        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "processing task did not complete"),
            }
        }
        self.join_deferred().await;
        results
    }

    /// Wait for every deferred save started so far.
    pub async fn join_deferred(&self) {
        let handles = std::mem::take(
            &mut *self
                .deferred
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "deferred save did not complete");
            }
        }
    }

    /// Generate `style` and hand it to the attachment.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown style, a missing original, a lock or
    /// record failure, a fatal processor failure (after failing the style),
    /// or a failed inline save.
    pub async fn process(&self, style: &Style) -> Result<StyleOutcome, AttachmentError> {
        let definition = self
            .attachment
            .definition()
            .style(style)
            .cloned()
            .ok_or_else(|| AttachmentError::unknown_style(style))?;
        let original = self.source().await?;

        self.attachment.processing(style).await?;
        let result = self.processors.run_chain(&definition, &original).await;
        self.attachment.wait_until_saved().await;

        match result {
            Ok(Some(blob)) => {
                if let Err(e) = self.attachment.queue_write(style.clone(), blob) {
                    return self.abort(style, e.into()).await;
                }
                self.finish(style).await
            }
            Ok(None) => {
                if let Err(e) = self.attachment.drop_write(style) {
                    return self.abort(style, e.into()).await;
                }
                self.attachment.failed_processing(style).await?;
                info!(%style, "no output, style skipped");
                Ok(StyleOutcome::Skipped)
            }
            Err(e) if e.is_unsupported() => {
                warn!(%style, error = %e, "unsupported input");
                if self.attachment.definition().whiny {
                    self.attachment
                        .record_processing_error(format!("{style}: {e}"));
                }
                self.attachment.failed_processing(style).await?;
                Ok(StyleOutcome::Failed {
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                error!(%style, error = %e, "processing failed");
                self.abort(style, e.into()).await
            }
        }
    }

    /// Fail `style`, then return `err`.
    pub(super) async fn abort(
        &self,
        style: &Style,
        err: AttachmentError,
    ) -> Result<StyleOutcome, AttachmentError> {
        self.attachment.failed_processing(style).await?;
        Err(err)
    }

    /// The original content: queued if not saved yet, otherwise read back
    /// from storage.
    async fn source(&self) -> Result<Blob, AttachmentError> {
        if let Some(blob) = self.attachment.original_blob()? {
            return Ok(blob);
        }

        let scratch = tempfile::NamedTempFile::new().map_err(crate::storage::StorageError::from)?;
        let original = Style::original();
        if !self
            .attachment
            .copy_to_local_file(&original, scratch.path())
            .await?
        {
            return Err(AttachmentError::MissingOriginal);
        }
        let data = tokio::fs::read(scratch.path())
            .await
            .map_err(crate::storage::StorageError::from)?;

        let mut blob = Blob::new(data);
        if let Some(file) = self.attachment.record().file() {
            blob.original_filename = Some(file.file_name);
            blob.content_type = file.content_type;
        }
        Ok(blob)
    }

    async fn finish(&self, style: &Style) -> Result<StyleOutcome, AttachmentError> {
        match self.attachment.definition().save_trigger {
            SaveTrigger::Inline => {
                save_and_finish(&self.attachment, style).await?;
                Ok(StyleOutcome::Finished)
            }
            SaveTrigger::Deferred => {
                let attachment = Arc::clone(&self.attachment);
                let style = style.clone();
                let handle = tokio::spawn(
                    async move {
                        if let Err(e) = save_and_finish(&attachment, &style).await {
                            error!(error = %e, "deferred save failed");
                        }
                    }
                    .in_current_span(),
                );
                self.deferred
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(handle);
                Ok(StyleOutcome::Deferred)
            }
        }
    }
}

/// Save unless the host record will, then finish the style. A failed save
/// fails the style instead.
async fn save_and_finish(attachment: &Attachment, style: &Style) -> Result<(), AttachmentError> {
    let host_saves = attachment.with_status_lock(LifecycleStatus::has_unsaved_changes);
    if !host_saves {
        if let Err(e) = attachment.save().await {
            attachment.failed_processing(style).await?;
            return Err(e);
        }
    }
    attachment.finished_processing(style).await
}
