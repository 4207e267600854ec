//! Replicated storage fan-out.
//!
//! A coordinator owns one main store, optional additional mirrors and
//! optional backup archives, and presents them as a single
//! [`AttachmentStore`].
//!
//! | Store | Receives | Runs | Failure |
//! |-------|----------|------|---------|
//! | main | every style | on the caller | returned |
//! | backup (sync) | `original` only | on the caller, before main | returned, stops the flush |
//! | backup (async) | `original` only | spawned, awaited | returned after all backups settle |
//! | additional | every style | spawned, not awaited | logged and published |
//!
//! Backups never take part in deletes. Reads fall back from main to the
//! additional stores and then to the backups.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;
use vellum_shared::{AttachmentSettings, BackupForm, StorageSettings, StoreSettings};

use super::error::StorageError;
use super::path::PathResolver;
use super::proxy::{AttachmentStore, StorageProxy};
use super::registry::StoreRegistry;
use crate::attachment::{Style, WriteQueue};

const EVENT_CAPACITY: usize = 64;

/// How backup stores are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackupMode {
    /// Inline, before the main store.
    Sync,
    /// On spawned workers, awaited before the flush returns.
    #[default]
    Async,
}

impl From<BackupForm> for BackupMode {
    fn from(form: BackupForm) -> Self {
        match form {
            BackupForm::Sync => Self::Sync,
            BackupForm::Async => Self::Async,
        }
    }
}

/// Flush kind carried by events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `flush_writes`.
    Write,
    /// `flush_deletes`.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write => f.write_str("write"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// Outcome of background replication work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// An additional store failed.
    StoreFailed {
        /// Store label.
        store: String,
        /// Flush that failed.
        operation: Operation,
        /// Error message.
        error: String,
    },
    /// Every additional-store worker of a flush has finished.
    Settled {
        /// Flush that settled.
        operation: Operation,
        /// How many of them failed.
        failures: usize,
    },
}

type Shared = Arc<dyn AttachmentStore>;

/// Earliest failure observed during one flush.
#[derive(Default)]
struct FirstError(Option<(Instant, StorageError)>);

impl FirstError {
    fn record(&mut self, at: Instant, error: StorageError) {
        match &self.0 {
            Some((seen, _)) if *seen <= at => {
                tracing::debug!(error = %error, "later critical failure ignored");
            }
            _ => self.0 = Some((at, error)),
        }
    }

    fn is_set(&self) -> bool {
        self.0.is_some()
    }

    fn into_result(self) -> Result<(), StorageError> {
        self.0.map_or(Ok(()), |(_, e)| Err(e))
    }
}

/// One main store replicated to mirrors and backups.
pub struct ReplicationCoordinator {
    main: Shared,
    additional: Vec<Shared>,
    backups: Vec<Shared>,
    backup_mode: BackupMode,
    events: broadcast::Sender<ReplicationEvent>,
}

impl ReplicationCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        main: Shared,
        additional: Vec<Shared>,
        backups: Vec<Shared>,
        backup_mode: BackupMode,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            main,
            additional,
            backups,
            backup_mode,
            events,
        }
    }

    /// Subscribe to background replication events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    /// The main store.
    #[must_use]
    pub fn main(&self) -> &Shared {
        &self.main
    }

    /// Backup write mode.
    #[must_use]
    pub fn backup_mode(&self) -> BackupMode {
        self.backup_mode
    }

    /// Spawn best-effort work for every additional store and report it
    /// through events once all of it has finished.
    fn replicate_in_background<F, Fut>(&self, operation: Operation, work: F)
    where
        F: Fn(Shared) -> Fut,
        Fut: Future<Output = Result<(), StorageError>> + Send + 'static,
    {
        let mut workers = JoinSet::new();
        for store in &self.additional {
            let name = store.name().to_string();
            let events = self.events.clone();
            let fut = work(Arc::clone(store));
            let span = tracing::debug_span!("replicate", store = %name, %operation);
            workers.spawn(
                async move {
                    let result = fut.await;
                    if let Err(e) = &result {
                        tracing::error!(error = %e, "additional store failed");
                        let _ = events.send(ReplicationEvent::StoreFailed {
                            store: name,
                            operation,
                            error: e.to_string(),
                        });
                    }
                    result.is_err()
                }
                .instrument(span),
            );
        }

        let events = self.events.clone();
        if workers.is_empty() {
            let _ = events.send(ReplicationEvent::Settled {
                operation,
                failures: 0,
            });
            return;
        }
        tokio::spawn(async move {
            let mut failures = 0;
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(failed) => failures += usize::from(failed),
                    Err(e) => {
                        tracing::error!(error = %e, "additional store worker did not complete");
                        failures += 1;
                    }
                }
            }
            tracing::debug!(%operation, failures, "background replication settled");
            let _ = events.send(ReplicationEvent::Settled {
                operation,
                failures,
            });
        });
    }
}

#[async_trait]
impl AttachmentStore for ReplicationCoordinator {
    fn name(&self) -> &str {
        self.main.name()
    }

    fn provider_name(&self) -> &'static str {
        self.main.provider_name()
    }

    fn path(&self, style: &Style) -> Option<String> {
        self.main.path(style)
    }

    async fn flush_writes(&self, queue: WriteQueue) -> Result<(), StorageError> {
        let backup_queue = queue.original_only();
        let mut first_error = FirstError::default();
        let mut critical = JoinSet::new();
        let mut critical_names = HashMap::new();

        for backup in &self.backups {
            match self.backup_mode {
                BackupMode::Sync => {
                    if let Err(e) = backup.flush_writes(backup_queue.clone()).await {
                        tracing::error!(store = %backup.name(), error = %e, "backup write failed");
                        first_error.record(Instant::now(), e);
                        break;
                    }
                }
                BackupMode::Async => {
                    let store = Arc::clone(backup);
                    let copy = backup_queue.clone();
                    let handle = critical.spawn(async move {
                        let result = store.flush_writes(copy).await;
                        (Instant::now(), result)
                    });
                    critical_names.insert(handle.id(), backup.name().to_string());
                }
            }
        }

        if !first_error.is_set() {
            self.replicate_in_background(Operation::Write, |store| {
                let copy = queue.clone();
                async move { store.flush_writes(copy).await }
            });

            if let Err(e) = self.main.flush_writes(queue).await {
                tracing::error!(store = %self.main.name(), error = %e, "main write failed");
                first_error.record(Instant::now(), e);
            }
        }

        while let Some(joined) = critical.join_next_with_id().await {
            match joined {
                Ok((_, (_, Ok(())))) => {}
                Ok((id, (at, Err(e)))) => {
                    let store = critical_names.get(&id).map_or("backup", String::as_str);
                    tracing::error!(%store, error = %e, "backup write failed");
                    first_error.record(at, e);
                }
                Err(e) => {
                    let store = critical_names
                        .get(&e.id())
                        .cloned()
                        .unwrap_or_else(|| "backup".to_string());
                    first_error.record(
                        Instant::now(),
                        StorageError::Join {
                            store,
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }

        first_error.into_result()
    }

    async fn flush_deletes(&self, paths: Vec<String>) -> Result<(), StorageError> {
        self.replicate_in_background(Operation::Delete, |store| {
            let copy = paths.clone();
            async move { store.flush_deletes(copy).await }
        });
        self.main.flush_deletes(paths).await
    }

    async fn exists(&self, style: &Style) -> Result<bool, StorageError> {
        self.main.exists(style).await
    }

    async fn copy_to_local_file(&self, style: &Style, dest: &Path) -> Result<bool, StorageError> {
        let chain = std::iter::once(&self.main)
            .chain(self.additional.iter())
            .chain(self.backups.iter());
        for store in chain {
            match store.copy_to_local_file(style, dest).await {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    tracing::warn!(store = %store.name(), %style, "not found, trying next store");
                }
                Err(e) => {
                    tracing::warn!(store = %store.name(), %style, error = %e, "read failed, trying next store");
                }
            }
        }
        Ok(false)
    }
}

/// Build the store of an attachment from its settings.
///
/// A single store becomes a plain proxy; a multiple layout becomes a
/// [`ReplicationCoordinator`]. Every store inherits the attachment's
/// general options.
///
/// # Errors
///
/// Returns the first store that cannot be built.
pub fn build_store(
    settings: &AttachmentSettings,
    registry: &StoreRegistry,
    parent: &Arc<dyn PathResolver>,
) -> Result<Arc<dyn AttachmentStore>, StorageError> {
    let proxy = |name: String, store: &StoreSettings| -> Result<Shared, StorageError> {
        Ok(Arc::new(StorageProxy::from_settings(
            name,
            store,
            &settings.options,
            registry,
            Arc::clone(parent),
        )?))
    };

    match &settings.storage {
        StorageSettings::Single { store } => proxy(store.storage.clone(), store),
        StorageSettings::Multiple {
            main,
            additional,
            backups,
            backup_form,
        } => {
            let main = proxy("main".to_string(), main)?;
            let additional = additional
                .iter()
                .enumerate()
                .map(|(i, store)| proxy(format!("additional[{i}]"), store))
                .collect::<Result<Vec<_>, _>>()?;
            let backups = backups
                .iter()
                .enumerate()
                .map(|(i, store)| proxy(format!("backups[{i}]"), store))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(ReplicationCoordinator::new(
                main,
                additional,
                backups,
                (*backup_form).into(),
            )))
        }
    }
}
