//! In-crate fakes for unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use vellum_shared::types::RecordId;

use crate::attachment::{
    AttachmentRecord, Blob, ExecutionContext, FileMetadata, ProcessingUpdate, RecordError, Style,
};
use crate::processing::{Processor, ProcessorError};
use crate::storage::{AttachmentStore, PathResolver, StorageBackend, StorageError, StorageProxy};

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = vellum_shared::telemetry::try_init_tracing("vellum=debug");
}

#[derive(Debug, Default)]
struct RecordState {
    file: Option<FileMetadata>,
    in_memory: ProcessingUpdate,
    durable: ProcessingUpdate,
    durable_writes: Vec<ProcessingUpdate>,
}

/// Record kept in memory, with a counted durable write path.
#[derive(Debug)]
pub struct MemoryRecord {
    id: RecordId,
    new_record: AtomicBool,
    missing_attempts: AtomicU32,
    state: Mutex<RecordState>,
}

impl MemoryRecord {
    fn with_state(new_record: bool) -> Self {
        Self {
            id: RecordId::new(),
            new_record: AtomicBool::new(new_record),
            missing_attempts: AtomicU32::new(0),
            state: Mutex::new(RecordState::default()),
        }
    }

    /// A record that has been saved.
    pub fn persisted() -> Arc<Self> {
        Arc::new(Self::with_state(false))
    }

    /// A record that has not been saved yet.
    pub fn unsaved() -> Arc<Self> {
        Arc::new(Self::with_state(true))
    }

    /// A saved record whose first `attempts` durable writes see no row.
    pub fn persisted_after(attempts: u32) -> Arc<Self> {
        let record = Self::with_state(false);
        record.missing_attempts.store(attempts, Ordering::SeqCst);
        Arc::new(record)
    }

    /// Flip the record to persisted, as the host's insert would.
    pub fn mark_persisted(&self) {
        self.new_record.store(false, Ordering::SeqCst);
    }

    /// Processing columns of the loaded instance.
    pub fn in_memory(&self) -> ProcessingUpdate {
        self.lock().in_memory.clone()
    }

    /// Processing columns as stored.
    pub fn durable(&self) -> ProcessingUpdate {
        self.lock().durable.clone()
    }

    /// Every durable write, in order.
    pub fn durable_writes(&self) -> Vec<ProcessingUpdate> {
        self.lock().durable_writes.clone()
    }

    /// Durable writes that set `processing = true`.
    pub fn durable_processing_flips(&self) -> usize {
        self.lock()
            .durable_writes
            .iter()
            .filter(|u| u.processing)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordState> {
        self.state.lock().expect("record state poisoned")
    }

    async fn durable_write(&self, update: &ProcessingUpdate) -> Result<(), RecordError> {
        tokio::task::yield_now().await;
        let remaining = self.missing_attempts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.missing_attempts.store(remaining - 1, Ordering::SeqCst);
            return Err(RecordError::NotFound { id: self.id });
        }
        let mut state = self.lock();
        state.in_memory = update.clone();
        state.durable = update.clone();
        state.durable_writes.push(update.clone());
        Ok(())
    }
}

#[async_trait]
impl AttachmentRecord for MemoryRecord {
    fn id(&self) -> Option<RecordId> {
        Some(self.id)
    }

    fn is_new_record(&self) -> bool {
        self.new_record.load(Ordering::SeqCst)
    }

    fn file(&self) -> Option<FileMetadata> {
        self.lock().file.clone()
    }

    fn assign_file(&self, file: Option<FileMetadata>) {
        self.lock().file = file;
    }

    fn processed_styles(&self) -> Vec<String> {
        self.lock().in_memory.processed_styles.clone()
    }

    fn assign_processing(&self, update: &ProcessingUpdate) {
        self.lock().in_memory = update.clone();
    }

    async fn update_columns(&self, update: &ProcessingUpdate) -> Result<(), RecordError> {
        self.durable_write(update).await
    }

    async fn update_with_row_lock(&self, update: &ProcessingUpdate) -> Result<(), RecordError> {
        self.durable_write(update).await
    }
}

/// Backend that keeps objects in a map and records who wrote them.
#[derive(Debug, Default)]
pub struct FakeBackend {
    objects: Mutex<BTreeMap<String, Bytes>>,
    writes: Mutex<Vec<(String, ExecutionContext)>>,
    deletes: Mutex<Vec<String>>,
    reads: AtomicUsize,
    fail_writes: Option<String>,
    fail_reads: bool,
    delay: Duration,
    delete_delay: Duration,
}

impl FakeBackend {
    /// A working backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write fails with `message`.
    pub fn failing_writes(mut self, message: &str) -> Self {
        self.fail_writes = Some(message.to_string());
        self
    }

    /// Every read fails.
    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    /// Sleep before every write.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sleep before every delete.
    pub fn with_delete_delay(mut self, delay: Duration) -> Self {
        self.delete_delay = delay;
        self
    }

    /// Store an object directly.
    pub fn put(&self, path: &str, data: &'static [u8]) {
        self.objects
            .lock()
            .expect("objects poisoned")
            .insert(path.to_string(), Bytes::from_static(data));
    }

    /// Stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.objects
            .lock()
            .expect("objects poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Contexts that performed writes, in order.
    pub fn write_contexts(&self) -> Vec<ExecutionContext> {
        self.writes
            .lock()
            .expect("writes poisoned")
            .iter()
            .map(|(_, context)| *context)
            .collect()
    }

    /// Number of write calls, including failed ones.
    pub fn write_calls(&self) -> usize {
        self.writes.lock().expect("writes poisoned").len()
    }

    /// Paths passed to delete.
    pub fn deleted(&self) -> Vec<String> {
        self.deletes.lock().expect("deletes poisoned").clone()
    }

    /// Number of read calls.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for FakeBackend {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn write(&self, path: &str, blob: &Blob) -> Result<(), StorageError> {
        self.writes
            .lock()
            .expect("writes poisoned")
            .push((path.to_string(), ExecutionContext::current()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.fail_writes {
            return Err(StorageError::operation(message.clone()));
        }
        self.objects
            .lock()
            .expect("objects poisoned")
            .insert(path.to_string(), blob.data.clone());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        if !self.delete_delay.is_zero() {
            tokio::time::sleep(self.delete_delay).await;
        }
        self.deletes
            .lock()
            .expect("deletes poisoned")
            .push(path.to_string());
        self.objects.lock().expect("objects poisoned").remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self
            .objects
            .lock()
            .expect("objects poisoned")
            .contains_key(path))
    }

    async fn read(&self, path: &str) -> Result<Bytes, StorageError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads {
            return Err(StorageError::operation("read refused"));
        }
        self.objects
            .lock()
            .expect("objects poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::not_found(path))
    }
}

/// Paths of the form `obj/<style>`.
pub struct StylePaths;

impl PathResolver for StylePaths {
    fn path(&self, style: &Style) -> Option<String> {
        Some(format!("obj/{style}"))
    }
}

/// Wrap a fake backend in a proxy named `name`.
pub fn fake_store(name: &str, backend: &Arc<FakeBackend>) -> Arc<dyn AttachmentStore> {
    Arc::new(StorageProxy::new(
        name,
        Arc::clone(backend) as Arc<dyn StorageBackend>,
        Arc::new(StylePaths),
    ))
}

type TransformFn = dyn Fn(&Blob) -> Result<Option<Blob>, ProcessorError> + Send + Sync;

/// Processor backed by a closure.
pub struct FnProcessor {
    transform: Box<TransformFn>,
    delay: Duration,
}

impl FnProcessor {
    /// Wrap `transform`.
    pub fn new<F>(transform: F) -> Self
    where
        F: Fn(&Blob) -> Result<Option<Blob>, ProcessorError> + Send + Sync + 'static,
    {
        Self {
            transform: Box::new(transform),
            delay: Duration::ZERO,
        }
    }

    /// Prefix the input with `tag`.
    pub fn tagging(tag: &'static str) -> Self {
        Self::new(move |blob| {
            let mut data = tag.as_bytes().to_vec();
            data.extend_from_slice(&blob.data);
            Ok(Some(Blob::new(data)))
        })
    }

    /// Sleep before transforming.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Processor for FnProcessor {
    async fn transform(
        &self,
        input: &Blob,
        _options: &BTreeMap<String, String>,
    ) -> Result<Option<Blob>, ProcessorError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.transform)(input)
    }
}
