//! Lock primitives for the attachment state engine.
//!
//! Every lock remembers which execution context holds it. A context is the
//! current tokio task when there is one, otherwise the current thread.
//! Re-acquiring a non-reentrant lock from the context that already holds it
//! returns [`LockError::Reentrant`] instead of deadlocking.
//!
//! | Type | Blocking | Re-entrant | Used for |
//! |------|----------|------------|----------|
//! | [`ContextLock`] | async | no | save lock, processor-info lock |
//! | [`ContextMutex`] | sync | no | attributes lock |
//! | [`ReentrantGate`] | sync | yes | status lock |

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use thiserror::Error;

/// Locking misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock is already held by the calling context.
    #[error("{lock} lock is already held by the current execution context")]
    Reentrant {
        /// Name of the lock.
        lock: &'static str,
    },
}

/// The unit of execution a lock is held by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionContext {
    /// A spawned tokio task.
    Task(tokio::task::Id),
    /// A plain thread, or a future driven by `block_on`.
    Thread(ThreadId),
}

impl ExecutionContext {
    /// The context the caller is running in.
    #[must_use]
    pub fn current() -> Self {
        tokio::task::try_id().map_or_else(|| Self::Thread(thread::current().id()), Self::Task)
    }
}

#[derive(Debug, Default)]
struct Owner(Mutex<Option<ExecutionContext>>);

impl Owner {
    fn get(&self) -> Option<ExecutionContext> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, context: Option<ExecutionContext>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = context;
    }

    fn is_current(&self) -> bool {
        self.get() == Some(ExecutionContext::current())
    }
}

/// Clears the owner when dropped, including during unwinding.
struct OwnerReset<'a>(&'a Owner);

impl Drop for OwnerReset<'_> {
    fn drop(&mut self) {
        self.0.set(None);
    }
}

/// Async, non-reentrant lock that may be held across `.await` points.
#[derive(Debug)]
pub struct ContextLock<T> {
    name: &'static str,
    data: tokio::sync::Mutex<T>,
    owner: Owner,
}

/// Guard returned by [`ContextLock::lock`].
pub struct ContextLockGuard<'a, T> {
    // Field order matters: the owner is cleared before the mutex is released.
    _reset: OwnerReset<'a>,
    data: tokio::sync::MutexGuard<'a, T>,
}

impl<T> ContextLock<T> {
    /// Create a named lock around `value`.
    #[must_use]
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            data: tokio::sync::Mutex::new(value),
            owner: Owner::default(),
        }
    }

    /// Name used in errors and logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the calling context currently holds this lock.
    #[must_use]
    pub fn is_held_by_current(&self) -> bool {
        self.owner.is_current()
    }

    /// Wait for the lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Reentrant`] if the calling context already holds it.
    pub async fn lock(&self) -> Result<ContextLockGuard<'_, T>, LockError> {
        let context = ExecutionContext::current();
        if self.owner.get() == Some(context) {
            return Err(LockError::Reentrant { lock: self.name });
        }
        let data = self.data.lock().await;
        self.owner.set(Some(context));
        Ok(ContextLockGuard {
            _reset: OwnerReset(&self.owner),
            data,
        })
    }
}

impl<T> Deref for ContextLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for ContextLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

/// Blocking, non-reentrant mutex for short critical sections.
#[derive(Debug)]
pub struct ContextMutex<T> {
    name: &'static str,
    data: Mutex<T>,
    owner: Owner,
}

impl<T> ContextMutex<T> {
    /// Create a named mutex around `value`.
    #[must_use]
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            data: Mutex::new(value),
            owner: Owner::default(),
        }
    }

    /// Run `f` with exclusive access to the data.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Reentrant`] when called from inside another
    /// `with` on the same mutex.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, LockError> {
        let context = ExecutionContext::current();
        if self.owner.get() == Some(context) {
            return Err(LockError::Reentrant { lock: self.name });
        }
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        self.owner.set(Some(context));
        let _reset = OwnerReset(&self.owner);
        Ok(f(&mut data))
    }
}

#[derive(Debug, Default)]
struct GateState {
    owner: Option<ExecutionContext>,
    depth: usize,
}

/// Blocking lock that the holding context may enter again.
///
/// It guards no data of its own; callers keep the protected fields in
/// atomics and only touch them while inside the gate.
#[derive(Debug)]
pub struct ReentrantGate {
    name: &'static str,
    state: Mutex<GateState>,
    released: Condvar,
}

struct GateEntry<'a>(&'a ReentrantGate);

impl ReentrantGate {
    /// Create a named gate.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(GateState::default()),
            released: Condvar::new(),
        }
    }

    /// Name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `f` inside the gate, entering again if the caller already holds it.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        let _entry = self.enter();
        f()
    }

    /// Current nesting depth; zero when the gate is free.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .depth
    }

    fn enter(&self) -> GateEntry<'_> {
        let context = ExecutionContext::current();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match state.owner {
                None => {
                    state.owner = Some(context);
                    state.depth = 1;
                    break;
                }
                Some(owner) if owner == context => {
                    state.depth += 1;
                    break;
                }
                Some(_) => {
                    state = self
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        GateEntry(self)
    }
}

impl Drop for GateEntry<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.0.released.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_context_lock_rejects_reentry() {
        let lock = ContextLock::new("save", ());
        let guard = lock.lock().await.expect("first acquisition");
        assert!(lock.is_held_by_current());

        let err = lock.lock().await.err().expect("second acquisition fails");
        assert_eq!(err, LockError::Reentrant { lock: "save" });

        drop(guard);
        assert!(!lock.is_held_by_current());
        assert!(lock.lock().await.is_ok());
    }

    #[tokio::test]
    async fn test_context_lock_blocks_other_tasks() {
        let lock = Arc::new(ContextLock::new("save", 0_u32));
        let guard = lock.lock().await.expect("held by test");

        let other = Arc::clone(&lock);
        let handle = tokio::spawn(async move {
            let mut value = other.lock().await.expect("other task waits, not errors");
            *value += 1;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(guard);

        handle.await.expect("task completes");
        assert_eq!(*lock.lock().await.expect("free again"), 1);
    }

    #[tokio::test]
    async fn test_context_lock_released_on_panic() {
        let lock = Arc::new(ContextLock::new("save", ()));
        let inner = Arc::clone(&lock);
        let result = tokio::spawn(async move {
            let _guard = inner.lock().await.expect("acquired");
            panic!("boom");
        })
        .await;

        assert!(result.is_err());
        assert!(lock.lock().await.is_ok());
    }

    #[test]
    fn test_context_mutex_rejects_nested_with() {
        let mutex = ContextMutex::new("attributes", vec![1]);
        let nested = mutex
            .with(|outer| {
                outer.push(2);
                mutex.with(|inner| inner.len())
            })
            .expect("outer succeeds");

        assert_eq!(nested, Err(LockError::Reentrant { lock: "attributes" }));
        assert_eq!(mutex.with(|v| v.clone()).expect("free again"), vec![1, 2]);
    }

    #[test]
    fn test_context_mutex_is_shared_across_threads() {
        let mutex = Arc::new(ContextMutex::new("attributes", 0_usize));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..100 {
                        mutex.with(|n| *n += 1).expect("no re-entry");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread finishes");
        }
        assert_eq!(mutex.with(|n| *n).expect("readable"), 800);
    }

    #[test]
    fn test_reentrant_gate_allows_nesting() {
        let gate = ReentrantGate::new("status");
        let depth = gate.with(|| gate.with(|| gate.depth()));
        assert_eq!(depth, 2);
        assert_eq!(gate.depth(), 0);
    }

    #[test]
    fn test_reentrant_gate_excludes_other_threads() {
        let gate = Arc::new(ReentrantGate::new("status"));
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..50 {
                        gate.with(|| {
                            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                            gate.with(|| thread::yield_now());
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread finishes");
        }
    }
}
