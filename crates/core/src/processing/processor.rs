//! Processor trait and named registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::attachment::{Blob, StyleDefinition};

/// Processor failures.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The input cannot be handled. Recorded, never fatal.
    #[error("unsupported input: {0}")]
    Unsupported(String),

    /// The style has an empty processor chain.
    #[error("style '{style}' has no processors")]
    NoProcessors {
        /// Style name.
        style: String,
    },

    /// The chain names a processor that is not registered.
    #[error("unknown processor '{0}'")]
    UnknownProcessor(String),

    /// The external program is not installed.
    #[error("command not found: {program}")]
    CommandNotFound {
        /// Program name.
        program: String,
    },

    /// The external program exited with an error.
    #[error("{program} failed with status {status}: {stderr}")]
    CommandFailed {
        /// Program name.
        program: String,
        /// Exit status, as reported by the OS.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// Scratch file I/O failed.
    #[error("processor I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessorError {
    /// Create an unsupported input error.
    #[must_use]
    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported(reason.into())
    }

    /// Whether the failure is the non-fatal unsupported-input kind.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

/// Transforms content into a style.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Produce a new blob from `input`, or `None` when there is nothing to store.
    async fn transform(
        &self,
        input: &Blob,
        options: &BTreeMap<String, String>,
    ) -> Result<Option<Blob>, ProcessorError>;
}

/// Processors by name.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` under `name`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, processor: impl Processor + 'static) -> Self {
        self.register(name, Arc::new(processor));
        self
    }

    /// Register `processor` under `name`, replacing any earlier one.
    pub fn register(&mut self, name: impl Into<String>, processor: Arc<dyn Processor>) {
        self.processors.insert(name.into(), processor);
    }

    /// Look up a processor.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Processor>> {
        self.processors.get(name)
    }

    /// Run the chain of `style` on `original`.
    ///
    /// Each processor receives the previous output. A `None` from any
    /// processor ends the chain with `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::NoProcessors`] for an empty chain,
    /// [`ProcessorError::UnknownProcessor`] for an unregistered name, or the
    /// first processor failure.
    pub async fn run_chain(
        &self,
        style: &StyleDefinition,
        original: &Blob,
    ) -> Result<Option<Blob>, ProcessorError> {
        if style.processors.is_empty() {
            return Err(ProcessorError::NoProcessors {
                style: style.style.to_string(),
            });
        }

        let mut current = original.clone();
        for name in &style.processors {
            let processor = self
                .get(name)
                .ok_or_else(|| ProcessorError::UnknownProcessor(name.clone()))?;
            match processor.transform(&current, &style.options).await? {
                Some(next) => current = next,
                None => {
                    tracing::debug!(style = %style.style, processor = %name, "processor produced no output");
                    return Ok(None);
                }
            }
        }
        Ok(Some(current))
    }
}
