//! Style generation.
//!
//! A style is produced by running its processor chain on the original and
//! queueing the result. Workers drive one style each through the
//! attachment's processing state and trigger the save.

mod command;
mod processor;
mod worker;


pub use command::CommandProcessor;
pub use processor::{Processor, ProcessorError, ProcessorRegistry};
pub use worker::{ProcessingWorker, StyleOutcome};
