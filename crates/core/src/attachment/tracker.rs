//! Per-style processing state.
//!
//! A style moves `unscheduled -> processing -> finished | failed`. Leaving
//! the processing state happens at most once per run, so a second
//! completion call for the same style is a no-op. Starting a style that
//! already terminated opens a new run for it.

use std::collections::{BTreeSet, HashMap};

use super::record::ProcessingUpdate;
use super::types::Style;

/// Where a style is in its current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleState {
    /// Being generated.
    Processing,
    /// Generated successfully.
    Finished,
    /// Generation failed.
    Failed,
}

impl StyleState {
    /// Whether no further transition is possible in this run.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Result of a completion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The style was not in flight; nothing changed.
    NotInFlight,
    /// The style left the in-flight set.
    Removed {
        /// Whether the set is now empty.
        drained: bool,
    },
}

impl Removal {
    /// Whether this call emptied the in-flight set.
    #[must_use]
    pub fn drained(self) -> bool {
        matches!(self, Self::Removed { drained: true })
    }
}

/// In-flight and processed styles of one attachment.
#[derive(Debug, Default)]
pub struct ProcessorTracker {
    in_flight: BTreeSet<Style>,
    processed: Vec<Style>,
    states: HashMap<Style, StyleState>,
}

impl ProcessorTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add styles already recorded as processed on the record.
    pub fn seed_processed<I>(&mut self, styles: I)
    where
        I: IntoIterator<Item = Style>,
    {
        for style in styles {
            self.push_processed(style);
        }
    }

    /// Mark `style` as in flight.
    ///
    /// Returns `true` when this call took the set from empty to non-empty.
    pub fn start(&mut self, style: &Style) -> bool {
        if self.in_flight.contains(style) {
            return false;
        }
        let was_empty = self.in_flight.is_empty();
        self.in_flight.insert(style.clone());
        self.states.insert(style.clone(), StyleState::Processing);
        was_empty
    }

    /// Complete `style` successfully and record it as processed.
    pub fn finish(&mut self, style: &Style) -> Removal {
        self.complete(style, StyleState::Finished)
    }

    /// Complete `style` with a failure.
    pub fn fail(&mut self, style: &Style) -> Removal {
        self.complete(style, StyleState::Failed)
    }

    /// Undo a `start` whose side effects could not be applied.
    pub fn abandon(&mut self, style: &Style) -> bool {
        if self.in_flight.remove(style) {
            self.states.remove(style);
            true
        } else {
            false
        }
    }

    fn complete(&mut self, style: &Style, state: StyleState) -> Removal {
        if !self.in_flight.remove(style) {
            return Removal::NotInFlight;
        }
        self.states.insert(style.clone(), state);
        if state == StyleState::Finished {
            self.push_processed(style.clone());
        }
        Removal::Removed {
            drained: self.in_flight.is_empty(),
        }
    }

    fn push_processed(&mut self, style: Style) {
        if !self.processed.contains(&style) {
            self.processed.push(style);
        }
    }

    /// Styles in flight, in name order.
    #[must_use]
    pub fn in_flight(&self) -> Vec<Style> {
        self.in_flight.iter().cloned().collect()
    }

    /// Whether `style` is in flight.
    #[must_use]
    pub fn is_in_flight(&self, style: &Style) -> bool {
        self.in_flight.contains(style)
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Styles processed so far, in completion order.
    #[must_use]
    pub fn processed(&self) -> &[Style] {
        &self.processed
    }

    /// State of `style` in its latest run.
    #[must_use]
    pub fn state(&self, style: &Style) -> Option<StyleState> {
        self.states.get(style).copied()
    }

    /// Fields to write to the record for the current state.
    #[must_use]
    pub fn update(&self) -> ProcessingUpdate {
        ProcessingUpdate {
            processing: !self.in_flight.is_empty(),
            processed_styles: self.processed.iter().map(|s| s.as_str().to_string()).collect(),
        }
    }
}
