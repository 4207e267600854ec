//! Property-based tests for the processor tracker.
//!
//! Completion calls arrive in arbitrary order, repeated or not. The
//! in-flight set must drain exactly when every started style terminated,
//! and the processed list must hold exactly the styles that finished.

use std::collections::BTreeSet;

use proptest::prelude::*;

use super::tracker::{ProcessorTracker, Removal};
use super::types::Style;

const STYLES: [&str; 5] = ["thumb", "small", "medium", "large", "preview"];

#[derive(Debug, Clone, Copy)]
enum Op {
    Start(usize),
    Finish(usize),
    Fail(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..STYLES.len()).prop_map(Op::Start),
        (0..STYLES.len()).prop_map(Op::Finish),
        (0..STYLES.len()).prop_map(Op::Fail),
    ]
}

/// Every style started once, then terminated in a shuffled order, with
/// a success flag per style and a random number of duplicate calls.
fn arb_terminations() -> impl Strategy<Value = Vec<(usize, bool, usize)>> {
    prop::collection::vec((any::<bool>(), 1usize..3), STYLES.len())
        .prop_map(|flags| {
            flags
                .into_iter()
                .enumerate()
                .map(|(i, (ok, repeats))| (i, ok, repeats))
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Starting every style and terminating them in any order drains the
    /// set only after the last termination, and only finished styles are
    /// recorded as processed.
    #[test]
    fn prop_drains_after_last_termination(terminations in arb_terminations()) {
        let mut tracker = ProcessorTracker::new();
        for name in STYLES {
            tracker.start(&Style::new(name));
        }

        let mut drained_calls = 0;
        let mut finished = BTreeSet::new();
        for (position, (index, ok, repeats)) in terminations.iter().enumerate() {
            let style = Style::new(STYLES[*index]);
            for attempt in 0..*repeats {
                let removal = if *ok { tracker.finish(&style) } else { tracker.fail(&style) };
                if attempt > 0 {
                    prop_assert_eq!(removal, Removal::NotInFlight);
                }
                if removal.drained() {
                    drained_calls += 1;
                    prop_assert_eq!(position, terminations.len() - 1);
                }
            }
            if *ok {
                finished.insert(STYLES[*index].to_string());
            }
        }

        prop_assert_eq!(drained_calls, 1);
        prop_assert!(tracker.is_drained());

        let processed: BTreeSet<String> =
            tracker.processed().iter().map(|s| s.as_str().to_string()).collect();
        prop_assert_eq!(processed, finished);
        prop_assert_eq!(tracker.processed().len(), tracker.update().processed_styles.len());
    }

    /// Arbitrary interleavings agree with a simple set model.
    #[test]
    fn prop_matches_set_model(ops in prop::collection::vec(arb_op(), 0..60)) {
        let mut tracker = ProcessorTracker::new();
        let mut in_flight = BTreeSet::new();
        let mut processed = BTreeSet::new();

        for op in ops {
            match op {
                Op::Start(i) => {
                    let became_busy = tracker.start(&Style::new(STYLES[i]));
                    let was_empty = in_flight.is_empty();
                    let inserted = in_flight.insert(i);
                    prop_assert_eq!(became_busy, was_empty && inserted);
                }
                Op::Finish(i) => {
                    let removal = tracker.finish(&Style::new(STYLES[i]));
                    if in_flight.remove(&i) {
                        processed.insert(STYLES[i].to_string());
                        prop_assert_eq!(removal, Removal::Removed { drained: in_flight.is_empty() });
                    } else {
                        prop_assert_eq!(removal, Removal::NotInFlight);
                    }
                }
                Op::Fail(i) => {
                    let removal = tracker.fail(&Style::new(STYLES[i]));
                    if in_flight.remove(&i) {
                        prop_assert_eq!(removal, Removal::Removed { drained: in_flight.is_empty() });
                    } else {
                        prop_assert_eq!(removal, Removal::NotInFlight);
                    }
                }
            }

            prop_assert_eq!(tracker.is_drained(), in_flight.is_empty());
            prop_assert_eq!(tracker.update().processing, !in_flight.is_empty());
        }

        let tracked: BTreeSet<String> =
            tracker.processed().iter().map(|s| s.as_str().to_string()).collect();
        prop_assert_eq!(tracked, processed);
    }
}
