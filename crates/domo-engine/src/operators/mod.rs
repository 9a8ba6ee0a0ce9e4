//! Temporal operators over entity state streams
//!
//! Each operator subscribes to one entity on the bus and turns raw,
//! possibly-noisy transitions into a reliable higher-level signal. All
//! operators are pure with respect to their inputs: an identical ordered
//! input sequence with identical clock advancement produces an identical
//! output sequence.

mod edge;
mod flicker;
mod multi_click;
mod sustained;

pub use edge::{Edge, EdgeConfig, EdgeTrigger};
pub use flicker::{FlickerConfig, FlickerDetector, Transition};
pub use multi_click::{MultiClickConfig, MultiClickDetector};
pub use sustained::{SustainedConfig, SustainedState};

use std::sync::Arc;

use domo_core::StateValue;

/// Predicate over a state value
pub type StatePredicate = Arc<dyn Fn(&StateValue) -> bool + Send + Sync>;

/// Predicate matching exactly one value
pub fn value_is(expected: StateValue) -> StatePredicate {
    Arc::new(move |v| *v == expected)
}
