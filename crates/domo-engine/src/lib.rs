//! Temporal automation engine
//!
//! Everything a rule is built out of: a clock abstraction, a cancellable
//! timer queue whose callbacks join the same serialized handling path as
//! bus events, the temporal operator library (sustained state, edge
//! triggers, flicker and multi-click detection), the toggleable automation
//! lifecycle, and daily schedule validation.

mod clock;
mod error;
mod lifecycle;
pub mod operators;
mod schedule;
mod timer;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{EngineError, EngineResult};
pub use lifecycle::{Lifecycle, LifecycleConfig};
pub use schedule::{DailySchedule, ScheduleEntry};
pub use timer::{TimerHandle, TimerId, TimerQueue, TimerSlot};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use domo_event_bus::StateBus;
use domo_state_store::StateStore;

/// The shared handles every operator and rule needs
#[derive(Clone)]
pub struct EngineCtx {
    pub bus: Arc<StateBus>,
    pub store: Arc<StateStore>,
    pub timers: Arc<TimerQueue>,
    pub clock: SharedClock,
}

impl EngineCtx {
    pub fn new(store: Arc<StateStore>, clock: SharedClock) -> Self {
        let bus = store.bus().clone();
        let timers = TimerQueue::new(clock.clone());
        Self {
            bus,
            store,
            timers,
            clock,
        }
    }

    /// A fully wired context on the system clock
    pub fn system() -> Self {
        let clock: SharedClock = Arc::new(SystemClock);
        Self::new(StateStore::new(StateBus::new()), clock)
    }

    /// A fully wired context on a manual clock, for tests and simulations
    pub fn manual(start: DateTime<Utc>) -> (Self, ManualClock) {
        let manual = ManualClock::at(start);
        let clock: SharedClock = Arc::new(manual.clone());
        (Self::new(StateStore::new(StateBus::new()), clock), manual)
    }

    /// Run every timer whose deadline has been reached
    ///
    /// Production code runs this from the timer driver; tests call it after
    /// advancing a manual clock.
    pub fn pump(&self) -> usize {
        self.timers.fire_due(self.clock.now())
    }
}
