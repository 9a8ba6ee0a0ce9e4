//! Cancellable timers on the serialized event path
//!
//! Timers are the engine's only source of concurrency. A callback fires
//! through `fire_due`, on the thread that pumps the queue, so timer
//! callbacks never race with bus handlers. Cancellation is absolute: a
//! cancelled timer never fires, even when its deadline already elapsed in
//! wall-clock terms before the cancellation was observed.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Duration, Utc};
use domo_event_bus::Cancel;
use tokio::sync::Notify;
use tracing::trace;

use crate::clock::SharedClock;

/// A unique identifier for one scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

type Callback = Box<dyn FnOnce() + Send>;

struct Pending {
    deadlines: BinaryHeap<Reverse<(DateTime<Utc>, TimerId)>>,
    callbacks: HashMap<TimerId, Callback>,
}

/// Deadline-ordered queue of cancellable one-shot timers
pub struct TimerQueue {
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    clock: SharedClock,
    wake: Notify,
}

impl TimerQueue {
    pub fn new(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Pending {
                deadlines: BinaryHeap::new(),
                callbacks: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            clock,
            wake: Notify::new(),
        })
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Schedule a callback at an absolute deadline
    pub fn schedule_at(
        self: &Arc<Self>,
        deadline: DateTime<Utc>,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        {
            let mut pending = self.lock_pending();
            pending.deadlines.push(Reverse((deadline, id)));
            pending.callbacks.insert(id, Box::new(callback));
        }
        trace!(timer = id.0, deadline = %deadline, "timer scheduled");
        self.wake.notify_one();
        TimerHandle {
            id,
            queue: Arc::downgrade(self),
        }
    }

    /// Schedule a callback after a delay from the queue's clock now
    pub fn schedule_in(
        self: &Arc<Self>,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        self.schedule_at(self.clock.now() + delay.max(Duration::zero()), callback)
    }

    fn cancel(&self, id: TimerId) -> bool {
        // The heap entry stays behind and is skipped as stale later.
        let removed = self.lock_pending().callbacks.remove(&id).is_some();
        if removed {
            trace!(timer = id.0, "timer cancelled");
        }
        removed
    }

    fn contains(&self, id: TimerId) -> bool {
        self.lock_pending().callbacks.contains_key(&id)
    }

    /// The earliest live deadline, if any
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let mut pending = self.lock_pending();
        while let Some(Reverse((deadline, id))) = pending.deadlines.peek().copied() {
            if pending.callbacks.contains_key(&id) {
                return Some(deadline);
            }
            pending.deadlines.pop();
        }
        None
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().callbacks.len()
    }

    /// Run every live timer whose deadline is at or before `now`
    ///
    /// Callbacks run on the caller's thread with no queue lock held, so
    /// they may schedule or cancel further timers. A timer made due by a
    /// callback in the same pass fires in the same pass.
    pub fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;
        loop {
            let callback = {
                let mut pending = self.lock_pending();
                match pending.deadlines.peek().copied() {
                    Some(Reverse((deadline, id))) if deadline <= now => {
                        pending.deadlines.pop();
                        match pending.callbacks.remove(&id) {
                            Some(callback) => callback,
                            // Stale entry for a cancelled timer
                            None => continue,
                        }
                    }
                    _ => break,
                }
            };
            callback();
            fired += 1;
        }
        fired
    }

    /// Pump the queue from a background tokio task
    ///
    /// Sleeps until the next deadline and wakes early whenever an earlier
    /// deadline is scheduled. Abort the returned handle to stop.
    pub fn spawn_driver(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                match queue.next_deadline() {
                    Some(deadline) => {
                        let now = queue.clock.now();
                        if deadline <= now {
                            queue.fire_due(now);
                            continue;
                        }
                        let wait = (deadline - now).to_std().unwrap_or_default();
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {
                                queue.fire_due(queue.clock.now());
                            }
                            _ = queue.wake.notified() => {}
                        }
                    }
                    None => queue.wake.notified().await,
                }
            }
        })
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cancellation token for one scheduled timer
pub struct TimerHandle {
    id: TimerId,
    queue: Weak<TimerQueue>,
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Cancel the timer; returns whether it was still pending
    pub fn cancel(&self) -> bool {
        self.queue
            .upgrade()
            .map(|q| q.cancel(self.id))
            .unwrap_or(false)
    }

    pub fn is_pending(&self) -> bool {
        self.queue
            .upgrade()
            .map(|q| q.contains(self.id))
            .unwrap_or(false)
    }
}

impl Cancel for TimerHandle {
    fn cancel(&self) {
        TimerHandle::cancel(self);
    }
}

/// Holds at most one live timer for one logical trigger
///
/// Arming cancels whatever was armed before, so there are never two live
/// timers for the same "is X currently pending" concept. Slots are cheap
/// to clone; clones share the same cell.
#[derive(Clone, Default)]
pub struct TimerSlot {
    inner: Arc<Mutex<Option<TimerHandle>>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the armed timer, cancelling the previous one
    pub fn arm(&self, handle: TimerHandle) {
        let previous = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Cancel and forget the armed timer, if any
    pub fn cancel(&self) {
        if let Some(handle) = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.cancel();
        }
    }

    /// Forget the armed timer without cancelling; fired callbacks call
    /// this on their own slot
    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_armed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Cancel for TimerSlot {
    fn cancel(&self) {
        TimerSlot::cancel(self);
    }
}
