//! Heap-driven alarm scheduler with a single OS timer.
//!
//! Turns any number of per-connection deadlines into one wake-up time: the
//! earliest scheduled deadline. The shard loop sleeps until [`WakeTimer`]
//! fires, then pops every due alarm in one batch and fires them in
//! `(deadline, insertion order)` order.
//!
//! # Contract
//!
//! - Single-threaded: only the owning shard thread calls in.
//! - An alarm must be registered before it is scheduled or canceled, and
//!   unregistered exactly once. Violations panic: they mean the engine and
//!   the core disagree about an alarm's lifetime, and carrying on would
//!   corrupt the heap.
//! - Popping and firing are split (`pop_due`, then the caller fires, then
//!   `finish_tasks`) so callbacks can re-arm alarms without disturbing the
//!   batch being drained.

use super::alarm::AlarmId;
use super::config::{SchedulerConfig, MAX_IDLE_TIMER_SECS};
use super::heap::{AlarmHeap, HeapItem, Registry};
use crate::clock::Timestamp;
use std::time::{Duration, Instant};
use tracing::trace;

/// Upper bound on any single OS timer delay. A deadline further out is
/// reached by re-arming after each wake-up.
const MAX_TIMER_DELAY: Duration = Duration::from_secs(MAX_IDLE_TIMER_SECS);

/// The shard's single OS-level timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeTimer {
    /// Engine-clock time the timer stands for.
    pub deadline: Timestamp,
    /// Wall-clock instant to wake at.
    pub fire_at: Instant,
    /// Bumped on every re-arm; the event loop resets its sleep on change.
    pub generation: u64,
}

pub struct TaskRunner {
    heap: AlarmHeap,
    registry: Registry,
    next_order: u64,
    top_deadline: Option<Timestamp>,
    timer: WakeTimer,
    idle_timer: Duration,
    coalesce_window: Duration,
}

impl TaskRunner {
    pub fn new(config: &SchedulerConfig, now: Timestamp) -> Self {
        let idle_timer = Duration::from_secs(config.idle_timer_secs.clamp(1, MAX_IDLE_TIMER_SECS));
        Self {
            heap: AlarmHeap::new(),
            registry: Registry::default(),
            next_order: 0,
            top_deadline: None,
            timer: WakeTimer {
                deadline: now + idle_timer,
                fire_at: wake_instant(idle_timer),
                generation: 0,
            },
            idle_timer,
            coalesce_window: Duration::from_micros(config.coalesce_window_us),
        }
    }

    /// Create the scheduling record for `alarm`. Not scheduled yet.
    pub fn register_alarm(&mut self, alarm: AlarmId) {
        let previous = self.registry.insert(
            alarm,
            HeapItem {
                deadline: Timestamp::ZERO,
                heap_index: None,
                insertion_order: 0,
            },
        );
        if previous.is_some() {
            panic!("alarm {} registered twice", alarm);
        }
    }

    /// Schedule `alarm` at `deadline`, or move it if already scheduled.
    pub fn run_alarm(&mut self, alarm: AlarmId, deadline: Timestamp, now: Timestamp) {
        let order = self.next_order;
        self.next_order += 1;

        let item = self.item_mut(alarm);
        item.deadline = deadline;
        item.insertion_order = order;
        let index = item.heap_index;

        match index {
            None => self.heap.push(&mut self.registry, alarm),
            Some(i) => self.heap.fix(&mut self.registry, i),
        }
        trace!(alarm = %alarm, deadline = deadline.as_micros(), "alarm scheduled");
        self.refresh_timer(now);
    }

    /// Take `alarm` out of the heap if it is scheduled. Idempotent.
    pub fn cancel_alarm(&mut self, alarm: AlarmId, now: Timestamp) {
        if let Some(index) = self.item_mut(alarm).heap_index {
            self.heap.remove(&mut self.registry, index);
            self.refresh_timer(now);
        }
    }

    /// Cancel and drop the scheduling record. Must be called exactly once.
    pub fn unregister_alarm(&mut self, alarm: AlarmId, now: Timestamp) {
        self.cancel_alarm(alarm, now);
        self.registry.remove(&alarm);
    }

    /// Pop every alarm due at `now` (plus the coalescing window), earliest
    /// first. The caller fires them, then calls [`finish_tasks`].
    ///
    /// [`finish_tasks`]: TaskRunner::finish_tasks
    pub fn pop_due(&mut self, now: Timestamp) -> Vec<AlarmId> {
        let horizon = now + self.coalesce_window;
        let mut due = Vec::new();
        while let Some((_, deadline)) = self.heap.peek() {
            if deadline > horizon {
                break;
            }
            match self.heap.pop(&mut self.registry) {
                Some(alarm) => due.push(alarm),
                None => break,
            }
        }
        due
    }

    /// Re-arm the OS timer after a batch. Always bumps the timer generation,
    /// since the timer that triggered the batch has expired.
    pub fn finish_tasks(&mut self, now: Timestamp) {
        self.top_deadline = self.heap.peek().map(|(_, d)| d);
        if self.top_deadline.is_some() {
            self.reset_timer(now);
        } else {
            self.arm(now + self.idle_timer, self.idle_timer);
        }
    }

    /// Point the OS timer at the heap top: `max(0, top - now)` from now.
    /// No-op on an empty heap; the timer stays where it was.
    pub fn reset_timer(&mut self, now: Timestamp) {
        if let Some((_, top)) = self.heap.peek() {
            let delay = top.saturating_duration_since(now);
            self.arm(top, delay);
        }
    }

    pub fn timer(&self) -> WakeTimer {
        self.timer
    }

    pub fn top_deadline(&self) -> Option<Timestamp> {
        self.top_deadline
    }

    pub fn is_registered(&self, alarm: AlarmId) -> bool {
        self.registry.contains_key(&alarm)
    }

    /// True while `alarm` sits in the heap. False for unregistered alarms.
    pub fn is_scheduled(&self, alarm: AlarmId) -> bool {
        self.registry
            .get(&alarm)
            .map_or(false, |item| item.heap_index.is_some())
    }

    /// Deadline snapshot of a scheduled alarm.
    pub fn scheduled_deadline(&self, alarm: AlarmId) -> Option<Timestamp> {
        self.registry
            .get(&alarm)
            .filter(|item| item.heap_index.is_some())
            .map(|item| item.deadline)
    }

    /// Number of scheduled alarms.
    pub fn scheduled_len(&self) -> usize {
        self.heap.len()
    }

    /// Number of registered alarms.
    pub fn registered_len(&self) -> usize {
        self.registry.len()
    }

    fn refresh_timer(&mut self, now: Timestamp) {
        let top = self.heap.peek().map(|(_, d)| d);
        if top != self.top_deadline {
            self.top_deadline = top;
            self.reset_timer(now);
        }
    }

    fn arm(&mut self, deadline: Timestamp, delay: Duration) {
        self.timer = WakeTimer {
            deadline,
            fire_at: wake_instant(delay),
            generation: self.timer.generation.wrapping_add(1),
        };
    }

    fn item_mut(&mut self, alarm: AlarmId) -> &mut HeapItem {
        match self.registry.get_mut(&alarm) {
            Some(item) => item,
            None => panic!("alarm {} used without being registered", alarm),
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        self.heap.assert_consistent(&self.registry);
        if let Some((_, top)) = self.heap.peek() {
            assert!(
                self.timer.deadline <= top,
                "timer at {:?} is later than heap top {:?}",
                self.timer.deadline,
                top
            );
        }
    }
}

/// `now + delay` on the OS clock, never overflowing.
fn wake_instant(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(MAX_TIMER_DELAY))
        .or_else(|| now.checked_add(Duration::from_secs(1)))
        .unwrap_or(now)
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("scheduled", &self.heap.len())
            .field("registered", &self.registry.len())
            .field("top_deadline", &self.top_deadline)
            .field("timer", &self.timer)
            .finish()
    }
}
