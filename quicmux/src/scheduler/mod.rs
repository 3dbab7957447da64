//! Per-shard alarm scheduling.
//!
//! # Architecture
//!
//! - **Alarm**: engine-owned timer state (deadline, cancel and destroy
//!   flags). Lives in the shard context's alarm table.
//! - **TaskRunner**: one per shard. Keeps a non-owning scheduling record per
//!   registered alarm and an indexed min-heap of the scheduled ones, ordered
//!   by `(deadline, insertion order)`.
//! - **WakeTimer**: the single OS-level timer. It tracks the heap top only;
//!   the shard loop re-arms its tokio `Sleep` whenever the timer's generation
//!   changes.
//!
//! All of it runs on the shard thread. There is no locking here.

pub mod alarm;
pub mod config;
mod heap;
pub mod task_runner;


pub use alarm::{Alarm, AlarmId, AlarmState, AlarmToken, FireDecision};
pub use config::{SchedulerConfig, MAX_IDLE_TIMER_SECS};
pub use task_runner::{TaskRunner, WakeTimer};
