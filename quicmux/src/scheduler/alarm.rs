//! Engine-owned timer state.
//!
//! ```text
//! Idle --set--> Armed --cancel--> Idle
//!                 |
//!                 +--due--> fired --> Idle
//! any --destroy--> Destroyed (terminal)
//! ```

use crate::clock::Timestamp;

/// Core-issued identity of an alarm. Monotonic per shard, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlarmId(pub(crate) u64);

impl AlarmId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for AlarmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque engine-side value handed back when the alarm fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmToken(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Idle,
    Armed,
    Destroyed,
}

/// Outcome of a due alarm being handed to [`Alarm::on_alarm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireDecision {
    /// Deadline reached; invoke the engine.
    Fire(AlarmToken),
    /// Woke before the deadline and the re-arm budget is spent. Fire anyway.
    ForceFire(AlarmToken),
    /// Woke before the deadline; schedule again at this deadline.
    Rearm(Timestamp),
    /// Canceled, destroyed or never set.
    Skip,
}

#[derive(Debug, Clone)]
pub struct Alarm {
    token: AlarmToken,
    deadline: Option<Timestamp>,
    canceled: bool,
    destroyed: bool,
    premature_rearms: u32,
}

impl Alarm {
    pub fn new(token: AlarmToken) -> Self {
        Self {
            token,
            deadline: None,
            canceled: false,
            destroyed: false,
            premature_rearms: 0,
        }
    }

    pub fn token(&self) -> AlarmToken {
        self.token
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn premature_rearms(&self) -> u32 {
        self.premature_rearms
    }

    pub fn state(&self) -> AlarmState {
        if self.destroyed {
            AlarmState::Destroyed
        } else if self.deadline.is_some() && !self.canceled {
            AlarmState::Armed
        } else {
            AlarmState::Idle
        }
    }

    /// Record a new deadline. Returns `false` for a destroyed alarm, in which
    /// case nothing must be scheduled.
    pub fn set_impl(&mut self, deadline: Timestamp) -> bool {
        if self.destroyed {
            return false;
        }
        self.canceled = false;
        self.deadline = Some(deadline);
        self.premature_rearms = 0;
        true
    }

    /// Mark canceled. Idempotent. Returns `false` for a destroyed alarm.
    pub fn cancel_impl(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        self.canceled = true;
        self.deadline = None;
        true
    }

    /// Decide what a due alarm does at `now`.
    pub fn on_alarm(&mut self, now: Timestamp, max_premature_rearms: u32) -> FireDecision {
        if self.destroyed || self.canceled {
            return FireDecision::Skip;
        }
        let Some(deadline) = self.deadline else {
            return FireDecision::Skip;
        };

        if now < deadline {
            if self.premature_rearms < max_premature_rearms {
                self.premature_rearms += 1;
                return FireDecision::Rearm(deadline);
            }
            self.fired();
            return FireDecision::ForceFire(self.token);
        }

        self.fired();
        FireDecision::Fire(self.token)
    }

    /// Enter the terminal state. Returns `true` the first time only.
    pub fn destroy(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        self.cancel_impl();
        self.destroyed = true;
        true
    }

    fn fired(&mut self) {
        self.deadline = None;
        self.premature_rearms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(us: i64) -> Timestamp {
        Timestamp::from_micros(us)
    }

    #[test]
    fn test_set_then_fire_returns_to_idle() {
        let mut alarm = Alarm::new(AlarmToken(9));
        assert_eq!(alarm.state(), AlarmState::Idle);

        assert!(alarm.set_impl(ts(100)));
        assert_eq!(alarm.state(), AlarmState::Armed);

        assert_eq!(alarm.on_alarm(ts(100), 3), FireDecision::Fire(AlarmToken(9)));
        assert_eq!(alarm.state(), AlarmState::Idle);
        assert_eq!(alarm.deadline(), None);
    }

    #[test]
    fn test_cancel_twice_equals_cancel_once() {
        let mut once = Alarm::new(AlarmToken(1));
        once.set_impl(ts(50));
        once.cancel_impl();

        let mut twice = Alarm::new(AlarmToken(1));
        twice.set_impl(ts(50));
        twice.cancel_impl();
        twice.cancel_impl();

        assert_eq!(once.state(), twice.state());
        assert_eq!(once.deadline(), twice.deadline());
        assert_eq!(once.is_canceled(), twice.is_canceled());
    }

    #[test]
    fn test_set_clears_cancel_flag() {
        let mut alarm = Alarm::new(AlarmToken(1));
        alarm.set_impl(ts(10));
        alarm.cancel_impl();
        assert!(alarm.is_canceled());

        alarm.set_impl(ts(20));
        assert!(!alarm.is_canceled());
        assert_eq!(alarm.state(), AlarmState::Armed);
    }

    #[test]
    fn test_canceled_alarm_skips_on_fire() {
        let mut alarm = Alarm::new(AlarmToken(1));
        alarm.set_impl(ts(10));
        alarm.cancel_impl();
        assert_eq!(alarm.on_alarm(ts(20), 3), FireDecision::Skip);
    }

    #[test]
    fn test_premature_wake_rearms_until_budget_spent() {
        let mut alarm = Alarm::new(AlarmToken(4));
        alarm.set_impl(ts(100));

        assert_eq!(alarm.on_alarm(ts(90), 2), FireDecision::Rearm(ts(100)));
        assert_eq!(alarm.on_alarm(ts(95), 2), FireDecision::Rearm(ts(100)));
        assert_eq!(alarm.premature_rearms(), 2);
        assert_eq!(alarm.on_alarm(ts(99), 2), FireDecision::ForceFire(AlarmToken(4)));
        assert_eq!(alarm.premature_rearms(), 0);
        assert_eq!(alarm.state(), AlarmState::Idle);
    }

    #[test]
    fn test_destroyed_alarm_ignores_set_and_cancel() {
        let mut alarm = Alarm::new(AlarmToken(1));
        alarm.set_impl(ts(10));
        assert!(alarm.destroy());
        assert!(!alarm.destroy());

        assert_eq!(alarm.state(), AlarmState::Destroyed);
        assert!(!alarm.set_impl(ts(30)));
        assert!(!alarm.cancel_impl());
        assert_eq!(alarm.on_alarm(ts(40), 3), FireDecision::Skip);
    }
}
