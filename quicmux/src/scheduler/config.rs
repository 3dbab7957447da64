use serde::{Deserialize, Serialize};

/// Longest the OS timer is ever parked for, idle or not.
pub const MAX_IDLE_TIMER_SECS: u64 = 86_400;

/// Alarm scheduler tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Consecutive premature wake-ups tolerated per alarm before it is fired
    /// regardless of the clock.
    ///
    /// **Default:** 3
    pub max_premature_rearms: u32,

    /// How far ahead the OS timer is parked while no alarm is scheduled.
    ///
    /// **Default:** 3600 seconds, at most [`MAX_IDLE_TIMER_SECS`]
    pub idle_timer_secs: u64,

    /// Alarms due within this window of the current time are fired in the
    /// same batch. Zero disables coalescing.
    ///
    /// **Default:** 0 microseconds
    pub coalesce_window_us: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_premature_rearms: 3,
            idle_timer_secs: 3600,
            coalesce_window_us: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.idle_timer_secs == 0 {
            errors.push("scheduler.idle_timer_secs must be > 0".to_string());
        }
        if self.idle_timer_secs > MAX_IDLE_TIMER_SECS {
            errors.push(format!(
                "scheduler.idle_timer_secs must be <= {} (1 day)",
                MAX_IDLE_TIMER_SECS
            ));
        }
        if self.coalesce_window_us > 1_000_000 {
            errors.push("scheduler.coalesce_window_us must be <= 1000000 (1 s)".to_string());
        }
        if self.max_premature_rearms > 1000 {
            errors.push("scheduler.max_premature_rearms is unreasonably high (> 1000)".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
