//! Activation and exit accounting for one code package.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Run statistics of one code package across its instances.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunStats {
    /// Exit code of the most recent instance.
    pub last_exit_code: u32,
    /// When the most recent activation was attempted.
    pub last_activation_time: Option<DateTime<Utc>>,
    /// When an activation last succeeded.
    pub last_successful_activation_time: Option<DateTime<Utc>>,
    /// When an instance last exited.
    pub last_exit_time: Option<DateTime<Utc>>,
    /// When an instance last exited successfully.
    pub last_successful_exit_time: Option<DateTime<Utc>>,
    /// Total activation attempts.
    pub activation_count: u64,
    /// Total failed activation attempts.
    pub activation_failure_count: u64,
    /// Failed activations since the last success.
    pub continuous_activation_failure_count: u32,
    /// Total instance exits.
    pub exit_count: u64,
    /// Total failing exits.
    pub exit_failure_count: u64,
    /// Failing exits since the last successful exit.
    pub continuous_exit_failure_count: u32,
}

impl RunStats {
    /// Account one activation attempt.
    pub fn update_activation_stats(&mut self, success: bool) {
        self.last_activation_time = Some(Utc::now());
        self.activation_count += 1;

        if success {
            self.last_successful_activation_time = self.last_activation_time;
            self.continuous_activation_failure_count = 0;
        } else {
            self.activation_failure_count += 1;
            self.continuous_activation_failure_count += 1;
        }
    }

    /// Account one instance exit.
    ///
    /// An instance that stayed alive longer than `reset_interval` resets the
    /// continuous exit-failure counter even when its exit code is a failure.
    pub fn update_exit_stats(&mut self, exit_code: u32, reset_interval: Duration) {
        self.last_exit_code = exit_code;
        self.last_exit_time = Some(Utc::now());
        self.exit_count += 1;

        if hosting_model::is_successful_exit(exit_code) {
            self.last_successful_exit_time = self.last_exit_time;
            self.continuous_exit_failure_count = 0;
            return;
        }

        let alive_long_enough = match self.last_activation_time {
            Some(activated) => {
                Utc::now() - activated
                    > ChronoDuration::from_std(reset_interval)
                        .unwrap_or_else(|_| ChronoDuration::MAX)
            }
            None => false,
        };

        if alive_long_enough {
            self.continuous_exit_failure_count = 0;
        } else {
            self.continuous_exit_failure_count += 1;
        }

        self.exit_failure_count += 1;
    }

    /// The larger of the two continuous failure counters; compared against
    /// the continuous-failure cap.
    pub fn max_continuous_failure_count(&self) -> u32 {
        self.continuous_exit_failure_count
            .max(self.continuous_activation_failure_count)
    }

    /// Combined continuous failures used for backoff.
    pub fn continuous_failure_count(&self) -> u32 {
        self.continuous_exit_failure_count + self.continuous_activation_failure_count
    }

    /// Delay until the next activation is due.
    ///
    /// Failure-free periodic packages run at the next multiple of
    /// `run_interval` after the last activation; any failure switches even a
    /// periodic package to the bounded backoff `min(cap, base * failures)`.
    /// A package never activated is due immediately.
    pub fn due_time(&self, run_interval: Duration, base: Duration, cap: Duration) -> Duration {
        if self.activation_count == 0 {
            return Duration::ZERO;
        }

        let failures = self.continuous_failure_count();
        if failures == 0 {
            if run_interval.is_zero() {
                return Duration::ZERO;
            }
            let Some(last) = self.last_activation_time else {
                return Duration::ZERO;
            };
            let interval = match ChronoDuration::from_std(run_interval) {
                Ok(interval) => interval,
                Err(_) => return Duration::ZERO,
            };
            let now = Utc::now();
            let mut next = last + interval;
            while next < now {
                next += interval;
            }
            return (next - now).to_std().unwrap_or(Duration::ZERO);
        }

        base.saturating_mul(failures).min(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hosting_model::PROCESS_DEACTIVATE_EXIT_CODE;

    const RESET: Duration = Duration::from_secs(300);

    #[test]
    fn test_activation_accounting() {
        let mut stats = RunStats::default();
        stats.update_activation_stats(false);
        stats.update_activation_stats(false);
        assert_eq!(stats.activation_count, 2);
        assert_eq!(stats.continuous_activation_failure_count, 2);

        stats.update_activation_stats(true);
        assert_eq!(stats.activation_count, 3);
        assert_eq!(stats.continuous_activation_failure_count, 0);
        assert_eq!(stats.activation_failure_count, 2);
    }

    #[test]
    fn test_successful_exit_codes_reset_continuous_count() {
        let mut stats = RunStats::default();
        stats.update_activation_stats(true);
        stats.update_exit_stats(1, RESET);
        stats.update_exit_stats(1, RESET);
        assert_eq!(stats.continuous_exit_failure_count, 2);

        stats.update_exit_stats(PROCESS_DEACTIVATE_EXIT_CODE, RESET);
        assert_eq!(stats.continuous_exit_failure_count, 0);
        assert_eq!(stats.exit_failure_count, 2);
        assert_eq!(stats.exit_count, 3);
    }

    #[test]
    fn test_long_lived_instance_resets_on_failure_exit() {
        let mut stats = RunStats {
            continuous_exit_failure_count: 5,
            ..Default::default()
        };
        // Activated well before the reset interval ago.
        stats.last_activation_time = Some(Utc::now() - ChronoDuration::seconds(3_600));
        stats.activation_count = 6;

        stats.update_exit_stats(1, RESET);
        assert_eq!(stats.continuous_exit_failure_count, 0);
        assert_eq!(stats.last_exit_code, 1);
    }

    #[test]
    fn test_due_time_first_activation_is_immediate() {
        let stats = RunStats::default();
        assert_eq!(
            stats.due_time(Duration::ZERO, Duration::from_secs(5), Duration::from_secs(300)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_due_time_backoff_is_bounded() {
        let mut stats = RunStats::default();
        stats.update_activation_stats(false);
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(300);
        assert_eq!(stats.due_time(Duration::ZERO, base, cap), base);

        stats.continuous_activation_failure_count = 1_000;
        assert_eq!(stats.due_time(Duration::ZERO, base, cap), cap);
    }

    #[test]
    fn test_due_time_periodic_schedules_next_multiple() {
        let mut stats = RunStats::default();
        stats.activation_count = 1;
        stats.last_activation_time = Some(Utc::now() - ChronoDuration::seconds(90));

        let due = stats.due_time(
            Duration::from_secs(60),
            Duration::from_secs(5),
            Duration::from_secs(300),
        );
        // Next multiple after 90s into a 60s cadence is 30s away.
        assert!(due > Duration::from_secs(25) && due <= Duration::from_secs(30));
    }
}
