use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

/// Sentinel for [`BackendOptions::backend_cpu_affinity`] meaning "do not pin".
pub const NO_CPU_AFFINITY: u16 = u16::MAX;

/// Callback receiving every internal warning or error line the worker emits.
pub type ErrorNotifier = Arc<dyn Fn(&str) + Send + Sync>;

/// Configuration of the backend worker thread.
///
/// All options have usable defaults; `Backend::start` validates and
/// normalizes them before the worker thread is spawned. Violating the
/// `sleep_duration <= rdtsc_resync_interval` constraint is the one fatal
/// configuration error.
#[derive(Clone)]
pub struct BackendOptions {
    /// CPU to pin the worker thread to, [`NO_CPU_AFFINITY`] to leave it alone.
    pub backend_cpu_affinity: u16,
    /// OS name of the worker thread. Truncated to the platform limit.
    pub thread_name: String,
    /// Upper bound of the idle wait. Zero selects yield/spin behaviour, see
    /// [`BackendOptions::enable_yield_when_idle`].
    pub sleep_duration: Duration,
    /// How often the TSC clock is recalibrated against the wall clock.
    pub rdtsc_resync_interval: Duration,
    /// Below this many cached events the worker processes a single event per
    /// cycle and returns to draining the producer queues.
    pub transit_events_soft_limit: u32,
    /// Per-producer cap of cached events per drain; prevents one chatty
    /// producer from starving the rest.
    pub transit_events_hard_limit: u32,
    /// Initial slot count of each producer's transit-event ring.
    pub transit_event_buffer_initial_capacity: u32,
    /// Cap per-cycle queue visibility at the cycle start time so that emitted
    /// timestamps are non-decreasing across producers.
    pub enable_strict_log_timestamp_order: bool,
    /// Drain every queue and ring before the worker exits.
    pub wait_for_queues_to_empty_before_exit: bool,
    /// With a zero `sleep_duration`, yield instead of spinning when idle.
    pub enable_yield_when_idle: bool,
    /// Receives dropped-message reports, reallocation notices, formatting
    /// and sink errors. Defaults to stderr.
    pub error_notifier: ErrorNotifier,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            backend_cpu_affinity: NO_CPU_AFFINITY,
            thread_name: "inkwire-backend".to_string(),
            sleep_duration: Duration::from_micros(500),
            rdtsc_resync_interval: Duration::from_millis(500),
            transit_events_soft_limit: 800,
            transit_events_hard_limit: 2500,
            transit_event_buffer_initial_capacity: 128,
            enable_strict_log_timestamp_order: true,
            wait_for_queues_to_empty_before_exit: true,
            enable_yield_when_idle: false,
            error_notifier: Arc::new(|msg| eprintln!("{msg}")),
        }
    }
}

impl BackendOptions {
    /// Checks the fatal constraints and coerces nonsensical limits.
    ///
    /// A limit of zero would make the worker unable to process anything, so
    /// both transit-event limits are raised to one instead of failing.
    pub(crate) fn validated(mut self) -> Result<Self, ConfigError> {
        if self.thread_name.is_empty() {
            return Err(ConfigError::EmptyThreadName);
        }

        if self.sleep_duration > self.rdtsc_resync_interval {
            return Err(ConfigError::SleepExceedsResyncInterval {
                sleep_us: self.sleep_duration.as_micros(),
                resync_us: self.rdtsc_resync_interval.as_micros(),
            });
        }

        if self.transit_events_hard_limit == 0 {
            self.transit_events_hard_limit = 1;
        }

        if self.transit_events_soft_limit == 0 {
            self.transit_events_soft_limit = 1;
        }

        Ok(self)
    }

    pub(crate) fn notify_error(&self, msg: &str) {
        (self.error_notifier)(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let opts = BackendOptions::default().validated().unwrap();
        assert_eq!(opts.backend_cpu_affinity, NO_CPU_AFFINITY);
        assert!(opts.enable_strict_log_timestamp_order);
        assert!(opts.wait_for_queues_to_empty_before_exit);
    }

    #[test]
    fn sleep_longer_than_resync_is_fatal() {
        let opts = BackendOptions {
            sleep_duration: Duration::from_secs(2),
            rdtsc_resync_interval: Duration::from_secs(1),
            ..BackendOptions::default()
        };
        assert!(matches!(
            opts.validated(),
            Err(ConfigError::SleepExceedsResyncInterval { .. })
        ));
    }

    #[test]
    fn zero_limits_are_coerced_to_one() {
        let opts = BackendOptions {
            transit_events_soft_limit: 0,
            transit_events_hard_limit: 0,
            ..BackendOptions::default()
        };
        let opts = opts.validated().unwrap();
        assert_eq!(opts.transit_events_soft_limit, 1);
        assert_eq!(opts.transit_events_hard_limit, 1);
    }

    #[test]
    fn empty_thread_name_is_rejected() {
        let opts = BackendOptions {
            thread_name: String::new(),
            ..BackendOptions::default()
        };
        assert!(matches!(opts.validated(), Err(ConfigError::EmptyThreadName)));
    }
}
