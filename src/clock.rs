//! TSC-based timestamping: a calibrated linear map from the CPU timestamp
//! counter to nanoseconds since the Unix epoch.
//!
//! The worker creates the clock lazily on the first TSC-tagged record and
//! recalibrates the offset on its resync cadence; producers only ever read
//! the raw counter. Targets without a TSC fall back to the system clock, in
//! which case the map degenerates to identity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Raw counter read. Cheap and unordered; calibration absorbs the skew.
#[cfg(target_arch = "x86_64")]
pub(crate) fn rdtsc() -> u64 {
    // SAFETY: RDTSC has no preconditions.
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
pub(crate) fn rdtsc() -> u64 {
    wall_clock_ns()
}

pub(crate) fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Copy)]
struct Calibration {
    base_tsc: u64,
    base_ns: u64,
}

struct Sample {
    tsc: u64,
    wall_ns: u64,
    latency_ticks: u64,
}

/// Takes one `(tsc, wall)` pair, bracketing the wall read so the pair's
/// measurement latency is known.
fn sample_pair() -> Sample {
    let t0 = rdtsc();
    let wall_ns = wall_clock_ns();
    let t1 = rdtsc();
    Sample {
        tsc: t0 + (t1.wrapping_sub(t0)) / 2,
        wall_ns,
        latency_ticks: t1.wrapping_sub(t0),
    }
}

fn best_of(tries: u32) -> Sample {
    let mut best = sample_pair();
    for _ in 1..tries {
        let s = sample_pair();
        if s.latency_ticks < best.latency_ticks {
            best = s;
        }
    }
    best
}

pub(crate) struct TscClock {
    ns_per_tick: f64,
    calibration: Mutex<Calibration>,
    /// Clamp so conversions never run backwards for monotone inputs, even
    /// right after a resync nudged the offset down.
    last_ns: AtomicU64,
}

impl TscClock {
    /// Measures the counter frequency against the wall clock and records the
    /// initial offset. Spends a few milliseconds spinning; only the worker
    /// ever constructs one.
    pub(crate) fn new() -> Self {
        let first = best_of(8);
        let deadline = Instant::now() + Duration::from_millis(10);
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
        let second = best_of(8);

        let dticks = second.tsc.wrapping_sub(first.tsc);
        let dns = second.wall_ns.saturating_sub(first.wall_ns);
        let ns_per_tick = if dticks == 0 {
            1.0
        } else {
            dns as f64 / dticks as f64
        };

        Self {
            ns_per_tick,
            calibration: Mutex::new(Calibration {
                base_tsc: second.tsc,
                base_ns: second.wall_ns,
            }),
            last_ns: AtomicU64::new(0),
        }
    }

    /// Refreshes the offset with a pair whose measurement latency is below
    /// `expected_latency_ns`. Returns false when no such pair was obtained,
    /// in which case the caller retries on its next cadence.
    pub(crate) fn resync(&self, expected_latency_ns: u64) -> bool {
        for _ in 0..4 {
            let s = sample_pair();
            let latency_ns = s.latency_ticks as f64 * self.ns_per_tick;
            if latency_ns <= expected_latency_ns as f64 {
                *self.calibration.lock() = Calibration {
                    base_tsc: s.tsc,
                    base_ns: s.wall_ns,
                };
                return true;
            }
        }
        false
    }

    /// Converts a counter value to nanoseconds since the epoch.
    pub(crate) fn time_since_epoch(&self, tsc: u64) -> u64 {
        let cal = *self.calibration.lock();
        let dticks = tsc as i128 - cal.base_tsc as i128;
        let ns = cal.base_ns as i128 + (dticks as f64 * self.ns_per_tick) as i128;
        ns.clamp(0, u64::MAX as i128) as u64
    }

    /// Monotone variant used for every converted record timestamp.
    pub(crate) fn time_since_epoch_safe(&self, tsc: u64) -> u64 {
        let ns = self.time_since_epoch(tsc);
        let prev = self.last_ns.fetch_max(ns, Ordering::AcqRel);
        ns.max(prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_tracks_wall_clock() {
        let clock = TscClock::new();
        let converted = clock.time_since_epoch(rdtsc());
        let wall = wall_clock_ns();
        let diff = converted.abs_diff(wall);
        // Calibration error across a fresh clock stays far below a second.
        assert!(diff < 1_000_000_000, "off by {diff} ns");
    }

    #[test]
    fn safe_conversion_is_monotone() {
        let clock = TscClock::new();
        let mut last = 0u64;
        for _ in 0..1000 {
            let ns = clock.time_since_epoch_safe(rdtsc());
            assert!(ns >= last);
            last = ns;
        }
    }

    #[test]
    fn resync_with_generous_latency_allowance_succeeds() {
        let clock = TscClock::new();
        // A millisecond of allowed latency is always attainable.
        assert!(clock.resync(1_000_000));
    }

    #[test]
    fn monotone_across_resync() {
        let clock = TscClock::new();
        let before = clock.time_since_epoch_safe(rdtsc());
        clock.resync(1_000_000);
        let after = clock.time_since_epoch_safe(rdtsc());
        assert!(after >= before);
    }
}
