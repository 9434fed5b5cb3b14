//! Deadline waiting with a coarse sleep and a busy-spin tail.
//!
//! A single OS sleep wakes up anywhere within the scheduler's resolution
//! after the requested time. To hit a deadline with microsecond accuracy
//! the waiter sleeps until `threshold` before the deadline, then polls the
//! clock until the deadline passes.
//!
//! ```text
//!  start                      target - threshold   target
//!    |------------ sleep ------------|~~~ spin ~~~~|
//! ```

use fsk_common::config::WaiterConfig;
use fsk_common::time::Timestamp;
use std::time::{Duration, Instant};
use tracing::trace;

/// Default remaining time below which the waiter does not sleep.
pub const DEFAULT_SLEEP_THRESHOLD: Duration = Duration::from_micros(20);

/// Monotonic time source used by the waiter.
pub trait Clock {
    /// Current time.
    fn now(&self) -> Timestamp;

    /// Suspend the calling thread for roughly `duration`.
    ///
    /// May return early (e.g. when interrupted by a signal); the waiter
    /// tolerates this because it spins for the remainder.
    fn sleep(&self, duration: Duration);
}

/// `CLOCK_MONOTONIC` clock with `clock_nanosleep` sleeps.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose timestamps count from now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        let nanos = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        Timestamp::from_nanos(nanos)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[allow(unsafe_code)]
    fn sleep(&self, duration: Duration) {
        // Always < 1_000_000_000, fits every c_long.
        #[allow(clippy::cast_possible_wrap)]
        let nanos = duration.subsec_nanos() as libc::c_long;
        let request = libc::timespec {
            tv_sec: libc::time_t::try_from(duration.as_secs()).unwrap_or(libc::time_t::MAX),
            tv_nsec: nanos,
        };
        // SAFETY: `request` is a valid timespec; the remainder pointer may be null.
        let rc = unsafe {
            libc::clock_nanosleep(libc::CLOCK_MONOTONIC, 0, &request, std::ptr::null_mut())
        };
        if rc != 0 {
            // EINTR is not retried; the spin phase covers the rest.
            trace!(rc, "clock_nanosleep returned early");
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// How a call to [`DeadlineWaiter::wait_until`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The target was already in the past; nothing was waited.
    AlreadyPassed,
    /// The target was reached.
    Reached {
        /// Whether the coarse sleep phase ran.
        slept: bool,
    },
    /// The clock went backwards past the wait's start; spinning stopped.
    ClockRegressed,
}

/// Blocks the caller until a target timestamp.
#[derive(Debug, Clone)]
pub struct DeadlineWaiter<C: Clock = MonotonicClock> {
    clock: C,
    sleep_threshold: Duration,
}

impl DeadlineWaiter<MonotonicClock> {
    /// Create a waiter on the monotonic clock with the default threshold.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::new(), DEFAULT_SLEEP_THRESHOLD)
    }

    /// Create a waiter on the monotonic clock from configuration.
    #[must_use]
    pub fn from_config(config: &WaiterConfig) -> Self {
        Self::with_clock(MonotonicClock::new(), config.sleep_threshold)
    }
}

impl Default for DeadlineWaiter<MonotonicClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> DeadlineWaiter<C> {
    /// Create a waiter on an arbitrary clock.
    pub fn with_clock(clock: C, sleep_threshold: Duration) -> Self {
        Self {
            clock,
            sleep_threshold,
        }
    }

    /// The underlying clock.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Remaining time below which the waiter only spins.
    pub fn sleep_threshold(&self) -> Duration {
        self.sleep_threshold
    }

    /// Current time on the waiter's clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Block until `target`.
    ///
    /// Returns immediately if `target` is not in the future. Otherwise sleeps
    /// for `remaining - threshold` if that is positive, then spins until the
    /// clock reaches `target`. The spin also stops if the clock reads earlier
    /// than the start of the wait, so a non-monotonic clock cannot hang the
    /// caller.
    pub fn wait_until(&self, target: Timestamp) -> WaitOutcome {
        let start = self.clock.now();
        let Some(remaining) = target.checked_duration_since(start).filter(|d| !d.is_zero())
        else {
            return WaitOutcome::AlreadyPassed;
        };

        let slept = remaining > self.sleep_threshold;
        if slept {
            self.clock.sleep(remaining - self.sleep_threshold);
        }

        loop {
            let now = self.clock.now();
            if now < start {
                return WaitOutcome::ClockRegressed;
            }
            if now >= target {
                return WaitOutcome::Reached { slept };
            }
            std::hint::spin_loop();
        }
    }

    /// Block for `duration` from now.
    pub fn wait_for(&self, duration: Duration) -> WaitOutcome {
        self.wait_until(self.clock.now() + duration)
    }
}


#[cfg(test)]
mod tests {
    use super::manual_clock::ManualClock;
    use super::*;

    fn waiter(clock: ManualClock) -> DeadlineWaiter<ManualClock> {
        DeadlineWaiter::with_clock(clock, Duration::from_micros(20))
    }

    #[test]
    fn test_past_target_returns_immediately() {
        let w = waiter(ManualClock::starting_at(5_000, 1));
        let outcome = w.wait_until(Timestamp::from_nanos(1_000));

        assert_eq!(outcome, WaitOutcome::AlreadyPassed);
        assert!(w.clock().sleeps.borrow().is_empty());
        assert_eq!(w.clock().reads.get(), 1);
    }

    #[test]
    fn test_current_target_returns_immediately() {
        let w = waiter(ManualClock::starting_at(5_000, 1));
        assert_eq!(
            w.wait_until(Timestamp::from_nanos(5_000)),
            WaitOutcome::AlreadyPassed
        );
    }

    #[test]
    fn test_long_wait_sleeps_then_spins() {
        let w = waiter(ManualClock::starting_at(0, 1_000));
        let target = Timestamp::from_nanos(1_000_000);

        let outcome = w.wait_until(target);

        assert_eq!(outcome, WaitOutcome::Reached { slept: true });
        // One coarse sleep leaving exactly the threshold as margin.
        assert_eq!(*w.clock().sleeps.borrow(), vec![Duration::from_micros(980)]);
        // Returned within one clock step of the target.
        let overshoot = w.clock().now_ns.get() - target.as_nanos();
        assert!(overshoot <= 2 * 1_000, "overshoot {overshoot}ns");
    }

    #[test]
    fn test_short_wait_only_spins() {
        let w = waiter(ManualClock::starting_at(0, 500));
        let outcome = w.wait_until(Timestamp::from_nanos(15_000));

        assert_eq!(outcome, WaitOutcome::Reached { slept: false });
        assert!(w.clock().sleeps.borrow().is_empty());
        assert!(w.clock().reads.get() > 2);
    }

    #[test]
    fn test_remaining_equal_to_threshold_does_not_sleep() {
        let w = waiter(ManualClock::starting_at(0, 1_000));
        w.wait_until(Timestamp::from_nanos(20_000));
        assert!(w.clock().sleeps.borrow().is_empty());
    }

    #[test]
    fn test_oversleep_is_not_compensated() {
        let mut clock = ManualClock::starting_at(0, 1_000);
        clock.oversleep_ns = 50_000;
        let w = waiter(clock);

        let outcome = w.wait_until(Timestamp::from_nanos(1_000_000));

        // The sleep overshot past the target, so the spin exits on first read.
        assert_eq!(outcome, WaitOutcome::Reached { slept: true });
        assert_eq!(w.clock().reads.get(), 2);
    }

    #[test]
    fn test_regressing_clock_stops_spin() {
        let mut clock = ManualClock::starting_at(10_000_000, 1);
        clock.regress_on_sleep = true;
        let w = waiter(clock);

        let outcome = w.wait_until(Timestamp::from_nanos(20_000_000));
        assert_eq!(outcome, WaitOutcome::ClockRegressed);
    }

    #[test]
    fn test_wait_for_is_relative() {
        let w = waiter(ManualClock::starting_at(7_000, 1_000));
        assert_eq!(
            w.wait_for(Duration::from_micros(100)),
            WaitOutcome::Reached { slept: true }
        );
        assert!(w.clock().now_ns.get() >= 107_000);
    }

    #[test]
    fn test_monotonic_clock_wait() {
        let w = DeadlineWaiter::new();
        let requested = Duration::from_millis(2);

        let start = Instant::now();
        let outcome = w.wait_for(requested);
        let elapsed = start.elapsed();

        assert!(matches!(outcome, WaitOutcome::Reached { .. }));
        assert!(elapsed >= requested, "returned early after {elapsed:?}");
        // Generous bound for loaded CI machines.
        assert!(elapsed < requested + Duration::from_millis(100), "{elapsed:?}");
    }

    #[test]
    fn test_monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let mut prev = clock.now();
        for _ in 0..1_000 {
            let now = clock.now();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn test_from_config() {
        let config = WaiterConfig {
            sleep_threshold: Duration::from_micros(75),
        };
        let w = DeadlineWaiter::from_config(&config);
        assert_eq!(w.sleep_threshold(), Duration::from_micros(75));
    }
}
