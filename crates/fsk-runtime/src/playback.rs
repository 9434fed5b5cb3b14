//! Delay sequence playback.
//!
//! Drives a [`LevelSink`] through a [`DelaySequence`], waiting for each
//! transition's absolute deadline so that waiting errors do not accumulate
//! across the stream.

use crate::wait::{Clock, DeadlineWaiter, MonotonicClock, WaitOutcome};
use fsk_common::config::PlayerConfig;
use fsk_common::error::{FskError, FskResult};
use fsk_encoder::{DelaySequence, SignalLevel};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Receives signal level changes.
pub trait LevelSink {
    /// Put the line at `level`.
    ///
    /// # Errors
    ///
    /// Implementations return [`FskError::Sink`] if the level cannot be applied;
    /// playback stops.
    fn set_level(&mut self, level: SignalLevel) -> FskResult<()>;
}

impl<F> LevelSink for F
where
    F: FnMut(SignalLevel) -> FskResult<()>,
{
    fn set_level(&mut self, level: SignalLevel) -> FskResult<()> {
        self(level)
    }
}

/// Timing summary of one playback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackReport {
    /// Number of delays played.
    pub delays: usize,
    /// Number of level transitions issued after the initial level.
    pub transitions: usize,
    /// Sum of all delays.
    pub expected_ns: u64,
    /// Wall time from the initial level to the end of the last delay.
    pub elapsed_ns: u64,
    /// Worst observed lateness of a transition past its deadline.
    pub max_lateness_ns: u64,
    /// Deadlines that had already passed when the wait began.
    pub missed_deadlines: usize,
    /// Waits cut short by a backwards clock.
    pub clock_regressions: usize,
}

/// Plays delay sequences against a clock.
#[derive(Debug, Clone)]
pub struct Player<C: Clock = MonotonicClock> {
    waiter: DeadlineWaiter<C>,
    tick: Duration,
}

impl Player<MonotonicClock> {
    /// Player on the monotonic clock, configured from `config`.
    #[must_use]
    pub fn from_config(config: &PlayerConfig) -> Self {
        Self::new(DeadlineWaiter::from_config(&config.waiter), config.tick)
    }
}

impl<C: Clock> Player<C> {
    /// Player using `waiter`, with one delay unit lasting `tick`.
    pub fn new(waiter: DeadlineWaiter<C>, tick: Duration) -> Self {
        Self { waiter, tick }
    }

    /// Duration of one delay unit.
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// The waiter used between transitions.
    pub fn waiter(&self) -> &DeadlineWaiter<C> {
        &self.waiter
    }

    /// Play `seq` into `sink`.
    ///
    /// The sink is set to [`SignalLevel::Space`] immediately, then flipped
    /// at the end of every delay except the last; the line is left at
    /// [`SignalLevel::Mark`] (the final stop bit) once the last delay has
    /// elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`FskError::InvalidInput`] for an empty sequence or one whose
    /// total duration does not fit the clock's nanosecond range, and
    /// propagates sink errors.
    pub fn play<K>(&self, seq: &DelaySequence, sink: &mut K) -> FskResult<PlaybackReport>
    where
        K: LevelSink + ?Sized,
    {
        if seq.is_empty() {
            return Err(FskError::InvalidInput("cannot play an empty sequence".into()));
        }

        let total_ns = self
            .tick
            .as_nanos()
            .checked_mul(u128::from(seq.total_ticks()))
            .and_then(|ns| u64::try_from(ns).ok())
            .ok_or_else(|| {
                FskError::InvalidInput(format!(
                    "{} ticks of {:?} exceed the clock range",
                    seq.total_ticks(),
                    self.tick
                ))
            })?;

        let mut report = PlaybackReport {
            delays: seq.len(),
            ..PlaybackReport::default()
        };
        let last = seq.len() - 1;

        let start = self.waiter.now();
        let mut deadline = start;
        sink.set_level(SignalLevel::Space)?;

        // Every partial sum is bounded by `total_ns`, so the products fit.
        for (i, (level, delay)) in seq.levels().enumerate() {
            deadline += self.tick * u32::from(delay);
            match self.waiter.wait_until(deadline) {
                WaitOutcome::AlreadyPassed => report.missed_deadlines += 1,
                WaitOutcome::ClockRegressed => report.clock_regressions += 1,
                WaitOutcome::Reached { .. } => {}
            }

            if i < last {
                let next = level.flip();
                sink.set_level(next)?;
                report.transitions += 1;
                trace!(%next, delay, "Level transition");
            }

            let lateness = self.waiter.now().saturating_duration_since(deadline);
            report.max_lateness_ns = report.max_lateness_ns.max(as_nanos(lateness));
        }

        report.expected_ns = total_ns;
        report.elapsed_ns = as_nanos(self.waiter.now().saturating_duration_since(start));

        if report.missed_deadlines > 0 || report.clock_regressions > 0 {
            warn!(
                missed = report.missed_deadlines,
                regressions = report.clock_regressions,
                max_lateness_ns = report.max_lateness_ns,
                "Playback timing degraded"
            );
        }
        debug!(?report, "Playback complete");
        Ok(report)
    }
}

fn as_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
