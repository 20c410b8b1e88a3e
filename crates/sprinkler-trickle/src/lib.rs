//! Sprinkler Trickle -- RFC 6206 adaptive suppression timer.
//!
//! Pure state machine: the caller injects `now` and drives `poll` at
//! `next_deadline`. One timer per channel (control beacons, data bursts).
//! Jitter comes from a seeded RNG so runs are reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Shortest interval we accept. Fire points need room for jitter.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrickleError {
    #[error("interval_min {0:?} is below {MIN_INTERVAL:?}")]
    IntervalTooShort(Duration),
    #[error("interval_min {min:?} exceeds interval_max {max:?}")]
    InvertedBounds { min: Duration, max: Duration },
}

/// Timer parameters for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrickleConfig {
    pub interval_min: Duration,
    pub interval_max: Duration,
    /// Redundancy constant k. 0 disables suppression.
    pub redundancy: u32,
}

impl TrickleConfig {
    pub fn from_millis(min_ms: u64, max_ms: u64, redundancy: u32) -> Self {
        Self {
            interval_min: Duration::from_millis(min_ms),
            interval_max: Duration::from_millis(max_ms),
            redundancy,
        }
    }

    pub fn validate(&self) -> Result<(), TrickleError> {
        if self.interval_min < MIN_INTERVAL {
            return Err(TrickleError::IntervalTooShort(self.interval_min));
        }
        if self.interval_min > self.interval_max {
            return Err(TrickleError::InvertedBounds {
                min: self.interval_min,
                max: self.interval_max,
            });
        }
        Ok(())
    }
}

/// What `poll` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrickleEvent {
    /// Fire point reached with fewer than k consistent observations.
    Transmit,
    /// Fire point reached but the neighbourhood already said enough.
    Suppressed,
    /// Interval over; a new one of the given length has begun.
    IntervalEnded { interval: Duration },
}

#[derive(Debug, Clone, Copy)]
struct Phase {
    start: Instant,
    fire_at: Instant,
    fired: bool,
}

#[derive(Debug)]
pub struct TrickleTimer {
    config: TrickleConfig,
    interval: Duration,
    counter: u32,
    suppressed: bool,
    out_of_cycle_used: bool,
    intervals_started: u64,
    /// None while stopped.
    phase: Option<Phase>,
    rng: StdRng,
}

impl TrickleTimer {
    /// A stopped timer. `reset` starts it.
    pub fn new(config: TrickleConfig, seed: u64) -> Result<Self, TrickleError> {
        config.validate()?;
        Ok(Self {
            config,
            interval: config.interval_min,
            counter: 0,
            suppressed: false,
            out_of_cycle_used: false,
            intervals_started: 0,
            phase: None,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Back to `interval_min` and a fresh interval starting at `now`.
    pub fn reset(&mut self, now: Instant) {
        self.interval = self.config.interval_min;
        self.suppressed = false;
        self.begin_interval(now);
    }

    /// Record a consistent transmission heard in the current interval.
    pub fn hear_consistent(&mut self) {
        if self.phase.is_some() {
            self.counter = self.counter.saturating_add(1);
        }
    }

    /// Record an inconsistency. Resets unless already running at
    /// `interval_min`. Returns whether a reset happened.
    pub fn hear_inconsistent(&mut self, now: Instant) -> bool {
        if self.phase.is_some() && self.interval == self.config.interval_min {
            return false;
        }
        self.reset(now);
        true
    }

    /// Advance to `now`. Returns at most one event per call; call again
    /// until `None` when catching up over several deadlines.
    pub fn poll(&mut self, now: Instant) -> Option<TrickleEvent> {
        let phase = self.phase.as_mut()?;

        if !phase.fired {
            if now < phase.fire_at {
                return None;
            }
            phase.fired = true;
            let transmit = self.config.redundancy == 0 || self.counter < self.config.redundancy;
            self.suppressed = !transmit;
            return Some(if transmit {
                TrickleEvent::Transmit
            } else {
                TrickleEvent::Suppressed
            });
        }

        let end = phase.start + self.interval;
        if now < end {
            return None;
        }
        self.interval = self
            .interval
            .saturating_mul(2)
            .min(self.config.interval_max);
        self.begin_interval(end);
        Some(TrickleEvent::IntervalEnded {
            interval: self.interval,
        })
    }

    /// When `poll` next has something to report.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.phase.map(|p| {
            if p.fired {
                p.start + self.interval
            } else {
                p.fire_at
            }
        })
    }

    pub fn stop(&mut self) {
        self.phase = None;
        self.counter = 0;
    }

    /// Grant one transmission outside the normal fire point, at most once
    /// per interval. Always false while stopped.
    pub fn try_out_of_cycle(&mut self) -> bool {
        if self.phase.is_none() || self.out_of_cycle_used {
            return false;
        }
        self.out_of_cycle_used = true;
        true
    }

    pub fn config(&self) -> &TrickleConfig {
        &self.config
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Whether the last fire point of this timer was suppressed.
    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    pub fn is_running(&self) -> bool {
        self.phase.is_some()
    }

    pub fn interval_start(&self) -> Option<Instant> {
        self.phase.map(|p| p.start)
    }

    pub fn fire_at(&self) -> Option<Instant> {
        self.phase.map(|p| p.fire_at)
    }

    pub fn intervals_started(&self) -> u64 {
        self.intervals_started
    }

    fn begin_interval(&mut self, start: Instant) {
        self.counter = 0;
        self.out_of_cycle_used = false;
        self.intervals_started += 1;

        // t uniform in [I/2, I)
        let half = self.interval / 2;
        let span = (self.interval - half).as_nanos().min(u64::MAX as u128) as u64;
        let offset = self.rng.gen_range(0..span.max(1));
        let fire_at = start + half + Duration::from_nanos(offset);

        tracing::trace!(
            interval_ms = self.interval.as_millis() as u64,
            fire_in_ms = (fire_at - start).as_millis() as u64,
            "trickle interval started"
        );
        self.phase = Some(Phase {
            start,
            fire_at,
            fired: false,
        });
    }
}
