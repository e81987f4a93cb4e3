//! Live counters read while an activity runs.
//!
//! Unlike aggregates these are shared by all motors and updated in place, so
//! everything here is atomics or short critical sections.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Cycle progress gauges for one activity.
#[derive(Debug, Default)]
pub struct ActivityMetrics {
    pending: AtomicU64,
    active: AtomicU64,
    complete: AtomicU64,
    success: AtomicU64,
    error: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub pending: u64,
    pub active: u64,
    pub complete: u64,
    pub success: u64,
    pub error: u64,
}

impl ActivityMetrics {
    pub fn new(total_cycles: u64) -> Self {
        Self {
            pending: AtomicU64::new(total_cycles),
            ..Default::default()
        }
    }

    pub fn cycle_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycle_finished(&self, success: bool) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        // never below zero, even if the range was resized underneath us
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| p.checked_sub(1));
        self.complete.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ActivityCounts {
        ActivityCounts {
            pending: self.pending.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            complete: self.complete.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
        }
    }
}

const TICK: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Ewma {
    alpha: f64,
    rate: f64,
    primed: bool,
}

impl Ewma {
    fn over_minutes(minutes: f64) -> Self {
        Self {
            alpha: 1.0 - (-TICK.as_secs_f64() / 60.0 / minutes).exp(),
            rate: 0.0,
            primed: false,
        }
    }

    fn tick(&mut self, events: u64) {
        let instant = events as f64 / TICK.as_secs_f64();
        if self.primed {
            self.rate += self.alpha * (instant - self.rate);
        } else {
            self.rate = instant;
            self.primed = true;
        }
    }
}

#[derive(Debug)]
struct MeterState {
    count: u64,
    uncounted: u64,
    last_tick: Instant,
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
}

impl MeterState {
    fn catch_up(&mut self, now: Instant) {
        while now.saturating_duration_since(self.last_tick) >= TICK {
            let events = std::mem::take(&mut self.uncounted);
            self.m1.tick(events);
            self.m5.tick(events);
            self.m15.tick(events);
            self.last_tick += TICK;
        }
    }
}

/// Event rate meter with 1, 5 and 15 minute moving averages, ticking every
/// five seconds.
#[derive(Debug)]
pub struct RateMeter {
    start: Instant,
    state: Mutex<MeterState>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterSnapshot {
    pub count: u64,
    pub mean_rate: f64,
    pub m1_rate: f64,
    pub m5_rate: f64,
    pub m15_rate: f64,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::starting_at(Instant::now())
    }
}

impl RateMeter {
    pub fn starting_at(start: Instant) -> Self {
        Self {
            start,
            state: Mutex::new(MeterState {
                count: 0,
                uncounted: 0,
                last_tick: start,
                m1: Ewma::over_minutes(1.0),
                m5: Ewma::over_minutes(5.0),
                m15: Ewma::over_minutes(15.0),
            }),
        }
    }

    pub fn mark(&self, events: u64) {
        self.mark_at(events, Instant::now());
    }

    pub fn mark_at(&self, events: u64, now: Instant) {
        let mut state = self.state.lock();
        state.catch_up(now);
        state.count += events;
        state.uncounted += events;
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> MeterSnapshot {
        let mut state = self.state.lock();
        state.catch_up(now);
        let elapsed = now.saturating_duration_since(self.start).as_secs_f64();
        MeterSnapshot {
            count: state.count,
            mean_rate: if elapsed > 0.0 {
                state.count as f64 / elapsed
            } else {
                0.0
            },
            m1_rate: state.m1.rate,
            m5_rate: state.m5.rate,
            m15_rate: state.m15.rate,
        }
    }
}
