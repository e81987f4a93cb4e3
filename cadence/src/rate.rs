//! Per-motor pacing.
//!
//! A [`RateLimiter`] gates the start of each cycle (or stride) against a
//! target rate. Scheduling is split in two: [`RateLimiter::reserve`] is a pure
//! function of the current instant that books the next start slot, and
//! [`RateLimiter::acquire`] sleeps until that slot.
//!
//! # Policies
//!
//! With `burst_ratio == 1.0` the limiter is a strict ceiling: a late caller
//! starts immediately and the schedule is re-anchored on it, so lost
//! throughput is never made up.
//!
//! With `burst_ratio > 1.0` the ideal schedule keeps advancing by one interval
//! per op regardless of lateness. A caller that fell behind is let through
//! early, but never closer than `interval / burst_ratio` to the previous start,
//! so the limiter catches up at no more than `rate * burst_ratio`.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};

pub const DEFAULT_BURST_RATIO: f64 = 1.1;

/// Longest gap between ops a rate may ask for: one op per day.
pub const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

/// What a newly published spec does to limiters that are already running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateVerb {
    /// Record the spec without touching running limiters.
    Configure,
    /// Rebuild running limiters if the rate or burst ratio changed.
    #[default]
    Start,
    /// Rebuild running limiters from scratch, dropping any backlog.
    Restart,
}

impl FromStr for RateVerb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "configure" => Ok(RateVerb::Configure),
            "start" => Ok(RateVerb::Start),
            "restart" => Ok(RateVerb::Restart),
            _ => Err(Error::invalid(
                "rate",
                s,
                "verb must be one of configure, start, restart",
            )),
        }
    }
}

impl fmt::Display for RateVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RateVerb::Configure => "configure",
            RateVerb::Start => "start",
            RateVerb::Restart => "restart",
        })
    }
}

/// `rate[,burst_ratio[,verb]]`, `:` also accepted as a separator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSpec {
    /// Ops per second.
    pub rate: f64,
    pub burst_ratio: f64,
    pub verb: RateVerb,
}

impl RateSpec {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            burst_ratio: DEFAULT_BURST_RATIO,
            verb: RateVerb::Start,
        }
    }

    pub fn with_burst_ratio(mut self, burst_ratio: f64) -> Self {
        self.burst_ratio = burst_ratio;
        self
    }

    pub fn with_verb(mut self, verb: RateVerb) -> Self {
        self.verb = verb;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.burst_ratio <= 1.0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate)
    }

    /// True if `other` would pace differently from `self`.
    pub fn differs_from(&self, other: &RateSpec) -> bool {
        self.rate != other.rate || self.burst_ratio != other.burst_ratio
    }
}

impl FromStr for RateSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split([',', ':']).map(str::trim).collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(Error::invalid(
                "rate",
                s,
                "expected 'rate', 'rate,burst_ratio' or 'rate,burst_ratio,verb'",
            ));
        }
        let rate = parse_rate(s, parts[0])?;
        let mut spec = RateSpec::new(rate);
        if let Some(burst) = parts.get(1) {
            let burst: f64 = burst
                .parse()
                .map_err(|_| Error::invalid("rate", s, "burst ratio is not a number"))?;
            if !(burst >= 1.0 && burst.is_finite()) {
                return Err(Error::invalid(
                    "rate",
                    s,
                    "burst ratios less than 1.0 are invalid",
                ));
            }
            spec.burst_ratio = burst;
        }
        if let Some(verb) = parts.get(2) {
            spec.verb = verb.parse()?;
        }
        Ok(spec)
    }
}

fn parse_rate(whole: &str, raw: &str) -> Result<f64> {
    let (digits, scale) = match raw.chars().last() {
        Some('k' | 'K') => (&raw[..raw.len() - 1], 1e3),
        Some('m' | 'M') => (&raw[..raw.len() - 1], 1e6),
        _ => (raw, 1.0),
    };
    let rate = digits
        .parse::<f64>()
        .map(|r| r * scale)
        .map_err(|_| Error::invalid("rate", whole, "rate is not a number"))?;
    if !(rate > 0.0 && rate.is_finite()) {
        return Err(Error::invalid("rate", whole, "rate must be positive"));
    }
    match Duration::try_from_secs_f64(1.0 / rate) {
        Ok(interval) if interval <= MAX_INTERVAL => Ok(rate),
        _ => Err(Error::invalid(
            "rate",
            whole,
            format!("rate is below one op per {MAX_INTERVAL:?}"),
        )),
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.rate, self.burst_ratio, self.verb)
    }
}

/// Outcome of one [`RateLimiter::acquire`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permit {
    /// Time the caller was paused.
    pub waited: Duration,
    /// How far the granted start trails its ideal slot.
    pub lag: Duration,
}

/// A booked start slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub start: Instant,
    pub ideal: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    spec: RateSpec,
    interval: Duration,
    min_gap: Duration,
    scheduled: Option<Instant>,
    last_start: Option<Instant>,
}

impl RateLimiter {
    pub fn new(spec: RateSpec) -> Self {
        let interval = spec.interval();
        let min_gap = if spec.is_strict() {
            interval
        } else {
            interval.div_f64(spec.burst_ratio)
        };
        Self {
            spec,
            interval,
            min_gap,
            scheduled: None,
            last_start: None,
        }
    }

    pub fn spec(&self) -> &RateSpec {
        &self.spec
    }

    /// Books the next start slot for a caller arriving at `now`.
    pub fn reserve(&mut self, now: Instant) -> Reservation {
        let ideal = self.scheduled.unwrap_or(now);
        let start = if self.spec.is_strict() {
            let start = now.max(ideal);
            self.scheduled = Some(start + self.interval);
            start
        } else {
            let floor = self
                .last_start
                .map_or(ideal, |last| ideal.max(last + self.min_gap));
            let start = now.max(floor);
            self.scheduled = Some(ideal + self.interval);
            start
        };
        self.last_start = Some(start);
        Reservation { start, ideal }
    }

    pub async fn acquire(&mut self) -> Permit {
        let now = Instant::now();
        let slot = self.reserve(now);
        if slot.start > now {
            tokio::time::sleep_until(slot.start).await;
        }
        Permit {
            waited: slot.start.saturating_duration_since(now),
            lag: slot.start.saturating_duration_since(slot.ideal),
        }
    }

    /// Applies a newly published spec to a motor's limiter slot.
    ///
    /// `configure` never touches the slot, `start` rebuilds only on a real
    /// change, `restart` always rebuilds and `None` removes pacing.
    pub fn refresh(slot: &mut Option<RateLimiter>, next: Option<&RateSpec>) {
        match next {
            None => *slot = None,
            Some(spec) => match spec.verb {
                RateVerb::Configure => {}
                RateVerb::Start => {
                    let changed = slot
                        .as_ref()
                        .is_none_or(|current| current.spec.differs_from(spec));
                    if changed {
                        *slot = Some(RateLimiter::new(*spec));
                    }
                }
                RateVerb::Restart => *slot = Some(RateLimiter::new(*spec)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn parses_rate_specs() {
        let spec: RateSpec = "500".parse().unwrap();
        assert_eq!(spec, RateSpec::new(500.0));
        assert_eq!(spec.burst_ratio, DEFAULT_BURST_RATIO);

        let spec: RateSpec = "2K,1.0,restart".parse().unwrap();
        assert_eq!(spec.rate, 2_000.0);
        assert!(spec.is_strict());
        assert_eq!(spec.verb, RateVerb::Restart);

        let spec: RateSpec = "10:1.5".parse().unwrap();
        assert_eq!(spec.burst_ratio, 1.5);

        assert!("10,0.9".parse::<RateSpec>().is_err());
        assert!("0".parse::<RateSpec>().is_err());
        assert!("fast".parse::<RateSpec>().is_err());
        assert!("10,1.2,later".parse::<RateSpec>().is_err());
        assert!("1,2,start,4".parse::<RateSpec>().is_err());
    }

    #[test]
    fn rates_too_slow_to_schedule_are_rejected() {
        assert!("1e-30".parse::<RateSpec>().is_err());
        assert!("0.000001".parse::<RateSpec>().is_err());
        let slow: RateSpec = "0.5".parse().unwrap();
        assert_eq!(RateLimiter::new(slow).spec().rate, 0.5);
        assert_eq!(slow.interval(), Duration::from_secs(2));
    }

    #[test]
    fn strict_limiter_spaces_eager_callers() {
        let t0 = Instant::now();
        let mut limiter = RateLimiter::new(RateSpec::new(100.0).with_burst_ratio(1.0));
        let first = limiter.reserve(t0);
        let second = limiter.reserve(t0);
        let third = limiter.reserve(t0);
        assert_eq!(first.start, t0);
        assert_eq!(second.start, t0 + 10 * MS);
        assert_eq!(third.start, t0 + 20 * MS);
    }

    #[test]
    fn strict_limiter_never_recovers_lost_time() {
        let t0 = Instant::now();
        let mut limiter = RateLimiter::new(RateSpec::new(100.0).with_burst_ratio(1.0));
        limiter.reserve(t0);
        // caller shows up a full second late
        let late = t0 + Duration::from_secs(1);
        let slot = limiter.reserve(late);
        assert_eq!(slot.start, late);
        assert_eq!(slot.start - slot.ideal, Duration::from_millis(990));
        // and the schedule is re-anchored on it
        let next = limiter.reserve(late);
        assert_eq!(next.start, late + 10 * MS);
        assert_eq!(next.start, next.ideal);
    }

    #[test]
    fn catch_up_limiter_bursts_at_most_burst_ratio() {
        let t0 = Instant::now();
        let spec = RateSpec::new(100.0).with_burst_ratio(2.0);
        let mut limiter = RateLimiter::new(spec);
        limiter.reserve(t0);

        // stall for 100ms, i.e. ten slots behind
        let mut now = t0 + Duration::from_millis(100);
        let mut starts = Vec::new();
        for _ in 0..30 {
            let slot = limiter.reserve(now);
            starts.push(slot.start);
            now = slot.start;
        }
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= 5 * MS, "gap below interval / burst");
        }
        // after catching up the limiter settles back onto the ideal schedule
        let last = starts[starts.len() - 1];
        let ideal_last = t0 + 30 * 10 * MS;
        assert_eq!(last, ideal_last);
    }

    #[test]
    fn refresh_follows_verbs() {
        let mut slot = None;
        RateLimiter::refresh(
            &mut slot,
            Some(&RateSpec::new(10.0).with_verb(RateVerb::Configure)),
        );
        assert!(slot.is_none());

        RateLimiter::refresh(&mut slot, Some(&RateSpec::new(10.0)));
        let t0 = Instant::now();
        slot.as_mut().unwrap().reserve(t0);

        // same spec under `start` keeps the running schedule
        RateLimiter::refresh(&mut slot, Some(&RateSpec::new(10.0)));
        assert!(slot.as_ref().unwrap().scheduled.is_some());

        RateLimiter::refresh(
            &mut slot,
            Some(&RateSpec::new(10.0).with_verb(RateVerb::Restart)),
        );
        assert!(slot.as_ref().unwrap().scheduled.is_none());

        RateLimiter::refresh(&mut slot, Some(&RateSpec::new(20.0)));
        assert_eq!(slot.as_ref().unwrap().spec().rate, 20.0);

        RateLimiter::refresh(&mut slot, None);
        assert!(slot.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_holds_the_rate_on_a_paused_clock() {
        let mut limiter = RateLimiter::new(RateSpec::new(1_000.0).with_burst_ratio(1.0));
        let start = Instant::now();
        let mut waited = Duration::ZERO;
        for _ in 0..100 {
            waited += limiter.acquire().await.waited;
        }
        let elapsed = start.elapsed();
        // 100 starts at 1000/s span 99 intervals
        assert!(elapsed >= Duration::from_millis(99));
        assert!(elapsed < Duration::from_millis(101));
        assert!(waited > Duration::ZERO && waited <= elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_reports_lag_after_a_stall() {
        let mut limiter = RateLimiter::new(RateSpec::new(100.0).with_burst_ratio(1.5));
        limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(50)).await;
        let permit = limiter.acquire().await;
        assert_eq!(permit.waited, Duration::ZERO);
        assert_eq!(permit.lag, Duration::from_millis(40));
    }
}
