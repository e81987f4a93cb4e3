//! Per-activity error handling.
//!
//! The `errors=` parameter maps error names to handler chains:
//!
//! ```text
//! errors=Timeout.*,Overloaded:warn,retry;BindError:stop;.*:count
//! ```
//!
//! Mappings are separated by `;` and tried in order; the first whose pattern
//! list fully matches the error name wins. A mapping without `patterns:`
//! applies to every name, so the plain forms `errors=stop`, `errors=warn` or
//! `errors=warn,retry` work too. Handlers run left to right:
//!
//! - `stop` escalates: the motor ends `Errored` and the activity fails
//! - `warn` logs at WARN
//! - `count` (or `counter`) only counts, which always happens anyway
//! - `retry` lets the motor re-run the same bound op, up to `maxtries`
//! - `ignore` suppresses logging
//! - an integer sets the cycle's result code
//!
//! Names that match no mapping are treated as `stop`.

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, OpError, Result},
    metrics::{MeterSnapshot, RateMeter},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStep {
    Stop,
    Warn,
    Count,
    Retry,
    Ignore,
    Code(i32),
}

impl HandlerStep {
    fn parse(spec: &str, word: &str) -> Result<Self> {
        if let Ok(code) = word.parse::<i32>() {
            return Ok(HandlerStep::Code(code));
        }
        match word.to_ascii_lowercase().as_str() {
            "stop" => Ok(HandlerStep::Stop),
            "warn" => Ok(HandlerStep::Warn),
            "count" | "counter" => Ok(HandlerStep::Count),
            "retry" => Ok(HandlerStep::Retry),
            "ignore" => Ok(HandlerStep::Ignore),
            other => Err(Error::ErrorSpec {
                spec: spec.to_string(),
                reason: format!("unknown handler '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerMapping {
    patterns: Vec<Regex>,
    steps: Vec<HandlerStep>,
}

impl HandlerMapping {
    pub fn parse(spec: &str) -> Result<Self> {
        let (patterns, handlers) = match spec.rsplit_once(':') {
            Some((p, h)) => (p.trim(), h.trim()),
            None => (".*", spec.trim()),
        };
        let patterns = patterns
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| Regex::new(&format!("^(?:{p})$")))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let steps = handlers
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| HandlerStep::parse(spec, h))
            .collect::<Result<Vec<_>>>()?;
        if patterns.is_empty() || steps.is_empty() {
            return Err(Error::ErrorSpec {
                spec: spec.to_string(),
                reason: "a mapping needs at least one pattern and one handler".into(),
            });
        }
        Ok(Self { patterns, steps })
    }

    fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(name))
    }

    pub fn steps(&self) -> &[HandlerStep] {
        &self.steps
    }
}

/// What the motor should do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorVerdict {
    /// Fail the motor and the activity.
    pub stop: bool,
    /// The attempt may be retried.
    pub retry: bool,
    /// Result code to record for the cycle.
    pub code: i32,
}

const STOP_ALL: &[HandlerStep] = &[HandlerStep::Stop];

/// Widest tries histogram; counts past it share the last slot.
const MAX_TRIES_BUCKETS: usize = 64;

pub struct ErrorHandler {
    alias: String,
    mappings: Vec<HandlerMapping>,
    // error name -> index of the mapping that handles it
    resolved: RwLock<HashMap<String, Option<usize>>>,
    metrics: ErrorMetrics,
}

impl ErrorHandler {
    pub fn parse(alias: &str, spec: &str, max_tries: u32) -> Result<Self> {
        let mappings = spec
            .split(';')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(HandlerMapping::parse)
            .collect::<Result<Vec<_>>>()?;
        if mappings.is_empty() {
            return Err(Error::ErrorSpec {
                spec: spec.to_string(),
                reason: "no handler mappings".into(),
            });
        }
        Ok(Self {
            alias: alias.to_string(),
            mappings,
            resolved: RwLock::new(HashMap::new()),
            metrics: ErrorMetrics::new(max_tries),
        })
    }

    pub fn metrics(&self) -> &ErrorMetrics {
        &self.metrics
    }

    fn steps_for(&self, name: &str) -> &[HandlerStep] {
        let cached = self.resolved.read().get(name).copied();
        let idx = match cached {
            Some(idx) => idx,
            None => {
                let idx = self.mappings.iter().position(|m| m.matches(name));
                self.resolved.write().insert(name.to_string(), idx);
                idx
            }
        };
        idx.map_or(STOP_ALL, |i| self.mappings[i].steps())
    }

    /// Records one failed attempt and decides what happens next.
    pub fn handle(&self, error: &OpError, cycle: u64, attempt: u32) -> ErrorVerdict {
        self.metrics.record(&error.name);
        let mut verdict = ErrorVerdict {
            stop: false,
            retry: false,
            code: error.code,
        };
        let mut quiet = false;
        for step in self.steps_for(&error.name) {
            match *step {
                HandlerStep::Stop => verdict.stop = true,
                HandlerStep::Retry => verdict.retry = true,
                HandlerStep::Code(code) => verdict.code = code,
                HandlerStep::Ignore => quiet = true,
                HandlerStep::Count => {}
                HandlerStep::Warn => {
                    if !quiet {
                        tracing::warn!(
                            "{} cycle {cycle} attempt {attempt}: {error}",
                            self.alias
                        );
                    }
                }
            }
        }
        if verdict.stop {
            tracing::error!("{} cycle {cycle}: stopping on {error}", self.alias);
        } else if !quiet {
            tracing::trace!("{} cycle {cycle} attempt {attempt}: {error}", self.alias);
        }
        verdict
    }

    /// Called when a retryable error used up every try: warn and move on.
    pub fn exhausted(&self, error: &OpError, cycle: u64, tries: u32) {
        self.metrics.exhausted.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "{} cycle {cycle} gave up after {tries} tries: {error}",
            self.alias
        );
    }
}

/// Shared error counters for one activity.
#[derive(Debug)]
pub struct ErrorMetrics {
    total: AtomicU64,
    by_name: Mutex<BTreeMap<String, u64>>,
    retries: AtomicU64,
    exhausted: AtomicU64,
    tries: Vec<AtomicU64>,
    meter: RateMeter,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    pub total: u64,
    pub by_name: BTreeMap<String, u64>,
    pub retries: u64,
    pub exhausted: u64,
    /// `tries[n]` counts cycles that took `n` tries; the last slot also holds
    /// anything beyond it.
    pub tries: Vec<u64>,
    pub rates: MeterSnapshot,
}

impl ErrorMetrics {
    pub fn new(max_tries: u32) -> Self {
        Self {
            total: AtomicU64::new(0),
            by_name: Mutex::new(BTreeMap::new()),
            retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            tries: (0..(max_tries as usize).min(MAX_TRIES_BUCKETS) + 2)
                .map(|_| AtomicU64::new(0))
                .collect(),
            meter: RateMeter::default(),
        }
    }

    fn record(&self, name: &str) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.by_name.lock().entry(name.to_string()).or_default() += 1;
        self.meter.mark(1);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tries(&self, tries: u32) {
        let idx = (tries as usize).min(self.tries.len() - 1);
        self.tries[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ErrorSnapshot {
        ErrorSnapshot {
            total: self.total(),
            by_name: self.by_name.lock().clone(),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            tries: self.tries.iter().map(|t| t.load(Ordering::Relaxed)).collect(),
            rates: self.meter.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(name: &str) -> OpError {
        OpError::new(name, "boom")
    }

    #[test]
    fn plain_policies_apply_to_every_name() {
        let stop = ErrorHandler::parse("a", "stop", 10).unwrap();
        assert!(stop.handle(&err("Anything"), 0, 1).stop);

        let warn = ErrorHandler::parse("a", "warn", 10).unwrap();
        let v = warn.handle(&err("Anything"), 0, 1);
        assert!(!v.stop && !v.retry);

        let retry = ErrorHandler::parse("a", "warn,retry", 10).unwrap();
        assert!(retry.handle(&err("Anything"), 0, 1).retry);
    }

    #[test]
    fn first_matching_mapping_wins() {
        let h = ErrorHandler::parse("a", "Timeout.*,Overloaded:warn,retry;Bind.*:stop;.*:count,42", 10)
            .unwrap();
        let t = h.handle(&err("TimeoutException"), 1, 1);
        assert!(t.retry && !t.stop);
        assert!(h.handle(&err("Overloaded"), 1, 1).retry);
        assert!(h.handle(&err("BindError"), 1, 1).stop);
        let other = h.handle(&err("Weird"), 1, 1);
        assert!(!other.stop && !other.retry);
        assert_eq!(other.code, 42);
    }

    #[test]
    fn unmatched_names_stop() {
        let h = ErrorHandler::parse("a", "Timeout:warn", 10).unwrap();
        assert!(h.handle(&err("Other"), 0, 1).stop);
        // cached lookups agree
        assert!(h.handle(&err("Other"), 1, 1).stop);
        assert!(!h.handle(&err("Timeout"), 2, 1).stop);
    }

    #[test]
    fn patterns_match_whole_names() {
        let h = ErrorHandler::parse("a", "Time:ignore", 10).unwrap();
        assert!(h.handle(&err("Timeout"), 0, 1).stop);
    }

    #[test]
    fn every_attempt_is_counted_once() {
        let h = ErrorHandler::parse("a", "ignore", 3).unwrap();
        h.handle(&err("A"), 0, 1);
        h.handle(&err("A"), 0, 2);
        h.handle(&err("B"), 1, 1);
        h.metrics().record_retry();
        h.exhausted(&err("A"), 0, 3);
        h.metrics().record_tries(1);
        h.metrics().record_tries(3);
        h.metrics().record_tries(99);
        let snap = h.metrics().snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.by_name.get("A"), Some(&2));
        assert_eq!(snap.by_name.get("B"), Some(&1));
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.exhausted, 1);
        assert_eq!(snap.tries, vec![0, 1, 0, 1, 1]);
        assert_eq!(snap.rates.count, 3);
    }

    #[test]
    fn huge_maxtries_keeps_the_histogram_small() {
        let metrics = ErrorMetrics::new(u32::MAX);
        metrics.record_tries(u32::MAX);
        metrics.record_tries(2);
        let tries = metrics.snapshot().tries;
        assert_eq!(tries.len(), MAX_TRIES_BUCKETS + 2);
        assert_eq!(tries[2], 1);
        assert_eq!(tries[MAX_TRIES_BUCKETS + 1], 1);
    }

    #[test]
    fn bad_specs_are_rejected() {
        assert!(matches!(
            ErrorHandler::parse("a", "explode", 1),
            Err(Error::ErrorSpec { .. })
        ));
        assert!(matches!(
            ErrorHandler::parse("a", "(:warn", 1),
            Err(Error::Pattern(_))
        ));
        assert!(ErrorHandler::parse("a", " ; ", 1).is_err());
    }
}
