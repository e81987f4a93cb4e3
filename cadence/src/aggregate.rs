use crate::{
    Metric,
    macros::aggregate,
    metric::CycleMetric,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{fmt::Debug, time::Duration};

/// The `Aggregate` trait defines how raw [`Metric`] values are collected and combined
/// into an intermediate, mergeable representation.
///
/// Aggregates should **not** compute final statistics such as averages or
/// percentiles. Those belong in a [`Report`](crate::Report), which is converted from
/// an `Aggregate`. Aggregates store compact, mergeable raw data (counts, sums,
/// histograms) so the report stage can summarise without losing information.
///
/// Every motor keeps its own aggregate and folds it into the activity's shared
/// one after each stride, so `merge` must be **associative** and **commutative**.
///
/// # Example
/// ```rust
/// use cadence::{Aggregate, Metric, macros::*};
///
/// #[metric]
/// struct Latency(u64);
///
/// #[aggregate]
/// struct LatencySum {
///     count: u64,
///     sum: u128,
/// }
///
/// impl Aggregate for LatencySum {
///     type Metric = Latency;
///
///     fn new() -> Self {
///         Self { count: 0, sum: 0 }
///     }
///
///     fn consume(&mut self, metric: &Self::Metric) {
///         self.count += 1;
///         self.sum += metric.0 as u128;
///     }
///
///     fn merge(&mut self, other: Self) {
///         self.count += other.count;
///         self.sum += other.sum;
///     }
/// }
/// ```
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
    /// The metric type this aggregate summarizes.
    type Metric: Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple metrics into the current instance.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single metric into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);
}

const BUCKETS: usize = 40;

/// Duration accumulator with power-of-two microsecond buckets.
///
/// Bucket `i` holds samples below `2^i` µs (bucket 0 is sub-microsecond), so
/// percentiles derived from it are upper bounds within a factor of two. Forty
/// buckets reach past six days.
#[derive(Serialize, Deserialize, PartialOrd, PartialEq, Debug, Clone)]
pub struct PhaseTimer {
    pub count: u64,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Duration,
    pub buckets: Vec<u64>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self {
            count: 0,
            total: Duration::ZERO,
            min: None,
            max: Duration::ZERO,
            buckets: vec![0; BUCKETS],
        }
    }
}

impl PhaseTimer {
    pub fn record(&mut self, sample: Duration) {
        self.count += 1;
        self.total += sample;
        self.min = Some(self.min.map_or(sample, |m| m.min(sample)));
        self.max = self.max.max(sample);
        let micros = sample.as_micros();
        let idx = (u128::BITS - micros.leading_zeros()) as usize;
        self.buckets[idx.min(BUCKETS - 1)] += 1;
    }

    pub fn merge(&mut self, other: &PhaseTimer) {
        self.count += other.count;
        self.total += other.total;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = self.max.max(other.max);
        for (mine, theirs) in self.buckets.iter_mut().zip(&other.buckets) {
            *mine += theirs;
        }
    }

    /// Upper bound of the bucket holding the `q` quantile, capped at `max`.
    pub fn quantile(&self, q: f64) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let rank = ((q.clamp(0.0, 1.0) * self.count as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (i, n) in self.buckets.iter().enumerate() {
            seen += n;
            if seen >= rank {
                return Duration::from_micros(1u64 << i).min(self.max);
            }
        }
        self.max
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total.div_f64(self.count as f64)
    }
}

/// Plain cycle counters; merging is field-wise addition.
#[aggregate(additive)]
#[derive(Default)]
pub struct CycleCounts {
    pub cycles: u64,
    pub successes: u64,
    pub errors: u64,
    pub tries: u64,
    pub bytes: u64,
}

impl Aggregate for CycleCounts {
    type Metric = CycleMetric;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, metric: &Self::Metric) {
        self.cycles += 1;
        if metric.success {
            self.successes += 1;
        } else {
            self.errors += 1;
        }
        self.tries += metric.tries as u64;
        self.bytes += metric.bytes;
    }

    fn merge(&mut self, other: Self) {
        *self += other;
    }
}

/// Everything an activity's motors measured.
#[aggregate]
#[derive(Default)]
pub struct ActivityAggregate {
    pub counts: CycleCounts,
    pub bind: PhaseTimer,
    pub execute: PhaseTimer,
    pub result: PhaseTimer,
    pub result_success: PhaseTimer,
    pub verifier: PhaseTimer,
    pub cycle_service: PhaseTimer,
    pub cycle_response: PhaseTimer,
    pub stride_service: PhaseTimer,
}

impl ActivityAggregate {
    pub fn record_stride(&mut self, service: Duration) {
        self.stride_service.record(service);
    }

    pub fn is_empty(&self) -> bool {
        self.counts.cycles == 0 && self.stride_service.count == 0
    }
}

impl Aggregate for ActivityAggregate {
    type Metric = CycleMetric;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, metric: &Self::Metric) {
        self.counts.consume(metric);
        self.bind.record(metric.bind);
        self.execute.record(metric.execute);
        self.result.record(metric.result);
        if let Some(d) = metric.result_success {
            self.result_success.record(d);
        }
        self.verifier.record(metric.verifier);
        self.cycle_service.record(metric.service);
        self.cycle_response.record(metric.response);
    }

    fn merge(&mut self, other: Self) {
        self.counts.merge(other.counts);
        self.bind.merge(&other.bind);
        self.execute.merge(&other.execute);
        self.result.merge(&other.result);
        self.result_success.merge(&other.result_success);
        self.verifier.merge(&other.verifier);
        self.cycle_service.merge(&other.cycle_service);
        self.cycle_response.merge(&other.cycle_response);
        self.stride_service.merge(&other.stride_service);
    }
}
