use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{fmt, fmt::Debug, time::Duration};

use crate::{
    Aggregate,
    activity::Activity,
    aggregate::{ActivityAggregate, PhaseTimer},
    error::Result,
    errors::ErrorSnapshot,
    executor::{ExecutionResult, RunState},
    metrics::ActivityCounts,
};

/// A final, human- or machine-facing view of an [`Aggregate`].
///
/// Reports are where averages and percentiles get computed; the aggregate
/// only keeps mergeable raw data.
pub trait Report<A>
where
    Self: Send + Sync + Debug + From<A> + Serialize + DeserializeOwned,
    A: Aggregate,
{
}

/// Sends a report somewhere: stdout, a file, a database.
#[async_trait]
pub trait Reporter<R: Sync> {
    async fn report(&self, report: &R) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerStats {
    pub count: u64,
    pub mean: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
}

impl From<&PhaseTimer> for TimerStats {
    fn from(t: &PhaseTimer) -> Self {
        Self {
            count: t.count,
            mean: t.mean(),
            min: t.min.unwrap_or_default(),
            max: t.max,
            p50: t.quantile(0.5),
            p90: t.quantile(0.9),
            p99: t.quantile(0.99),
        }
    }
}

impl fmt::Display for TimerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count={} mean={:?} min={:?} p50={:?} p90={:?} p99={:?} max={:?}",
            self.count, self.mean, self.min, self.p50, self.p90, self.p99, self.max
        )
    }
}

/// Timers and counters of one activity, summarized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityReport {
    pub cycles: u64,
    pub successes: u64,
    pub errors: u64,
    pub tries: u64,
    pub bytes: u64,
    /// Percentage of cycles that succeeded.
    pub success_ratio: f64,
    pub bind: TimerStats,
    pub execute: TimerStats,
    pub result: TimerStats,
    pub result_success: TimerStats,
    pub verifier: TimerStats,
    pub cycle_service: TimerStats,
    pub cycle_response: TimerStats,
    pub stride_service: TimerStats,
}

impl From<ActivityAggregate> for ActivityReport {
    fn from(value: ActivityAggregate) -> Self {
        let counts = &value.counts;
        let success_ratio = if counts.cycles == 0 {
            0.0
        } else {
            (counts.successes as f64 / counts.cycles as f64) * 100.0
        };
        Self {
            cycles: counts.cycles,
            successes: counts.successes,
            errors: counts.errors,
            tries: counts.tries,
            bytes: counts.bytes,
            success_ratio,
            bind: (&value.bind).into(),
            execute: (&value.execute).into(),
            result: (&value.result).into(),
            result_success: (&value.result_success).into(),
            verifier: (&value.verifier).into(),
            cycle_service: (&value.cycle_service).into(),
            cycle_response: (&value.cycle_response).into(),
            stride_service: (&value.stride_service).into(),
        }
    }
}

impl Report<ActivityAggregate> for ActivityReport {}

/// Everything known about one activity at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub alias: String,
    /// `Running` until the executor has produced a result.
    pub state: RunState,
    pub elapsed: Duration,
    pub counts: ActivityCounts,
    pub errors: ErrorSnapshot,
    pub report: ActivityReport,
}

impl ActivitySummary {
    pub fn collect(activity: &Activity, result: Option<&ExecutionResult>) -> Self {
        Self {
            alias: activity.alias().to_string(),
            state: result.map_or(RunState::Running, |r| r.state),
            elapsed: result.map_or(Duration::ZERO, |r| r.elapsed),
            counts: activity.metrics().snapshot(),
            errors: activity.errors().metrics().snapshot(),
            report: activity.aggregate().into(),
        }
    }
}

impl fmt::Display for ActivitySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.report;
        writeln!(
            f,
            "activity {} {} after {:?}: cycles={} success={} errors={} ({:.2}% ok) tries={} bytes={}",
            self.alias,
            self.state,
            self.elapsed,
            r.cycles,
            r.successes,
            r.errors,
            r.success_ratio,
            r.tries,
            r.bytes
        )?;
        writeln!(f, "  service   {}", r.cycle_service)?;
        writeln!(f, "  response  {}", r.cycle_response)?;
        writeln!(f, "  execute   {}", r.execute)?;
        write!(f, "  strides   {}", r.stride_service)?;
        if self.errors.total > 0 {
            let names: Vec<String> = self
                .errors
                .by_name
                .iter()
                .map(|(name, n)| format!("{name}={n}"))
                .collect();
            write!(
                f,
                "\n  errors    total={} retries={} exhausted={} [{}] m1={:.2}/s",
                self.errors.total,
                self.errors.retries,
                self.errors.exhausted,
                names.join(" "),
                self.errors.rates.m1_rate
            )?;
        }
        Ok(())
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use super::*;

    /// Prints the human-readable form of a report.
    pub struct StdoutReporter;

    #[async_trait]
    impl<R: fmt::Display + Sync> Reporter<R> for StdoutReporter {
        async fn report(&self, report: &R) -> Result<()> {
            println!("{report}");
            Ok(())
        }
    }

    /// Prints a report as JSON.
    #[derive(Default)]
    pub struct JsonReporter {
        pub pretty: bool,
    }

    impl JsonReporter {
        pub fn render<R: Serialize>(&self, report: &R) -> Result<String> {
            Ok(if self.pretty {
                serde_json::to_string_pretty(report)?
            } else {
                serde_json::to_string(report)?
            })
        }
    }

    #[async_trait]
    impl<R: Serialize + Sync> Reporter<R> for JsonReporter {
        async fn report(&self, report: &R) -> Result<()> {
            println!("{}", self.render(report)?);
            Ok(())
        }
    }
}
