use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::Error;

/// How `await_completion` reacts when several activities fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Return the first failure, in completion order, as soon as it happens.
    #[default]
    FirstFailure,
    /// Wait for every activity and return all failures together.
    Aggregate,
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "firstfailure" | "first-failure" => Ok(FailurePolicy::FirstFailure),
            "aggregate" | "all" => Ok(FailurePolicy::Aggregate),
            _ => Err(Error::invalid(
                "failure_policy",
                s,
                "expected 'first' or 'aggregate'",
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailurePolicy::FirstFailure => "first",
            FailurePolicy::Aggregate => "aggregate",
        })
    }
}

/// Engine-wide timing and policy knobs.
///
/// ```rust
/// use std::time::Duration;
/// use cadence::config::{EngineConfig, FailurePolicy};
///
/// let config = EngineConfig::builder()
///     .progress_interval(Duration::from_secs(10))
///     .failure_policy(FailurePolicy::Aggregate)
///     .build();
/// assert_eq!(config.shutdown_grace, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, TypedBuilder, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long `shutdown` waits for activities before forcing them.
    #[builder(default = Duration::from_secs(5))]
    pub shutdown_grace: Duration,
    /// How long a forced stop waits for aborted motors to land.
    #[builder(default = Duration::from_secs(10))]
    pub force_stop_grace: Duration,
    /// How long `start` waits for an activity's motors to come up.
    #[builder(default = Duration::from_secs(30))]
    pub start_timeout: Duration,
    #[builder(default, setter(strip_option(fallback = progress_interval_opt)))]
    pub progress_interval: Option<Duration>,
    #[builder(default)]
    pub failure_policy: FailurePolicy,
    /// Scenarios a `ScenariosExecutor` runs at once.
    #[builder(default = 1)]
    pub max_scenarios: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
