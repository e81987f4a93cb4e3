use std::{fmt::Debug, time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use crate::macros::metric;

/// A single sample produced by the engine.
/// Metrics can be composed of other metrics as well
pub trait Metric
where
    Self: Serialize + DeserializeOwned + PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
}

/// What one cycle cost, phase by phase.
///
/// Phase durations are summed over every attempt of the cycle. `service` is
/// the wall time from bind to the final verdict; `response` adds the rate
/// limiter lag in front of it.
#[metric]
#[derive(Default)]
pub struct CycleMetric {
    pub cycle: u64,
    pub tries: u32,
    pub success: bool,
    pub code: i32,
    pub bytes: u64,
    pub bind: Duration,
    pub execute: Duration,
    pub result: Duration,
    /// Result phase of the successful attempt, if there was one.
    pub result_success: Option<Duration>,
    pub verifier: Duration,
    pub service: Duration,
    pub response: Duration,
}
