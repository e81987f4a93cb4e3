//! Cadence: an activity execution and scheduling engine for load generation.
//!
//! An *activity* runs an operation sequence over a range of cycles with a pool
//! of motors. A *scenario* drives activities through a control procedure:
//! start them, throttle them, resize them, stop them, and wait for them. The
//! engine takes care of the hard parts in between: cycles are handed out in
//! strides so each runs exactly once, rate limits can change while motors are
//! running, error handling is configurable per error name, and every cycle is
//! timed.
//!
//! # Architecture
//!
//! - [`params`]: activity parameters (`alias=a;driver=diag;cycles=1M`) and the
//!   typed views over them ([`ActivityDef`]).
//! - [`sequence`]: turns weighted op templates into a fixed, repeating op order.
//! - [`input`]: the atomic cycle source motors claim strides from.
//! - [`rate`]: token-bucket rate limiting with hot-swappable specs.
//! - [`driver`]: [`DriverAdapter`](driver::DriverAdapter)s map op templates to
//!   executable ops. `stdout` and `diag` ship with the `builtins` feature.
//! - [`executor`]: motors and the [`ActivityExecutor`](executor::ActivityExecutor)
//!   that owns their lifecycle.
//! - [`errors`]: per-error-name handler chains (`warn`, `retry`, `stop`, ...).
//! - [`metric`], [`aggregate`], [`report`]: per-cycle samples, mergeable
//!   aggregates and the reports computed from them.
//! - [`scenario`]: [`Scenario`], [`ScenarioController`] and
//!   [`ScenariosExecutor`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use cadence::{
//!     ActivityDef, Reporter, Scenario, ScenarioController,
//!     report::StdoutReporter,
//! };
//!
//! #[tokio::main]
//! async fn main() -> cadence::Result<()> {
//!     let result = Scenario::builder()
//!         .name("ramp")
//!         .procedure(Arc::new(|c: Arc<ScenarioController>| async move {
//!             c.start(ActivityDef::parse("alias=load;driver=diag;op=x;cycles=100K;threads=8;cyclerate=500")?)
//!                 .await?;
//!             for rate in [1_000, 2_000, 4_000] {
//!                 c.wait_millis(2_000).await;
//!                 c.set_param("load", "cyclerate", &rate.to_string()).await?;
//!             }
//!             c.await_activity("load", Duration::from_secs(120)).await?;
//!             Ok::<_, cadence::Error>(())
//!         }))
//!         .build()
//!         .run()
//!         .await;
//!
//!     StdoutReporter.report(&result).await
//! }
//! ```
//!
//! # Feature flags
//!
//! - `builtins`: the `stdout` and `diag` drivers and the stdout/JSON
//!   reporters. Enabled by default; required by the `cadence` binary.

extern crate self as cadence;

/// Activities and their runtime handles
pub mod activity;
/// Metric aggregators
pub mod aggregate;
/// Engine-wide configuration
pub mod config;
/// Driver adapters and their registry
pub mod driver;
pub mod error;
/// Named error handling
pub mod errors;
/// Motors and the activity executor
pub mod executor;
/// Cycle sources
pub mod input;
/// Single metrics
pub mod metric;
/// Live activity counters
pub mod metrics;
/// Op templates, dispensers and sources
pub mod op;
/// Activity parameters
pub mod params;
/// Rate limiting
pub mod rate;
/// Reports and Reporters
pub mod report;
/// Scenarios and their control surface
pub mod scenario;
/// Op sequencing
pub mod sequence;

pub use aggregate::Aggregate;
pub use config::{EngineConfig, FailurePolicy};
pub use error::{Error, Result};
pub use metric::Metric;
pub use params::ActivityDef;
pub use report::{Report, Reporter};
pub use scenario::{Scenario, ScenarioController, ScenarioResult, ScenariosExecutor};

/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use cadence_macros::*;
}
