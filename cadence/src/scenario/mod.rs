//! Scenarios: a control procedure plus the activities it drives.
//!
//! A [`Scenario`] runs its [`ControlProcedure`] against a fresh
//! [`ScenarioController`], waits for every activity it started, shuts the
//! controller down and reports one [`ScenarioResult`]. Procedures are plain
//! async closures or a parsed [`CommandScript`]:
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use cadence::{
//!     params::ActivityDef,
//!     scenario::{Scenario, ScenarioController},
//! };
//!
//! # async fn demo() -> cadence::Result<()> {
//! let scenario = Scenario::builder()
//!     .name("warmup")
//!     .procedure(Arc::new(|c: Arc<ScenarioController>| async move {
//!         c.start(ActivityDef::parse("alias=load;driver=diag;op=x;cycles=1M;threads=4")?)
//!             .await?;
//!         c.wait_millis(500).await;
//!         c.set_param("load", "cyclerate", "1000").await?;
//!         c.await_activity("load", Duration::from_secs(60)).await?;
//!         Ok::<_, cadence::Error>(())
//!     }))
//!     .build();
//! let result = scenario.run().await;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```
pub mod commands;
pub mod controller;
pub mod executor;

pub use commands::{Command, CommandScript};
pub use controller::ScenarioController;
pub use executor::{ScenariosExecutor, ScenariosResults};

use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use typed_builder::TypedBuilder;

use crate::{
    config::EngineConfig,
    driver::DriverRegistry,
    error::{Error, Result},
    op::{OpSource, ParamOpSource},
    report::ActivitySummary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScenarioState {
    Scheduled,
    Running,
    Finished,
    Errored,
    Interrupted,
}

impl ScenarioState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScenarioState::Finished | ScenarioState::Errored | ScenarioState::Interrupted
        )
    }

    /// Process exit code for a scenario that ended in this state.
    pub fn exit_code(self) -> u8 {
        match self {
            ScenarioState::Finished => 0,
            ScenarioState::Interrupted => 130,
            _ => 1,
        }
    }
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn error_text<S: Serializer>(error: &Option<Arc<Error>>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    pub name: String,
    pub state: ScenarioState,
    pub started_at: Option<SystemTime>,
    pub elapsed: Duration,
    #[serde(serialize_with = "error_text")]
    pub error: Option<Arc<Error>>,
    pub activities: Vec<ActivitySummary>,
}

impl ScenarioResult {
    /// A result for a scenario that never reported one itself.
    pub fn synthesized(name: &str, state: ScenarioState, error: Error) -> Self {
        Self {
            name: name.to_string(),
            state,
            started_at: None,
            elapsed: Duration::ZERO,
            error: Some(Arc::new(error)),
            activities: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.state == ScenarioState::Finished && self.error.is_none()
    }
}

impl fmt::Display for ScenarioResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scenario {} {} after {:?}", self.name, self.state, self.elapsed)?;
        if let Some(e) = &self.error {
            write!(f, ": {e}")?;
        }
        for activity in &self.activities {
            write!(f, "\n{activity}")?;
        }
        Ok(())
    }
}

/// What a scenario does with its controller.
#[async_trait]
pub trait ControlProcedure: Send + Sync {
    async fn run(&self, controller: Arc<ScenarioController>) -> Result<()>;
}

#[async_trait]
impl<F, Fut> ControlProcedure for F
where
    F: Fn(Arc<ScenarioController>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, controller: Arc<ScenarioController>) -> Result<()> {
        self(controller).await
    }
}

#[derive(TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    pub procedure: Arc<dyn ControlProcedure>,
    #[builder(default)]
    pub config: EngineConfig,
    #[builder(default = Arc::new(DriverRegistry::default()))]
    pub drivers: Arc<DriverRegistry>,
    #[builder(default = Arc::new(ParamOpSource))]
    pub source: Arc<dyn OpSource>,
    /// How long to wait for activities once the procedure returned.
    #[builder(default = Duration::MAX)]
    pub timeout: Duration,
}

/// Marks the scenario `Interrupted` if its future is dropped before it
/// recorded a final state.
struct DropGuard(Arc<ScenarioController>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        if !self.0.state().is_terminal() {
            tracing::warn!("scenario {} dropped before completing", self.0.name());
            self.0.set_state(ScenarioState::Interrupted);
        }
    }
}

impl Scenario {
    /// A controller wired with this scenario's configuration.
    pub fn controller(&self) -> Arc<ScenarioController> {
        Arc::new(ScenarioController::new(
            self.name.clone(),
            self.config.clone(),
            self.drivers.clone(),
            self.source.clone(),
        ))
    }

    pub async fn run(&self) -> ScenarioResult {
        self.run_on(self.controller()).await
    }

    /// Runs the procedure, waits for the activities, shuts the controller
    /// down. Always produces exactly one result.
    pub async fn run_on(&self, controller: Arc<ScenarioController>) -> ScenarioResult {
        let _guard = DropGuard(controller.clone());
        let started_at = SystemTime::now();
        let started = tokio::time::Instant::now();
        controller.set_state(ScenarioState::Running);
        tracing::info!("Running scenario {}...", self.name);
        let progress = self
            .config
            .progress_interval
            .map(|every| tokio::spawn(log_progress(controller.clone(), every)));

        let mut error = match self.procedure.run(controller.clone()).await {
            Ok(()) => controller.await_completion(self.timeout).await.err(),
            Err(e) => {
                tracing::error!("scenario {}: control procedure failed: {e}", self.name);
                if let Err(stop) = controller
                    .force_stop_scenario(self.config.force_stop_grace)
                    .await
                {
                    tracing::error!("scenario {}: {stop}", self.name);
                }
                Some(e)
            }
        };
        if let Err(e) = controller.shutdown().await {
            tracing::error!("scenario {}: {e}", self.name);
            error.get_or_insert(e);
        }
        if let Some(task) = progress {
            task.abort();
        }

        let state = if controller.is_interrupted() {
            ScenarioState::Interrupted
        } else if error.is_some() {
            ScenarioState::Errored
        } else {
            ScenarioState::Finished
        };
        controller.set_state(state);
        let elapsed = started.elapsed();
        tracing::info!("Scenario {} {state} after {elapsed:?}", self.name);
        ScenarioResult {
            name: self.name.clone(),
            state,
            started_at: Some(started_at),
            elapsed,
            error: error.map(Arc::new),
            activities: controller.report_metrics().await,
        }
    }
}

async fn log_progress(controller: Arc<ScenarioController>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for summary in controller.report_metrics().await {
            let c = summary.counts;
            tracing::info!(
                "{}/{}: complete={} pending={} active={} errors={}",
                controller.name(),
                summary.alias,
                c.complete,
                c.pending,
                c.active,
                c.error
            );
        }
    }
}
