//! A loaded activity: everything its motors share.

use std::{pin::Pin, sync::Arc};

use futures::future::{FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::{
    aggregate::{ActivityAggregate, Aggregate},
    driver::{DriverAdapter, DriverRegistry},
    error::{Error, Result},
    errors::ErrorHandler,
    executor::{ActivityExecutor, ExecutionResult},
    input::AtomicInput,
    metrics::ActivityMetrics,
    op::{OpDispenser, OpSource, TagFilter},
    params::{ActivityDef, CyclesSpec},
    rate::RateSpec,
    sequence::{OpSequence, SequencePlanner},
};

pub struct Activity {
    alias: String,
    def: RwLock<Arc<ActivityDef>>,
    // kept alive for drivers that hold connections or sinks
    _driver: Arc<dyn DriverAdapter>,
    sequence: OpSequence<Arc<dyn OpDispenser>>,
    input: AtomicInput,
    stride: u64,
    threads: usize,
    max_tries: u32,
    errors: ErrorHandler,
    metrics: ActivityMetrics,
    aggregate: Mutex<ActivityAggregate>,
    cycle_rate: watch::Sender<Option<RateSpec>>,
    stride_rate: watch::Sender<Option<RateSpec>>,
}

impl Activity {
    /// Resolves the driver, op templates and sequence. Any configuration
    /// problem surfaces here, before a single motor exists.
    pub fn load(def: ActivityDef, drivers: &DriverRegistry, source: &dyn OpSource) -> Result<Self> {
        def.validate()?;
        let alias = def.alias().to_string();
        let driver = drivers.create(&def)?;

        let mut templates = source.load(&def)?;
        if let Some(spec) = def.tags() {
            let filter = TagFilter::parse(spec)?;
            let before = templates.len();
            templates = filter.filter(templates);
            tracing::debug!("{alias}: tag filter kept {} of {before} ops", templates.len());
        }

        let mut planner = SequencePlanner::new(def.sequencer()?);
        for template in &templates {
            let dispenser = driver.map_op(template, &def)?;
            planner.add(dispenser, template.ratio);
        }
        let sequence = planner.resolve();

        let cycles = match def.cycles()? {
            Some(cycles) => cycles,
            None => CyclesSpec::new(0, sequence.len() as u64)?,
        };
        let recycles = def.recycles()?;
        if sequence.is_empty() && !cycles.is_empty() {
            return Err(Error::EmptySequence {
                alias,
                cycles: cycles.count(),
            });
        }

        let stride = def.stride()?.unwrap_or(sequence.len() as u64).max(1);
        if cycles.count() % stride != 0 {
            tracing::warn!(
                "{alias}: stride {stride} does not evenly divide cycles {cycles}, the last stride of each pass is short"
            );
        }
        let threads = def.threads()?.resolve(cycles.count());
        if threads as u64 > cycles.count() {
            tracing::warn!("{alias}: threads={threads} but cycles={cycles}, some motors will idle");
        }
        let max_tries = def.max_tries()?;
        let errors = ErrorHandler::parse(&alias, def.errors_spec(), max_tries)?;
        let input = AtomicInput::new(cycles, recycles);

        tracing::info!(
            "Loaded activity {alias}: driver={} ops={} cycles={cycles} threads={threads} stride={stride}",
            def.driver(),
            sequence.len(),
        );
        Ok(Self {
            metrics: ActivityMetrics::new(input.total()),
            cycle_rate: watch::Sender::new(def.cycle_rate()?),
            stride_rate: watch::Sender::new(def.stride_rate()?),
            def: RwLock::new(Arc::new(def)),
            alias,
            _driver: driver,
            sequence,
            input,
            stride,
            threads,
            max_tries,
            errors,
            aggregate: Mutex::new(ActivityAggregate::new()),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Current parameter snapshot.
    pub fn def(&self) -> Arc<ActivityDef> {
        self.def.read().clone()
    }

    /// Installs a new definition snapshot with `key` changed. Rate keys are
    /// published to running motors, which pick them up at their next stride.
    /// `none` or an empty value removes a rate.
    pub fn apply_param(&self, key: &str, value: &str) -> Result<()> {
        let clear = value.trim().is_empty() || value.eq_ignore_ascii_case("none");
        let next = if clear {
            self.def().without_param(key)
        } else {
            self.def().with_param(key, value)
        };
        match key {
            "cyclerate" | "rate" | "striderate" => {
                let spec = if clear { None } else { Some(value.parse::<RateSpec>()?) };
                let channel = if key == "striderate" {
                    &self.stride_rate
                } else {
                    &self.cycle_rate
                };
                channel.send_replace(spec);
            }
            "threads" => {
                next.threads()?;
            }
            _ => next.validate()?,
        }
        tracing::info!("{}: {key}={value}", self.alias);
        *self.def.write() = Arc::new(next);
        Ok(())
    }

    pub fn sequence(&self) -> &OpSequence<Arc<dyn OpDispenser>> {
        &self.sequence
    }

    pub fn input(&self) -> &AtomicInput {
        &self.input
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Motor count resolved at load time.
    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    pub fn errors(&self) -> &ErrorHandler {
        &self.errors
    }

    pub fn metrics(&self) -> &ActivityMetrics {
        &self.metrics
    }

    pub fn cycle_rate(&self) -> watch::Receiver<Option<RateSpec>> {
        self.cycle_rate.subscribe()
    }

    pub fn stride_rate(&self) -> watch::Receiver<Option<RateSpec>> {
        self.stride_rate.subscribe()
    }

    /// Folds a motor's local aggregate into the activity's.
    pub fn merge(&self, local: ActivityAggregate) {
        self.aggregate.lock().merge(local);
    }

    pub fn aggregate(&self) -> ActivityAggregate {
        self.aggregate.lock().clone()
    }
}

pub type Completion = Shared<Pin<Box<dyn Future<Output = ExecutionResult> + Send>>>;

/// A started activity as the scenario controller tracks it.
#[derive(Clone)]
pub struct ActivityRuntimeInfo {
    pub activity: Arc<Activity>,
    pub executor: Arc<ActivityExecutor>,
    completion: Completion,
}

impl ActivityRuntimeInfo {
    /// Spawns the executor and wraps its task in a shareable completion.
    pub fn spawn(activity: Arc<Activity>, executor: Arc<ActivityExecutor>) -> Self {
        let alias = activity.alias().to_string();
        let task = tokio::spawn(executor.clone().run());
        let completion: Pin<Box<dyn Future<Output = ExecutionResult> + Send>> =
            Box::pin(async move {
                match task.await {
                    Ok(result) => result,
                    Err(e) => ExecutionResult::failed(&alias, Error::MotorPanic(e.to_string())),
                }
            });
        Self {
            activity,
            executor,
            completion: completion.shared(),
        }
    }

    pub fn alias(&self) -> &str {
        self.activity.alias()
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// The result, if the executor is done.
    pub fn peek(&self) -> Option<ExecutionResult> {
        self.completion.peek().cloned()
    }

    pub fn is_running(&self) -> bool {
        !self.executor.is_done()
    }
}
