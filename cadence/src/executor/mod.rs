//! Activity executor: runs one activity's motors to completion.
//!
//! An [`ActivityExecutor`] owns the motors of a single activity. `run()` is
//! spawned once by the scenario controller; it starts `threads` motors and
//! then waits on the activity's [`Tally`] until every motor has reached a
//! terminal state. The other methods are the control surface the controller
//! uses while `run()` is in flight:
//!
//! - [`ActivityExecutor::await_started`] for `start` to know motors came up
//! - [`ActivityExecutor::stop`] for a cooperative stop between cycles
//! - [`ActivityExecutor::force_stop`] which aborts what does not stop in time
//! - [`ActivityExecutor::adjust_threads`] when `threads=` changes mid-run
//!
//! Motors never crash the executor. A motor's escalated error, or a panic
//! caught at its join boundary, is recorded as the activity's error and the
//! result ends `Errored`. An escalated error also stops every other motor of
//! the activity.
//!
//! # Final state
//!
//! Once every motor is terminal the executor folds the tally into one
//! [`RunState`]: `Errored` if any motor failed, else `Interrupted` if any was
//! aborted, else `Stopped` if any honoured a stop, else `Finished`.
pub mod motor;
pub mod state;

pub use motor::{Motor, MotorContext};
pub use state::{MotorState, RunState, Tally, TallyImage};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::{
    sync::watch,
    task::{AbortHandle, JoinHandle},
};

use crate::{
    activity::Activity,
    config::EngineConfig,
    error::{Error, Result},
};

/// What an activity's run came to.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub alias: String,
    pub state: RunState,
    pub error: Option<Arc<Error>>,
    pub elapsed: Duration,
    /// Motor states at the end of the run.
    pub motors: TallyImage,
}

impl ExecutionResult {
    pub fn failed(alias: &str, error: Error) -> Self {
        Self {
            alias: alias.to_string(),
            state: RunState::Errored,
            error: Some(Arc::new(error)),
            elapsed: Duration::ZERO,
            motors: TallyImage::default(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some() || self.state == RunState::Errored
    }

    /// The activity's error wrapped with its alias, if it failed.
    pub fn activity_error(&self) -> Option<Error> {
        self.error.as_ref().map(|source| Error::Activity {
            alias: self.alias.clone(),
            source: source.clone(),
        })
    }
}

struct MotorHandle {
    state: Arc<MotorState>,
    stop: watch::Sender<bool>,
    abort: AbortHandle,
}

#[derive(Default)]
struct Motors {
    handles: Vec<MotorHandle>,
    tasks: Vec<JoinHandle<()>>,
    stopping: bool,
    closed: bool,
}

type FirstError = Arc<Mutex<Option<Arc<Error>>>>;

fn record_error(slot: &FirstError, error: Error) {
    let mut first = slot.lock();
    if first.is_none() {
        *first = Some(Arc::new(error));
    }
}

fn stop_all(motors: &Mutex<Motors>) {
    let mut motors = motors.lock();
    motors.stopping = true;
    for handle in &motors.handles {
        handle.stop.send_replace(true);
    }
}

pub struct ActivityExecutor {
    activity: Arc<Activity>,
    force_stop_grace: Duration,
    tally: Arc<Tally>,
    motors: Arc<Mutex<Motors>>,
    first_error: FirstError,
    done: watch::Sender<Option<ExecutionResult>>,
}

impl ActivityExecutor {
    pub fn new(activity: Arc<Activity>, config: &EngineConfig) -> Self {
        Self {
            activity,
            force_stop_grace: config.force_stop_grace,
            tally: Arc::new(Tally::new()),
            motors: Arc::new(Mutex::new(Motors::default())),
            first_error: Arc::new(Mutex::new(None)),
            done: watch::Sender::new(None),
        }
    }

    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    pub fn alias(&self) -> &str {
        self.activity.alias()
    }

    pub fn tally(&self) -> TallyImage {
        self.tally.image()
    }

    pub fn is_done(&self) -> bool {
        self.done.borrow().is_some()
    }

    pub fn result(&self) -> Option<ExecutionResult> {
        self.done.borrow().clone()
    }

    fn spawn_motor(&self, motors: &mut Motors) {
        let id = motors.handles.len();
        let state = Arc::new(MotorState::new(id, self.tally.clone()));
        let (stop, stop_rx) = watch::channel(motors.stopping);
        let ctx = MotorContext::new(id, self.activity.clone(), state.clone(), stop_rx);
        let motor = Motor::new(ctx);
        let first_error = self.first_error.clone();
        let siblings = self.motors.clone();
        let alias = self.alias().to_string();
        let task = tokio::spawn(async move {
            if let Err(e) = motor.run().await {
                record_error(&first_error, e);
                tracing::warn!("{alias}: motor {id} failed, stopping the activity");
                stop_all(&siblings);
            }
        });
        motors.handles.push(MotorHandle {
            state,
            stop,
            abort: task.abort_handle(),
        });
        motors.tasks.push(task);
    }

    /// Runs the activity until every motor is terminal.
    pub async fn run(self: Arc<Self>) -> ExecutionResult {
        let started = Instant::now();
        let alias = self.alias().to_string();
        let threads = self.activity.threads();
        tracing::info!("Spawning {threads} motors for {alias}...");
        {
            let mut motors = self.motors.lock();
            for _ in 0..threads {
                self.spawn_motor(&mut motors);
            }
        }

        // adjust_threads may add motors until the tally is seen all terminal
        // under the lock, so re-check there before closing
        let tasks = loop {
            self.tally.wait_for(|img| img.all_terminal()).await;
            let mut motors = self.motors.lock();
            if self.tally.image().all_terminal() {
                motors.closed = true;
                break std::mem::take(&mut motors.tasks);
            }
        };

        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                if e.is_panic() {
                    // instead of crashing the engine, log the motor panic
                    tracing::error!("{alias}: motor panicked: {e}");
                    record_error(&self.first_error, Error::MotorPanic(e.to_string()));
                }
            }
        }

        let motors = self.tally.image();
        let error = self.first_error.lock().clone();
        let state = if error.is_some() || motors.count(RunState::Errored) > 0 {
            RunState::Errored
        } else if motors.count(RunState::Interrupted) > 0 {
            RunState::Interrupted
        } else if motors.count(RunState::Stopped) > 0 {
            RunState::Stopped
        } else {
            RunState::Finished
        };
        let elapsed = started.elapsed();
        tracing::info!("Activity {alias} {state} after {elapsed:?} motors={motors}");
        let result = ExecutionResult {
            alias,
            state,
            error,
            elapsed,
            motors,
        };
        self.done.send_replace(Some(result.clone()));
        result
    }

    /// Waits until a motor is running or has already ended.
    pub async fn await_started(&self, timeout: Duration) -> Result<()> {
        let started = self.tally.wait_for(|img| {
            img.any_of(&[RunState::Running, RunState::Stopping]) || img.terminal() > 0
        });
        let mut done = self.done.subscribe();
        let finished = async { done.wait_for(Option::is_some).await.is_ok() };
        tokio::select! {
            _ = started => Ok(()),
            _ = finished => Ok(()),
            _ = tokio::time::sleep(timeout) => {
                Err(Error::timeout(format!("activity '{}' to start", self.alias()), timeout))
            }
        }
    }

    /// Asks every motor to stop after its current cycle and waits for all of
    /// them to land.
    pub async fn stop(&self) {
        tracing::info!("Stopping activity {}", self.alias());
        stop_all(&self.motors);
        self.tally.wait_for(|img| img.all_terminal()).await;
    }

    /// Cooperative stop, then abort whatever is still running after
    /// `timeout`. Errors if aborted motors do not land within the engine's
    /// `force_stop_grace`.
    pub async fn force_stop(&self, timeout: Duration) -> Result<()> {
        stop_all(&self.motors);
        let all_terminal = self.tally.wait_for(|img| img.all_terminal());
        if tokio::time::timeout(timeout, all_terminal).await.is_ok() {
            return Ok(());
        }

        let mut aborted = 0;
        for handle in self.motors.lock().handles.iter() {
            if !handle.state.get().is_terminal() {
                handle.abort.abort();
                aborted += 1;
            }
        }
        tracing::warn!(
            "{}: {aborted} motors did not stop within {timeout:?}, aborting",
            self.alias()
        );
        let all_terminal = self.tally.wait_for(|img| img.all_terminal());
        match tokio::time::timeout(self.force_stop_grace, all_terminal).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::Shutdown(format!(
                "activity '{}' still has motors {} after abort",
                self.alias(),
                self.tally.image()
            ))),
        }
    }

    /// Grows or shrinks the set of live motors to `threads`. Surplus motors
    /// are the highest-numbered ones and stop cooperatively.
    pub fn adjust_threads(&self, threads: usize) {
        let mut motors = self.motors.lock();
        if motors.closed || motors.stopping {
            tracing::debug!("{}: not adjusting threads, activity is ending", self.alias());
            return;
        }
        let live: Vec<usize> = motors
            .handles
            .iter()
            .enumerate()
            .filter(|(_, h)| !*h.stop.borrow() && !h.state.get().is_terminal())
            .map(|(i, _)| i)
            .collect();
        tracing::info!("{}: threads {} -> {threads}", self.alias(), live.len());
        if threads > live.len() {
            for _ in live.len()..threads {
                self.spawn_motor(&mut motors);
            }
        } else {
            for &i in live.iter().skip(threads) {
                motors.handles[i].stop.send_replace(true);
            }
        }
    }

    /// Waits for the run to end, surfacing the activity's error.
    pub async fn await_completion(&self, timeout: Duration) -> Result<ExecutionResult> {
        let mut done = self.done.subscribe();
        let result = match tokio::time::timeout(timeout, done.wait_for(Option::is_some)).await {
            Ok(Ok(result)) => result.clone(),
            _ => None,
        };
        let Some(result) = result else {
            return Err(Error::timeout(
                format!("activity '{}' to complete", self.alias()),
                timeout,
            ));
        };
        match result.activity_error() {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }
}

#[cfg(all(test, feature = "builtins"))]
mod tests {
    use super::*;
    use crate::{
        driver::DriverRegistry,
        error::OpError,
        op::ParamOpSource,
        params::ActivityDef,
    };

    fn executor(params: &str) -> Arc<ActivityExecutor> {
        let def = ActivityDef::parse(params).unwrap();
        let activity = Activity::load(def, &DriverRegistry::default(), &ParamOpSource).unwrap();
        Arc::new(ActivityExecutor::new(
            Arc::new(activity),
            &EngineConfig::default(),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_cycle_runs_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let exec = executor(&format!(
            "alias=e2e;driver=stdout;op={{cycle}};cycles=0..100;threads=4;cyclerate=1000;filename={}",
            path.display()
        ));

        let result = exec.clone().run().await;
        assert_eq!(result.state, RunState::Finished);
        assert!(result.error.is_none());
        assert_eq!(result.motors.count(RunState::Finished), 4);

        let mut cycles: Vec<u64> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| l.parse().unwrap())
            .collect();
        cycles.sort_unstable();
        assert_eq!(cycles, (0..100).collect::<Vec<u64>>());

        let counts = exec.activity().metrics().snapshot();
        assert_eq!(counts.success, 100);
        assert_eq!(counts.pending, 0);
        assert_eq!(exec.activity().aggregate().counts.cycles, 100);
        assert!(exec.is_done());
    }

    #[tokio::test]
    async fn graceful_stop_finishes_in_flight_cycles() {
        let exec = executor("alias=g;driver=diag;op=x;delay_ms=5;cycles=1000000;threads=2");
        let run = tokio::spawn(exec.clone().run());
        exec.await_started(Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        exec.stop().await;

        let result = run.await.unwrap();
        assert_eq!(result.state, RunState::Stopped);
        assert_eq!(result.motors.count(RunState::Stopped), 2);
        let counts = exec.activity().metrics().snapshot();
        assert_eq!(counts.active, 0);
        assert!(counts.complete > 0 && counts.complete < 1_000_000);
        assert_eq!(counts.complete, counts.success);
    }

    #[tokio::test]
    async fn force_stop_interrupts_stuck_motors() {
        let exec = executor("alias=f;driver=diag;op=x;delay_ms=60000;cycles=10;threads=2");
        let run = tokio::spawn(exec.clone().run());
        exec.await_started(Duration::from_secs(5)).await.unwrap();
        exec.force_stop(Duration::from_millis(50)).await.unwrap();

        let result = run.await.unwrap();
        assert_eq!(result.state, RunState::Interrupted);
        assert_eq!(result.motors.count(RunState::Interrupted), 2);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn zero_timeout_force_stop_aborts_at_once() {
        let exec = executor("alias=z;driver=diag;op=x;delay_ms=60000;cycles=10;threads=3");
        let run = tokio::spawn(exec.clone().run());
        exec.await_started(Duration::from_secs(5)).await.unwrap();
        exec.force_stop(Duration::ZERO).await.unwrap();

        let result = run.await.unwrap();
        assert_eq!(result.state, RunState::Interrupted);
        assert_eq!(result.motors.count(RunState::Interrupted), 3);
        assert_eq!(exec.activity().metrics().snapshot().complete, 0);
    }

    #[tokio::test]
    async fn stop_handler_escalates() {
        let exec = executor("alias=s;driver=diag;op=x;cycles=20;error_modulo=5;errors=stop");
        let result = exec.clone().run().await;
        assert_eq!(result.state, RunState::Errored);
        let error = result.error.as_deref().unwrap();
        assert!(matches!(error, Error::Op(OpError { name, .. }) if name == "DiagError"));
        assert!(matches!(
            exec.await_completion(Duration::from_secs(1)).await,
            Err(Error::Activity { .. })
        ));
    }

    #[tokio::test]
    async fn stop_handler_ends_every_motor() {
        let exec = executor(
            "alias=s2;driver=diag;op=x;delay_ms=2;cycles=0..1000;threads=2;error_modulo=100000;errors=stop",
        );
        let result = tokio::time::timeout(Duration::from_secs(2), exec.clone().run())
            .await
            .expect("siblings should stop once one motor escalates");
        assert_eq!(result.state, RunState::Errored);
        assert_eq!(result.motors.count(RunState::Errored), 1);
        assert_eq!(result.motors.count(RunState::Stopped), 1);
        let counts = exec.activity().metrics().snapshot();
        assert!(counts.complete < 1000, "complete={}", counts.complete);
        assert_eq!(counts.error, 1);
    }

    #[tokio::test]
    async fn warn_handler_keeps_going() {
        let exec = executor("alias=w;driver=diag;op=x;cycles=20;error_modulo=5;errors=warn");
        let result = exec.clone().run().await;
        assert_eq!(result.state, RunState::Finished);
        let counts = exec.activity().metrics().snapshot();
        assert_eq!(counts.error, 4);
        assert_eq!(counts.success, 16);
        assert_eq!(exec.activity().errors().metrics().total(), 4);
    }

    #[tokio::test]
    async fn retries_recover_or_give_up() {
        let exec = executor(
            "alias=r;driver=diag;op=x;cycles=10;error_modulo=2;fail_attempts=1;errors=retry;maxtries=3",
        );
        assert_eq!(exec.clone().run().await.state, RunState::Finished);
        let errors = exec.activity().errors().metrics().snapshot();
        assert_eq!(errors.retries, 5);
        assert_eq!(errors.exhausted, 0);
        assert_eq!(errors.tries[1], 5);
        assert_eq!(errors.tries[2], 5);
        assert_eq!(exec.activity().metrics().snapshot().success, 10);

        let exec = executor("alias=r2;driver=diag;op=x;cycles=10;error_modulo=2;errors=retry;maxtries=3");
        assert_eq!(exec.clone().run().await.state, RunState::Finished);
        let errors = exec.activity().errors().metrics().snapshot();
        assert_eq!(errors.total, 15);
        assert_eq!(errors.retries, 10);
        assert_eq!(errors.exhausted, 5);
        assert_eq!(errors.tries[3], 5);
        let counts = exec.activity().metrics().snapshot();
        assert_eq!((counts.success, counts.error), (5, 5));
    }

    #[tokio::test]
    async fn bind_failure_is_motor_fatal() {
        let exec = executor("alias=b;driver=diag;op=x;cycles=10;bind_error_modulo=4;errors=warn");
        let result = exec.clone().run().await;
        assert_eq!(result.state, RunState::Errored);
        assert!(matches!(result.error.as_deref(), Some(Error::Bind { cycle: 0, .. })));
    }

    #[tokio::test]
    async fn adjust_threads_adds_and_retires_motors() {
        let exec = executor("alias=t;driver=diag;op=x;delay_ms=2;cycles=1000000;threads=1");
        let run = tokio::spawn(exec.clone().run());
        exec.await_started(Duration::from_secs(5)).await.unwrap();

        exec.adjust_threads(3);
        assert_eq!(exec.tally().total(), 3);
        exec.adjust_threads(1);
        let img = exec
            .tally
            .wait_for(|img| img.count(RunState::Stopped) == 2)
            .await;
        assert_eq!(img.total(), 3);

        exec.stop().await;
        let result = run.await.unwrap();
        assert_eq!(result.motors.count(RunState::Stopped), 3);
    }

    #[tokio::test]
    async fn await_completion_times_out_while_running() {
        let exec = executor("alias=c;driver=diag;op=x;delay_ms=50;cycles=100");
        let run = tokio::spawn(exec.clone().run());
        assert!(matches!(
            exec.await_completion(Duration::from_millis(10)).await,
            Err(Error::Timeout { .. })
        ));
        exec.stop().await;
        run.await.unwrap();
        let result = exec.await_completion(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.state, RunState::Stopped);
    }
}
