//! Runs several named scenarios, a bounded number at a time.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::Semaphore,
    task::JoinHandle,
    time::Instant,
};

use super::{Scenario, ScenarioController, ScenarioResult, ScenarioState};
use crate::error::{Error, Result};

type ResultSlot = Arc<Mutex<Option<ScenarioResult>>>;

struct Entry {
    name: String,
    controller: Arc<ScenarioController>,
    result: ResultSlot,
    task: Option<JoinHandle<()>>,
}

impl Entry {
    fn is_pending(&self) -> bool {
        self.result.lock().is_none() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

/// Results of every scenario submitted to a [`ScenariosExecutor`], in
/// submission order.
#[derive(Debug, Clone, Serialize)]
pub struct ScenariosResults {
    pub name: String,
    pub results: Vec<ScenarioResult>,
}

impl ScenariosResults {
    pub fn get(&self, name: &str) -> Option<&ScenarioResult> {
        self.results.iter().find(|r| r.name == name)
    }

    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| !r.is_ok())
    }

    /// 130 if anything was interrupted, else 1 if anything failed, else 0.
    pub fn exit_code(&self) -> u8 {
        self.results
            .iter()
            .map(|r| match r.state {
                ScenarioState::Interrupted => 130,
                ScenarioState::Finished if r.error.is_none() => 0,
                _ => 1,
            })
            .max()
            .unwrap_or(0)
    }
}

impl fmt::Display for ScenariosResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, result) in self.results.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{result}")?;
        }
        Ok(())
    }
}

pub struct ScenariosExecutor {
    name: String,
    permits: Arc<Semaphore>,
    entries: Mutex<Vec<Entry>>,
    closed: AtomicBool,
}

impl ScenariosExecutor {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            entries: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submits a scenario. It starts once a concurrency permit is free.
    pub fn execute(&self, scenario: Scenario) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed(format!("scenarios executor '{}'", self.name)));
        }
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.name == scenario.name) {
            return Err(Error::DuplicateScenario(scenario.name.clone()));
        }

        let name = scenario.name.clone();
        let controller = scenario.controller();
        let result: ResultSlot = Arc::new(Mutex::new(None));
        let task = {
            let permits = self.permits.clone();
            let controller = controller.clone();
            let result = result.clone();
            tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let outcome = scenario.run_on(controller).await;
                *result.lock() = Some(outcome);
            })
        };
        tracing::info!("{}: submitted scenario {name}", self.name);
        entries.push(Entry {
            name,
            controller,
            result,
            task: Some(task),
        });
        Ok(())
    }

    pub fn pending_scenarios(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.is_pending())
            .map(|e| e.name.clone())
            .collect()
    }

    /// Every scenario with its result, `None` while it is still running.
    pub fn async_result_status(&self) -> Vec<(String, Option<ScenarioResult>)> {
        self.entries
            .lock()
            .iter()
            .map(|e| (e.name.clone(), e.result.lock().clone()))
            .collect()
    }

    /// Closes the executor to new scenarios and waits up to `timeout` for the
    /// submitted ones, logging progress every `update_interval`. A scenario
    /// that did not report in time gets a synthesized result.
    pub async fn await_all_results(
        &self,
        timeout: Duration,
        update_interval: Duration,
    ) -> Result<ScenariosResults> {
        if update_interval > timeout {
            return Err(Error::invalid(
                "update_interval",
                &format!("{update_interval:?}"),
                format!("must not exceed the timeout of {timeout:?}"),
            ));
        }
        self.closed.store(true, Ordering::Release);
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let pending = self.pending_scenarios();
            if pending.is_empty() {
                break;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        tracing::warn!("{}: gave up waiting for {}", self.name, pending.join(", "));
                        break;
                    }
                    left.min(update_interval)
                }
                None => update_interval,
            };
            tracing::info!("{}: waiting on {}", self.name, pending.join(", "));
            tokio::time::sleep(slice).await;
        }

        let finished: Vec<(String, ResultSlot, Arc<ScenarioController>, Option<JoinHandle<()>>)> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .map(|e| {
                    let task = e.task.take_if(|t| t.is_finished());
                    (e.name.clone(), e.result.clone(), e.controller.clone(), task)
                })
                .collect()
        };
        let mut results = Vec::with_capacity(finished.len());
        for (name, slot, controller, task) in finished {
            if let Some(Err(e)) = match task {
                Some(task) => Some(task.await),
                None => None,
            } {
                tracing::error!("{}: scenario {name} task failed: {e}", self.name);
                results.push(ScenarioResult::synthesized(
                    &name,
                    ScenarioState::Errored,
                    Error::Control(format!("scenario task failed: {e}")),
                ));
                continue;
            }
            let reported = slot.lock().clone();
            results.push(match reported {
                Some(result) => result,
                None => {
                    let state = match controller.state() {
                        ScenarioState::Interrupted => ScenarioState::Interrupted,
                        _ => ScenarioState::Errored,
                    };
                    ScenarioResult::synthesized(
                        &name,
                        state,
                        Error::timeout(format!("scenario '{name}'"), timeout),
                    )
                }
            });
        }
        Ok(ScenariosResults {
            name: self.name.clone(),
            results,
        })
    }

    fn controller(&self, name: &str) -> Result<Arc<ScenarioController>> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.controller.clone())
            .ok_or_else(|| Error::MissingScenario(name.to_string()))
    }

    /// Force-stops every activity of the named scenario.
    pub async fn stop_scenario(&self, name: &str) -> Result<()> {
        let controller = self.controller(name)?;
        tracing::info!("{}: stopping scenario {name}", self.name);
        controller
            .force_stop_scenario(controller.config().shutdown_grace)
            .await
    }

    /// Stops the named scenario and forgets it, freeing its name.
    pub async fn delete_scenario(&self, name: &str) -> Result<()> {
        self.stop_scenario(name).await?;
        let mut entries = self.entries.lock();
        if let Some(idx) = entries.iter().position(|e| e.name == name) {
            let entry = entries.remove(idx);
            if let Some(task) = entry.task {
                task.abort();
            }
        }
        Ok(())
    }

    /// Interrupts every scenario that has not reported yet.
    pub async fn interrupt_all(&self) {
        let running: Vec<Arc<ScenarioController>> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.result.lock().is_none())
            .map(|e| e.controller.clone())
            .collect();
        let outcomes = join_all(
            running
                .iter()
                .map(|c| c.interrupt(c.config().force_stop_grace)),
        )
        .await;
        for (controller, outcome) in running.iter().zip(outcomes) {
            if let Err(e) = outcome {
                tracing::error!("{}: interrupting {}: {e}", self.name, controller.name());
            }
        }
    }
}

#[cfg(all(test, feature = "builtins"))]
mod tests {
    use super::*;
    use crate::{
        executor::RunState,
        scenario::{CommandScript, ControlProcedure},
    };

    fn script(name: &str, words: &[&str]) -> Scenario {
        let procedure: Arc<dyn ControlProcedure> = Arc::new(CommandScript::parse(words).unwrap());
        Scenario::builder().name(name).procedure(procedure).build()
    }

    #[tokio::test]
    async fn runs_every_submitted_scenario() {
        let exec = ScenariosExecutor::new("test", 2);
        exec.execute(script("one", &["run", "alias=a", "driver=diag", "op=x", "cycles=10"]))
            .unwrap();
        exec.execute(script("two", &["driver=diag", "op=y", "cycles=5", "threads=2"]))
            .unwrap();
        assert!(matches!(
            exec.execute(script("one", &["awaitall"])),
            Err(Error::DuplicateScenario(_))
        ));

        let results = exec
            .await_all_results(Duration::from_secs(10), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(results.results.len(), 2);
        assert!(!results.has_errors(), "{results}");
        assert_eq!(results.exit_code(), 0);
        assert_eq!(results.get("two").unwrap().activities[0].counts.success, 5);
        assert!(exec.pending_scenarios().is_empty());
        assert!(matches!(
            exec.execute(script("three", &["awaitall"])),
            Err(Error::Closed(_))
        ));
    }

    #[tokio::test]
    async fn update_interval_must_fit_in_the_timeout() {
        let exec = ScenariosExecutor::new("test", 1);
        assert!(
            exec.await_all_results(Duration::from_millis(10), Duration::from_secs(1))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn unfinished_scenarios_get_synthesized_results() {
        let exec = ScenariosExecutor::new("test", 1);
        exec.execute(script(
            "slow",
            &["run", "alias=s", "driver=diag", "op=x", "delay_ms=10", "cycles=1M"],
        ))
        .unwrap();
        let results = exec
            .await_all_results(Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap();
        let slow = results.get("slow").unwrap();
        assert_eq!(slow.state, ScenarioState::Errored);
        assert!(matches!(slow.error.as_deref(), Some(Error::Timeout { .. })));
        exec.delete_scenario("slow").await.unwrap();
        assert!(exec.async_result_status().is_empty());
    }

    #[tokio::test]
    async fn interrupt_all_marks_scenarios_interrupted() {
        let exec = ScenariosExecutor::new("test", 1);
        exec.execute(script(
            "endless",
            &["start", "alias=e", "driver=diag", "op=x", "delay_ms=5", "cycles=1M", "awaitall"],
        ))
        .unwrap();
        // wait for the activity to exist before interrupting
        let controller = exec.controller("endless").unwrap();
        while controller.get_aliases().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        exec.interrupt_all().await;

        let results = exec
            .await_all_results(Duration::from_secs(10), Duration::from_millis(10))
            .await
            .unwrap();
        let endless = results.get("endless").unwrap();
        assert_eq!(endless.state, ScenarioState::Interrupted);
        assert!(matches!(
            endless.activities[0].state,
            RunState::Stopped | RunState::Interrupted
        ));
        assert_eq!(results.exit_code(), 130);
    }

    #[tokio::test]
    async fn unknown_scenarios_are_reported() {
        let exec = ScenariosExecutor::new("test", 1);
        assert!(matches!(
            exec.stop_scenario("nope").await,
            Err(Error::MissingScenario(_))
        ));
        assert!(matches!(
            exec.delete_scenario("nope").await,
            Err(Error::MissingScenario(_))
        ));
    }
}
