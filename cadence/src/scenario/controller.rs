//! The control surface a scenario's procedure drives.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{
    StreamExt,
    future::join_all,
    stream::FuturesUnordered,
};
use regex::Regex;
use tokio::sync::Mutex;

use super::ScenarioState;
use crate::{
    activity::{Activity, ActivityRuntimeInfo},
    config::{EngineConfig, FailurePolicy},
    driver::DriverRegistry,
    error::{Error, Result},
    executor::{ActivityExecutor, ExecutionResult},
    op::OpSource,
    params::ActivityDef,
    report::ActivitySummary,
};

/// Owns the activities of one scenario, keyed by alias.
///
/// Every registry access goes through one async mutex, so `start` of an alias
/// creates its activity at most once even when called concurrently.
pub struct ScenarioController {
    name: String,
    config: EngineConfig,
    drivers: Arc<DriverRegistry>,
    source: Arc<dyn OpSource>,
    activities: Mutex<BTreeMap<String, ActivityRuntimeInfo>>,
    accepting: AtomicBool,
    interrupted: AtomicBool,
    state: parking_lot::Mutex<ScenarioState>,
}

impl ScenarioController {
    pub fn new(
        name: impl Into<String>,
        config: EngineConfig,
        drivers: Arc<DriverRegistry>,
        source: Arc<dyn OpSource>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            drivers,
            source,
            activities: Mutex::new(BTreeMap::new()),
            accepting: AtomicBool::new(true),
            interrupted: AtomicBool::new(false),
            state: parking_lot::Mutex::new(ScenarioState::Scheduled),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> ScenarioState {
        *self.state.lock()
    }

    /// Moves the scenario to `next` unless it already ended.
    pub(crate) fn set_state(&self, next: ScenarioState) {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = next;
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Loads and starts an activity, then waits for its motors to come up.
    /// Starting an alias that is already registered returns the existing
    /// activity.
    pub async fn start(&self, def: ActivityDef) -> Result<ActivityRuntimeInfo> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::Closed(format!("scenario '{}'", self.name)));
        }
        let info = {
            let mut activities = self.activities.lock().await;
            if let Some(existing) = activities.get(def.alias()) {
                tracing::debug!("{}: activity {} already started", self.name, def.alias());
                return Ok(existing.clone());
            }
            let activity = Arc::new(Activity::load(def, &self.drivers, self.source.as_ref())?);
            let executor = Arc::new(ActivityExecutor::new(activity.clone(), &self.config));
            tracing::info!("{}: starting activity {}", self.name, activity.alias());
            let info = ActivityRuntimeInfo::spawn(activity, executor);
            activities.insert(info.alias().to_string(), info.clone());
            info
        };
        info.executor.await_started(self.config.start_timeout).await?;
        Ok(info)
    }

    /// Starts an activity and waits for it to finish, returning its error if
    /// it failed.
    pub async fn run(&self, def: ActivityDef, timeout: Duration) -> Result<ExecutionResult> {
        let alias = def.alias().to_string();
        self.start(def).await?;
        self.await_activity(&alias, timeout).await
    }

    async fn find(&self, alias: &str, action: &'static str) -> Result<ActivityRuntimeInfo> {
        self.activities
            .lock()
            .await
            .get(alias)
            .cloned()
            .ok_or_else(|| Error::MissingActivity {
                action,
                pattern: alias.to_string(),
            })
    }

    async fn resolve(&self, pattern: &str, action: &'static str) -> Result<Vec<ActivityRuntimeInfo>> {
        let activities = self.activities.lock().await;
        let aliases = matching_aliases(pattern, activities.keys().map(String::as_str))?;
        if aliases.is_empty() {
            return Err(Error::MissingActivity {
                action,
                pattern: pattern.to_string(),
            });
        }
        Ok(aliases
            .iter()
            .filter_map(|alias| activities.get(alias).cloned())
            .collect())
    }

    async fn all(&self) -> Vec<ActivityRuntimeInfo> {
        self.activities.lock().await.values().cloned().collect()
    }

    /// Cooperatively stops every activity matching `pattern` and waits for
    /// their motors to land.
    pub async fn stop(&self, pattern: &str) -> Result<()> {
        let infos = self.resolve(pattern, "stop").await?;
        join_all(infos.iter().map(|info| info.executor.stop())).await;
        Ok(())
    }

    pub async fn force_stop(&self, pattern: &str, timeout: Duration) -> Result<()> {
        let infos = self.resolve(pattern, "force stop").await?;
        force_stop_all(&infos, timeout).await
    }

    pub async fn await_activity(&self, alias: &str, timeout: Duration) -> Result<ExecutionResult> {
        let info = self.find(alias, "await").await?;
        let result = tokio::time::timeout(timeout, info.completion())
            .await
            .map_err(|_| Error::timeout(format!("activity '{alias}'"), timeout))?;
        match result.activity_error() {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Waits for every registered activity, applying the configured
    /// [`FailurePolicy`].
    pub async fn await_completion(&self, timeout: Duration) -> Result<()> {
        let mut pending: FuturesUnordered<_> =
            self.all().await.iter().map(ActivityRuntimeInfo::completion).collect();
        let policy = self.config.failure_policy;
        let mut failures = Vec::new();
        let collect = async {
            while let Some(result) = pending.next().await {
                if let Some(error) = result.activity_error() {
                    tracing::warn!("{}: {error}", self.name);
                    failures.push(error);
                    if policy == FailurePolicy::FirstFailure {
                        break;
                    }
                }
            }
        };
        tokio::time::timeout(timeout, collect)
            .await
            .map_err(|_| Error::timeout(format!("scenario '{}' activities", self.name), timeout))?;

        match Error::collect(failures) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn get_aliases(&self) -> Vec<String> {
        self.activities.lock().await.keys().cloned().collect()
    }

    pub async fn is_running_activity(&self, alias: &str) -> bool {
        match self.activities.lock().await.get(alias) {
            Some(info) => info.is_running(),
            None => false,
        }
    }

    pub async fn get_activity_def(&self, alias: &str) -> Result<Arc<ActivityDef>> {
        Ok(self.find(alias, "find").await?.activity.def())
    }

    pub async fn report_metrics(&self) -> Vec<ActivitySummary> {
        self.all()
            .await
            .iter()
            .map(|info| ActivitySummary::collect(&info.activity, info.peek().as_ref()))
            .collect()
    }

    /// Changes one parameter of a running activity. `threads` resizes its
    /// motor pool; rate keys reach its motors at their next stride.
    pub async fn set_param(&self, alias: &str, key: &str, value: &str) -> Result<()> {
        let info = self.find(alias, "modify").await?;
        info.activity.apply_param(key, value)?;
        if key == "threads" {
            let threads = info
                .activity
                .def()
                .threads()?
                .resolve(info.activity.input().total());
            info.executor.adjust_threads(threads);
        }
        Ok(())
    }

    pub async fn wait_millis(&self, millis: u64) {
        tracing::debug!("{}: waiting {millis}ms", self.name);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    /// Force-stops every activity of the scenario.
    pub async fn force_stop_scenario(&self, timeout: Duration) -> Result<()> {
        force_stop_all(&self.all().await, timeout).await
    }

    /// Marks the scenario interrupted and force-stops it.
    pub async fn interrupt(&self, timeout: Duration) -> Result<()> {
        tracing::warn!("{}: interrupted", self.name);
        self.interrupted.store(true, Ordering::Release);
        self.force_stop_scenario(timeout).await
    }

    /// Refuses new activities, then gives running ones `shutdown_grace` to
    /// finish before force-stopping them.
    pub async fn shutdown(&self) -> Result<()> {
        self.accepting.store(false, Ordering::Release);
        let infos = self.all().await;
        let grace = self.config.shutdown_grace;
        let completions = join_all(infos.iter().map(ActivityRuntimeInfo::completion));
        if tokio::time::timeout(grace, completions).await.is_ok() {
            tracing::debug!("{}: shut down", self.name);
            return Ok(());
        }

        tracing::warn!("{}: activities still running after {grace:?}, forcing", self.name);
        let forced = force_stop_all(&infos, grace).await;
        let completions = join_all(infos.iter().map(ActivityRuntimeInfo::completion));
        match (forced, tokio::time::timeout(grace, completions).await) {
            (Ok(()), Ok(_)) => Ok(()),
            (Err(e), _) => Err(Error::Shutdown(format!("scenario '{}': {e}", self.name))),
            (Ok(()), Err(_)) => {
                let running: Vec<&str> = infos
                    .iter()
                    .filter(|i| i.is_running())
                    .map(ActivityRuntimeInfo::alias)
                    .collect();
                Err(Error::Shutdown(format!(
                    "scenario '{}' still has running activities: {}",
                    self.name,
                    running.join(", ")
                )))
            }
        }
    }
}

async fn force_stop_all(infos: &[ActivityRuntimeInfo], timeout: Duration) -> Result<()> {
    let errors: Vec<Error> = join_all(infos.iter().map(|i| i.executor.force_stop(timeout)))
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect();
    match Error::collect(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// A plain alias is compared literally; anything else is a regex that must
/// match the whole alias.
fn is_plain_alias(element: &str) -> bool {
    let mut chars = element.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Aliases selected by a `,`, `;` or space separated pattern list, in
/// registry order.
pub fn matching_aliases<'a>(
    pattern: &str,
    aliases: impl Iterator<Item = &'a str> + Clone,
) -> Result<Vec<String>> {
    let mut selected: Vec<String> = Vec::new();
    for element in pattern
        .split([',', ';', ' '])
        .map(str::trim)
        .filter(|e| !e.is_empty())
    {
        let found: Vec<&str> = if is_plain_alias(element) {
            aliases.clone().filter(|a| *a == element).collect()
        } else {
            let re = Regex::new(&format!("^(?:{element})$"))?;
            aliases.clone().filter(|a| re.is_match(a)).collect()
        };
        for alias in found {
            if !selected.iter().any(|s| s == alias) {
                selected.push(alias.to_string());
            }
        }
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> [&'static str; 5] {
        ["warm", "w1", "w2", "load.read", "other"]
    }

    #[test]
    fn plain_aliases_match_literally() {
        let found = matching_aliases("w1, other", registry().into_iter()).unwrap();
        assert_eq!(found, ["w1", "other"]);
        assert!(matching_aliases("w", registry().into_iter()).unwrap().is_empty());
        assert_eq!(
            matching_aliases("load.read", registry().into_iter()).unwrap(),
            ["load.read"]
        );
    }

    #[test]
    fn patterns_match_whole_aliases() {
        let found = matching_aliases("w\\d;w.*", registry().into_iter()).unwrap();
        assert_eq!(found, ["w1", "w2", "warm"]);
        assert!(matches!(
            matching_aliases("w(", registry().into_iter()),
            Err(Error::Pattern(_))
        ));
    }

    #[cfg(feature = "builtins")]
    mod activities {
        use super::*;
        use crate::{executor::RunState, op::ParamOpSource};

        fn controller(config: EngineConfig) -> ScenarioController {
            ScenarioController::new(
                "test",
                config,
                Arc::new(DriverRegistry::default()),
                Arc::new(ParamOpSource),
            )
        }

        fn def(params: &str) -> ActivityDef {
            ActivityDef::parse(params).unwrap()
        }

        const ENDLESS: &str = "driver=diag;op=x;delay_ms=2;cycles=1M";

        async fn wait_running(info: &ActivityRuntimeInfo, motors: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while info.executor.tally().count(RunState::Running) != motors {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }

        #[tokio::test]
        async fn starting_an_alias_twice_returns_the_same_activity() {
            let c = controller(EngineConfig::default());
            let first = c.start(def(&format!("alias=a;{ENDLESS}"))).await.unwrap();
            let second = c.start(def("alias=a;driver=diag;op=y")).await.unwrap();
            assert!(Arc::ptr_eq(&first.activity, &second.activity));
            assert_eq!(c.get_aliases().await, ["a"]);
            assert!(c.is_running_activity("a").await);
            c.force_stop_scenario(Duration::from_secs(1)).await.unwrap();
        }

        #[tokio::test]
        async fn stop_selects_activities_by_pattern() {
            let c = controller(EngineConfig::default());
            for alias in ["w1", "w2", "other"] {
                c.start(def(&format!("alias={alias};{ENDLESS}"))).await.unwrap();
            }
            c.stop("w.*").await.unwrap();
            for alias in ["w1", "w2"] {
                let result = c.await_activity(alias, Duration::from_secs(5)).await.unwrap();
                assert_eq!(result.state, RunState::Stopped);
            }
            assert!(c.is_running_activity("other").await);
            assert!(matches!(
                c.stop("nope").await,
                Err(Error::MissingActivity { action: "stop", .. })
            ));

            c.force_stop("other", Duration::from_secs(1)).await.unwrap();
            c.shutdown().await.unwrap();
            assert!(!c.is_running_activity("other").await);
            assert!(matches!(
                c.start(def("alias=late;driver=diag;op=x")).await,
                Err(Error::Closed(_))
            ));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn threads_resize_the_motor_pool() {
            let c = controller(EngineConfig::default());
            let info = c.start(def(&format!("alias=a;threads=1;{ENDLESS}"))).await.unwrap();
            wait_running(&info, 1).await;

            c.set_param("a", "threads", "4").await.unwrap();
            wait_running(&info, 4).await;
            c.set_param("a", "threads", "2").await.unwrap();
            wait_running(&info, 2).await;
            assert_eq!(
                c.get_activity_def("a").await.unwrap().params().get("threads"),
                Some("2")
            );

            assert!(c.set_param("a", "threads", "lots").await.is_err());
            assert!(matches!(
                c.set_param("b", "threads", "2").await,
                Err(Error::MissingActivity { .. })
            ));
            c.force_stop_scenario(Duration::from_secs(1)).await.unwrap();
        }

        #[tokio::test]
        async fn aggregate_policy_collects_every_failure() {
            let config = EngineConfig::builder()
                .failure_policy(FailurePolicy::Aggregate)
                .build();
            let c = controller(config);
            for alias in ["a", "b"] {
                c.start(def(&format!("alias={alias};driver=diag;op=x;cycles=10;error_modulo=2")))
                    .await
                    .unwrap();
            }
            c.start(def("alias=fine;driver=diag;op=x;cycles=10")).await.unwrap();
            match c.await_completion(Duration::from_secs(10)).await {
                Err(Error::Multiple(errors)) => assert_eq!(errors.len(), 2),
                other => panic!("expected two failures, got {other:?}"),
            }
            let summaries = c.report_metrics().await;
            assert_eq!(summaries.len(), 3);
            assert_eq!(summaries[2].alias, "fine");
            assert_eq!(summaries[2].state, RunState::Finished);
        }

        /// Blocks its worker thread, so an aborted motor cannot land.
        struct Stall;

        struct StallOp;

        #[async_trait::async_trait]
        impl crate::op::CycleOp for StallOp {
            async fn execute(&self) -> Result<crate::op::OpOutput, crate::error::OpError> {
                std::thread::sleep(Duration::from_millis(500));
                Ok(crate::op::OpOutput::default())
            }
        }

        impl crate::op::OpDispenser for Stall {
            fn name(&self) -> &str {
                "stall"
            }

            fn bind(&self, _cycle: u64) -> Result<Box<dyn crate::op::CycleOp>, crate::error::OpError> {
                Ok(Box::new(StallOp))
            }
        }

        impl crate::driver::DriverAdapter for Stall {
            fn name(&self) -> &str {
                "stall"
            }

            fn map_op(
                &self,
                _template: &crate::op::OpTemplate,
                _def: &ActivityDef,
            ) -> Result<Arc<dyn crate::op::OpDispenser>> {
                Ok(Arc::new(Stall))
            }
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn shutdown_fails_loudly_when_motors_never_land() {
            let mut drivers = DriverRegistry::default();
            drivers.register("stall", |_| {
                Ok(Arc::new(Stall) as Arc<dyn crate::driver::DriverAdapter>)
            });
            let config = EngineConfig::builder()
                .shutdown_grace(Duration::from_millis(20))
                .force_stop_grace(Duration::from_millis(20))
                .build();
            let c = ScenarioController::new("test", config, Arc::new(drivers), Arc::new(ParamOpSource));
            c.start(def("alias=stuck;driver=stall;op=x;cycles=1")).await.unwrap();

            match c.shutdown().await {
                Err(Error::Shutdown(message)) => assert!(message.contains("stuck"), "{message}"),
                other => panic!("expected a shutdown error, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn run_waits_and_surfaces_failures() {
            let c = controller(EngineConfig::default());
            let ok = c
                .run(def("alias=ok;driver=diag;op=x;cycles=25"), Duration::from_secs(10))
                .await
                .unwrap();
            assert_eq!(ok.state, RunState::Finished);
            assert!(!c.is_running_activity("ok").await);

            let failed = c
                .run(
                    def("alias=bad;driver=diag;op=x;cycles=25;error_modulo=5"),
                    Duration::from_secs(10),
                )
                .await;
            assert!(matches!(failed, Err(Error::Activity { alias, .. }) if alias == "bad"));
            assert!(matches!(
                c.await_activity("ghost", Duration::from_secs(1)).await,
                Err(Error::MissingActivity { .. })
            ));
        }
    }
}
