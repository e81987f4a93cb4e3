//! The motor: one task driving cycles for an activity.

use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, time::Instant};

use super::state::{MotorState, RunState};
use crate::{
    activity::Activity,
    aggregate::{ActivityAggregate, Aggregate},
    error::{Error, OpError, Result},
    metric::CycleMetric,
    op::{CycleOp, OpDispenser, OpOutput},
    rate::{RateLimiter, RateSpec},
};

/// Everything one motor owns. Nothing in here is shared with other motors
/// except through the `Activity`.
pub struct MotorContext {
    pub id: usize,
    pub activity: Arc<Activity>,
    pub state: Arc<MotorState>,
    stop: watch::Receiver<bool>,
    cycle_rate: watch::Receiver<Option<RateSpec>>,
    stride_rate: watch::Receiver<Option<RateSpec>>,
    cycle_limiter: Option<RateLimiter>,
    stride_limiter: Option<RateLimiter>,
    local: ActivityAggregate,
}

impl MotorContext {
    pub fn new(
        id: usize,
        activity: Arc<Activity>,
        state: Arc<MotorState>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let mut cycle_rate = activity.cycle_rate();
        let mut stride_rate = activity.stride_rate();
        let cycle_limiter = (*cycle_rate.borrow_and_update()).map(RateLimiter::new);
        let stride_limiter = (*stride_rate.borrow_and_update()).map(RateLimiter::new);
        Self {
            id,
            activity,
            state,
            stop,
            cycle_rate,
            stride_rate,
            cycle_limiter,
            stride_limiter,
            local: ActivityAggregate::new(),
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Swaps in fresh limiters if a new rate spec was published.
    fn refresh_limiters(&mut self) {
        if self.cycle_rate.has_changed().unwrap_or(false) {
            let spec = *self.cycle_rate.borrow_and_update();
            RateLimiter::refresh(&mut self.cycle_limiter, spec.as_ref());
        }
        if self.stride_rate.has_changed().unwrap_or(false) {
            let spec = *self.stride_rate.borrow_and_update();
            RateLimiter::refresh(&mut self.stride_limiter, spec.as_ref());
        }
    }

    fn flush(&mut self) {
        if !self.local.is_empty() {
            let local = std::mem::replace(&mut self.local, ActivityAggregate::new());
            self.activity.merge(local);
        }
    }
}

/// Marks the motor `Interrupted` if its task goes away before it reached a
/// terminal state, or `Errored` if it is unwinding from a panic.
struct DropGuard(Arc<MotorState>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        if !self.0.get().is_terminal() {
            let state = if std::thread::panicking() {
                RunState::Errored
            } else {
                RunState::Interrupted
            };
            self.0.enter(state);
        }
    }
}

/// Owns its drop guard from construction, so a motor whose task is aborted
/// before it was first polled still lands in a terminal state.
pub struct Motor {
    ctx: MotorContext,
    _guard: DropGuard,
}

impl Motor {
    pub fn new(ctx: MotorContext) -> Self {
        let guard = DropGuard(ctx.state.clone());
        Self { ctx, _guard: guard }
    }

    pub async fn run(mut self) -> Result<()> {
        let id = self.ctx.id;
        let alias = self.ctx.activity.alias().to_string();
        self.ctx.state.enter(RunState::Starting);
        self.ctx.state.enter(RunState::Running);
        tracing::debug!("{alias} motor {id} running");

        let outcome = self.drive().await;
        self.ctx.flush();
        match outcome {
            Ok(state) => {
                self.ctx.state.enter(state);
                tracing::debug!("{alias} motor {id} {state}");
                Ok(())
            }
            Err(e) => {
                tracing::error!("{alias} motor {id} failed: {e}");
                self.ctx.state.enter(RunState::Errored);
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<RunState> {
        let activity = self.ctx.activity.clone();
        let stride = activity.stride();
        loop {
            if self.ctx.stop_requested() {
                self.ctx.state.enter(RunState::Stopping);
                return Ok(RunState::Stopped);
            }
            self.ctx.refresh_limiters();
            let Some(segment) = activity.input().next_segment(stride) else {
                return Ok(RunState::Finished);
            };

            let stride_start = Instant::now();
            if let Some(limiter) = self.ctx.stride_limiter.as_mut() {
                limiter.acquire().await;
            }
            for cycle in segment.cycles() {
                if self.ctx.stop_requested() {
                    self.ctx.state.enter(RunState::Stopping);
                    self.ctx.local.record_stride(stride_start.elapsed());
                    return Ok(RunState::Stopped);
                }
                let lag = match self.ctx.cycle_limiter.as_mut() {
                    Some(limiter) => limiter.acquire().await.lag,
                    None => Duration::ZERO,
                };
                self.run_cycle(cycle, lag).await?;
            }
            self.ctx.local.record_stride(stride_start.elapsed());
            self.ctx.flush();
        }
    }

    /// bind, then up to `maxtries` attempts of execute, result and verify.
    async fn run_cycle(&mut self, cycle: u64, lag: Duration) -> Result<()> {
        let activity = self.ctx.activity.clone();
        let metrics = activity.metrics();
        let errors = activity.errors();
        metrics.cycle_started();
        let started = Instant::now();

        let Some(dispenser) = activity.sequence().get(cycle) else {
            metrics.cycle_finished(false);
            return Err(Error::EmptySequence {
                alias: activity.alias().to_string(),
                cycles: activity.input().total(),
            });
        };
        let op = match dispenser.bind(cycle) {
            Ok(op) => op,
            Err(source) => {
                metrics.cycle_finished(false);
                return Err(Error::Bind {
                    cycle,
                    op: dispenser.name().to_string(),
                    source,
                });
            }
        };
        let mut m = CycleMetric {
            cycle,
            bind: started.elapsed(),
            ..Default::default()
        };

        let mut escalated = None;
        loop {
            m.tries += 1;
            let attempt = self.attempt(&*op, dispenser.as_ref(), cycle, &mut m).await;
            match attempt {
                Ok(output) => {
                    m.success = true;
                    m.code = output.code;
                    m.bytes = output.bytes;
                    break;
                }
                Err(error) => {
                    let verdict = errors.handle(&error, cycle, m.tries);
                    m.code = verdict.code;
                    if verdict.stop {
                        escalated = Some(error);
                        break;
                    }
                    if verdict.retry {
                        if m.tries < activity.max_tries() {
                            errors.metrics().record_retry();
                            continue;
                        }
                        errors.exhausted(&error, cycle, m.tries);
                    }
                    break;
                }
            }
        }

        m.service = started.elapsed();
        m.response = m.service + lag;
        tracing::trace!(
            "{} cycle {cycle} tries={} success={} service={:?}",
            activity.alias(),
            m.tries,
            m.success,
            m.service
        );
        errors.metrics().record_tries(m.tries);
        metrics.cycle_finished(m.success);
        self.ctx.local.consume(&m);
        match escalated {
            Some(error) => Err(Error::Op(error)),
            None => Ok(()),
        }
    }

    async fn attempt(
        &self,
        op: &dyn CycleOp,
        dispenser: &dyn OpDispenser,
        cycle: u64,
        m: &mut CycleMetric,
    ) -> Result<OpOutput, OpError> {
        let t = Instant::now();
        let raw = op.execute().await;
        m.execute += t.elapsed();
        let raw = raw?;

        let t = Instant::now();
        let output = op.result(raw).await;
        let result_time = t.elapsed();
        m.result += result_time;
        let output = output?;

        let t = Instant::now();
        let verified = dispenser.verify(cycle, &output);
        m.verifier += t.elapsed();
        verified?;
        m.result_success = Some(result_time);
        Ok(output)
    }
}
