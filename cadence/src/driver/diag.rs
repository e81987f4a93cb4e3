//! `driver=diag`: a synthetic op for exercising the engine.
//!
//! Knobs, read from the template fields or the activity parameters:
//!
//! | key                 | effect                                                      |
//! |---------------------|-------------------------------------------------------------|
//! | `delay_ms`          | sleep this long inside every attempt                        |
//! | `error_modulo`      | cycles divisible by it fail                                 |
//! | `fail_attempts`     | failing cycles fail only this many attempts, then succeed   |
//! | `error_name`        | error name reported for failures (default `DiagError`)      |
//! | `verify_modulo`     | cycles divisible by it fail verification                    |
//! | `bind_error_modulo` | cycles divisible by it cannot be bound                      |

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use super::{DriverAdapter, knob};
use crate::{
    error::{OpError, Result},
    op::{CycleOp, OpDispenser, OpOutput, OpTemplate},
    params::ActivityDef,
};

pub struct DiagDriver;

impl DriverAdapter for DiagDriver {
    fn name(&self) -> &str {
        "diag"
    }

    fn map_op(&self, template: &OpTemplate, def: &ActivityDef) -> Result<Arc<dyn OpDispenser>> {
        Ok(Arc::new(DiagDispenser {
            name: template.name.clone(),
            delay: Duration::from_millis(knob(template, def, "delay_ms")?.unwrap_or(0)),
            error_modulo: knob(template, def, "error_modulo")?.unwrap_or(0),
            fail_attempts: knob(template, def, "fail_attempts")?.unwrap_or(u32::MAX),
            error_name: knob(template, def, "error_name")?.unwrap_or_else(|| "DiagError".into()),
            verify_modulo: knob(template, def, "verify_modulo")?.unwrap_or(0),
            bind_error_modulo: knob(template, def, "bind_error_modulo")?.unwrap_or(0),
        }))
    }
}

pub struct DiagDispenser {
    name: String,
    delay: Duration,
    error_modulo: u64,
    fail_attempts: u32,
    error_name: String,
    verify_modulo: u64,
    bind_error_modulo: u64,
}

fn hits(modulo: u64, cycle: u64) -> bool {
    modulo > 0 && cycle % modulo == 0
}

impl OpDispenser for DiagDispenser {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&self, cycle: u64) -> Result<Box<dyn CycleOp>, OpError> {
        if hits(self.bind_error_modulo, cycle) {
            return Err(OpError::new(
                "BindError",
                format!("diag op '{}' refuses cycle {cycle}", self.name),
            ));
        }
        Ok(Box::new(DiagOp {
            cycle,
            delay: self.delay,
            failing: hits(self.error_modulo, cycle),
            fail_attempts: self.fail_attempts,
            error_name: self.error_name.clone(),
            attempts: AtomicU32::new(0),
        }))
    }

    fn verify(&self, cycle: u64, _output: &OpOutput) -> Result<(), OpError> {
        if hits(self.verify_modulo, cycle) {
            return Err(OpError::verification(format!(
                "cycle {cycle} failed verification"
            )));
        }
        Ok(())
    }
}

struct DiagOp {
    cycle: u64,
    delay: Duration,
    failing: bool,
    fail_attempts: u32,
    error_name: String,
    attempts: AtomicU32,
}

#[async_trait]
impl CycleOp for DiagOp {
    async fn execute(&self) -> Result<OpOutput, OpError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if self.failing && attempt <= self.fail_attempts {
            return Err(OpError::new(
                self.error_name.clone(),
                format!("cycle {} attempt {attempt}", self.cycle),
            ));
        }
        Ok(OpOutput {
            code: 0,
            bytes: 8,
            body: Some(self.cycle.to_string()),
        })
    }
}
