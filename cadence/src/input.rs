//! Shared cycle allocation.
//!
//! Motors pull contiguous segments from one [`AtomicInput`] with a CAS loop.
//! Every cycle of every recycle pass is handed out exactly once, with no gaps,
//! whatever the number of motors.

use std::{
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::params::CyclesSpec;

/// A contiguous run of cycles within one recycle pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSegment {
    pub start: u64,
    pub end: u64,
    pub recycle: u64,
}

impl CycleSegment {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn cycles(&self) -> Range<u64> {
        self.start..self.end
    }
}

#[derive(Debug)]
pub struct AtomicInput {
    cycles: CyclesSpec,
    recycles: CyclesSpec,
    total: u64,
    position: AtomicU64,
}

impl AtomicInput {
    pub fn new(cycles: CyclesSpec, recycles: CyclesSpec) -> Self {
        let total = cycles.count().saturating_mul(recycles.count());
        Self {
            cycles,
            recycles,
            total,
            position: AtomicU64::new(0),
        }
    }

    /// Claims up to `stride` cycles. The last segment of a pass is cut at the
    /// end of the range rather than spilling into the next pass.
    pub fn next_segment(&self, stride: u64) -> Option<CycleSegment> {
        let per_pass = self.cycles.count();
        let stride = stride.max(1);
        let mut current = self.position.load(Ordering::Relaxed);
        loop {
            if current >= self.total {
                return None;
            }
            let pass = current / per_pass;
            let offset = current % per_pass;
            let len = stride.min(per_pass - offset);
            match self.position.compare_exchange_weak(
                current,
                current + len,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let start = self.cycles.start + offset;
                    return Some(CycleSegment {
                        start,
                        end: start + len,
                        recycle: self.recycles.start + pass,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Cycles across all passes.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Cycles not yet claimed by any motor.
    pub fn remaining(&self) -> u64 {
        self.total
            .saturating_sub(self.position.load(Ordering::Relaxed))
    }

    pub fn cycles(&self) -> CyclesSpec {
        self.cycles
    }
}
