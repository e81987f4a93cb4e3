//! Motor run states and the per-activity tally of them.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    /// Ran out of cycles.
    Finished,
    /// Honoured a cooperative stop.
    Stopped,
    Errored,
    /// Aborted by a forced stop or dropped by runtime shutdown.
    Interrupted,
}

const STATES: usize = 8;

impl RunState {
    pub const ALL: [RunState; STATES] = [
        RunState::Uninitialized,
        RunState::Starting,
        RunState::Running,
        RunState::Stopping,
        RunState::Finished,
        RunState::Stopped,
        RunState::Errored,
        RunState::Interrupted,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Finished | RunState::Stopped | RunState::Errored | RunState::Interrupted
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Counts of motors per state at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TallyImage {
    counts: [usize; STATES],
}

impl TallyImage {
    pub fn count(&self, state: RunState) -> usize {
        self.counts[state.index()]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn terminal(&self) -> usize {
        RunState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| self.count(*s))
            .sum()
    }

    /// True when every motor has reached a terminal state, including when
    /// there are no motors at all.
    pub fn all_terminal(&self) -> bool {
        self.terminal() == self.total()
    }

    pub fn any_of(&self, states: &[RunState]) -> bool {
        states.iter().any(|s| self.count(*s) > 0)
    }

    /// True when no motor is in a state outside `states`.
    pub fn none_other_than(&self, states: &[RunState]) -> bool {
        RunState::ALL
            .iter()
            .filter(|s| !states.contains(s))
            .all(|s| self.count(*s) == 0)
    }
}

impl fmt::Display for TallyImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = RunState::ALL
            .iter()
            .filter(|s| self.count(**s) > 0)
            .map(|s| format!("{s}:{}", self.count(*s)))
            .collect();
        write!(f, "[{}]", parts.join(" "))
    }
}

/// Live motor-state counts for one activity, observable through a watch
/// channel.
#[derive(Debug)]
pub struct Tally {
    tx: watch::Sender<TallyImage>,
}

impl Default for Tally {
    fn default() -> Self {
        Self::new()
    }
}

impl Tally {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(TallyImage::default()),
        }
    }

    pub fn image(&self) -> TallyImage {
        *self.tx.borrow()
    }

    fn add(&self, state: RunState) {
        self.tx.send_modify(|img| img.counts[state.index()] += 1);
    }

    fn moved(&self, from: RunState, to: RunState) {
        self.tx.send_modify(|img| {
            img.counts[from.index()] -= 1;
            img.counts[to.index()] += 1;
        });
    }

    /// Resolves with the first image satisfying `predicate`.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&TallyImage) -> bool) -> TallyImage {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|img| predicate(img)).await {
            Ok(img) => *img,
            // the sender lives in `self`, so the channel cannot close under us
            Err(_) => self.image(),
        }
    }

    pub async fn await_any(&self, states: &[RunState]) -> TallyImage {
        self.wait_for(|img| img.any_of(states)).await
    }

    pub async fn await_none_other(&self, states: &[RunState]) -> TallyImage {
        self.wait_for(|img| img.none_other_than(states)).await
    }
}

/// One motor's slot in the tally. Only the owning motor moves it, and a
/// terminal state is never left.
#[derive(Debug)]
pub struct MotorState {
    id: usize,
    tally: Arc<Tally>,
    state: Mutex<RunState>,
}

impl MotorState {
    pub fn new(id: usize, tally: Arc<Tally>) -> Self {
        tally.add(RunState::Uninitialized);
        Self {
            id,
            tally,
            state: Mutex::new(RunState::Uninitialized),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn get(&self) -> RunState {
        *self.state.lock()
    }

    /// Moves to `next`. Returns false, changing nothing, if the motor is
    /// already terminal or already in `next`.
    pub fn enter(&self, next: RunState) -> bool {
        let mut current = self.state.lock();
        if current.is_terminal() || *current == next {
            return false;
        }
        self.tally.moved(*current, next);
        tracing::trace!("motor {} {} -> {}", self.id, *current, next);
        *current = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_final() {
        let tally = Arc::new(Tally::new());
        let m = MotorState::new(0, tally.clone());
        assert!(m.enter(RunState::Starting));
        assert!(m.enter(RunState::Running));
        assert!(m.enter(RunState::Finished));
        assert!(!m.enter(RunState::Interrupted));
        assert_eq!(m.get(), RunState::Finished);
        assert_eq!(tally.image().count(RunState::Finished), 1);
        assert_eq!(tally.image().total(), 1);
    }

    #[test]
    fn image_predicates() {
        let tally = Arc::new(Tally::new());
        assert!(tally.image().all_terminal());
        let a = MotorState::new(0, tally.clone());
        let b = MotorState::new(1, tally.clone());
        a.enter(RunState::Running);
        b.enter(RunState::Stopped);
        let img = tally.image();
        assert!(!img.all_terminal());
        assert!(img.any_of(&[RunState::Running]));
        assert!(img.none_other_than(&[RunState::Running, RunState::Stopped]));
        assert!(!img.none_other_than(&[RunState::Running]));
        assert_eq!(img.to_string(), "[Running:1 Stopped:1]");
    }

    #[tokio::test]
    async fn waiters_wake_on_transitions() {
        let tally = Arc::new(Tally::new());
        let m = Arc::new(MotorState::new(0, tally.clone()));
        let waiter = {
            let tally = tally.clone();
            tokio::spawn(async move { tally.await_any(&[RunState::Errored]).await })
        };
        m.enter(RunState::Running);
        m.enter(RunState::Errored);
        let img = waiter.await.unwrap();
        assert_eq!(img.count(RunState::Errored), 1);
    }
}
