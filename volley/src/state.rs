//! Run lifecycle states and how executor states fold into the state of the run.
use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use serde::{Deserialize, Serialize};

/// Lifecycle of the whole run and of each executor.
///
/// ```text
/// Pending -> Starting -> Running -> GracefulStop -> Finished | Stopped
/// ```
///
/// Any state can jump straight to `Stopped` on cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum RunState {
    Pending = 0,
    Starting = 1,
    Running = 2,
    GracefulStop = 3,
    Stopped = 4,
    Finished = 5,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Finished)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::GracefulStop,
            4 => Self::Stopped,
            _ => Self::Finished,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::GracefulStop => "graceful-stop",
            Self::Stopped => "stopped",
            Self::Finished => "finished",
        };
        f.write_str(label)
    }
}

/// Lock-free holder for a [`RunState`], readable from any thread.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: RunState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Stores `state` and returns the previous one.
    pub(crate) fn set(&self, state: RunState) -> RunState {
        RunState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

/// Folds executor states into the state of the run as a whole.
///
/// `started` tells whether the scheduler has begun the run; `cancelled` whether the
/// caller asked it to stop.
pub fn aggregate_run_state(states: &[RunState], started: bool, cancelled: bool) -> RunState {
    if !started {
        return RunState::Pending;
    }
    if states.iter().all(|s| s.is_terminal()) {
        let forced = states.iter().any(|s| *s == RunState::Stopped);
        return if cancelled || forced {
            RunState::Stopped
        } else {
            RunState::Finished
        };
    }
    if states
        .iter()
        .any(|s| matches!(s, RunState::Starting | RunState::Running))
    {
        return RunState::Running;
    }
    // executors still waiting for their offset are not active
    if states.iter().any(|s| *s == RunState::GracefulStop) {
        return RunState::GracefulStop;
    }
    // only pending and terminal executors left
    if states.iter().all(|s| *s == RunState::Pending) {
        RunState::Starting
    } else {
        RunState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunState::*;

    #[test]
    fn not_started_is_pending() {
        assert_eq!(aggregate_run_state(&[Running], false, false), Pending);
    }

    #[test]
    fn waiting_for_first_start_is_starting() {
        assert_eq!(aggregate_run_state(&[Pending, Pending], true, false), Starting);
    }

    #[test]
    fn any_active_executor_means_running() {
        assert_eq!(
            aggregate_run_state(&[GracefulStop, Running, Pending], true, false),
            Running
        );
        assert_eq!(aggregate_run_state(&[Finished, Pending], true, false), Running);
    }

    #[test]
    fn all_remaining_in_graceful_stop() {
        assert_eq!(
            aggregate_run_state(&[Finished, GracefulStop, GracefulStop], true, false),
            GracefulStop
        );
    }

    #[test]
    fn pending_executors_do_not_hold_off_graceful_stop() {
        assert_eq!(aggregate_run_state(&[GracefulStop, Pending], true, false), GracefulStop);
        assert_eq!(
            aggregate_run_state(&[Finished, GracefulStop, Pending], true, false),
            GracefulStop
        );
    }

    #[test]
    fn terminal_outcomes() {
        assert_eq!(aggregate_run_state(&[Finished, Finished], true, false), Finished);
        assert_eq!(aggregate_run_state(&[Finished, Stopped], true, false), Stopped);
        assert_eq!(aggregate_run_state(&[Finished, Finished], true, true), Stopped);
    }

    #[test]
    fn cell_round_trips_every_state() {
        let cell = StateCell::new(Pending);
        for state in [Starting, Running, GracefulStop, Stopped, Finished, Pending] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }
}
