//! Task driver state machine.
//!
//! ```text
//! Idle --Start--> Scanning --ScanFinished--> Diffing --DiffFinished--> Packaging --PackagingFinished--> Completed
//!                                               \--DiffFinished(preview)--> Completed
//! Scanning | Diffing | Packaging --Cancel--> Cancelled
//! Scanning | Diffing | Packaging --Fail----> Failed
//! Completed | Failed | Cancelled --Reset--> Idle
//! ```

use crate::utils::errors::{EngineError, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPhase {
    Idle,
    Scanning,
    Diffing,
    Packaging,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Start,
    ScanFinished,
    DiffFinished { preview: bool },
    PackagingFinished,
    Cancel,
    Fail,
    /// The caller consumed the terminal result
    Reset,
}

impl TaskPhase {
    pub fn label(self) -> &'static str {
        match self {
            TaskPhase::Idle => "idle",
            TaskPhase::Scanning => "scanning",
            TaskPhase::Diffing => "diffing",
            TaskPhase::Packaging => "packaging",
            TaskPhase::Completed => "completed",
            TaskPhase::Failed => "failed",
            TaskPhase::Cancelled => "cancelled",
        }
    }

    /// Scanning, diffing or packaging
    pub fn is_active(self) -> bool {
        matches!(self, TaskPhase::Scanning | TaskPhase::Diffing | TaskPhase::Packaging)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskPhase::Completed | TaskPhase::Failed | TaskPhase::Cancelled)
    }

    /// Apply an event, rejecting transitions the machine does not have.
    pub fn next(self, event: TaskEvent) -> Result<TaskPhase> {
        use TaskEvent as E;
        use TaskPhase as P;

        let next = match (self, event) {
            (P::Idle, E::Start) => P::Scanning,
            (P::Scanning, E::ScanFinished) => P::Diffing,
            (P::Diffing, E::DiffFinished { preview: true }) => P::Completed,
            (P::Diffing, E::DiffFinished { preview: false }) => P::Packaging,
            (P::Packaging, E::PackagingFinished) => P::Completed,
            (phase, E::Cancel) if phase.is_active() => P::Cancelled,
            (phase, E::Fail) if phase.is_active() => P::Failed,
            (phase, E::Reset) if phase.is_terminal() => P::Idle,
            (phase, event) => {
                return Err(EngineError::InvalidTransition {
                    from: phase.to_string(),
                    event: format!("{event:?}"),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
