//! Run status and its atomic state machine.
//!
//! ```text
//! Created → Scheduled → Running → {Completed, Failed, Cancelled}
//! ```
//!
//! `Created` may also go straight to `Failed` (the run context rejected the
//! work), and any non-terminal state may go to `Cancelled`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Status of one run of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TaskStatus {
    /// Handle exists, nothing scheduled yet
    Created = 0,
    /// Unit of work accepted by the run context
    Scheduled = 1,
    /// Computation is executing
    Running = 2,
    /// Computation returned a value
    Completed = 3,
    /// Scheduling or the computation failed
    Failed = 4,
    /// Cancelled before an outcome was decided
    Cancelled = 5,
}

impl TaskStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskStatus::Created,
            1 => TaskStatus::Scheduled,
            2 => TaskStatus::Running,
            3 => TaskStatus::Completed,
            4 => TaskStatus::Failed,
            _ => TaskStatus::Cancelled,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Created => write!(f, "created"),
            TaskStatus::Scheduled => write!(f, "scheduled"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Atomically updated [`TaskStatus`], shared by every unit of one run.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    /// Create a cell holding `status`.
    pub fn new(status: TaskStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    /// Current status.
    pub fn get(&self) -> TaskStatus {
        TaskStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`. On a lost race, returns the status that won.
    pub fn transition(&self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskStatus> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(TaskStatus::from_u8)
    }

    /// Move any non-terminal status to `Cancelled`.
    ///
    /// Returns `false` when the run had already reached a terminal state.
    pub fn cancel(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if TaskStatus::from_u8(current).is_terminal() {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                TaskStatus::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}
