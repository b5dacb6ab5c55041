//! Handles and scopes of started runs.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use errand_core::{StatusCell, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;

#[derive(Debug)]
struct Shared {
    id: TaskId,
    label: Option<String>,
    status: StatusCell,
    token: CancellationToken,
    finished: Notify,
    run_context: String,
    response_context: String,
    error_context: String,
    delay: Duration,
    created_at: Time,
    started_at: OnceLock<Time>,
    finished_at: OnceLock<Time>,
}

/// Cancellable, queryable reference to one started run.
///
/// Clones share the same run. Dropping every clone does not cancel it.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    shared: Arc<Shared>,
}

/// Context names a run was started with.
#[derive(Debug, Clone)]
pub(crate) struct Routing {
    pub run: String,
    pub response: String,
    pub error: String,
}

impl TaskHandle {
    pub(crate) fn new(label: Option<String>, routing: Routing, delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: TaskId::new(),
                label,
                status: StatusCell::new(TaskStatus::Created),
                token: CancellationToken::new(),
                finished: Notify::new(),
                run_context: routing.run,
                response_context: routing.response,
                error_context: routing.error,
                delay,
                created_at: chrono::Utc::now(),
                started_at: OnceLock::new(),
                finished_at: OnceLock::new(),
            }),
        }
    }

    /// Run identifier.
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    /// Label given with [`Task::named`](crate::Task::named).
    pub fn label(&self) -> Option<&str> {
        self.shared.label.as_deref()
    }

    /// Current status.
    pub fn status(&self) -> TaskStatus {
        self.shared.status.get()
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Whether the run has not reached a terminal state yet.
    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    /// Request cancellation.
    ///
    /// Returns `true` if this call cancelled the run, `false` if it was
    /// already terminal (including already cancelled).
    pub fn cancel(&self) -> bool {
        if !self.shared.status.cancel() {
            return false;
        }
        self.shared.token.cancel();
        self.mark_finished();
        info!("Task {} cancelled", self.display_name());
        true
    }

    /// Wait until the run reaches a terminal state.
    ///
    /// Resolves once the outcome is decided; a success or error handler may
    /// still be queued on its context at that point.
    pub async fn finished(&self) -> TaskStatus {
        loop {
            let notified = self.shared.finished.notified();
            let status = self.status();
            if status.is_terminal() {
                return status;
            }
            notified.await;
        }
    }

    /// Serializable snapshot.
    pub fn report(&self) -> TaskReport {
        let shared = &self.shared;
        TaskReport {
            id: shared.id,
            label: shared.label.clone(),
            status: shared.status.get(),
            run_context: shared.run_context.clone(),
            response_context: shared.response_context.clone(),
            error_context: shared.error_context.clone(),
            delay_ms: u64::try_from(shared.delay.as_millis()).unwrap_or(u64::MAX),
            created_at: shared.created_at,
            started_at: shared.started_at.get().copied(),
            finished_at: shared.finished_at.get().copied(),
        }
    }

    pub(crate) fn display_name(&self) -> String {
        match &self.shared.label {
            Some(label) => format!("{} ({})", self.shared.id, label),
            None => self.shared.id.to_string(),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    pub(crate) fn scope(&self, context: &str) -> Scope {
        Scope {
            id: self.shared.id,
            token: self.shared.token.clone(),
            context: context.to_string(),
        }
    }

    /// Move between states; a terminal target records the finish time and
    /// wakes [`finished`](Self::finished) waiters.
    pub(crate) fn transition(&self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskStatus> {
        self.shared.status.transition(from, to)?;
        if to == TaskStatus::Running {
            let _ = self.shared.started_at.set(chrono::Utc::now());
        }
        if to.is_terminal() {
            self.mark_finished();
        }
        Ok(())
    }

    fn mark_finished(&self) {
        let _ = self.shared.finished_at.set(chrono::Utc::now());
        self.shared.finished.notify_waiters();
    }
}

/// Handed to the computation: cooperative cancellation and run metadata.
#[derive(Debug, Clone)]
pub struct Scope {
    id: TaskId,
    token: CancellationToken,
    context: String,
}

impl Scope {
    /// Run identifier.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Name of the context the computation runs on.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// `false` once cancellation has been requested. Long computations should
    /// poll this and bail out.
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Sleep unless cancelled first. Returns `false` if cancelled.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Snapshot of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    /// Run identifier
    pub id: TaskId,
    /// Optional label
    pub label: Option<String>,
    /// Status at snapshot time
    pub status: TaskStatus,
    /// Where the computation runs
    pub run_context: String,
    /// Where the success handler runs
    pub response_context: String,
    /// Where the error handler runs
    pub error_context: String,
    /// Start delay in milliseconds
    pub delay_ms: u64,
    /// When the run was started
    pub created_at: Time,
    /// When the computation began
    pub started_at: Option<Time>,
    /// When the outcome was decided
    pub finished_at: Option<Time>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> TaskHandle {
        TaskHandle::new(
            Some("report".to_string()),
            Routing {
                run: "background".to_string(),
                response: "coordinating".to_string(),
                error: "coordinating".to_string(),
            },
            Duration::from_millis(250),
        )
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = handle();
        handle.transition(TaskStatus::Created, TaskStatus::Scheduled).unwrap();

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
        assert!(!handle.is_active());
        assert_eq!(handle.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let handle = handle();
        handle.transition(TaskStatus::Created, TaskStatus::Scheduled).unwrap();
        handle.transition(TaskStatus::Scheduled, TaskStatus::Running).unwrap();
        handle.transition(TaskStatus::Running, TaskStatus::Completed).unwrap();

        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
        assert_eq!(handle.status(), TaskStatus::Completed);
    }

    #[test]
    fn test_report_tracks_timestamps() {
        let handle = handle();
        let report = handle.report();
        assert_eq!(report.status, TaskStatus::Created);
        assert_eq!(report.delay_ms, 250);
        assert!(report.started_at.is_none());

        handle.transition(TaskStatus::Created, TaskStatus::Scheduled).unwrap();
        handle.transition(TaskStatus::Scheduled, TaskStatus::Running).unwrap();
        handle.transition(TaskStatus::Running, TaskStatus::Failed).unwrap();

        let report = handle.report();
        assert!(report.started_at.is_some());
        assert!(report.finished_at.is_some());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["label"], "report");
    }

    #[test]
    fn test_report_saturates_huge_delay() {
        let handle = TaskHandle::new(
            None,
            Routing {
                run: "background".to_string(),
                response: "coordinating".to_string(),
                error: "coordinating".to_string(),
            },
            Duration::MAX,
        );
        assert_eq!(handle.report().delay_ms, u64::MAX);
    }

    #[tokio::test]
    async fn test_finished_wakes_on_cancel() {
        let handle = handle();
        let waiter = handle.clone();
        let join = tokio::spawn(async move { waiter.finished().await });

        tokio::task::yield_now().await;
        handle.cancel();

        assert_eq!(join.await.unwrap(), TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_scope_sleep_stops_on_cancel() {
        let handle = handle();
        let scope = handle.scope("background");
        assert!(scope.is_active());

        handle.cancel();
        assert!(!scope.sleep(Duration::from_secs(5)).await);
        assert!(scope.is_cancelled());
        assert_eq!(scope.context(), "background");
    }
}
