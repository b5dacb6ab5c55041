//! Handle registry for hosts that own many runs.
//!
//! Nothing tracks started tasks implicitly. A host that wants to cancel its
//! outstanding work on teardown registers handles here and calls
//! [`TaskRegistry::cancel_all`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use errand_core::{TaskId, TaskStatus};

use crate::handle::{TaskHandle, TaskReport};

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No handle with this id is registered
    #[error("Task {0} not found")]
    NotFound(TaskId),

    /// The run already reached a terminal state
    #[error("Cannot cancel task {0} in {1} state")]
    AlreadyFinished(TaskId, TaskStatus),
}

/// Filter for listing runs
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Filter by status
    pub status: Option<TaskStatus>,
    /// Filter by label
    pub label: Option<String>,
    /// Maximum results to return
    pub limit: Option<usize>,
    /// Include terminal runs
    pub include_finished: bool,
}

impl TaskFilter {
    fn matches(&self, report: &TaskReport) -> bool {
        if let Some(status) = self.status {
            if report.status != status {
                return false;
            }
        }

        if let Some(label) = &self.label {
            if report.label.as_deref() != Some(label.as_str()) {
                return false;
            }
        }

        self.include_finished || !report.status.is_terminal()
    }
}

/// TaskRegistry trait - explicit ownership of started runs
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Track a handle
    async fn register(&self, handle: TaskHandle);

    /// Snapshot of a tracked run
    async fn get(&self, id: &TaskId) -> Option<TaskReport>;

    /// Cancel a tracked run
    async fn cancel(&self, id: &TaskId) -> Result<(), RegistryError>;

    /// List tracked runs, oldest first
    async fn list(&self, filter: TaskFilter) -> Vec<TaskReport>;

    /// Cancel every non-terminal run; returns how many were cancelled
    async fn cancel_all(&self) -> usize;

    /// Forget terminal runs; returns how many were dropped
    async fn prune(&self) -> usize;

    /// Wait for a run to reach a terminal state (with timeout)
    async fn wait_for_completion(&self, id: &TaskId, timeout: Duration) -> Option<TaskReport>;
}

/// In-memory registry implementation
#[derive(Debug, Default)]
pub struct InMemoryTaskRegistry {
    handles: Arc<Mutex<HashMap<TaskId, TaskHandle>>>,
}

impl InMemoryTaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked handles
    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Whether nothing is tracked
    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }
}

#[async_trait]
impl TaskRegistry for InMemoryTaskRegistry {
    async fn register(&self, handle: TaskHandle) {
        debug!("Registered task {}", handle.display_name());
        self.handles.lock().await.insert(handle.id(), handle);
    }

    async fn get(&self, id: &TaskId) -> Option<TaskReport> {
        let handles = self.handles.lock().await;
        handles.get(id).map(TaskHandle::report)
    }

    async fn cancel(&self, id: &TaskId) -> Result<(), RegistryError> {
        let handles = self.handles.lock().await;

        match handles.get(id) {
            Some(handle) => {
                if handle.cancel() {
                    Ok(())
                } else {
                    Err(RegistryError::AlreadyFinished(*id, handle.status()))
                }
            }
            None => Err(RegistryError::NotFound(*id)),
        }
    }

    async fn list(&self, filter: TaskFilter) -> Vec<TaskReport> {
        let handles = self.handles.lock().await;
        let mut results: Vec<_> = handles
            .values()
            .map(TaskHandle::report)
            .filter(|report| filter.matches(report))
            .collect();
        drop(handles);

        results.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });

        // Apply limit
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }

        results
    }

    async fn cancel_all(&self) -> usize {
        let handles = self.handles.lock().await;
        let cancelled = handles.values().filter(|handle| handle.cancel()).count();
        info!("Cancelled {} of {} tracked tasks", cancelled, handles.len());
        cancelled
    }

    async fn prune(&self) -> usize {
        let mut handles = self.handles.lock().await;
        let before = handles.len();
        handles.retain(|_, handle| handle.is_active());
        before - handles.len()
    }

    async fn wait_for_completion(&self, id: &TaskId, timeout: Duration) -> Option<TaskReport> {
        let handle = self.handles.lock().await.get(id).cloned()?;
        tokio::time::timeout(timeout, handle.finished()).await.ok()?;
        Some(handle.report())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Task;
    use errand_core::{Contexts, UnhandledPolicy};
    use tokio::runtime::Handle;

    fn contexts() -> Contexts {
        Contexts::builder()
            .background_runtime(Handle::current())
            .unhandled(UnhandledPolicy::Log)
            .build()
            .unwrap()
    }

    fn started(contexts: &Contexts, label: &str, delay: Duration) -> TaskHandle {
        let mut task = Task::new(contexts, |_| Ok(())).named(label);
        task.start_after(delay);
        task.handle().unwrap().clone()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_unknown_and_finished() {
        let contexts = contexts();
        let registry = InMemoryTaskRegistry::new();

        let missing = TaskId::new();
        assert!(matches!(
            registry.cancel(&missing).await,
            Err(RegistryError::NotFound(id)) if id == missing
        ));

        let handle = started(&contexts, "quick", Duration::ZERO);
        let id = handle.id();
        registry.register(handle).await;

        let report = registry
            .wait_for_completion(&id, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert!(matches!(
            registry.cancel(&id).await,
            Err(RegistryError::AlreadyFinished(_, TaskStatus::Completed))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_all_then_prune() {
        let contexts = contexts();
        let registry = InMemoryTaskRegistry::new();

        for label in ["a", "b", "c"] {
            registry
                .register(started(&contexts, label, Duration::from_secs(60)))
                .await;
        }

        let pending = registry.list(TaskFilter::default()).await;
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|r| r.status == TaskStatus::Scheduled));

        assert_eq!(registry.cancel_all().await, 3);
        assert_eq!(registry.cancel_all().await, 0);
        assert!(registry.list(TaskFilter::default()).await.is_empty());

        let cancelled = registry
            .list(TaskFilter {
                status: Some(TaskStatus::Cancelled),
                include_finished: true,
                ..Default::default()
            })
            .await;
        assert_eq!(cancelled.len(), 3);

        assert_eq!(registry.prune().await, 3);
        assert!(registry.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_list_filters_by_label_and_limit() {
        let contexts = contexts();
        let registry = InMemoryTaskRegistry::new();

        for label in ["sync", "sync", "upload"] {
            registry
                .register(started(&contexts, label, Duration::from_secs(60)))
                .await;
        }

        let sync = registry
            .list(TaskFilter {
                label: Some("sync".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(sync.len(), 2);

        let limited = registry
            .list(TaskFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await;
        assert_eq!(limited.len(), 1);

        let id = sync[0].id;
        assert!(registry.cancel(&id).await.is_ok());
        assert_eq!(
            registry.get(&id).await.map(|r| r.status),
            Some(TaskStatus::Cancelled)
        );

        registry.cancel_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_times_out_for_pending_run() {
        let contexts = contexts();
        let registry = InMemoryTaskRegistry::new();
        let handle = started(&contexts, "slow", Duration::from_secs(60));
        let id = handle.id();
        registry.register(handle).await;

        assert!(registry
            .wait_for_completion(&id, Duration::from_millis(50))
            .await
            .is_none());
        registry.cancel_all().await;
    }
}
