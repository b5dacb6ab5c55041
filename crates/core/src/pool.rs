//! The background worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::{Handle, Runtime};
use tracing::debug;

use crate::context::{in_context, ExecutionContext, UnitOfWork};
use crate::error::ScheduleError;

/// Multi-threaded context backed by a tokio runtime.
///
/// Either owns its runtime ([`WorkerPool::new`]) or borrows one the host
/// already runs ([`WorkerPool::from_handle`]).
#[derive(Debug)]
pub struct WorkerPool {
    name: Arc<str>,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Build a pool with its own multi-thread runtime.
    pub fn new(
        name: impl Into<String>,
        worker_threads: usize,
        thread_name: impl Into<String>,
    ) -> crate::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(thread_name.into())
            .enable_all()
            .build()?;
        let name: Arc<str> = Arc::from(name.into());

        debug!("Worker pool `{}` started with {} threads", name, worker_threads.max(1));

        Ok(Self {
            name,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            closed: AtomicBool::new(false),
        })
    }

    /// Schedule onto a runtime the host owns.
    pub fn from_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            name: Arc::from(name.into()),
            handle,
            runtime: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Runtime handle units are spawned on.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Refuse new work and drop an owned runtime without blocking.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        debug!("Worker pool `{}` shut down", self.name);
    }
}

impl ExecutionContext for WorkerPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self, unit: UnitOfWork) -> Result<(), ScheduleError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ScheduleError::Closed(self.name.to_string()));
        }
        self.handle.spawn(in_context(self.name.clone(), unit));
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let runtime = self
            .runtime
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::current_context;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_owned_pool_runs_units_on_its_threads() {
        let pool = WorkerPool::new("background", 2, "pool-test").unwrap();
        let (tx, rx) = mpsc::channel();

        pool.schedule(Box::pin(async move {
            let thread = std::thread::current().name().map(str::to_string);
            let _ = tx.send((thread, current_context()));
        }))
        .unwrap();

        let (thread, context) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(thread.as_deref(), Some("pool-test"));
        assert_eq!(context.as_deref(), Some("background"));
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_work() {
        let pool = WorkerPool::from_handle("io", Handle::current());
        pool.shutdown();

        let refused = pool.schedule(Box::pin(async {}));
        assert_eq!(refused, Err(ScheduleError::Closed("io".to_string())));
    }
}
