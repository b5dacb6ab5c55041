//! The deferred task: configure, start, route the outcome.
//!
//! A [`Task`] runs its computation on the run context (background by
//! default), then hands the outcome to a separately scheduled unit on the
//! response context (success) or error context (failure), both coordinating
//! by default. A failure with no error handler is raised as unhandled on the
//! coordinating context.
//!
//! ```text
//! start_after(d) → schedule on run context → [cancelled?] → wait d → compute
//!                → Ok  → schedule on_success on response context
//!                → Err → schedule on_error on error context | raise unhandled
//! ```

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use errand_core::{ContextRef, Contexts, ExecutionContext, ScheduleError, TaskError, TaskStatus};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use crate::handle::{Routing, Scope, TaskHandle};

type Body<T> = Arc<dyn Fn(Scope) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;
type Handler<V> = Arc<dyn Fn(V) + Send + Sync>;

/// A deferred computation and where its outcome goes.
///
/// Configure with the by-value setters, then [`start`](Task::start). Each
/// start snapshots the configuration; changing it afterwards only affects
/// later starts.
pub struct Task<T> {
    contexts: Contexts,
    body: Body<T>,
    label: Option<String>,
    run_context: ContextRef,
    response_context: ContextRef,
    error_context: ContextRef,
    on_success: Option<Handler<T>>,
    on_error: Option<Handler<TaskError>>,
    handle: Option<TaskHandle>,
}

impl<T: Send + 'static> Task<T> {
    /// Wrap a blocking computation.
    ///
    /// On a multi-thread runtime the computation runs through
    /// [`block_in_place`](tokio::task::block_in_place), so the worker's other
    /// units keep running. On a single-threaded context (the coordinating one)
    /// it occupies the thread. Poll [`Scope::is_active`] to stop early.
    pub fn new<F>(contexts: &Contexts, computation: F) -> Self
    where
        F: Fn(&Scope) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let computation = Arc::new(computation);
        Self::with_body(
            contexts,
            Arc::new(move |scope: Scope| {
                let computation = computation.clone();
                async move { run_blocking(|| computation(&scope)) }.boxed()
            }),
        )
    }

    /// Wrap an async computation.
    pub fn from_async<F, Fut>(contexts: &Contexts, computation: F) -> Self
    where
        F: Fn(Scope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::with_body(contexts, Arc::new(move |scope: Scope| computation(scope).boxed()))
    }

    fn with_body(contexts: &Contexts, body: Body<T>) -> Self {
        Self {
            contexts: contexts.clone(),
            body,
            label: None,
            run_context: ContextRef::Background,
            response_context: ContextRef::Coordinating,
            error_context: ContextRef::Coordinating,
            on_success: None,
            on_error: None,
            handle: None,
        }
    }

    /// Label used in logs and reports.
    pub fn named(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Where the computation runs.
    pub fn on_run_context(mut self, context: impl Into<ContextRef>) -> Self {
        self.run_context = context.into();
        self
    }

    /// Run the computation on the coordinating context.
    pub fn run_on_coordinating(self) -> Self {
        self.on_run_context(ContextRef::Coordinating)
    }

    /// Run the computation on the background context.
    pub fn run_on_background(self) -> Self {
        self.on_run_context(ContextRef::Background)
    }

    /// Where the success handler runs.
    pub fn on_response_context(mut self, context: impl Into<ContextRef>) -> Self {
        self.response_context = context.into();
        self
    }

    /// Deliver results on the coordinating context.
    pub fn respond_on_coordinating(self) -> Self {
        self.on_response_context(ContextRef::Coordinating)
    }

    /// Deliver results on the background context.
    pub fn respond_on_background(self) -> Self {
        self.on_response_context(ContextRef::Background)
    }

    /// Where the error handler runs.
    pub fn on_error_context(mut self, context: impl Into<ContextRef>) -> Self {
        self.error_context = context.into();
        self
    }

    /// Set the success handler, replacing any previous one.
    pub fn on_success<F>(mut self, handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(handler));
        self
    }

    /// Set the error handler, replacing any previous one.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(TaskError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Start now. Same as `start_after(Duration::ZERO)`.
    pub fn start(&mut self) -> &mut Self {
        self.start_after(Duration::ZERO)
    }

    /// Start after `delay`. Never blocks and never fails; scheduling problems
    /// are routed like computation failures.
    ///
    /// If the previous run is still in flight it is cancelled first.
    pub fn start_after(&mut self, delay: Duration) -> &mut Self {
        if let Some(previous) = &self.handle {
            if previous.is_active() {
                warn!(
                    "Task {} restarted while {}, cancelling the previous run",
                    previous.display_name(),
                    previous.status()
                );
                previous.cancel();
            }
        }

        let handle = TaskHandle::new(
            self.label.clone(),
            Routing {
                run: self.contexts.label(&self.run_context),
                response: self.contexts.label(&self.response_context),
                error: self.contexts.label(&self.error_context),
            },
            delay,
        );
        self.handle = Some(handle.clone());

        let run = Run {
            contexts: self.contexts.clone(),
            body: self.body.clone(),
            response_context: self.response_context.clone(),
            error_context: self.error_context.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            handle,
        };
        run.launch(&self.run_context, delay);
        self
    }

    /// Cancel the current run, if any. Idempotent.
    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }

    /// Handle of the current run, `None` before the first start.
    pub fn handle(&self) -> Option<&TaskHandle> {
        self.handle.as_ref()
    }

    /// Status of the current run; `Created` before the first start.
    pub fn status(&self) -> TaskStatus {
        self.handle
            .as_ref()
            .map(TaskHandle::status)
            .unwrap_or(TaskStatus::Created)
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("run_context", &self.run_context.label())
            .field("response_context", &self.response_context.label())
            .field("error_context", &self.error_context.label())
            .field("has_on_success", &self.on_success.is_some())
            .field("has_on_error", &self.on_error.is_some())
            .field("handle", &self.handle.as_ref().map(TaskHandle::id))
            .finish()
    }
}

/// Configuration snapshot of one start.
struct Run<T> {
    contexts: Contexts,
    body: Body<T>,
    response_context: ContextRef,
    error_context: ContextRef,
    on_success: Option<Handler<T>>,
    on_error: Option<Handler<TaskError>>,
    handle: TaskHandle,
}

impl<T> Clone for Run<T> {
    fn clone(&self) -> Self {
        Self {
            contexts: self.contexts.clone(),
            body: self.body.clone(),
            response_context: self.response_context.clone(),
            error_context: self.error_context.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<T: Send + 'static> Run<T> {
    fn launch(self, run_context: &ContextRef, delay: Duration) {
        let context = match self.contexts.resolve(run_context) {
            Ok(context) => context,
            Err(source) => {
                let _ = self.handle.transition(TaskStatus::Created, TaskStatus::Failed);
                self.route_failure(TaskError::Schedule {
                    context: self.contexts.label(run_context),
                    source,
                });
                return;
            }
        };

        // Scheduled before handing the unit over, so it can move to Running.
        if self
            .handle
            .transition(TaskStatus::Created, TaskStatus::Scheduled)
            .is_err()
        {
            return;
        }

        let name = context.name().to_string();
        let guard = Abandoned {
            run: self.clone(),
            context: name.clone(),
            handover: Arc::new(AtomicU8::new(PENDING)),
        };
        let handover = guard.handover.clone();
        let unit = async move { guard.run.execute(&guard.context, delay).await }.boxed();

        match context.schedule(unit) {
            Ok(()) => {
                debug!(
                    "Task {} scheduled on `{}` with delay {:?}",
                    self.handle.display_name(),
                    name,
                    delay
                );
                // The context may have dropped the unit before returning.
                if handover
                    .compare_exchange(PENDING, HANDED_OVER, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    self.abandon(&name, ScheduleError::Closed(name.clone()));
                }
            }
            Err(source) => self.abandon(&name, source),
        }
    }

    /// Fail a run whose unit will never finish on `context`.
    fn abandon(&self, context: &str, source: ScheduleError) {
        for from in [TaskStatus::Scheduled, TaskStatus::Running] {
            if self.handle.transition(from, TaskStatus::Failed).is_ok() {
                self.route_failure(TaskError::Schedule {
                    context: context.to_string(),
                    source,
                });
                return;
            }
        }
    }

    async fn execute(&self, context: &str, delay: Duration) {
        let handle = &self.handle;

        if handle.is_cancelled() {
            debug!("Task {} cancelled before it ran", handle.display_name());
            return;
        }

        if !delay.is_zero() {
            tokio::select! {
                _ = handle.token().cancelled() => {
                    debug!("Task {} cancelled during its delay", handle.display_name());
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if handle
            .transition(TaskStatus::Scheduled, TaskStatus::Running)
            .is_err()
        {
            debug!("Task {} cancelled before it ran", handle.display_name());
            return;
        }

        let scope = handle.scope(context);
        let body = self.body.clone();
        let outcome = AssertUnwindSafe(async move { body(scope).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => match handle.transition(TaskStatus::Running, TaskStatus::Completed) {
                Ok(()) => self.deliver_success(value),
                Err(status) => debug!(
                    "Task {} completed after being {}, result dropped",
                    handle.display_name(),
                    status
                ),
            },
            Ok(Err(e)) => self.finish_failed(TaskError::Failed(e)),
            Err(payload) => self.finish_failed(TaskError::from_panic(payload)),
        }
    }

    fn finish_failed(&self, failure: TaskError) {
        match self.handle.transition(TaskStatus::Running, TaskStatus::Failed) {
            Ok(()) => self.route_failure(failure),
            Err(status) => debug!(
                "Task {} failed after being {}, failure dropped: {}",
                self.handle.display_name(),
                status,
                failure
            ),
        }
    }

    fn deliver_success(&self, value: T) {
        let Some(on_success) = &self.on_success else {
            debug!(
                "Task {} completed without a success handler",
                self.handle.display_name()
            );
            return;
        };

        let target = match self.contexts.resolve(&self.response_context) {
            Ok(target) => target,
            Err(source) => {
                self.route_failure(TaskError::Schedule {
                    context: self.contexts.label(&self.response_context),
                    source,
                });
                return;
            }
        };

        match dispatch(&self.contexts, &target, value, on_success.clone()) {
            Ok(()) => debug!(
                "Task {} delivering result on `{}`",
                self.handle.display_name(),
                target.name()
            ),
            Err((_, source)) => {
                warn!(
                    "Task {} could not deliver its result on `{}`: {}",
                    self.handle.display_name(),
                    target.name(),
                    source
                );
                self.route_failure(TaskError::Schedule {
                    context: target.name().to_string(),
                    source,
                });
            }
        }
    }

    /// Error handler on the error context, then on the coordinating
    /// context; unhandled if neither accepts it or there is no handler.
    fn route_failure(&self, failure: TaskError) {
        let Some(on_error) = &self.on_error else {
            debug!(
                "Task {} failed without an error handler: {}",
                self.handle.display_name(),
                failure
            );
            self.contexts.raise_unhandled(failure);
            return;
        };

        let mut targets: Vec<Arc<dyn ExecutionContext>> = Vec::with_capacity(2);
        match self.contexts.resolve(&self.error_context) {
            Ok(target) => targets.push(target),
            Err(reason) => warn!(
                "Task {} has an unusable error context: {}",
                self.handle.display_name(),
                reason
            ),
        }
        let coordinating: Arc<dyn ExecutionContext> = self.contexts.coordinating();
        if targets.iter().all(|t| t.name() != coordinating.name()) {
            targets.push(coordinating);
        }

        let mut failure = failure;
        for target in targets {
            match dispatch(&self.contexts, &target, failure, on_error.clone()) {
                Ok(()) => {
                    debug!(
                        "Task {} delivering failure on `{}`",
                        self.handle.display_name(),
                        target.name()
                    );
                    return;
                }
                Err((returned, reason)) => {
                    warn!(
                        "Task {} could not deliver its failure on `{}`: {}",
                        self.handle.display_name(),
                        target.name(),
                        reason
                    );
                    failure = returned;
                }
            }
        }
        self.contexts.raise_unhandled(failure);
    }
}

const PENDING: u8 = 0;
const HANDED_OVER: u8 = 1;
const DROPPED: u8 = 2;

/// Travels with the run's unit. If the context drops the unit before the run
/// is terminal (a pool shut down mid-delay, a coordinator that stopped with
/// work queued), the run fails with a scheduling error instead of hanging.
struct Abandoned<T: Send + 'static> {
    run: Run<T>,
    context: String,
    handover: Arc<AtomicU8>,
}

impl<T: Send + 'static> Drop for Abandoned<T> {
    fn drop(&mut self) {
        // Not handed over yet: `launch` settles the run.
        if self
            .handover
            .compare_exchange(PENDING, DROPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
        if self.run.handle.is_active() {
            warn!(
                "Task {} was dropped by `{}` while {}",
                self.run.handle.display_name(),
                self.context,
                self.run.handle.status()
            );
            self.run
                .abandon(&self.context, ScheduleError::Closed(self.context.clone()));
        }
    }
}

/// Run a blocking closure without stalling a multi-thread runtime's worker.
fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// Schedule `handler(value)` as its own unit on `target`.
///
/// On rejection the value comes back with the reason. A panicking handler is
/// raised as unhandled on the coordinating context.
fn dispatch<V: Send + 'static>(
    contexts: &Contexts,
    target: &Arc<dyn ExecutionContext>,
    value: V,
    handler: Handler<V>,
) -> Result<(), (V, ScheduleError)> {
    let slot = Arc::new(Mutex::new(Some(value)));

    let unit_slot = slot.clone();
    let contexts = contexts.clone();
    let unit = async move {
        let value = unit_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(value) = value {
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(value))) {
                contexts.raise_unhandled(TaskError::from_panic(payload));
            }
        }
    };

    match target.schedule(unit.boxed()) {
        Ok(()) => Ok(()),
        Err(reason) => {
            let value = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            match value {
                Some(value) => Err((value, reason)),
                None => Ok(()),
            }
        }
    }
}
