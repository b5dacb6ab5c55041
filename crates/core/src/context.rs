//! Execution contexts: where units of work run.

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

use crate::error::ScheduleError;

/// A single scheduled piece of execution.
pub type UnitOfWork = BoxFuture<'static, ()>;

/// A scheduling target that runs units of work asynchronously to the caller.
///
/// Implementations must never run the unit inline inside `schedule`.
pub trait ExecutionContext: Send + Sync + fmt::Debug {
    /// Name used in logs, reports and by-name lookup.
    fn name(&self) -> &str;

    /// Queue a unit of work.
    fn schedule(&self, unit: UnitOfWork) -> Result<(), ScheduleError>;
}

tokio::task_local! {
    static CURRENT_CONTEXT: Arc<str>;
}

/// Name of the context running the current unit of work.
///
/// `None` when called outside any unit scheduled through an [`ExecutionContext`]
/// of this crate (or one wrapped with [`in_context`]).
pub fn current_context() -> Option<String> {
    CURRENT_CONTEXT.try_with(|name| name.to_string()).ok()
}

/// Tag a unit so that [`current_context`] reports `name` while it runs.
pub fn in_context(name: Arc<str>, unit: UnitOfWork) -> UnitOfWork {
    Box::pin(CURRENT_CONTEXT.scope(name, unit))
}

/// How a task refers to a context before it is resolved at start time.
#[derive(Debug, Clone)]
pub enum ContextRef {
    /// The coordinating context
    Coordinating,
    /// The background worker pool
    Background,
    /// A context registered under this name
    Named(String),
    /// A context supplied directly
    Custom(Arc<dyn ExecutionContext>),
}

impl ContextRef {
    /// Label for logs and reports; the configured names for the two
    /// well-known contexts are only known after resolution.
    pub fn label(&self) -> String {
        match self {
            ContextRef::Coordinating => "coordinating".to_string(),
            ContextRef::Background => "background".to_string(),
            ContextRef::Named(name) => name.clone(),
            ContextRef::Custom(ctx) => ctx.name().to_string(),
        }
    }
}

impl From<&str> for ContextRef {
    fn from(name: &str) -> Self {
        ContextRef::Named(name.to_string())
    }
}

impl From<String> for ContextRef {
    fn from(name: String) -> Self {
        ContextRef::Named(name)
    }
}

impl From<Arc<dyn ExecutionContext>> for ContextRef {
    fn from(ctx: Arc<dyn ExecutionContext>) -> Self {
        ContextRef::Custom(ctx)
    }
}
