//! Errand tasks.
//!
//! A [`Task`] describes a computation, the context it runs on and the
//! contexts its outcome is delivered on, then runs it asynchronously with an
//! optional delay and cooperative cancellation.

#![warn(missing_docs)]

pub mod handle;
pub mod registry;
pub mod task;

pub use handle::{Scope, TaskHandle, TaskReport, Time};
pub use registry::{InMemoryTaskRegistry, RegistryError, TaskFilter, TaskRegistry};
pub use task::Task;

pub use errand_core::{
    current_context, ContextError, ContextRef, Contexts, ContextsBuilder, ContextsConfig,
    ExecutionContext, ScheduleError, TaskError, TaskId, TaskStatus, UnhandledMode,
    UnhandledPolicy, UnitOfWork,
};
