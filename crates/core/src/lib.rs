//! Errand execution contexts.
//!
//! This crate defines where deferred work runs: the coordinating context,
//! the background worker pool, and any named contexts a host registers.

#![warn(missing_docs)]

mod id;
mod status;
mod error;

mod context;
mod coordinator;
mod pool;
mod contexts;

pub use id::TaskId;
pub use status::{StatusCell, TaskStatus};
pub use error::{ContextError, Result, ScheduleError, TaskError};

pub use context::{current_context, in_context, ContextRef, ExecutionContext, UnitOfWork};
pub use coordinator::{Coordinator, UnhandledPolicy};
pub use pool::WorkerPool;
pub use contexts::{Contexts, ContextsBuilder, ContextsConfig, UnhandledMode};
