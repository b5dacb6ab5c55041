//! Error types.

use std::any::Any;

/// Result of building or tearing down execution contexts.
pub type Result<T> = std::result::Result<T, ContextError>;

/// A context refused a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// No context is registered under this name
    #[error("unknown execution context `{0}`")]
    UnknownContext(String),

    /// The context has shut down (or crashed) and accepts no more work
    #[error("execution context `{0}` is closed")]
    Closed(String),
}

/// Failure delivered to an error handler, or raised as unhandled.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The unit of work never made it onto a context
    #[error("could not schedule on `{context}`: {source}")]
    Schedule {
        /// Context that was asked
        context: String,
        /// Why it refused
        #[source]
        source: ScheduleError,
    },

    /// The computation returned an error
    #[error("{0:#}")]
    Failed(anyhow::Error),

    /// The computation panicked
    #[error("computation panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Build a [`TaskError::Panicked`] from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskError::Panicked(message)
    }

    /// The error returned by the computation, if that is what failed.
    pub fn computation_error(&self) -> Option<&anyhow::Error> {
        match self {
            TaskError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError::Failed(e)
    }
}

/// Errors building, configuring or shutting down contexts.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// I/O error (runtime or thread creation, reading config)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// A context with this name is already registered
    #[error("execution context `{0}` is already registered")]
    Duplicate(String),

    /// The coordinating context died on an unhandled failure
    #[error("coordinating context crashed: {0}")]
    Crashed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_payload_is_preserved() {
        let err = TaskError::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "computation panicked: boom");

        let err = TaskError::from_panic(Box::new(String::from("owned boom")));
        assert!(matches!(err, TaskError::Panicked(ref m) if m == "owned boom"));
    }

    #[test]
    fn test_schedule_error_display_names_context() {
        let err = TaskError::Schedule {
            context: "io".to_string(),
            source: ScheduleError::UnknownContext("io".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "could not schedule on `io`: unknown execution context `io`"
        );
    }

    #[test]
    fn test_failed_keeps_anyhow_chain() {
        let inner = anyhow::anyhow!("disk full").context("saving report");
        let err = TaskError::from(inner);
        assert_eq!(err.to_string(), "saving report: disk full");
        assert!(err.computation_error().is_some());
    }
}
