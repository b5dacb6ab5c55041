//! The coordinating context.
//!
//! A dedicated thread drives a current-thread runtime with a [`LocalSet`].
//! Units are spawned locally, so they only interleave at await points, the
//! same way work interleaves on a UI thread. The thread also receives
//! unhandled task failures, which are a separate signal from ordinary work.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, error};

use crate::context::{in_context, ExecutionContext, UnitOfWork};
use crate::error::{ContextError, ScheduleError, TaskError};

/// What the coordinating context does with a failure nobody handled.
#[derive(Clone, Default)]
pub enum UnhandledPolicy {
    /// Log, then panic the coordinating thread
    #[default]
    Panic,
    /// Log and keep running
    Log,
    /// Hand the failure to a host hook, called on the coordinating thread
    Hook(Arc<dyn Fn(TaskError) + Send + Sync>),
}

impl UnhandledPolicy {
    fn handle(&self, context: &str, failure: TaskError) {
        match self {
            UnhandledPolicy::Panic => {
                error!("Unhandled task failure on `{}`: {}", context, failure);
                panic!("unhandled task failure: {failure}");
            }
            UnhandledPolicy::Log => {
                error!("Unhandled task failure on `{}`: {}", context, failure);
            }
            UnhandledPolicy::Hook(hook) => hook(failure),
        }
    }
}

impl fmt::Debug for UnhandledPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnhandledPolicy::Panic => write!(f, "Panic"),
            UnhandledPolicy::Log => write!(f, "Log"),
            UnhandledPolicy::Hook(_) => write!(f, "Hook(..)"),
        }
    }
}

enum Message {
    Run(UnitOfWork),
    Unhandled(TaskError),
    Shutdown,
}

/// Single-threaded, cooperative context for outcome delivery.
#[derive(Debug)]
pub struct Coordinator {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Message>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Start the coordinating thread.
    pub fn spawn(name: impl Into<String>, policy: UnhandledPolicy) -> crate::Result<Self> {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let loop_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let local = LocalSet::new();
                local.block_on(&runtime, async {
                    while let Some(message) = rx.recv().await {
                        match message {
                            Message::Run(unit) => {
                                tokio::task::spawn_local(unit);
                            }
                            Message::Unhandled(failure) => policy.handle(&loop_name, failure),
                            Message::Shutdown => break,
                        }
                    }
                });
                debug!("Coordinating context `{}` stopped", loop_name);
            })?;

        debug!("Coordinating context `{}` started", name);

        Ok(Self {
            name,
            tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Raise a failure nobody handled. Gives the failure back if the
    /// coordinating thread is gone.
    pub fn raise_unhandled(&self, failure: TaskError) -> Result<(), TaskError> {
        self.tx.send(Message::Unhandled(failure)).map_err(|e| match e.0 {
            Message::Unhandled(failure) => failure,
            _ => unreachable!("only unhandled failures are sent here"),
        })
    }

    /// Whether the thread has stopped accepting work.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Stop the thread and wait for it. Pending units are dropped.
    ///
    /// Must not be called from the coordinating thread itself.
    pub fn shutdown(&self) -> crate::Result<()> {
        let _ = self.tx.send(Message::Shutdown);
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match thread {
            Some(thread) => thread.join().map_err(|payload| {
                ContextError::Crashed(TaskError::from_panic(payload).to_string())
            }),
            None => Ok(()),
        }
    }
}

impl ExecutionContext for Coordinator {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self, unit: UnitOfWork) -> Result<(), ScheduleError> {
        self.tx
            .send(Message::Run(in_context(self.name.clone(), unit)))
            .map_err(|_| ScheduleError::Closed(self.name.to_string()))
    }
}
