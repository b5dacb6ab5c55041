//! The set of execution contexts a host makes available to tasks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{error, info};

use crate::context::{ContextRef, ExecutionContext};
use crate::coordinator::{Coordinator, UnhandledPolicy};
use crate::error::{ContextError, ScheduleError, TaskError};
use crate::pool::WorkerPool;

/// How the coordinating context treats unhandled failures, as configured
/// from a file. Hooks can only be installed in code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnhandledMode {
    /// Crash the coordinating thread
    #[default]
    Panic,
    /// Log and continue
    Log,
}

impl From<UnhandledMode> for UnhandledPolicy {
    fn from(mode: UnhandledMode) -> Self {
        match mode {
            UnhandledMode::Panic => UnhandledPolicy::Panic,
            UnhandledMode::Log => UnhandledPolicy::Log,
        }
    }
}

/// Context configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextsConfig {
    /// Name (and thread name) of the coordinating context
    pub coordinating_name: String,
    /// Name of the background worker pool
    pub background_name: String,
    /// Worker threads for an owned background pool (None = available parallelism)
    pub worker_threads: Option<usize>,
    /// Thread name for background workers
    pub thread_name: String,
    /// Unhandled failure behaviour
    pub unhandled: UnhandledMode,
}

impl Default for ContextsConfig {
    fn default() -> Self {
        Self {
            coordinating_name: "coordinating".to_string(),
            background_name: "background".to_string(),
            worker_threads: None,
            thread_name: "errand-worker".to_string(),
            unhandled: UnhandledMode::Panic,
        }
    }
}

impl ContextsConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

struct Inner {
    coordinator: Arc<Coordinator>,
    background: Arc<dyn ExecutionContext>,
    pool: Option<Arc<WorkerPool>>,
    named: HashMap<String, Arc<dyn ExecutionContext>>,
}

/// Shared registry of the coordinating, background and named contexts.
///
/// Cheap to clone. Contexts are fixed once built.
#[derive(Clone)]
pub struct Contexts {
    inner: Arc<Inner>,
}

impl Contexts {
    /// Build contexts from configuration, with an owned background runtime.
    pub fn new(config: ContextsConfig) -> crate::Result<Self> {
        Self::builder().config(config).build()
    }

    /// Start configuring contexts.
    pub fn builder() -> ContextsBuilder {
        ContextsBuilder::default()
    }

    /// The coordinating context.
    pub fn coordinating(&self) -> Arc<Coordinator> {
        self.inner.coordinator.clone()
    }

    /// The background context.
    pub fn background(&self) -> Arc<dyn ExecutionContext> {
        self.inner.background.clone()
    }

    /// Look a context up by name (the two well-known contexts included).
    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutionContext>> {
        self.inner.named.get(name).cloned()
    }

    /// Names of all registered contexts, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.named.keys().cloned().collect();
        names.sort();
        names
    }

    /// Turn a reference into a concrete context.
    pub fn resolve(&self, context: &ContextRef) -> Result<Arc<dyn ExecutionContext>, ScheduleError> {
        match context {
            ContextRef::Coordinating => Ok(self.inner.coordinator.clone()),
            ContextRef::Background => Ok(self.inner.background.clone()),
            ContextRef::Named(name) => self
                .get(name)
                .ok_or_else(|| ScheduleError::UnknownContext(name.clone())),
            ContextRef::Custom(ctx) => Ok(ctx.clone()),
        }
    }

    /// Display name of a reference, using the configured names.
    pub fn label(&self, context: &ContextRef) -> String {
        match context {
            ContextRef::Coordinating => self.inner.coordinator.name().to_string(),
            ContextRef::Background => self.inner.background.name().to_string(),
            other => other.label(),
        }
    }

    /// Surface a failure nobody handled on the coordinating context.
    pub fn raise_unhandled(&self, failure: TaskError) {
        if let Err(failure) = self.inner.coordinator.raise_unhandled(failure) {
            error!(
                "Coordinating context `{}` is closed, unhandled failure lost: {}",
                self.inner.coordinator.name(),
                failure
            );
        }
    }

    /// Stop the coordinating thread and an owned background pool.
    ///
    /// Reports [`ContextError::Crashed`] if the coordinating context died on
    /// an unhandled failure. Must not be called from the coordinating context.
    pub fn shutdown(&self) -> crate::Result<()> {
        info!("Shutting down execution contexts");
        if let Some(pool) = &self.inner.pool {
            pool.shutdown();
        }
        self.inner.coordinator.shutdown()
    }
}

impl std::fmt::Debug for Contexts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contexts")
            .field("coordinating", &self.inner.coordinator.name())
            .field("background", &self.inner.background.name())
            .field("named", &self.names())
            .finish()
    }
}

/// Builder for [`Contexts`].
#[derive(Default)]
pub struct ContextsBuilder {
    config: ContextsConfig,
    policy: Option<UnhandledPolicy>,
    background: Option<Arc<dyn ExecutionContext>>,
    runtime: Option<Handle>,
    extra: Vec<Arc<dyn ExecutionContext>>,
}

impl ContextsBuilder {
    /// Use this configuration.
    pub fn config(mut self, config: ContextsConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the configured unhandled failure policy.
    pub fn unhandled(mut self, policy: UnhandledPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Install a hook for unhandled failures.
    pub fn on_unhandled<F>(self, hook: F) -> Self
    where
        F: Fn(TaskError) + Send + Sync + 'static,
    {
        self.unhandled(UnhandledPolicy::Hook(Arc::new(hook)))
    }

    /// Run background work on an existing runtime instead of an owned one.
    pub fn background_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Use a custom background context.
    pub fn background(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.background = Some(context);
        self
    }

    /// Register an additional named context.
    pub fn context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.extra.push(context);
        self
    }

    /// Start the contexts.
    pub fn build(self) -> crate::Result<Contexts> {
        let config = self.config;
        let policy = self.policy.unwrap_or_else(|| config.unhandled.into());

        let mut pool = None;
        let background: Arc<dyn ExecutionContext> = match (self.background, self.runtime) {
            (Some(custom), _) => custom,
            (None, Some(handle)) => Arc::new(WorkerPool::from_handle(
                config.background_name.clone(),
                handle,
            )),
            (None, None) => {
                let owned = Arc::new(WorkerPool::new(
                    config.background_name.clone(),
                    config.worker_threads(),
                    config.thread_name.clone(),
                )?);
                pool = Some(owned.clone());
                owned
            }
        };

        let coordinator = Arc::new(Coordinator::spawn(config.coordinating_name.clone(), policy)?);

        let mut named: HashMap<String, Arc<dyn ExecutionContext>> = HashMap::new();
        let well_known: [Arc<dyn ExecutionContext>; 2] = [coordinator.clone(), background.clone()];
        for context in well_known.into_iter().chain(self.extra) {
            let name = context.name().to_string();
            if named.insert(name.clone(), context).is_some() {
                let _ = coordinator.shutdown();
                if let Some(pool) = &pool {
                    pool.shutdown();
                }
                return Err(ContextError::Duplicate(name));
            }
        }

        info!(
            "Execution contexts ready: {} (coordinating), {} (background), {} total",
            coordinator.name(),
            background.name(),
            named.len()
        );

        Ok(Contexts {
            inner: Arc::new(Inner {
                coordinator,
                background,
                pool,
                named,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UnitOfWork;

    #[derive(Debug)]
    struct Closed(&'static str);

    impl ExecutionContext for Closed {
        fn name(&self) -> &str {
            self.0
        }

        fn schedule(&self, _unit: UnitOfWork) -> Result<(), ScheduleError> {
            Err(ScheduleError::Closed(self.0.to_string()))
        }
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config = ContextsConfig::from_json_str(r#"{ "worker_threads": 2, "unhandled": "log" }"#)
            .unwrap();
        assert_eq!(config.worker_threads, Some(2));
        assert_eq!(config.unhandled, UnhandledMode::Log);
        assert_eq!(config.coordinating_name, "coordinating");
        assert_eq!(config.background_name, "background");
    }

    #[test]
    fn test_config_rejects_bad_json() {
        let result = ContextsConfig::from_json_str(r#"{ "unhandled": "explode" }"#);
        assert!(matches!(result, Err(ContextError::Config(_))));
    }

    #[tokio::test]
    async fn test_resolve_well_known_and_named() {
        let contexts = Contexts::builder()
            .unhandled(UnhandledPolicy::Log)
            .background_runtime(Handle::current())
            .context(Arc::new(Closed("legacy")))
            .build()
            .unwrap();

        assert_eq!(
            contexts.resolve(&ContextRef::Coordinating).unwrap().name(),
            "coordinating"
        );
        assert_eq!(contexts.resolve(&"background".into()).unwrap().name(), "background");
        assert_eq!(contexts.resolve(&"legacy".into()).unwrap().name(), "legacy");
        assert_eq!(
            contexts.resolve(&"missing".into()).unwrap_err(),
            ScheduleError::UnknownContext("missing".to_string())
        );
        assert_eq!(contexts.names(), vec!["background", "coordinating", "legacy"]);
        contexts.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_names_are_rejected() {
        let result = Contexts::builder()
            .unhandled(UnhandledPolicy::Log)
            .background_runtime(Handle::current())
            .context(Arc::new(Closed("coordinating")))
            .build();
        assert!(matches!(result, Err(ContextError::Duplicate(ref n)) if n == "coordinating"));
    }
}
