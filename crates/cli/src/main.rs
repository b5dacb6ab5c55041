//! Errand CLI - run deferred tasks and watch where their outcomes land.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use errand_core::{current_context, ContextError, ContextRef, Contexts, ContextsConfig};
use errand_task::{Task, TaskHandle, TaskReport};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "errand")]
#[command(about = "Deferred task runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON file with context configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print the final task report as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Return a value and deliver it to a success handler
    Succeed {
        /// Value the computation returns
        #[arg(long, default_value = "42")]
        value: i64,
        /// Start delay in milliseconds
        #[arg(long, default_value = "0")]
        delay_ms: u64,
        /// Context the success handler runs on
        #[arg(long, value_enum, default_value = "coordinating")]
        respond_on: Target,
    },
    /// Fail, with or without an error handler
    Fail {
        /// Error message
        #[arg(long, default_value = "something went wrong")]
        message: String,
        /// Leave the failure unhandled
        #[arg(long)]
        no_handler: bool,
    },
    /// Start blocking work and cancel it part way
    Cancel {
        /// Cancel after this many milliseconds
        #[arg(long, default_value = "10")]
        after_ms: u64,
        /// How long the work blocks
        #[arg(long, default_value = "1000")]
        work_ms: u64,
    },
    /// List configured contexts
    Contexts,
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    Coordinating,
    Background,
}

impl From<Target> for ContextRef {
    fn from(target: Target) -> Self {
        match target {
            Target::Coordinating => ContextRef::Coordinating,
            Target::Background => ContextRef::Background,
        }
    }
}

/// What a handler saw, and where.
#[derive(Debug)]
enum Delivery {
    Success(i64, Option<String>),
    Failure(String, Option<String>),
}

const GRACE: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ContextsConfig::from_path(path)?,
        None => ContextsConfig::default(),
    };
    let contexts = Contexts::builder()
        .config(config)
        .background_runtime(tokio::runtime::Handle::current())
        .build()?;

    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = match cli.command {
        Commands::Succeed { value, delay_ms, respond_on } => {
            let ok_tx = tx.clone();
            let mut task = Task::new(&contexts, move |_| Ok(value))
                .named("succeed")
                .on_response_context(respond_on)
                .on_success(move |v| {
                    let _ = ok_tx.send(Delivery::Success(v, current_context()));
                });
            task.start_after(Duration::from_millis(delay_ms));
            task.handle().cloned()
        }
        Commands::Fail { message, no_handler } => {
            let mut task = Task::new(&contexts, move |_| -> anyhow::Result<i64> {
                Err(anyhow::anyhow!(message.clone()))
            })
            .named("fail");
            if !no_handler {
                let err_tx = tx.clone();
                task = task.on_error(move |e| {
                    let _ = err_tx.send(Delivery::Failure(e.to_string(), current_context()));
                });
            }
            task.start();
            task.handle().cloned()
        }
        Commands::Cancel { after_ms, work_ms } => {
            let ok_tx = tx.clone();
            let err_tx = tx.clone();
            let mut task = Task::new(&contexts, move |_| {
                std::thread::sleep(Duration::from_millis(work_ms));
                Ok(1)
            })
            .named("cancel")
            .on_success(move |v| {
                let _ = ok_tx.send(Delivery::Success(v, current_context()));
            })
            .on_error(move |e| {
                let _ = err_tx.send(Delivery::Failure(e.to_string(), current_context()));
            });
            task.start();
            tokio::time::sleep(Duration::from_millis(after_ms)).await;
            task.cancel();
            info!("Cancel requested after {}ms", after_ms);
            task.handle().cloned()
        }
        Commands::Contexts => {
            println!("Execution contexts:");
            for name in contexts.names() {
                println!("  - {}", name);
            }
            None
        }
    };
    drop(tx);

    if let Some(handle) = handle {
        report(&handle, &mut rx, cli.json).await?;
    }

    let shutdown = tokio::task::spawn_blocking(move || contexts.shutdown()).await?;
    match shutdown {
        Err(ContextError::Crashed(message)) => {
            warn!("Coordinating context crashed: {}", message);
            std::process::exit(101);
        }
        other => other?,
    }

    Ok(())
}

async fn report(
    handle: &TaskHandle,
    rx: &mut mpsc::UnboundedReceiver<Delivery>,
    json: bool,
) -> Result<()> {
    let status = handle.finished().await;
    info!("Task {} finished as {}", handle.id(), status);

    match tokio::time::timeout(GRACE, rx.recv()).await {
        Ok(Some(Delivery::Success(value, context))) => {
            println!("success: {} (on {})", value, context.unwrap_or_default());
        }
        Ok(Some(Delivery::Failure(message, context))) => {
            println!("error: {} (on {})", message, context.unwrap_or_default());
        }
        _ => println!("no handler fired"),
    }

    if json {
        let report: TaskReport = handle.report();
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(())
}
