use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;

use spool_core::impls::FileTaskStore;
use spool_core::ports::{Clock, SystemClock, TaskStore};
use spool_core::{
    Coordinator, CoordinatorBuilder, EnqueueOptions, Handler, LifecycleDir, QueueConfig, Task,
    TaskError, TaskId, TaskRecord,
};

#[derive(Debug, Parser)]
#[command(name = "spool")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Durable file-backed task queue")]
#[command(arg_required_else_help = true)]
struct Cli {
    /// TOML config file
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the config
    #[arg(short = 'd', long = "data-dir", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the queue until Ctrl-C
    Run {
        /// Number of hello tasks to enqueue at startup
        #[arg(long = "demo", default_value_t = 0)]
        demo: u32,

        /// Let the hello handler fail this many times before succeeding
        #[arg(long = "fail-first", default_value_t = 0)]
        fail_first: u32,
    },

    /// Enqueue one hello task without running anything
    Enqueue {
        name: String,

        #[arg(short = 'k', long = "key")]
        custom_key: Option<String>,

        /// Delay before the task becomes due
        #[arg(long = "delay-ms", default_value_t = 0)]
        delay_ms: i64,
    },

    /// Show how many tasks are in each directory
    Status {
        #[arg(long = "json")]
        json: bool,
    },

    /// Send a failed task back through manualRetry/
    Retry { id: u64 },

    /// Run one task now, whether or not it is due
    Force {
        id: u64,

        /// Also take a task left in locked/
        #[arg(long = "force")]
        force: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloTask {
    name: String,
}

impl Task for HelloTask {
    const TYPE: &'static str = "spool.demo.hello.v1";
}

struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler<HelloTask> for HelloHandler {
    async fn handle(&self, task: HelloTask, record: &TaskRecord) -> Result<(), TaskError> {
        if let Ok(left) = self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
        {
            return Err(TaskError::transient(format!(
                "intentional failure (left={left})"
            )));
        }

        info!(task_id = %record.id, try_count = record.try_count, "Hello, {}!", task.name);
        Ok(())
    }
}

fn load_config(cli: &Cli) -> Result<QueueConfig> {
    let mut config = match &cli.config {
        Some(path) => QueueConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => QueueConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn build_coordinator(config: QueueConfig, fail_first: u32) -> Result<Coordinator> {
    let coordinator = CoordinatorBuilder::new(config)
        .register::<HelloTask, _>(HelloHandler::new(fail_first))?
        .expect_tasks(&[HelloTask::TYPE])
        .build()?;
    Ok(coordinator)
}

async fn run(config: QueueConfig, demo: u32, fail_first: u32) -> Result<()> {
    let coordinator = build_coordinator(config, fail_first)?;
    let report = coordinator.startup().await?;
    info!(?report, "recovered");

    for i in 0..demo {
        let task = HelloTask {
            name: format!("demo-{i}"),
        };
        coordinator.enqueue(&task).await?;
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    if !coordinator.graceful_shutdown().await {
        bail!("shutdown timed out with tasks still running");
    }
    Ok(())
}

/// Build a coordinator for a one-shot command, with caches loaded from disk
/// but no background loops.
async fn offline_coordinator(config: QueueConfig) -> Result<Coordinator> {
    FileTaskStore::new(&config.data_dir).ensure_layout().await?;
    let coordinator = build_coordinator(config, 0)?;
    coordinator.reload_from_disk().await?;
    Ok(coordinator)
}

async fn enqueue(
    config: QueueConfig,
    name: String,
    custom_key: Option<String>,
    delay_ms: i64,
) -> Result<()> {
    let coordinator = offline_coordinator(config).await?;
    let mut options = EnqueueOptions::new();
    if let Some(key) = custom_key {
        options = options.custom_key(key);
    }
    if delay_ms > 0 {
        options = options.execute_at(SystemClock.now_millis() + delay_ms);
    }
    let task = coordinator.enqueue_with(&HelloTask { name }, options).await?;
    println!("{}", task.id);
    Ok(())
}

async fn status(config: QueueConfig, json: bool) -> Result<()> {
    let coordinator = offline_coordinator(config).await?;
    let counts = coordinator.counts().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
        return Ok(());
    }
    for dir in LifecycleDir::ALL {
        println!("{:<12} {}", dir.dir_name(), counts.get(dir));
    }
    Ok(())
}

async fn retry(config: QueueConfig, id: u64) -> Result<()> {
    let store = FileTaskStore::new(&config.data_dir);
    store.ensure_layout().await?;

    let id = TaskId::new(id);
    let Some((dir, name)) = store.find(id, &[LifecycleDir::Failed]).await? else {
        bail!("task {id} is not in failed/");
    };
    let mut task = store.read_file(dir, &name).await?;
    store
        .move_to(&mut task, LifecycleDir::Failed, LifecycleDir::ManualRetry)
        .await?;
    println!("task {id} moved to manualRetry/");
    Ok(())
}

async fn force(config: QueueConfig, id: u64, force: bool) -> Result<()> {
    let coordinator = offline_coordinator(config).await?;
    let id = TaskId::new(id);
    if !coordinator.run_task_for_id(id, force).await? {
        bail!("task {id} was not run (already locked; pass --force to take it)");
    }
    let counts = coordinator.counts().await?;
    println!(
        "task {id} ran (completed={}, failed={})",
        counts.get(LifecycleDir::Completed),
        counts.get(LifecycleDir::Failed)
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spool=info,spool_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Run { demo, fail_first } => run(config, demo, fail_first).await,
        Command::Enqueue {
            name,
            custom_key,
            delay_ms,
        } => enqueue(config, name, custom_key, delay_ms).await,
        Command::Status { json } => status(config, json).await,
        Command::Retry { id } => retry(config, id).await,
        Command::Force { id, force: take_locked } => force(config, id, take_locked).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_subcommand_takes_an_id_and_a_flag() {
        let cli = Cli::try_parse_from(["spool", "force", "42", "--force"]).unwrap();
        assert!(matches!(cli.command, Command::Force { id: 42, force: true }));

        let cli = Cli::try_parse_from(["spool", "force", "42"]).unwrap();
        assert!(matches!(cli.command, Command::Force { id: 42, force: false }));
    }

    #[tokio::test]
    async fn hello_handler_fails_only_the_requested_number_of_times() {
        let handler = HelloHandler::new(2);
        let record = TaskRecord::new(TaskId::new(1), HelloTask::TYPE, "{}", None, 0, 0);
        let hello = || HelloTask {
            name: "spool".to_string(),
        };

        assert!(handler.handle(hello(), &record).await.is_err());
        assert!(handler.handle(hello(), &record).await.is_err());
        assert!(handler.handle(hello(), &record).await.is_ok());
        assert!(handler.handle(hello(), &record).await.is_ok());
    }
}
