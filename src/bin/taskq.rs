//! taskq CLI: run workers, submit tasks, query status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use taskq_rs::channel::Channel;
use taskq_rs::config::Config;
use taskq_rs::db::{Db, PgResultStore, PgmqChannel};
use taskq_rs::dispatch::Dispatcher;
use taskq_rs::model::{TaskId, TaskResult};
use taskq_rs::registry;
use taskq_rs::status::{StatusQuery, TaskStatusReport};
use taskq_rs::store::ResultStore;
use taskq_rs::telemetry::{Role, TelemetryConfig, init_telemetry};
use taskq_rs::worker::WorkerPool;

#[derive(Parser)]
#[command(name = "taskq", about = "Distributed task queue")]
struct Cli {
    /// Optional TOML config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker pool with the built-in handlers
    Worker {
        /// Concurrent worker loops (overrides config)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Purge expired results every N seconds
        #[arg(long)]
        reap_every: Option<u64>,
    },
    /// Submit a task
    Submit {
        /// Task type, e.g. "add"
        task_type: String,
        /// Positional arguments, each parsed as JSON (bare words become strings)
        args: Vec<String>,
        /// Queue to submit to (overrides config)
        #[arg(long)]
        queue: Option<String>,
        /// Wait up to N seconds for a terminal status
        #[arg(long)]
        wait: Option<u64>,
    },
    /// Show a task's status
    Status {
        /// Task ID (UUID)
        task_id: String,
    },
    /// Delete expired task records
    Purge,
}

struct Backends {
    channel: Arc<dyn Channel>,
    store: Arc<dyn ResultStore>,
}

async fn connect(config: &Config) -> anyhow::Result<Backends> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let db = Arc::new(db);
    Ok(Backends {
        channel: Arc::new(PgmqChannel::new(Arc::clone(&db), config.visibility_timeout)),
        store: Arc::new(PgResultStore::new(db, config.result_ttl)),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    let role = match cli.command {
        Command::Worker { .. } => Role::Worker,
        Command::Submit { .. } => Role::Dispatcher,
        Command::Status { .. } | Command::Purge => Role::Admin,
    };
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, role))?;

    match cli.command {
        Command::Worker {
            concurrency,
            reap_every,
        } => cmd_worker(&config, concurrency, reap_every).await,
        Command::Submit {
            task_type,
            args,
            queue,
            wait,
        } => cmd_submit(&config, task_type, args, queue, wait).await,
        Command::Status { task_id } => cmd_status(&config, task_id).await,
        Command::Purge => cmd_purge(&config).await,
    }
}

async fn cmd_worker(
    config: &Config,
    concurrency: Option<usize>,
    reap_every: Option<u64>,
) -> anyhow::Result<()> {
    let backends = connect(config).await?;

    let mut worker_config = config.worker_config();
    if let Some(n) = concurrency {
        worker_config.concurrency = n;
    }
    worker_config.reap_interval = reap_every.map(Duration::from_secs);

    let pool = WorkerPool::new(
        backends.channel,
        backends.store,
        Arc::new(registry::builtin()),
        worker_config,
    );

    let handle = pool.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown requested, finishing in-flight tasks");
        handle.shutdown();
    });

    pool.run().await?;
    Ok(())
}

async fn cmd_submit(
    config: &Config,
    task_type: String,
    args: Vec<String>,
    queue: Option<String>,
    wait: Option<u64>,
) -> anyhow::Result<()> {
    let args: Vec<serde_json::Value> = args
        .into_iter()
        .map(|raw| serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)))
        .collect();

    let backends = connect(config).await?;
    let dispatcher = Dispatcher::new(
        Arc::clone(&backends.channel),
        Arc::clone(&backends.store),
        config.dispatcher_config(),
    );

    let task_id = match queue {
        Some(ref q) => dispatcher.submit_to(q, &task_type, args).await?,
        None => dispatcher.submit(&task_type, args).await?,
    };
    println!("Submitted: {task_id}");

    if let Some(secs) = wait {
        let query = StatusQuery::new(backends.store);
        let report = query
            .wait_terminal(task_id, Duration::from_secs(secs), Duration::from_millis(250))
            .await?;
        print_report(task_id, report.as_ref())?;
    }
    Ok(())
}

async fn cmd_status(config: &Config, task_id: String) -> anyhow::Result<()> {
    let task_id: TaskId = task_id.parse()?;
    let backends = connect(config).await?;
    let report = StatusQuery::new(backends.store).get_status(task_id).await?;
    print_report(task_id, report.as_ref())
}

async fn cmd_purge(config: &Config) -> anyhow::Result<()> {
    let backends = connect(config).await?;
    let purged = backends.store.purge_expired().await?;
    println!("Purged {purged} expired record(s)");
    Ok(())
}

fn print_report(task_id: TaskId, report: Option<&TaskStatusReport>) -> anyhow::Result<()> {
    let Some(report) = report else {
        println!("{task_id}: not found (never submitted or expired)");
        return Ok(());
    };

    println!("ID:      {}", report.task_id);
    println!("Status:  {}", report.status);
    match &report.result {
        Some(TaskResult::Value { value }) => {
            println!("Result:  {}", serde_json::to_string_pretty(value)?);
        }
        Some(TaskResult::Error(failure)) => {
            println!("Reason:  {}", failure.reason);
            println!("Error:   {}", failure.message);
        }
        None => {}
    }
    Ok(())
}
