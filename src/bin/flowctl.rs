//! Flowkeeper operator CLI
//!
//! Runs a sample review flow in memory and checks the configured process
//! lock backend. Settings come from an optional config file, then
//! `FLOWKEEPER__*` environment variables (a `.env` file is loaded first).

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use flowkeeper::engine::LockLease;
use flowkeeper::{
    Caller, EngineConfig, Flow, FlowEngine, InMemoryStorage, LockBackend, LockKey, NodeSpec, ProcessId,
    ProcessLock, ProcessStatus, TaskStatus,
};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowctl")]
#[command(about = "Flowkeeper CLI - run demo processes and check lock backends")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional config file (toml, yaml or json)
    #[arg(long, env = "FLOWKEEPER_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sample split/join review flow and print its task table
    Demo {
        /// Lock backend for the demo engine
        #[arg(long, value_enum, default_value_t = DemoLock::Cache)]
        lock: DemoLock,

        /// Cancel the legal review branch instead of approving it
        #[arg(long)]
        skip_legal: bool,
    },

    /// Acquire and release one lock on the configured backend
    LockCheck {
        /// Flow reference used for the lock key
        #[arg(long, default_value = "flowctl/check.Flow")]
        flow: String,

        /// Process id used for the lock key
        #[arg(long, default_value_t = 1)]
        process: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DemoLock {
    None,
    Row,
    Cache,
}

impl From<DemoLock> for LockBackend {
    fn from(lock: DemoLock) -> Self {
        match lock {
            DemoLock::None => LockBackend::None,
            DemoLock::Row => LockBackend::Row,
            DemoLock::Cache => LockBackend::Cache,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenv();

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo { lock, skip_legal } => run_demo(config, lock, skip_legal).await?,
        Commands::LockCheck { flow, process } => check_lock(config, &flow, ProcessId(process)).await?,
    }

    Ok(())
}

fn review_flow() -> Result<Arc<Flow>> {
    let flow = Flow::builder("flowctl", "review.flows.ReviewFlow")
        .node("start", NodeSpec::start().description("Submit document").next("split"))
        .node("split", NodeSpec::split().next("legal").next("tech"))
        .node(
            "legal",
            NodeSpec::view()
                .permission("review.legal")
                .description("Legal review")
                .next("join"),
        )
        .node(
            "tech",
            NodeSpec::function(|ctx| {
                ctx.task.merge_data(json!({"checked": true}));
                Ok(())
            })
            .description("Automated checks")
            .next("join"),
        )
        .node("join", NodeSpec::join().next("end"))
        .node("end", NodeSpec::end())
        .build()?;
    Ok(flow)
}

async fn run_demo(mut config: EngineConfig, lock: DemoLock, skip_legal: bool) -> Result<()> {
    config.lock.backend = lock.into();
    let flow = review_flow()?;
    let engine = FlowEngine::builder()
        .flow(flow.clone())
        .with_storage(Arc::new(InMemoryStorage::new()))
        .build_from_config(&config)
        .await?;
    info!(lock = engine.lock_backend(), flow = %flow.reference(), "demo engine ready");

    let process = engine
        .start_process(&flow.reference(), "start", json!({"document": "contract.pdf"}), &Caller::system())
        .await?;

    let legal = engine
        .storage()
        .find_tasks(process.id, "legal", &[TaskStatus::New])
        .await?;
    for task in legal {
        if skip_legal {
            engine.cancel(task.id, &Caller::system()).await?;
        } else {
            engine.assign(task.id, "alice", &Caller::system()).await?;
            engine
                .execute(task.id, json!({"approved": true}), &Caller::system())
                .await?;
        }
    }

    let process = engine.process(process.id).await?;
    println!("process {} [{}] {}", process.id, process.status, process.flow);
    println!("{:<4} {:<8} {:<10} {:<14} {:<10} previous", "id", "node", "status", "token", "owner");
    for task in engine.tasks(process.id).await? {
        let previous: Vec<String> = task.previous.iter().map(ToString::to_string).collect();
        println!(
            "{:<4} {:<8} {:<10} {:<14} {:<10} {}",
            task.id.to_string(),
            task.node,
            task.status.to_string(),
            task.token.to_string(),
            task.owner.as_deref().unwrap_or("-"),
            previous.join(",")
        );
    }

    if process.status != ProcessStatus::Done {
        warn!(process_id = %process.id, status = %process.status, "demo process did not finish");
    }
    Ok(())
}

async fn check_lock(config: EngineConfig, flow: &str, process: ProcessId) -> Result<()> {
    let storage = Arc::new(InMemoryStorage::new());
    let lock = config.lock.build(storage).await?;
    let key = LockKey::new(flow, process);

    let started = Instant::now();
    let mut lease = lock.acquire(&key).await?;
    let acquired = started.elapsed();
    lease.release().await?;

    info!(backend = lock.name(), key = %key, "lock check succeeded");
    println!(
        "{} lock on {} acquired in {:?}, released in {:?}",
        lock.name(),
        key,
        acquired,
        started.elapsed() - acquired
    );
    Ok(())
}
