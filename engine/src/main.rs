use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use docwriter_broker::{InMemoryBroker, StatusTopic};
use docwriter_gateway::HttpGateway;
use docwriter_kernel::{spawn_pipeline, KernelConfig, StageContext};
use docwriter_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use docwriter_render::{PassthroughConverter, PlantUmlClient};
use docwriter_store::{FsObjectStore, StatusStore};

#[derive(Parser, Debug)]
#[command(name = "docwriter-engine")]
#[command(about = "Headless docwriter pipeline engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every stage worker plus the status recorder until interrupted.
    Serve {
        #[arg(long, env = "DOCWRITER_STATE_DIR")]
        state_dir: Option<String>,
    },
    /// Print one job's status row as JSON.
    Status {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        job: String,
        #[arg(long, env = "DOCWRITER_STATE_DIR")]
        state_dir: Option<String>,
    },
    /// List an owner's document index rows as JSON.
    Documents {
        #[arg(long)]
        owner: String,
        #[arg(long, env = "DOCWRITER_STATE_DIR")]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { state_dir } => serve(resolve_state_dir(state_dir)).await,
        Command::Status {
            owner,
            job,
            state_dir,
        } => {
            let status = StatusStore::new(resolve_state_dir(state_dir).join("status")).await?;
            let record = status.get_job(&owner, &job).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Documents { owner, state_dir } => {
            let status = StatusStore::new(resolve_state_dir(state_dir).join("status")).await?;
            let rows = status.list_documents(&owner).await;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
    }
}

async fn serve(state_dir: PathBuf) -> anyhow::Result<()> {
    let _guard = init_process_logging(
        ProcessKind::Engine,
        &canonical_logs_dir_from_root(&state_dir),
        14,
    )
    .context("initialize logging")?;

    let config = Arc::new(KernelConfig::from_env());
    let ctx = build_context(&state_dir, config.clone()).await?;
    let cancel = CancellationToken::new();

    log_startup_paths(&state_dir, &config);

    let handles = spawn_pipeline(ctx.clone(), cancel.clone());
    let console = tokio::spawn(console_observer(ctx.topic.clone(), cancel.clone()));

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested; stopping workers");
    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    let _ = console.await;
    Ok(())
}

async fn build_context(
    state_dir: &PathBuf,
    config: Arc<KernelConfig>,
) -> anyhow::Result<StageContext> {
    let objects = Arc::new(FsObjectStore::new(state_dir.join("objects")).await?);
    let status = Arc::new(StatusStore::new(state_dir.join("status")).await?);
    let broker = Arc::new(InMemoryBroker::new());
    let topic = StatusTopic::new();
    let gateway = Arc::new(HttpGateway::new(config.gateway.clone()));
    let renderer = Arc::new(PlantUmlClient::new(config.renderer_url.clone()));
    let converter = Arc::new(PassthroughConverter);

    Ok(StageContext {
        broker,
        objects,
        status,
        topic,
        gateway,
        renderer,
        converter,
        config,
    })
}

/// The `console` observer: log every stage transition that crosses the
/// status topic.
async fn console_observer(topic: StatusTopic, cancel: CancellationToken) {
    let mut rx = topic.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = rx.recv() => match received {
                Ok(event) => info!(
                    job_id = %event.job_id,
                    stage = %event.stage,
                    phase = %event.phase,
                    cycle = event.cycle.unwrap_or(0),
                    message = event.message.as_deref().unwrap_or(""),
                    "status"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".docwriter")
}

fn log_startup_paths(state_dir: &PathBuf, config: &KernelConfig) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting docwriter-engine");
    info!(
        "startup paths: exe={} cwd={} state_dir={} llm_endpoint={} renderer={}",
        exe.display(),
        cwd.display(),
        state_dir.display(),
        config.gateway.endpoint,
        config.renderer_url
    );
}
