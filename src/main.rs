//! doc-orchestrator: host process for document task orchestration.
//!
//! `serve` speaks newline-delimited JSON on stdin/stdout; logs go to
//! stderr so they never interleave with responses.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use doc_orchestrator::config::HostConfig;
use doc_orchestrator::delegation::{DelegationChannel, ProcessContext};
use doc_orchestrator::store::file::FileBackend;
use doc_orchestrator::store::TaskStore;
use doc_orchestrator::{JobKind, TaskRouter};

/// Persistent task orchestration for document processing
#[derive(Parser)]
#[command(name = "doc-orchestrator")]
#[command(about = "Run and inspect document processing tasks", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the task collections (overrides config and env)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve caller messages on stdin/stdout
    ///
    /// Runs the recovery sweep for both job kinds first. At end of input,
    /// waits for running delegations (bounded by the request timeout).
    Serve,

    /// Print stored tasks as JSON
    Status {
        /// Job kind to inspect (chunking or toc)
        #[arg(long)]
        kind: JobKind,

        /// Print only this task
        #[arg(long)]
        task_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Status { kind, task_id } => status(config, kind, task_id).await,
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// File, then environment, then CLI flags.
fn load_config(cli: &Cli) -> Result<HostConfig> {
    let mut config = match &cli.config {
        Some(path) => HostConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HostConfig::default(),
    };
    config.apply_env()?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn serve(config: HostConfig) -> Result<()> {
    config.validate_for_serve()?;

    let backend = Arc::new(
        FileBackend::open(&config.data_dir)
            .await
            .with_context(|| format!("opening data dir {}", config.data_dir.display()))?,
    );
    let context = Arc::new(ProcessContext::new(
        config.context.command.clone(),
        config.context.args.clone(),
    ));
    let channel = Arc::new(DelegationChannel::new(
        context,
        config.context.spec(),
        config.request_timeout(),
    ));
    let router = TaskRouter::new(backend, channel, config.orchestrator());

    let resumed = router.resume_all().await;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        resumed = resumed.len(),
        "serving on stdio"
    );

    let stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut handlers = JoinSet::new();

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let router = router.clone();
        let stdout = stdout.clone();
        handlers.spawn(async move {
            let response = match serde_json::from_str::<Value>(&line) {
                Ok(message) => router.handle(message).await,
                Err(e) => json!({ "success": false, "error": format!("malformed message: {e}") }),
            };
            if let Err(e) = write_line(&stdout, &response).await {
                tracing::warn!(error = %e, "failed to write response");
            }
        });
    }

    while let Some(joined) = handlers.join_next().await {
        if let Err(e) = joined {
            tracing::warn!(error = %e, "message handler aborted");
        }
    }

    tracing::info!(in_flight = router.in_flight(), "input closed, draining");
    if tokio::time::timeout(config.request_timeout(), router.wait_idle())
        .await
        .is_err()
    {
        tracing::warn!(
            in_flight = router.in_flight(),
            "delegations still running at shutdown; they resume on next start"
        );
    }
    Ok(())
}

async fn write_line(stdout: &Mutex<tokio::io::Stdout>, value: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    let mut out = stdout.lock().await;
    out.write_all(&bytes).await?;
    out.flush().await?;
    Ok(())
}

async fn status(config: HostConfig, kind: JobKind, task_id: Option<String>) -> Result<()> {
    let backend = Arc::new(FileBackend::open(&config.data_dir).await?);
    let store = TaskStore::new(backend, kind.storage_key());

    let output = match task_id {
        Some(id) => {
            let record = store
                .get(&id)
                .await?
                .with_context(|| format!("no {kind} task with id {id}"))?;
            serde_json::to_string_pretty(&record)?
        },
        None => serde_json::to_string_pretty(&store.load().await?)?,
    };
    println!("{output}");
    Ok(())
}
