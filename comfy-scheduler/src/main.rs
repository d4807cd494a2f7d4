//! CLI entrypoint: loads global configuration and the workflow catalog,
//! then runs the Monitor loop, the Executor loop, the Control API server,
//! or all three together.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_scheduler::{
    config::{load_global_config, load_workflows},
    executor::JobExecutor,
    monitor::run_monitor_loop,
    store::SqliteStore,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "comfy-scheduler")]
#[command(about = "Filesystem-driven job scheduler for ComfyUI")]
struct Cli {
    /// Path to the workflow catalog YAML (workflow_id -> {template_path, required_inputs}).
    #[arg(long, global = true, default_value = "config/workflows.yaml")]
    workflows: String,

    /// Worker identity recorded on leased jobs.
    #[arg(long, global = true, default_value = "worker-1")]
    worker_id: String,

    /// Host:port the Control API binds to.
    #[arg(long, global = true, default_value = "127.0.0.1:8787")]
    listen: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor loop, the executor loop and the Control API together.
    Run,
    /// Run only the filesystem monitor loop.
    Monitor,
    /// Run only the executor loop.
    Executor,
    /// Run only the Control API HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let cfg = load_global_config().context("failed to load global configuration")?;
    let workflows = load_workflows(&cli.workflows)
        .with_context(|| format!("failed to load workflow catalog from {}", cli.workflows))?;
    info!(workflows = workflows.len(), "loaded workflow catalog");

    let store = SqliteStore::connect(&cfg.database_path)
        .await
        .context("failed to open job store")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    match cli.command {
        Commands::Run => {
            let executor = JobExecutor::new(store.clone(), workflows.clone(), cfg.clone(), cli.worker_id);
            let monitor_rx = shutdown_rx.clone();
            let executor_rx = shutdown_rx.clone();
            let monitor_store = store.clone();
            let monitor_workflows = workflows.clone();
            let monitor_cfg = cfg.clone();

            let monitor_handle =
                tokio::spawn(
                    async move { run_monitor_loop(monitor_store, monitor_workflows, monitor_cfg, monitor_rx).await },
                );
            let executor_handle = tokio::spawn(async move { executor.run_loop(executor_rx).await });
            let api_handle = tokio::spawn(serve_api(store, cli.listen, shutdown_rx));

            let _ = tokio::join!(monitor_handle, executor_handle, api_handle);
        }
        Commands::Monitor => {
            run_monitor_loop(store, workflows, cfg, shutdown_rx).await;
        }
        Commands::Executor => {
            let executor = JobExecutor::new(store, workflows, cfg, cli.worker_id);
            executor.run_loop(shutdown_rx).await;
        }
        Commands::Serve => {
            serve_api(store, cli.listen, shutdown_rx).await?;
        }
    }

    Ok(())
}

async fn serve_api(
    store: SqliteStore,
    listen: String,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let app = comfy_scheduler::api::router(store);
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind Control API listener on {listen}"))?;
    info!(%listen, "starting control API");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("control API server failed")?;

    Ok(())
}
