mod snapshot;

use clap::{Parser, Subcommand};
use corral_scheduler::{HostOptimizer, QuotaController, Scheduler};
use snapshot::{pending_count, ClusterSnapshot, DriverConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "corral", about = "Corral pod scheduling core")]
struct Cli {
    /// Cluster snapshot (YAML with nodes, pods, quotas and tenants)
    #[arg(long, env = "CORRAL_SNAPSHOT")]
    snapshot: PathBuf,
    /// Component configuration (YAML)
    #[arg(long, env = "CORRAL_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scheduling pass over pending pods, preempting where needed
    Schedule,
    /// Evaluate one tenant's quota
    TuneQuota {
        /// Tenant namespace
        #[arg(long)]
        namespace: String,
    },
    /// Run the scheduler, quota controller and host optimizer until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = DriverConfig::load(cli.config.as_deref())?;
    let snapshot = ClusterSnapshot::load(&cli.snapshot)?;

    match cli.command {
        Commands::Schedule => run_schedule(snapshot, config).await,
        Commands::TuneQuota { namespace } => run_tune_quota(snapshot, config, &namespace).await,
        Commands::Run => run_all(snapshot, config).await,
    }
}

/// Schedule every pending pod once and print the result
async fn run_schedule(snapshot: ClusterSnapshot, config: DriverConfig) -> miette::Result<()> {
    info!("{} pending pods in snapshot", pending_count(&snapshot.pods));

    let (store, _tenants) = snapshot.into_store().await;
    let store = Arc::new(store);
    let scheduler = Arc::new(Scheduler::new(store.clone(), store.clone(), config.scheduler)?);

    let report = scheduler.schedule_pending(&CancellationToken::new()).await?;
    println!("{}", corral_core::to_yaml(&report)?);

    Ok(())
}

/// Evaluate one tenant and print the resulting ceiling
async fn run_tune_quota(
    snapshot: ClusterSnapshot,
    config: DriverConfig,
    namespace: &str,
) -> miette::Result<()> {
    let (store, tenants) = snapshot.into_store().await;
    let store = Arc::new(store);

    let controller = QuotaController::new(store.clone(), store.clone(), config.quota);
    for tenant in tenants {
        controller.add_tenant(tenant).await?;
    }

    let outcome = controller.tune_quota(namespace).await?;
    println!("{}", corral_core::to_yaml(&outcome)?);

    Ok(())
}

/// Run every loop against the snapshot until Ctrl-C
async fn run_all(snapshot: ClusterSnapshot, config: DriverConfig) -> miette::Result<()> {
    let (store, tenants) = snapshot.into_store().await;
    let store = Arc::new(store);

    let scheduler = Arc::new(Scheduler::new(store.clone(), store.clone(), config.scheduler)?);

    let controller = QuotaController::new(store.clone(), store.clone(), config.quota);
    for tenant in tenants {
        controller.add_tenant(tenant).await?;
    }

    let optimizer = HostOptimizer::new(store.clone(), store.clone(), config.optimizer);

    let token = CancellationToken::new();

    let scheduler_handle = tokio::spawn(scheduler.run(token.clone()));

    let quota_token = token.clone();
    let quota_handle = tokio::spawn(async move { controller.run(quota_token).await });

    let optimizer_token = token.clone();
    let optimizer_handle = tokio::spawn(async move { optimizer.run(optimizer_token).await });

    info!("All components started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    // Wait for all tasks to finish with a timeout
    let shutdown_timeout = std::time::Duration::from_secs(5);
    let finished = tokio::time::timeout(shutdown_timeout, async {
        tokio::join!(scheduler_handle, quota_handle, optimizer_handle)
    })
    .await;

    match finished {
        Ok((scheduler, quota, optimizer)) => {
            for (name, result) in [("scheduler", scheduler), ("quota controller", quota), ("optimizer", optimizer)] {
                if let Err(e) = result {
                    error!("{} task failed: {}", name, e);
                }
            }
        }
        Err(_) => error!("Components did not stop within {:?}", shutdown_timeout),
    }

    info!("Shutdown complete");

    Ok(())
}
