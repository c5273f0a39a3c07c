//! Storage Convergence CLI
//!
//! Runs the convergence engine and the block/file stores against the
//! in-memory control plane.
//!
//! ```text
//! storage-convergence snapshot --backend file --az az2
//! storage-convergence cascade-delete --children 8 --failing 3
//! storage-convergence migrate-az --from az1 --to az2 --reuse-replica
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_convergence::{
    BlockMethod, ConvergenceEngine, ConvergenceMetrics, DeleteMode, FileMethod, PluginConfig,
    ReplicationState, ResourceBackend, ResourceKind, ResourceRef, SimulatedBackend,
    SimulatedControlPlane, SimulatorConfig, StoreFactory,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Convergence - drive remote storage resources to a desired state
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML file with `block` and `file` store settings
    #[arg(long, env = "CONVERGENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the Prometheus metrics after the command
    #[arg(long)]
    print_metrics: bool,

    /// Print the command result as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot a volume or share, restore it, then delete the snapshot
    Snapshot {
        /// Store to exercise (block or file)
        #[arg(long, default_value = "block")]
        backend: String,

        /// Availability zone the restored resource is requested in
        #[arg(long, default_value = "az1")]
        az: String,
    },

    /// Delete a clone together with its snapshots
    CascadeDelete {
        /// Number of snapshots depending on the clone
        #[arg(long, default_value_t = 5)]
        children: usize,

        /// How many of them fail their first delete
        #[arg(long, default_value_t = 1)]
        failing: usize,
    },

    /// Move a share to another availability zone through a replica
    MigrateAz {
        #[arg(long, default_value = "az1")]
        from: String,

        #[arg(long, default_value = "az2")]
        to: String,

        /// Seed an out-of-sync replica in the target zone to be reused
        #[arg(long)]
        reuse_replica: bool,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Storage Convergence");
    info!("  Version: {}", storage_convergence::VERSION);
    info!("  Config: {:?}", args.config);

    let config = match &args.config {
        Some(path) => PluginConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => demo_config(),
    };
    info!("  Block method: {}", config.block.method);
    info!("  File method: {}", config.file.method);

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling the running operation");
            interrupt.cancel();
        }
    });

    let metrics = Arc::new(ConvergenceMetrics::new()?);
    let plane = Arc::new(SimulatedControlPlane::new(SimulatorConfig::default()));

    let output = match args.command {
        Command::Snapshot { backend, az } => {
            let summary =
                run_snapshot(&backend, &az, &config, plane, metrics.clone(), shutdown).await?;
            render(&summary, args.json)?
        }
        Command::CascadeDelete { children, failing } => {
            if failing > children {
                bail!("--failing ({}) cannot exceed --children ({})", failing, children);
            }
            let summary =
                run_cascade_delete(children, failing, &config, plane, metrics.clone(), &shutdown)
                    .await?;
            render(&summary, args.json)?
        }
        Command::MigrateAz {
            from,
            to,
            reuse_replica,
        } => {
            let engine = ConvergenceEngine::new(&config.file.engine(), metrics.clone());
            let shares: Arc<dyn ResourceBackend> =
                Arc::new(SimulatedBackend::new(plane.clone(), ResourceKind::Share));

            plane.seed(ResourceKind::Share, "share-demo", "available", Some(from.as_str()));
            plane.seed_replica("share-demo", "replica-demo-a", &from, "available", ReplicationState::Active);
            if reuse_replica {
                plane.seed_replica(
                    "share-demo",
                    "replica-demo-b",
                    &to,
                    "available",
                    ReplicationState::Other("out_of_sync".into()),
                );
            }

            let report = engine
                .migrate_availability_zone(
                    plane,
                    shares,
                    "share-demo",
                    &to,
                    config.file.delete_mode(),
                    config.file.migration_timeouts(),
                    &shutdown,
                )
                .await
                .context("availability zone migration failed")?;
            render(&report, args.json)?
        }
    };
    println!("{}", output);

    if args.print_metrics {
        print!("{}", metrics.encode_text()?);
    }

    info!("Storage Convergence finished");
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Serialize)]
struct SnapshotSummary {
    backend: String,
    method: String,
    source_id: String,
    snapshot_id: String,
    restored_id: String,
    restored_ready: bool,
}

async fn run_snapshot(
    backend: &str,
    az: &str,
    config: &PluginConfig,
    plane: Arc<SimulatedControlPlane>,
    metrics: Arc<ConvergenceMetrics>,
    shutdown: CancellationToken,
) -> anyhow::Result<SnapshotSummary> {
    let (source_id, method) = match backend {
        "block" | "volume" => {
            plane.seed(ResourceKind::Volume, "volume-demo", "in-use", Some("az1"));
            ("volume-demo", config.block.method.to_string())
        }
        "file" | "share" => {
            plane.seed(ResourceKind::Share, "share-demo", "available", Some("az1"));
            plane.seed_replica("share-demo", "replica-demo", "az1", "available", ReplicationState::Active);
            ("share-demo", config.file.method.to_string())
        }
        other => bail!("unknown backend {:?}, expected block or file", other),
    };
    let store = StoreFactory::simulated(backend, config, plane, metrics, shutdown)?;

    let tags = BTreeMap::from([("origin".to_string(), "storage-convergence".to_string())]);
    let snapshot_id = store
        .create_snapshot(source_id, az, &tags)
        .await
        .context("snapshot creation failed")?;
    let restored_id = store
        .create_volume_from_snapshot(&snapshot_id, "standard", az)
        .await
        .context("restore failed")?;
    let restored_ready = store.is_volume_ready(&restored_id, az).await?;
    store
        .delete_snapshot(&snapshot_id)
        .await
        .context("snapshot deletion failed")?;

    Ok(SnapshotSummary {
        backend: backend.to_string(),
        method,
        source_id: source_id.to_string(),
        snapshot_id,
        restored_id,
        restored_ready,
    })
}

#[derive(Debug, Serialize)]
struct CascadeSummary {
    parent: ResourceRef,
    children: usize,
    failing: usize,
    delete_attempts: u64,
    resets: u64,
    remaining: usize,
}

async fn run_cascade_delete(
    children: usize,
    failing: usize,
    config: &PluginConfig,
    plane: Arc<SimulatedControlPlane>,
    metrics: Arc<ConvergenceMetrics>,
    shutdown: &CancellationToken,
) -> anyhow::Result<CascadeSummary> {
    let engine = ConvergenceEngine::new(&config.block.engine(), metrics.clone());
    let volumes: Arc<dyn ResourceBackend> =
        Arc::new(SimulatedBackend::new(plane.clone(), ResourceKind::Volume));
    let snapshots: Arc<dyn ResourceBackend> =
        Arc::new(SimulatedBackend::new(plane.clone(), ResourceKind::Snapshot));

    let parent = ResourceRef::new(ResourceKind::Volume, "clone-demo");
    plane.seed(ResourceKind::Volume, &parent.id, "available", Some("az1"));
    for i in 0..children {
        let id = format!("snapshot-demo-{}", i);
        plane.seed_child(ResourceKind::Snapshot, &id, &parent.id, "available");
        if i < failing {
            plane.fail_deletes(&id, 1);
        }
    }

    engine
        .cascade_delete_dependents(snapshots, &parent, config.block.snapshot_timeout, shutdown)
        .await
        .context("cascade delete of snapshots failed")?;
    engine
        .delete_resource(
            volumes,
            &parent.id,
            DeleteMode::Ensure,
            config.block.clone_timeout,
            shutdown,
        )
        .await
        .context("clone deletion failed")?;

    Ok(CascadeSummary {
        children,
        failing,
        delete_attempts: metrics.delete_attempts(ResourceKind::Snapshot),
        resets: metrics.resets(ResourceKind::Snapshot),
        remaining: plane.resources_of_kind(ResourceKind::Snapshot).len(),
        parent,
    })
}

// =============================================================================
// Output
// =============================================================================

fn render<T: Serialize + std::fmt::Debug>(value: &T, json: bool) -> anyhow::Result<String> {
    if json {
        Ok(serde_json::to_string_pretty(value)?)
    } else {
        Ok(format!("{:#?}", value))
    }
}

/// Store settings used when no configuration file is given: fast timings so
/// a run against the simulator completes in seconds.
fn demo_config() -> PluginConfig {
    let mut config = PluginConfig::default();

    config.block.method = BlockMethod::Clone;
    config.block.ensure_deleted = true;
    config.block.cascade_delete = true;
    config.block.poll_interval = Duration::from_millis(200);
    config.block.ensure_deleted_delay = Duration::from_millis(500);

    config.file.method = FileMethod::Clone;
    config.file.ensure_deleted = true;
    config.file.cascade_delete = true;
    config.file.enforce_az = true;
    config.file.poll_interval = Duration::from_millis(200);
    config.file.ensure_deleted_delay = Duration::from_millis(500);

    config
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
