mod auth;
mod buffer;
mod config;
mod error;
mod executor;
mod heartbeat;
mod runner;

use std::fmt;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::FormatTime;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::executor::TaskExecutor;
use crate::heartbeat::HeartbeatClient;
use marathon_vm::{SnapshotCatalog, VmPool};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .init();

    let config = NodeConfig::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: NodeConfig) -> NodeResult<()> {
    let auth_key = config.auth_key_bytes()?;
    validate_artifacts(&config)?;

    let kvm = config::kvm_present();
    let warm_target = config.resolved_warm_target();
    let node_id = Uuid::new_v4();
    info!(
        node_id = %node_id.simple(),
        kvm,
        warm_target,
        slots = config.total_vm_slots,
        listen = %format!("{}:{}", config.listen_addr, config.listen_port),
        orchestrator = %config.orchestrator_addr(),
        auth = auth_key.is_some(),
        "marathon node starting"
    );

    let catalog = SnapshotCatalog::load(&config.snapshot_dir).await?;
    if catalog.default_snapshot().is_none() {
        warn!("no 'base' snapshot found, tasks will cold-boot");
    }

    let config = Arc::new(config);
    let pool = Arc::new(VmPool::new(
        config.vm_config(),
        config.pool_config(),
        catalog,
    ));
    let executor = Arc::new(TaskExecutor::new(Arc::clone(&pool), config.vsock_port));

    // Pre-warm in the background so the heartbeat channel comes up at once.
    if warm_target > 0 {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if let Err(e) = pool.warm_pool(warm_target).await {
                warn!(error = %e, "initial warm-up failed");
            }
        });
    }

    let client = HeartbeatClient::new(
        Arc::clone(&config),
        node_id,
        auth_key,
        Arc::clone(&pool),
        Arc::clone(&executor),
    );
    let heartbeat = tokio::spawn(client.run());

    wait_for_shutdown().await;
    info!("shutdown signal received, stopping");

    heartbeat.abort();
    pool.shutdown().await;
    info!("marathon node stopped");
    Ok(())
}

/// Fail fast when the VM artifacts are missing; every task would fail anyway.
fn validate_artifacts(config: &NodeConfig) -> NodeResult<()> {
    for (path, what) in [
        (&config.firecracker, "firecracker binary"),
        (&config.kernel, "kernel image"),
        (&config.rootfs, "rootfs image"),
    ] {
        if !path.is_file() {
            return Err(NodeError::Config(format!(
                "{what} not found: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Park until SIGTERM or SIGINT.
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => info!("received SIGTERM"),
        _ = recv_signal(&mut sigint) => info!("received SIGINT"),
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
