use anyhow::Context;
use quicmux::config::{self, ServerConfig};
use quicmux::engine::{EchoSessionFactory, Engine, EngineFactory, LoopbackEngine};
use quicmux::proof::{ProofSigner, ProofSource, SignerRegistry};
use quicmux::shard::{self, ProofSetup};
use quicmux::{runtime, telemetry};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    let config = config::load_config()?;

    let bind_addr = config.bind_addr()?;
    let telemetry_cfg = config.global.telemetry.clone();
    let logging_cfg = config.global.logging.clone();

    // Telemetry, signal handling and off-shard proof signing run here.
    let tokio_runtime = runtime::create_runtime(&config.global.runtime)
        .with_context(|| "failed to create tokio runtime")?;
    let runtime_handle = tokio_runtime.handle().clone();

    let metrics_handle = tokio_runtime.block_on(async {
        telemetry::init_telemetry(&telemetry_cfg, &logging_cfg, &runtime_handle)
            .await
            .with_context(|| "failed to initialize telemetry")
    })?;

    info!("Configuration loaded successfully");

    let proofs = load_proof_signer(&config)?;

    let loopback_cfg = config.loopback.clone();
    let engine_factory: EngineFactory = Arc::new(move |shard_id| {
        Box::new(LoopbackEngine::new(shard_id, &loopback_cfg)) as Box<dyn Engine>
    });

    // Shards are native threads with their own runtimes, not tasks here.
    let shards = shard::spawn(
        bind_addr,
        config.shard_set(),
        Arc::new(EchoSessionFactory),
        engine_factory,
        proofs,
    )
    .with_context(|| "failed to start shards")?;

    info!(
        addr = %shards.local_addr(),
        shards = shards.shard_count(),
        "quicmux listening"
    );

    let shutdown_notify = Arc::new(Notify::new());
    let shutdown_notify_clone = Arc::clone(&shutdown_notify);

    tokio_runtime.spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("Failed to install Ctrl+C handler: {}", e);
            return;
        }
        info!("Shutdown signal received");
        shutdown_notify_clone.notify_one();
    });

    tokio_runtime.block_on(async {
        shutdown_notify.notified().await;
    });

    info!("Initiating graceful shutdown");

    // Blocks until every shard thread has exited.
    shards.shutdown();

    tokio_runtime.block_on(async {
        metrics_handle.shutdown().await;
    });

    info!("Shutting down tokio runtime");
    tokio_runtime.shutdown_timeout(std::time::Duration::from_secs(5));

    info!("Shutdown complete");
    Ok(())
}

fn load_proof_signer(config: &ServerConfig) -> anyhow::Result<ProofSetup> {
    let Some(key_path) = config.global.tls.key_path.as_ref() else {
        warn!("No tls.key_path configured, running insecure");
        return Ok(ProofSetup::insecure());
    };

    let source = ProofSource::from_pem_file(key_path)
        .with_context(|| format!("failed to load proof key {}", key_path.display()))?;
    let registry = SignerRegistry::new();
    let signer = registry
        .insert(Arc::new(source) as Arc<dyn ProofSigner>)
        .with_context(|| "failed to register proof signer")?;

    info!(key = %key_path.display(), "Proof signer loaded");
    Ok(ProofSetup {
        registry,
        signer: Some(signer),
    })
}
