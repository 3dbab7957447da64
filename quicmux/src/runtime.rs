use crate::config::RuntimeConfig;
use anyhow::Result;
use tokio::runtime::Runtime;

/// Main multi-thread runtime: telemetry, signals, proof signing for callers
/// outside a shard.
pub fn create_runtime(config: &RuntimeConfig) -> Result<Runtime> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .max_blocking_threads(config.max_blocking_threads)
        .thread_name(config.thread_name.clone())
        .thread_stack_size(config.thread_stack_size)
        .enable_all()
        .build()?;

    Ok(rt)
}

/// Single-threaded runtime that drives one shard's event loop.
pub fn create_shard_runtime(shard_id: usize) -> Result<Runtime> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .thread_name(format!("shard-{}-blocking", shard_id))
        .enable_all()
        .build()?;

    Ok(rt)
}
