pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod keys;
pub mod middleware;
pub mod protocol;
pub mod recording;
pub mod retry;
pub mod storage;
pub mod stream;
pub mod worker;

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

//
// Re-export
//
pub use broker::{Broker, BrokerHandle, MemoryBroker, RedisBroker};
pub use config::Config;
pub use error::PipelineError;
pub use events::{ControlEvent, ProgressEvent, StreamStatus, TranscodeStatus};
pub use gateway::GatewayState;
pub use recording::{
    HttpRecordingStore, NullRecordingStore, RecordingHandle, RecordingPatch, RecordingStore,
};
pub use storage::{ObjectStore, StorageBackend};
pub use worker::WorkerContext;

/// Builds the shared handles and runs the configured role until a
/// termination signal. `role = "all"` runs the gateway and a worker in one
/// process, which together with the memory broker gives a complete
/// single-machine pipeline.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let broker: BrokerHandle = if config.broker_url == "memory" {
        info!("using in-process broker");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(RedisBroker::connect(&config.broker_url).await?)
    };
    let store = Arc::new(ObjectStore::new(&config.to_storage_backend()?)?);
    let recordings: RecordingHandle = match &config.recording_api_url {
        Some(url) => Arc::new(HttpRecordingStore::new(url.clone())),
        None => Arc::new(NullRecordingStore),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(signal_listener(shutdown_tx));

    match config.role.as_str() {
        "gateway" => {
            let state = GatewayState::new(broker, store, recordings, config.bucket_name());
            gateway::run(&config, state, wait_for(shutdown_rx)).await
        }
        "worker" => {
            let ctx = Arc::new(WorkerContext {
                broker,
                store,
                worker_id: config.worker_id(),
                config,
            });
            worker::run(ctx, shutdown_rx).await
        }
        "all" => {
            let state = GatewayState::new(
                broker.clone(),
                store.clone(),
                recordings,
                config.bucket_name(),
            );
            let ctx = Arc::new(WorkerContext {
                broker,
                store,
                worker_id: config.worker_id(),
                config: config.clone(),
            });
            let gateway = gateway::run(&config, state, wait_for(shutdown_rx.clone()));
            let worker = worker::run(ctx, shutdown_rx);
            tokio::try_join!(gateway, worker)?;
            Ok(())
        }
        role => Err(anyhow::anyhow!("unsupported role {role:?}")),
    }
}

/// Resolves once the shutdown flag flips.
async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn signal_listener(shutdown: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("termination signal received, shutting down");
    let _ = shutdown.send(true);
}
