//! Ingest gateway: terminates recorder connections, persists media chunks,
//! publishes coordination events, and relays transcoder progress to every
//! connected viewer.

mod fanout;
mod routes;
mod session;

pub use routes::router;

use crate::broker::BrokerHandle;
use crate::config::Config;
use crate::events::StreamStatus;
use crate::recording::RecordingHandle;
use crate::storage::ObjectStore;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::info;

/// Connection-independent gateway state, cloned into every handler.
#[derive(Clone)]
pub struct GatewayState {
    pub broker: BrokerHandle,
    pub store: Arc<ObjectStore>,
    pub recordings: RecordingHandle,
    /// Advertised bucket, recorded on stream state and recording records.
    pub bucket: String,
    /// Streams with a recorder currently attached to this gateway.
    /// Critical sections are lookups and counter bumps only; no I/O.
    pub streams: Arc<Mutex<HashMap<String, LiveStream>>>,
    /// Progress frames fanned out to every connected websocket.
    pub viewer_tx: broadcast::Sender<String>,
}

/// Per-stream ingest bookkeeping held while the recorder is attached.
#[derive(Debug)]
pub struct LiveStream {
    pub status: StreamStatus,
    pub prefix: String,
    pub next_seq: u64,
    pub started_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(
        broker: BrokerHandle,
        store: Arc<ObjectStore>,
        recordings: RecordingHandle,
        bucket: String,
    ) -> Self {
        let (viewer_tx, _) = broadcast::channel(256);
        Self {
            broker,
            store,
            recordings,
            bucket,
            streams: Arc::new(Mutex::new(HashMap::new())),
            viewer_tx,
        }
    }
}

/// Binds the gateway and serves until `shutdown` resolves. The progress
/// fan-out subscriber is spawned first so no event published after startup
/// is missed.
pub async fn run(
    config: &Config,
    state: GatewayState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    tokio::spawn(fanout::run(state.clone()));

    let addr = format!("0.0.0.0:{}", config.listen_on_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind gateway on {addr}"))?;
    info!(%addr, "gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server error")
}
