//! Transcode worker: claims streams off the control log, drives one
//! transcoding task per owned stream, and keeps a TTL-bounded liveness key
//! refreshed so peers can tell a dead worker from a busy one.

mod muxer;
mod reclaim;
mod task;
mod uploader;

pub use muxer::Muxer;
pub use uploader::OutputUploader;

use crate::broker::{Broker, BrokerHandle};
use crate::config::Config;
use crate::error::PipelineError;
use crate::events::{ControlEvent, ProgressEvent};
use crate::storage::ObjectStore;
use crate::stream::{self, heartbeat_key};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Blocking budget for control-log tail reads; the shutdown flag is
/// re-checked between iterations.
const CONTROL_READ_BUDGET: Duration = Duration::from_secs(1);

/// Shared handles for everything the worker side does.
pub struct WorkerContext {
    pub broker: BrokerHandle,
    pub store: Arc<ObjectStore>,
    pub config: Config,
    pub worker_id: String,
}

struct StreamHandle {
    drain_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

type TaskMap = Arc<Mutex<HashMap<String, StreamHandle>>>;

pub async fn run(ctx: Arc<WorkerContext>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    info!(worker_id = %ctx.worker_id, "worker starting");

    // Heartbeats start first and stop last.
    let (heartbeat_stop, heartbeat_stop_rx) = watch::channel(false);
    let heartbeat = tokio::spawn(heartbeat_loop(ctx.clone(), heartbeat_stop_rx));

    let tasks: TaskMap = Arc::default();

    // Heal streams orphaned by dead workers before following new ones.
    for orphan in reclaim::sweep(&ctx).await {
        info!(stream_id = %orphan.stream_id, "resuming reclaimed stream");
        spawn_stream(
            &ctx,
            &tasks,
            orphan.stream_id,
            orphan.prefix,
            orphan.resume_last_applied,
        );
    }

    // Follow the control log from new entries only.
    let mut cursor = ctx
        .broker
        .log_tail_id(stream::CONTROL_LOG)
        .await
        .map_err(|err| anyhow::anyhow!("control log tail: {err}"))?;

    while !*shutdown.borrow() {
        let entries = match ctx
            .broker
            .log_read(stream::CONTROL_LOG, &cursor, Some(CONTROL_READ_BUDGET), 16)
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, "control log read failed");
                tokio::time::sleep(CONTROL_READ_BUDGET).await;
                continue;
            }
        };
        for entry in entries {
            cursor = entry.id.clone();
            let Some(raw) = entry.field("event") else {
                warn!(id = %entry.id, "control entry without event payload");
                continue;
            };
            match ControlEvent::parse(raw) {
                Ok(event) => handle_control(&ctx, &tasks, event).await,
                Err(err) => warn!(id = %entry.id, %err, "undecodable control event"),
            }
        }
    }

    // Shutdown: no new claims, drain every owned stream, then let the
    // heartbeat lapse.
    info!(worker_id = %ctx.worker_id, "worker draining");
    let handles: Vec<(String, StreamHandle)> = {
        let mut tasks = tasks.lock().expect("task map lock");
        tasks.drain().collect()
    };
    for (stream_id, handle) in &handles {
        debug!(%stream_id, "marking stream for drain");
        let _ = handle.drain_tx.send(true);
    }
    for (stream_id, handle) in handles {
        if let Err(err) = handle.join.await {
            warn!(%stream_id, %err, "stream task did not finish cleanly");
        }
    }
    let _ = heartbeat_stop.send(true);
    let _ = heartbeat.await;
    info!(worker_id = %ctx.worker_id, "worker stopped");
    Ok(())
}

async fn handle_control(ctx: &Arc<WorkerContext>, tasks: &TaskMap, event: ControlEvent) {
    match event {
        ControlEvent::StreamStart {
            stream_id, prefix, ..
        } => match claim(ctx, &stream_id).await {
            Ok(true) => {
                info!(%stream_id, worker_id = %ctx.worker_id, "stream claimed");
                spawn_stream(ctx, tasks, stream_id, prefix, None);
            }
            Ok(false) => {
                debug!(%stream_id, "claim skipped, another worker owns the stream");
            }
            Err(err) => {
                warn!(%stream_id, %err, "claim attempt failed");
            }
        },
        ControlEvent::StreamStop { stream_id, .. } => {
            let tasks = tasks.lock().expect("task map lock");
            match tasks.get(&stream_id) {
                Some(handle) => {
                    info!(%stream_id, "draining owned stream");
                    let _ = handle.drain_tx.send(true);
                }
                None => debug!(%stream_id, "stop for a stream this worker does not own"),
            }
        }
    }
}

async fn claim(ctx: &Arc<WorkerContext>, stream_id: &str) -> Result<bool, PipelineError> {
    ctx.broker
        .set_if_absent(&stream::owner_key(stream_id), &ctx.worker_id, None)
        .await
}

fn spawn_stream(
    ctx: &Arc<WorkerContext>,
    tasks: &TaskMap,
    stream_id: String,
    prefix: String,
    resume_last_applied: Option<u64>,
) {
    let (drain_tx, drain_rx) = watch::channel(false);
    let stream_task = task::StreamTask::new(
        ctx.clone(),
        stream_id.clone(),
        prefix,
        drain_rx,
        resume_last_applied,
    );

    let join = {
        let tasks = tasks.clone();
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            stream_task.run().await;
            tasks.lock().expect("task map lock").remove(&stream_id);
        })
    };

    tasks
        .lock()
        .expect("task map lock")
        .insert(stream_id, StreamHandle { drain_tx, join });
}

/// Refreshes `heartbeat:{worker_id}` forever, backing off on broker
/// failures but never giving up; a worker that cannot heartbeat is
/// indistinguishable from a dead one and loses its streams to the sweep.
async fn heartbeat_loop(ctx: Arc<WorkerContext>, mut stop: watch::Receiver<bool>) {
    let key = heartbeat_key(&ctx.worker_id);
    let interval = ctx.config.heartbeat_interval();
    let ttl = ctx.config.heartbeat_ttl();
    let mut backoff = Duration::from_millis(200);

    loop {
        if *stop.borrow() {
            break;
        }
        let delay = match ctx.broker.set(&key, "alive", Some(ttl)).await {
            Ok(()) => {
                backoff = Duration::from_millis(200);
                interval
            }
            Err(err) => {
                warn!(worker_id = %ctx.worker_id, %err, "heartbeat refresh failed");
                let delay = backoff;
                backoff = (backoff * 2).min(interval);
                delay
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => {}
        }
    }

    // Graceful exit: the key disappears immediately instead of lingering
    // for a TTL, so peers can reclaim without waiting.
    let _ = ctx.broker.delete(&key).await;
}

pub(crate) async fn publish_progress(ctx: &WorkerContext, event: ProgressEvent) {
    let channel = stream::events_channel(event.stream_id());
    if let Err(err) = ctx.broker.publish(&channel, &event.to_json()).await {
        warn!(stream_id = %event.stream_id(), %err, "progress publish failed");
    }
}
