//! Per-stream transcoding task.
//!
//! Four activities share this task: the muxer child, the chunk consumer
//! feeding its stdin, the output uploader polling its scratch directory,
//! and the finalizer that runs once the child exits. The consumer owns
//! stdin exclusively; the uploader owns the directory until the finalizer
//! takes over for the last sweep.

use super::WorkerContext;
use super::muxer::Muxer;
use super::uploader::OutputUploader;
use crate::broker::{Broker as _, LOG_START, LogEntry};
use crate::error::PipelineError;
use crate::events::{ProgressEvent, StreamStatus, TranscodeStatus};
use crate::retry;
use crate::stream::{self, ChunkEntry, StreamRecord};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a muxer gets to flush and exit after stdin closes.
const MUXER_EXIT_GRACE: Duration = Duration::from_secs(2);
/// Stream state is kept around this long after a terminal status so late
/// status queries still resolve.
const STATE_RETENTION: Duration = Duration::from_secs(300);

pub struct StreamTask {
    ctx: Arc<WorkerContext>,
    stream_id: String,
    prefix: String,
    drain_rx: watch::Receiver<bool>,
    /// Set when resuming a reclaimed stream; chunks at or below this
    /// sequence were already fed to the previous owner's muxer.
    resume_last_applied: Option<u64>,
}

impl StreamTask {
    pub fn new(
        ctx: Arc<WorkerContext>,
        stream_id: String,
        prefix: String,
        drain_rx: watch::Receiver<bool>,
        resume_last_applied: Option<u64>,
    ) -> Self {
        Self {
            ctx,
            stream_id,
            prefix,
            drain_rx,
            resume_last_applied,
        }
    }

    pub async fn run(self) {
        let stream_id = self.stream_id.clone();
        super::publish_progress(
            &self.ctx,
            ProgressEvent::StatusChange {
                stream_id: stream_id.clone(),
                status: TranscodeStatus::Transcoding,
            },
        )
        .await;

        match self.transcode().await {
            Ok(()) => info!(%stream_id, "stream finalized"),
            Err(err) => warn!(%stream_id, %err, "stream finalized with error"),
        }
    }

    async fn transcode(self) -> Result<(), PipelineError> {
        let out_dir = std::path::Path::new(&self.ctx.config.temp_root).join(&self.stream_id);
        if let Err(err) = tokio::fs::create_dir_all(&out_dir).await {
            let reason = format!("scratch directory: {err}");
            self.finalize_error(None, &reason).await;
            return Err(PipelineError::Muxer(reason));
        }

        let mut muxer = match Muxer::spawn(
            &self.ctx.config.muxer_bin,
            &out_dir,
            self.ctx.config.segment_seconds,
        ) {
            Ok(muxer) => muxer,
            Err(err) => {
                self.finalize_error(Some(&out_dir), &err.to_string()).await;
                return Err(err);
            }
        };
        let stdin = muxer
            .take_stdin()
            .ok_or_else(|| PipelineError::Muxer("stdin not piped".into()))?;

        let uploader = OutputUploader::new(
            self.stream_id.clone(),
            self.prefix.clone(),
            out_dir.clone(),
            self.ctx.store.clone(),
            self.ctx.broker.clone(),
            self.ctx.config.quiescence(),
        );
        let poll_cancel = CancellationToken::new();
        let uploader_join = tokio::spawn(
            uploader.run(self.ctx.config.poll_interval(), poll_cancel.clone()),
        );

        let consumer = ChunkConsumer {
            ctx: self.ctx.clone(),
            stream_id: self.stream_id.clone(),
            drain_rx: self.drain_rx.clone(),
            last_applied: self.resume_last_applied,
        };
        let mut consumer_join = tokio::spawn(consumer.consume(stdin));

        // Normal flow: the consumer drains and closes stdin, then the muxer
        // flushes and exits. A muxer death is noticed here first and tears
        // the consumer down instead.
        let mut consumer_result = None;
        let exit_status;
        {
            let muxer_wait = muxer.wait();
            tokio::pin!(muxer_wait);
            tokio::select! {
                joined = &mut consumer_join => {
                    consumer_result = Some(flatten_join(joined));
                    exit_status = None;
                }
                status = &mut muxer_wait => {
                    exit_status = Some(status);
                }
            }
        }
        let exit_status = match exit_status {
            Some(status) => {
                consumer_join.abort();
                let _ = consumer_join.await;
                status
            }
            None => muxer.wait_or_kill(MUXER_EXIT_GRACE).await,
        };

        // The poller and the finalizer sweep never overlap.
        poll_cancel.cancel();
        let mut uploader = match uploader_join.await {
            Ok(uploader) => uploader,
            Err(err) => {
                let reason = format!("uploader task failed: {err}");
                self.finalize_error(Some(&out_dir), &reason).await;
                return Err(PipelineError::Muxer(reason));
            }
        };
        uploader.final_sweep().await;

        // The consumer only returns Ok via its drain path, so a finished
        // consumer means the stream was ending. If it was torn down early
        // (muxer death), fall back to the same signals it watches: the
        // local drain mark and the broker state. A reclaimed stream that
        // was already Ending before the crash only shows up in the latter.
        let consumer_drained = matches!(&consumer_result, Some(Ok(_)));
        let consumer_error = match consumer_result {
            Some(Err(err)) => Some(err),
            _ => None,
        };
        let drained = consumer_drained
            || *self.drain_rx.borrow()
            || stream_is_ending(&self.ctx, &self.stream_id).await;
        let exited_cleanly = matches!(&exit_status, Ok(status) if status.success());

        // A non-zero exit during drain still counts when at least one
        // segment made it out; mid-live it is always fatal.
        let success = consumer_error.is_none()
            && (exited_cleanly || (drained && uploader.segment_count() > 0));

        if success {
            self.finalize_complete(&out_dir, &uploader).await;
            Ok(())
        } else {
            let reason = error_reason(&muxer, &exit_status, consumer_error.as_ref());
            self.finalize_error(Some(&out_dir), &reason).await;
            Err(PipelineError::Muxer(reason))
        }
    }

    async fn finalize_complete(&self, out_dir: &std::path::Path, uploader: &OutputUploader) {
        // Ready-then-complete ordering is load-bearing for existing
        // consumers; both are published back to back.
        super::publish_progress(
            &self.ctx,
            ProgressEvent::StatusChange {
                stream_id: self.stream_id.clone(),
                status: TranscodeStatus::Ready,
            },
        )
        .await;
        super::publish_progress(
            &self.ctx,
            ProgressEvent::StreamComplete {
                stream_id: self.stream_id.clone(),
                segment_count: uploader.segment_count(),
                total_bytes: uploader.total_bytes(),
            },
        )
        .await;
        self.retire(StreamStatus::Complete, out_dir).await;
        info!(
            stream_id = %self.stream_id,
            segments = uploader.segment_count(),
            bytes = uploader.total_bytes(),
            "transcode complete"
        );
    }

    async fn finalize_error(&self, out_dir: Option<&std::path::Path>, reason: &str) {
        super::publish_progress(
            &self.ctx,
            ProgressEvent::StatusChange {
                stream_id: self.stream_id.clone(),
                status: TranscodeStatus::Error,
            },
        )
        .await;
        super::publish_progress(
            &self.ctx,
            ProgressEvent::StreamError {
                stream_id: self.stream_id.clone(),
                reason: reason.to_string(),
            },
        )
        .await;
        if let Some(out_dir) = out_dir {
            self.retire(StreamStatus::Error, out_dir).await;
        } else {
            self.retire_state_only(StreamStatus::Error).await;
        }
    }

    async fn retire(&self, status: StreamStatus, out_dir: &std::path::Path) {
        self.retire_state_only(status).await;
        if let Err(err) = tokio::fs::remove_dir_all(out_dir).await {
            warn!(stream_id = %self.stream_id, %err, "scratch directory not removed");
        }
    }

    async fn retire_state_only(&self, status: StreamStatus) {
        let state_key = stream::state_key(&self.stream_id);
        let broker = &self.ctx.broker;
        if let Err(err) = broker
            .hash_set(
                &state_key,
                vec![(StreamRecord::F_STATUS.into(), status.to_string())],
            )
            .await
        {
            warn!(stream_id = %self.stream_id, %err, "terminal status not recorded");
        }
        if let Err(err) = broker.expire(&state_key, STATE_RETENTION).await {
            warn!(stream_id = %self.stream_id, %err, "state retention not scheduled");
        }
        if let Err(err) = broker.delete(&stream::owner_key(&self.stream_id)).await {
            warn!(stream_id = %self.stream_id, %err, "owner key not released");
        }
    }
}

fn flatten_join(
    joined: Result<Result<u64, PipelineError>, tokio::task::JoinError>,
) -> Result<u64, PipelineError> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(PipelineError::Transport(format!("consumer task: {err}"))),
    }
}

fn error_reason(
    muxer: &Muxer,
    exit_status: &Result<std::process::ExitStatus, PipelineError>,
    consumer_error: Option<&PipelineError>,
) -> String {
    if let Some(err) = consumer_error {
        return err.to_string();
    }
    let stderr = muxer.recent_errors();
    if !stderr.is_empty() {
        return stderr.join("; ");
    }
    match exit_status {
        Ok(status) => format!("muxer exited with {status}"),
        Err(err) => err.to_string(),
    }
}

/// Tails `chunks:{stream_id}` and feeds bytes to the muxer in strict
/// sequence order. Entries ahead of a gap are buffered; the gap is waited
/// out indefinitely while the stream is live and abandoned one grace
/// cycle after it starts ending.
struct ChunkConsumer {
    ctx: Arc<WorkerContext>,
    stream_id: String,
    drain_rx: watch::Receiver<bool>,
    last_applied: Option<u64>,
}

impl ChunkConsumer {
    async fn consume<W>(mut self, mut sink: W) -> Result<u64, PipelineError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let log = stream::chunks_log(&self.stream_id);
        let mut cursor = LOG_START.to_string();
        let mut pending: BTreeMap<u64, ChunkEntry> = BTreeMap::new();
        let mut applied: u64 = 0;
        let mut idle_cycles_ending: u32 = 0;
        let read_timeout = self.ctx.config.read_timeout();

        loop {
            let entries = self.read_log(&log, &cursor, Some(read_timeout)).await?;
            match entries.last() {
                Some(last) => {
                    cursor = last.id.clone();
                    idle_cycles_ending = 0;
                    self.stage(entries, &mut pending);
                    applied += self.apply_ready(&mut pending, &mut sink).await?;
                }
                None => {
                    if self.is_ending().await {
                        idle_cycles_ending += 1;
                        if idle_cycles_ending > self.ctx.config.drain_grace_cycles {
                            break;
                        }
                    } else {
                        idle_cycles_ending = 0;
                    }
                }
            }
        }

        // Draining: pick up whatever is already buffered in the log, then
        // close stdin so the muxer can flush.
        loop {
            let entries = self.read_log(&log, &cursor, None).await?;
            let Some(last) = entries.last() else {
                break;
            };
            cursor = last.id.clone();
            self.stage(entries, &mut pending);
            applied += self.apply_ready(&mut pending, &mut sink).await?;
        }

        if !pending.is_empty() {
            warn!(
                stream_id = %self.stream_id,
                last_applied = ?self.last_applied,
                buffered = pending.len(),
                "finalizing with a sequence gap; buffered chunks dropped"
            );
        }

        sink.shutdown()
            .await
            .map_err(|err| PipelineError::Transport(format!("close muxer stdin: {err}")))?;
        info!(stream_id = %self.stream_id, applied, "chunk consumer drained");
        Ok(applied)
    }

    async fn read_log(
        &self,
        log: &str,
        cursor: &str,
        block: Option<Duration>,
    ) -> Result<Vec<LogEntry>, PipelineError> {
        let broker = self.ctx.broker.clone();
        retry::with_backoff("chunk log read", || {
            let broker = broker.clone();
            async move { broker.log_read(log, cursor, block, 64).await }
        })
        .await
    }

    fn stage(&mut self, entries: Vec<LogEntry>, pending: &mut BTreeMap<u64, ChunkEntry>) {
        for entry in entries {
            let chunk = match ChunkEntry::from_fields(&entry.fields) {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(stream_id = %self.stream_id, %err, "undecodable chunk entry skipped");
                    continue;
                }
            };
            if self.last_applied.is_some_and(|last| chunk.seq <= last) {
                warn!(
                    stream_id = %self.stream_id,
                    seq = chunk.seq,
                    last_applied = ?self.last_applied,
                    "out-of-order chunk rejected"
                );
                continue;
            }
            pending.insert(chunk.seq, chunk);
        }
    }

    async fn apply_ready<W>(
        &mut self,
        pending: &mut BTreeMap<u64, ChunkEntry>,
        sink: &mut W,
    ) -> Result<u64, PipelineError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut applied = 0;
        loop {
            let next = self.last_applied.map_or(0, |last| last + 1);
            let Some(chunk) = pending.remove(&next) else {
                if let Some((&seq, _)) = pending.iter().next() {
                    debug!(
                        stream_id = %self.stream_id,
                        waiting_for = next,
                        buffered_from = seq,
                        "sequence gap, waiting"
                    );
                }
                return Ok(applied);
            };

            let store = self.ctx.store.clone();
            let key = chunk.key.clone();
            let bytes = retry::with_backoff("chunk fetch", || {
                let store = store.clone();
                let key = key.clone();
                async move { store.get(&key).await }
            })
            .await?;

            sink.write_all(&bytes)
                .await
                .map_err(|err| PipelineError::Muxer(format!("muxer stdin write: {err}")))?;
            self.last_applied = Some(chunk.seq);
            applied += 1;
            debug!(stream_id = %self.stream_id, seq = chunk.seq, size = bytes.len(), "chunk applied");
        }
    }

    async fn is_ending(&self) -> bool {
        *self.drain_rx.borrow() || stream_is_ending(&self.ctx, &self.stream_id).await
    }
}

/// True when the broker's stream record says the stream is past Live.
/// Unreadable state counts as still live; the next check comes a read
/// cycle later.
async fn stream_is_ending(ctx: &WorkerContext, stream_id: &str) -> bool {
    let fields = match ctx
        .broker
        .hash_get_all(&stream::state_key(stream_id))
        .await
    {
        Ok(fields) => fields,
        Err(err) => {
            warn!(%stream_id, %err, "stream state unreadable");
            return false;
        }
    };
    match StreamRecord::from_fields(&fields) {
        Some(Ok(record)) => record.status != StreamStatus::Live,
        _ => false,
    }
}
