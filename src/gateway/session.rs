//! One recorder (or viewer) connection.
//!
//! Every socket is served by a read loop and a write loop joined by a
//! bounded outbound queue. The read loop runs the control state machine:
//! connections start unauthenticated, the first frame must be `start`, and
//! binary frames are media chunks thereafter. The write loop multiplexes
//! direct acks with progress frames relayed from the broker subscription,
//! so a client that never sends `start` acts as a pure viewer.

use super::{GatewayState, LiveStream};
use crate::broker::Broker as _;
use crate::error::PipelineError;
use crate::events::{ControlEvent, StreamStatus};
use crate::keys;
use crate::protocol::{ClientFrame, ServerFrame, StopStats};
use crate::recording::RecordingPatch;
use crate::retry;
use crate::stream::{self, ChunkEntry, StreamRecord};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub async fn serve(socket: WebSocket, state: GatewayState) {
    let (mut sink, mut source) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<Message>(64);

    let write_loop = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Relay broadcast progress frames while the connection lives.
    let relay = {
        let mut viewer_rx = state.viewer_tx.subscribe();
        let outbound = outbound.clone();
        tokio::spawn(async move {
            loop {
                match viewer_rx.recv().await {
                    Ok(frame) => {
                        if outbound.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    // Skipped frames under lag are acceptable: events are
                    // self-describing and viewers resync from the manifest.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "viewer fell behind progress fan-out");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let mut session = Session {
        state,
        outbound,
        stream_id: None,
        closing: false,
    };

    while let Some(frame) = source.next().await {
        let result = match frame {
            Ok(Message::Text(text)) => session.on_text(text.as_str()).await,
            Ok(Message::Binary(data)) => session.on_binary(data).await,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Ok(()),
        };

        match result {
            Ok(()) => {
                if session.closing {
                    break;
                }
            }
            Err(err) if err.is_protocol() => {
                warn!(stream_id = ?session.stream_id, %err, "closing connection");
                session.send(ServerFrame::error(err.to_string())).await;
                break;
            }
            Err(err) => {
                warn!(stream_id = ?session.stream_id, %err, "connection failed");
                break;
            }
        }
    }

    session.on_disconnect().await;
    relay.abort();
    drop(session);
    let _ = write_loop.await;
}

struct Session {
    state: GatewayState,
    outbound: mpsc::Sender<Message>,
    /// Set once `start` has been accepted; doubles as the auth flag.
    stream_id: Option<String>,
    closing: bool,
}

impl Session {
    async fn send(&self, frame: ServerFrame) {
        let _ = self
            .outbound
            .send(Message::Text(frame.to_json().into()))
            .await;
    }

    async fn on_text(&mut self, text: &str) -> Result<(), PipelineError> {
        match ClientFrame::parse(text)? {
            ClientFrame::Start { recording_id } => self.on_start(recording_id).await,
            ClientFrame::Stop(stats) => self.on_stop(stats, true).await,
            ClientFrame::Ping {} => {
                self.send(ServerFrame::Pong {
                    timestamp: Utc::now().timestamp_millis(),
                })
                .await;
                Ok(())
            }
        }
    }

    async fn on_start(&mut self, recording_id: String) -> Result<(), PipelineError> {
        if self.stream_id.is_some() {
            return Err(PipelineError::protocol("start received twice"));
        }
        if recording_id.is_empty() || recording_id.contains(['/', ' ']) {
            return Err(PipelineError::protocol("invalid recording id"));
        }

        // Re-attachment is only possible while no worker holds the stream.
        let owner_key = stream::owner_key(&recording_id);
        if self.state.broker.get(&owner_key).await?.is_some() {
            return Err(PipelineError::protocol(format!(
                "stream {recording_id} is already being transcoded"
            )));
        }
        {
            let streams = self.state.streams.lock().expect("streams lock");
            if streams
                .get(&recording_id)
                .is_some_and(|s| s.status == StreamStatus::Live)
            {
                return Err(PipelineError::protocol(format!(
                    "stream {recording_id} already has a recorder attached"
                )));
            }
        }

        let started_at = Utc::now();
        let prefix = keys::date_prefix(started_at);
        let record = StreamRecord::new(self.state.bucket.clone(), prefix.clone(), started_at);

        let broker = self.state.broker.clone();
        let state_key = stream::state_key(&recording_id);
        let fields = record.to_fields();
        retry::with_backoff("stream state init", || {
            let broker = broker.clone();
            let fields = fields.clone();
            let state_key = state_key.clone();
            async move { broker.hash_set(&state_key, fields).await }
        })
        .await?;

        let start_event = control_fields(&ControlEvent::StreamStart {
            stream_id: recording_id.clone(),
            bucket: self.state.bucket.clone(),
            prefix: prefix.clone(),
        });
        retry::with_backoff("stream start announce", || {
            let broker = broker.clone();
            let start_event = start_event.clone();
            async move { broker.log_append(stream::CONTROL_LOG, start_event).await }
        })
        .await?;

        // External collaborator; failures must not abort the stream.
        let patch = RecordingPatch {
            status: Some("recording".into()),
            is_live_streaming: Some(true),
            stream_started_at: Some(started_at),
            storage_bucket: Some(self.state.bucket.clone()),
            storage_key: Some(keys::manifest_key(&prefix, &recording_id)),
            playback_format: Some("hls".into()),
            ..Default::default()
        };
        if let Err(err) = self.state.recordings.update(&recording_id, patch).await {
            warn!(%recording_id, %err, "recording record update failed on start");
        }

        self.state.streams.lock().expect("streams lock").insert(
            recording_id.clone(),
            LiveStream {
                status: StreamStatus::Live,
                prefix,
                next_seq: 0,
                started_at,
            },
        );

        info!(stream_id = %recording_id, "stream started");
        self.send(ServerFrame::Started {
            recording_id: recording_id.clone(),
            status: StreamStatus::Live,
        })
        .await;
        self.stream_id = Some(recording_id);
        Ok(())
    }

    async fn on_binary(&mut self, data: Bytes) -> Result<(), PipelineError> {
        let Some(stream_id) = self.stream_id.clone() else {
            return Err(PipelineError::protocol(
                "binary frame before start",
            ));
        };

        let live_chunk = {
            let streams = self.state.streams.lock().expect("streams lock");
            let Some(live) = streams.get(&stream_id) else {
                return Err(PipelineError::protocol("unknown stream"));
            };
            if live.status != StreamStatus::Live {
                // Late chunk after stop; drop it and tell the recorder.
                None
            } else {
                Some((live.next_seq, live.prefix.clone()))
            }
        };
        let (seq, prefix) = match live_chunk {
            Some(pair) => pair,
            None => {
                self.send(ServerFrame::error(format!(
                    "stream {stream_id} is no longer live"
                )))
                .await;
                return Ok(());
            }
        };

        let key = keys::chunk_key(&prefix, &stream_id, seq);
        let size = data.len() as u64;
        if let Err(err) = self
            .state
            .store
            .put_bytes(&key, data.to_vec(), "video/webm")
            .await
        {
            // The counter did not advance: the recorder may resend and the
            // retry reuses this sequence number.
            warn!(%stream_id, seq, %err, "chunk write failed");
            self.send(ServerFrame::error(format!("chunk {seq} not stored, retry")))
                .await;
            return Ok(());
        }

        if let Some(live) = self
            .state
            .streams
            .lock()
            .expect("streams lock")
            .get_mut(&stream_id)
        {
            live.next_seq = seq + 1;
        }

        // Commit order matters: the object is durable, so the log append
        // makes it visible. If the broker write fails the object is an
        // orphan; readers recover via chunk_count and the next append.
        let entry = ChunkEntry {
            seq,
            key: key.clone(),
            size,
            timestamp: Utc::now(),
        };
        if let Err(err) = self
            .state
            .broker
            .hash_incr(&stream::state_key(&stream_id), StreamRecord::F_CHUNK_COUNT, 1)
            .await
        {
            warn!(%stream_id, seq, %err, "chunk counter update failed, orphan object kept");
            return Ok(());
        }
        if let Err(err) = self
            .state
            .broker
            .log_append(&stream::chunks_log(&stream_id), entry.to_fields())
            .await
        {
            warn!(%stream_id, seq, %err, "chunk log append failed, orphan object kept");
        } else {
            debug!(%stream_id, seq, size, "chunk committed");
        }
        Ok(())
    }

    async fn on_stop(&mut self, stats: StopStats, ack: bool) -> Result<(), PipelineError> {
        let Some(stream_id) = self.stream_id.clone() else {
            return Err(PipelineError::protocol("stop before start"));
        };

        let first_stop = {
            let mut streams = self.state.streams.lock().expect("streams lock");
            match streams.get_mut(&stream_id) {
                Some(live) if live.status == StreamStatus::Live => {
                    live.status = StreamStatus::Ending;
                    true
                }
                _ => false,
            }
        };

        if first_stop {
            let broker = self.state.broker.clone();
            let state_key = stream::state_key(&stream_id);
            retry::with_backoff("stream state ending", || {
                let broker = broker.clone();
                let state_key = state_key.clone();
                async move {
                    broker
                        .hash_set(
                            &state_key,
                            vec![(
                                StreamRecord::F_STATUS.into(),
                                StreamStatus::Ending.to_string(),
                            )],
                        )
                        .await
                }
            })
            .await?;

            let stop_event = control_fields(&ControlEvent::StreamStop {
                stream_id: stream_id.clone(),
                stats: stats.clone(),
            });
            retry::with_backoff("stream stop announce", || {
                let broker = broker.clone();
                let stop_event = stop_event.clone();
                async move { broker.log_append(stream::CONTROL_LOG, stop_event).await }
            })
            .await?;

            let patch = RecordingPatch {
                stream_ended_at: Some(Utc::now()),
                duration: stats.duration,
                pause_count: stats.pause_count,
                pause_duration_total: stats.pause_duration_total,
                pause_events: Some(stats.pause_events.clone()),
                ..Default::default()
            };
            if let Err(err) = self.state.recordings.update(&stream_id, patch).await {
                warn!(%stream_id, %err, "recording record update failed on stop");
            }
            info!(%stream_id, "stream stopping");
        }

        // Finalization is not awaited; the ack carries the transitional
        // status and viewers learn the terminal one from the fan-out. A
        // repeated stop acks identically without re-publishing.
        if ack {
            self.send(ServerFrame::Stopped {
                recording_id: stream_id,
                status: StreamStatus::Ending,
            })
            .await;
        }
        Ok(())
    }

    /// Recorder went away. Without a prior `stop` this is an implicit stop
    /// with empty statistics.
    async fn on_disconnect(&mut self) {
        let Some(stream_id) = self.stream_id.clone() else {
            return;
        };
        let still_live = {
            let streams = self.state.streams.lock().expect("streams lock");
            streams
                .get(&stream_id)
                .is_some_and(|s| s.status == StreamStatus::Live)
        };
        if still_live {
            info!(%stream_id, "recorder disconnected while live, treating as stop");
            if let Err(err) = self.on_stop(StopStats::default(), false).await {
                warn!(%stream_id, %err, "implicit stop failed");
            }
        }
        self.state
            .streams
            .lock()
            .expect("streams lock")
            .remove(&stream_id);
    }
}

pub(super) fn control_fields(event: &ControlEvent) -> Vec<(String, String)> {
    vec![("event".into(), event.to_json())]
}
