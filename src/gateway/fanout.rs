//! Progress fan-out.
//!
//! One subscriber per gateway process drains every `events:*` channel and
//! forwards each frame onto the in-process broadcast channel; each
//! websocket write loop holds its own receiver. Terminal events also patch
//! the recording record, idempotently — the fields written are the same on
//! every delivery.

use super::GatewayState;
use crate::broker::Broker as _;
use crate::events::{ProgressEvent, TranscodeStatus};
use crate::recording::RecordingPatch;
use crate::stream::EVENTS_PATTERN;
use chrono::Utc;
use tracing::{debug, error, warn};

pub async fn run(state: GatewayState) {
    let mut events = match state.broker.subscribe(EVENTS_PATTERN).await {
        Ok(events) => events,
        Err(err) => {
            error!(%err, "progress subscription failed; viewers will see no events");
            return;
        }
    };

    while let Some((channel, payload)) = events.recv().await {
        // Forward first: chunk ingestion and record updates must never
        // delay what viewers see. No receivers connected is fine.
        let _ = state.viewer_tx.send(payload.clone());

        let event = match ProgressEvent::parse(&payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(%channel, %err, "undecodable progress event");
                continue;
            }
        };
        debug!(%channel, ?event, "progress event relayed");

        let stream_id = event.stream_id().to_string();
        if let Some(patch) = recording_patch(&event) {
            if let Err(err) = state.recordings.update(&stream_id, patch).await {
                warn!(%stream_id, %err, "recording record update failed");
            }
        }
    }
}

/// Maps terminal progress events onto narrow recording-record updates.
/// Segment and manifest notifications carry nothing durable.
fn recording_patch(event: &ProgressEvent) -> Option<RecordingPatch> {
    match event {
        ProgressEvent::StatusChange { status, .. } => {
            let mut patch = RecordingPatch {
                status: Some(status.as_recording_status().to_string()),
                ..Default::default()
            };
            if matches!(status, TranscodeStatus::Ready | TranscodeStatus::Error) {
                patch.is_live_streaming = Some(false);
                patch.stream_ended_at = Some(Utc::now());
            }
            Some(patch)
        }
        ProgressEvent::StreamComplete { total_bytes, .. } => Some(RecordingPatch {
            file_bytes: Some(*total_bytes),
            is_live_streaming: Some(false),
            ..Default::default()
        }),
        ProgressEvent::StreamError { .. } => Some(RecordingPatch {
            status: Some("error".into()),
            is_live_streaming: Some(false),
            ..Default::default()
        }),
        ProgressEvent::SegmentReady { .. } | ProgressEvent::ManifestUpdated { .. } => None,
    }
}
