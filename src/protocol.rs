//! Wire frames for the recorder transport.
//!
//! Text frames are UTF-8 JSON tagged on `type`; binary frames carry opaque
//! media bytes and never reach this module. Unknown `type` values fail
//! deserialization and are answered with a protocol error.

use crate::error::PipelineError;
use crate::events::StreamStatus;
use serde::{Deserialize, Serialize};

/// One recorder pause interval, reported back by the client on `stop`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseEvent {
    pub paused_at: f64,
    pub resumed_at: f64,
    pub duration: f64,
}

/// Recorder-supplied statistics attached to `stop`. All fields are optional
/// on the wire; a disconnect without `stop` is an implicit stop with the
/// default value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StopStats {
    pub duration: Option<f64>,
    pub pause_count: Option<u32>,
    pub pause_duration_total: Option<f64>,
    pub pause_events: Vec<PauseEvent>,
}

/// Client → server control frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Start { recording_id: String },
    Stop(StopStats),
    Ping {},
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(text)
            .map_err(|err| PipelineError::protocol(format!("unrecognized control frame: {err}")))
    }
}

/// Server → client acknowledgements. Progress events relayed from the
/// per-stream channels are serialized by `events::ProgressEvent` and share
/// the same tagged shape on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Started {
        recording_id: String,
        status: StreamStatus,
    },
    Stopped {
        recording_id: String,
        status: StreamStatus,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        detail: String,
    },
}

impl ServerFrame {
    pub fn error(detail: impl Into<String>) -> Self {
        Self::Error {
            detail: detail.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("server frame serializes")
    }
}

/// Convenience used by tests and the REST fallback when echoing transcoder
/// state to clients that cannot hold a websocket open.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamAttributes {
    pub status: StreamStatus,
    pub chunk_count: u64,
    pub bucket: String,
    pub prefix: String,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_frame_parses() {
        let frame = ClientFrame::parse(r#"{"type":"start","recordingId":"s1"}"#).unwrap();
        match frame {
            ClientFrame::Start { recording_id } => assert_eq!(recording_id, "s1"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn stop_frame_defaults_missing_stats() {
        let frame = ClientFrame::parse(r#"{"type":"stop"}"#).unwrap();
        match frame {
            ClientFrame::Stop(stats) => {
                assert_eq!(stats, StopStats::default());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn stop_frame_carries_pause_events() {
        let frame = ClientFrame::parse(
            r#"{"type":"stop","duration":40,"pauseCount":1,"pauseDurationTotal":2.5,
                "pauseEvents":[{"pausedAt":10.0,"resumedAt":12.5,"duration":2.5}]}"#,
        )
        .unwrap();
        let ClientFrame::Stop(stats) = frame else {
            panic!("expected stop");
        };
        assert_eq!(stats.duration, Some(40.0));
        assert_eq!(stats.pause_events.len(), 1);
        assert_eq!(stats.pause_events[0].resumed_at, 12.5);
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        let err = ClientFrame::parse(r#"{"type":"seek","to":12}"#).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn started_ack_matches_the_wire_contract() {
        let frame = ServerFrame::Started {
            recording_id: "s1".into(),
            status: StreamStatus::Live,
        };
        assert_eq!(
            frame.to_json(),
            r#"{"type":"started","recordingId":"s1","status":"Live"}"#
        );
    }

    #[test]
    fn pong_is_tagged() {
        let json = ServerFrame::Pong { timestamp: 17 }.to_json();
        assert_eq!(json, r#"{"type":"pong","timestamp":17}"#);
    }
}
