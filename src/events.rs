//! Lifecycle and progress records exchanged through the broker.
//!
//! `ControlEvent` rides the single shared `control` log; `ProgressEvent`
//! rides the per-stream `events:{stream_id}` channel and is relayed to
//! viewers verbatim, so each event carries its stream id and is
//! self-describing.

use crate::protocol::StopStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stream lifecycle status as held in the `state:{stream_id}` hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    Starting,
    Live,
    Ending,
    Complete,
    Error,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "Starting",
            Self::Live => "Live",
            Self::Ending => "Ending",
            Self::Complete => "Complete",
            Self::Error => "Error",
        };
        f.write_str(name)
    }
}

impl FromStr for StreamStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Starting" => Ok(Self::Starting),
            "Live" => Ok(Self::Live),
            "Ending" => Ok(Self::Ending),
            "Complete" => Ok(Self::Complete),
            "Error" => Ok(Self::Error),
            other => Err(format!("unknown stream status {other:?}")),
        }
    }
}

/// Transcoder-side status surfaced to viewers and the recording record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscodeStatus {
    Transcoding,
    Ready,
    Error,
}

impl TranscodeStatus {
    /// The recording record stores status lowercase.
    pub fn as_recording_status(self) -> &'static str {
        match self {
            Self::Transcoding => "transcoding",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

/// Record on the shared control log. Totally ordered by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlEvent {
    StreamStart {
        stream_id: String,
        bucket: String,
        prefix: String,
    },
    StreamStop {
        stream_id: String,
        stats: StopStats,
    },
}

impl ControlEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            Self::StreamStart { stream_id, .. } | Self::StreamStop { stream_id, .. } => stream_id,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("control event serializes")
    }

    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Record published on `events:{stream_id}`. The wire shape doubles as the
/// websocket broadcast frame, hence the camelCase tagging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    SegmentReady {
        stream_id: String,
        name: String,
        size: u64,
    },
    ManifestUpdated {
        stream_id: String,
        key: String,
    },
    StatusChange {
        stream_id: String,
        status: TranscodeStatus,
    },
    StreamComplete {
        stream_id: String,
        segment_count: u64,
        total_bytes: u64,
    },
    StreamError {
        stream_id: String,
        reason: String,
    },
}

impl ProgressEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            Self::SegmentReady { stream_id, .. }
            | Self::ManifestUpdated { stream_id, .. }
            | Self::StatusChange { stream_id, .. }
            | Self::StreamComplete { stream_id, .. }
            | Self::StreamError { stream_id, .. } => stream_id,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("progress event serializes")
    }

    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_events_round_trip_through_the_log_payload() {
        let event = ControlEvent::StreamStart {
            stream_id: "s1".into(),
            bucket: "media".into(),
            prefix: "recordings/2025/03/07".into(),
        };
        let parsed = ControlEvent::parse(&event.to_json()).unwrap();
        match parsed {
            ControlEvent::StreamStart { stream_id, bucket, .. } => {
                assert_eq!(stream_id, "s1");
                assert_eq!(bucket, "media");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn progress_events_use_viewer_facing_tags() {
        let event = ProgressEvent::SegmentReady {
            stream_id: "s1".into(),
            name: "segment_00001.ts".into(),
            size: 4096,
        };
        assert_eq!(
            event.to_json(),
            r#"{"type":"segmentReady","streamId":"s1","name":"segment_00001.ts","size":4096}"#
        );

        let complete = ProgressEvent::StreamComplete {
            stream_id: "s1".into(),
            segment_count: 10,
            total_bytes: 123,
        };
        assert!(complete.to_json().starts_with(r#"{"type":"streamComplete""#));
    }

    #[test]
    fn status_parses_both_directions() {
        assert_eq!("Live".parse::<StreamStatus>().unwrap(), StreamStatus::Live);
        assert_eq!(StreamStatus::Ending.to_string(), "Ending");
        assert!("live".parse::<StreamStatus>().is_err());
    }
}
