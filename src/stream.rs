//! Broker keyspace layout and the records stored in it.

use crate::error::PipelineError;
use crate::events::StreamStatus;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub const CONTROL_LOG: &str = "control";

pub fn chunks_log(stream_id: &str) -> String {
    format!("chunks:{stream_id}")
}

pub fn state_key(stream_id: &str) -> String {
    format!("state:{stream_id}")
}

pub fn owner_key(stream_id: &str) -> String {
    format!("owner:{stream_id}")
}

pub fn heartbeat_key(worker_id: &str) -> String {
    format!("heartbeat:{worker_id}")
}

pub fn events_channel(stream_id: &str) -> String {
    format!("events:{stream_id}")
}

/// Pattern the gateway's fan-out subscriber listens on.
pub const EVENTS_PATTERN: &str = "events:*";

/// The `state:{stream_id}` hash, flattened to string fields so every writer
/// can update its own fields atomically without read-modify-write.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub status: StreamStatus,
    pub bucket: String,
    pub prefix: String,
    pub chunk_count: u64,
    pub started_at: Option<DateTime<Utc>>,
}

impl StreamRecord {
    pub const F_STATUS: &'static str = "status";
    pub const F_BUCKET: &'static str = "bucket";
    pub const F_PREFIX: &'static str = "prefix";
    pub const F_CHUNK_COUNT: &'static str = "chunk_count";
    pub const F_STARTED_AT: &'static str = "started_at";

    pub fn new(bucket: String, prefix: String, started_at: DateTime<Utc>) -> Self {
        Self {
            status: StreamStatus::Live,
            bucket,
            prefix,
            chunk_count: 0,
            started_at: Some(started_at),
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (Self::F_STATUS.into(), self.status.to_string()),
            (Self::F_BUCKET.into(), self.bucket.clone()),
            (Self::F_PREFIX.into(), self.prefix.clone()),
            (Self::F_CHUNK_COUNT.into(), self.chunk_count.to_string()),
        ];
        if let Some(at) = self.started_at {
            fields.push((Self::F_STARTED_AT.into(), at.to_rfc3339()));
        }
        fields
    }

    /// Rebuilds the record from a hash read. Returns `None` on an empty
    /// hash (expired or never-created stream).
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Result<Self, PipelineError>> {
        if fields.is_empty() {
            return None;
        }
        Some(Self::parse(fields))
    }

    fn parse(fields: &HashMap<String, String>) -> Result<Self, PipelineError> {
        let status = fields
            .get(Self::F_STATUS)
            .ok_or_else(|| PipelineError::broker("stream record missing status"))?
            .parse::<StreamStatus>()
            .map_err(PipelineError::Broker)?;
        let chunk_count = fields
            .get(Self::F_CHUNK_COUNT)
            .map(|raw| raw.parse::<u64>())
            .transpose()
            .map_err(|err| PipelineError::broker(format!("bad chunk_count: {err}")))?
            .unwrap_or(0);
        let started_at = fields
            .get(Self::F_STARTED_AT)
            .map(|raw| DateTime::parse_from_rfc3339(raw).map(|at| at.with_timezone(&Utc)))
            .transpose()
            .map_err(|err| PipelineError::broker(format!("bad started_at: {err}")))?;

        Ok(Self {
            status,
            bucket: fields.get(Self::F_BUCKET).cloned().unwrap_or_default(),
            prefix: fields.get(Self::F_PREFIX).cloned().unwrap_or_default(),
            chunk_count,
            started_at,
        })
    }
}

/// One committed chunk as recorded on `chunks:{stream_id}`. The entry is
/// appended only after the chunk object write succeeded, so a reader holding
/// this record may fetch `key` unconditionally.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEntry {
    pub seq: u64,
    pub key: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

impl ChunkEntry {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("seq".into(), self.seq.to_string()),
            ("key".into(), self.key.clone()),
            ("size".into(), self.size.to_string()),
            ("timestamp".into(), self.timestamp.to_rfc3339()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, PipelineError> {
        let seq = fields
            .get("seq")
            .ok_or_else(|| PipelineError::broker("chunk entry missing seq"))?
            .parse::<u64>()
            .map_err(|err| PipelineError::broker(format!("bad chunk seq: {err}")))?;
        let size = fields
            .get("size")
            .map(|raw| raw.parse::<u64>())
            .transpose()
            .map_err(|err| PipelineError::broker(format!("bad chunk size: {err}")))?
            .unwrap_or(0);
        let timestamp = fields
            .get("timestamp")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Self {
            seq,
            key: fields
                .get("key")
                .cloned()
                .ok_or_else(|| PipelineError::broker("chunk entry missing key"))?,
            size,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_record_survives_the_hash() {
        let record = StreamRecord::new("media".into(), "recordings/2025/03/07".into(), Utc::now());
        let fields: HashMap<String, String> = record.to_fields().into_iter().collect();
        let parsed = StreamRecord::from_fields(&fields).unwrap().unwrap();
        assert_eq!(parsed.status, StreamStatus::Live);
        assert_eq!(parsed.bucket, "media");
        assert_eq!(parsed.chunk_count, 0);
        assert!(parsed.started_at.is_some());
    }

    #[test]
    fn empty_hash_means_no_stream() {
        assert!(StreamRecord::from_fields(&HashMap::new()).is_none());
    }

    #[test]
    fn chunk_entry_survives_the_log() {
        let entry = ChunkEntry {
            seq: 7,
            key: "recordings/2025/03/07/s1/chunks/chunk_00000007.webm".into(),
            size: 250_000,
            timestamp: Utc::now(),
        };
        let fields: HashMap<String, String> = entry.to_fields().into_iter().collect();
        let parsed = ChunkEntry::from_fields(&fields).unwrap();
        assert_eq!(parsed.seq, 7);
        assert_eq!(parsed.size, 250_000);
        assert_eq!(parsed.key, entry.key);
    }
}
