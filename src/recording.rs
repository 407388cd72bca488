//! Interface to the externally-owned recording record.
//!
//! Several producers (the gateway on lifecycle transitions, the progress
//! handler on transcoder events) converge on the same record, so every
//! update is a narrow field patch, never a full-record overwrite.

use crate::error::PipelineError;
use crate::protocol::PauseEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

pub type RecordingHandle = Arc<dyn RecordingStore>;

/// Fields the pipeline may touch. `None` means "leave unchanged".
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_live_streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_duration_total: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_events: Option<Vec<PauseEvent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_format: Option<String>,
}

#[async_trait]
pub trait RecordingStore: Send + Sync {
    async fn update(&self, recording_id: &str, patch: RecordingPatch)
    -> Result<(), PipelineError>;
}

/// Patches records over the collaborating application's HTTP API.
pub struct HttpRecordingStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRecordingStore {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl RecordingStore for HttpRecordingStore {
    async fn update(
        &self,
        recording_id: &str,
        patch: RecordingPatch,
    ) -> Result<(), PipelineError> {
        let url = format!("{}/recordings/{recording_id}", self.base_url);
        let response = self
            .client
            .patch(&url)
            .json(&patch)
            .send()
            .await
            .map_err(|err| PipelineError::Transport(format!("recording update: {err}")))?;

        if !response.status().is_success() {
            warn!(
                %recording_id,
                status = %response.status(),
                "recording record update rejected"
            );
        }
        Ok(())
    }
}

/// Swallows updates. Used when no recording API is configured (tests,
/// standalone deployments).
#[derive(Default)]
pub struct NullRecordingStore;

#[async_trait]
impl RecordingStore for NullRecordingStore {
    async fn update(
        &self,
        recording_id: &str,
        patch: RecordingPatch,
    ) -> Result<(), PipelineError> {
        debug!(%recording_id, ?patch, "recording update dropped (no store configured)");
        Ok(())
    }
}
