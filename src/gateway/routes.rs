//! HTTP surface: the websocket upgrade plus the REST fallback used by
//! clients that cannot hold a bidirectional connection open.

use super::{GatewayState, session};
use crate::broker::Broker as _;
use crate::events::{ControlEvent, StreamStatus};
use crate::keys;
use crate::middleware::log_request_errors;
use crate::protocol::{StopStats, StreamAttributes};
use crate::recording::RecordingPatch;
use crate::stream::{self, StreamRecord};
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

const MEDIA_URL_EXPIRY: Duration = Duration::from_secs(3600);

pub fn router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/stream", get(upgrade))
        .route("/api/streams/{stream_id}", get(stream_status))
        .route("/api/streams/{stream_id}/stop", post(stop_stream))
        .route("/api/streams/{stream_id}/media/{name}", get(media_url))
        .route("/healthz", get(healthz))
        .layer(axum::middleware::from_fn(log_request_errors))
        .layer(cors)
        .layer(Extension(state))
}

async fn upgrade(ws: WebSocketUpgrade, Extension(state): Extension<GatewayState>) -> Response {
    ws.on_upgrade(move |socket| session::serve(socket, state))
}

async fn healthz() -> &'static str {
    "ok"
}

/// `{status, code, title, detail}` error envelope shared by every endpoint.
#[derive(Serialize)]
struct ErrorBody {
    status: u16,
    code: &'static str,
    title: &'static str,
    detail: String,
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    title: &'static str,
    detail: impl Into<String>,
) -> Response {
    (
        status,
        Json(ErrorBody {
            status: status.as_u16(),
            code,
            title,
            detail: detail.into(),
        }),
    )
        .into_response()
}

fn stream_not_found(stream_id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "stream_not_found",
        "Stream not found",
        format!("no stream state for {stream_id}"),
    )
}

async fn load_record(state: &GatewayState, stream_id: &str) -> Result<StreamRecord, Response> {
    let fields = state
        .broker
        .hash_get_all(&stream::state_key(stream_id))
        .await
        .map_err(|err| {
            error_response(
                StatusCode::BAD_GATEWAY,
                "broker_error",
                "Broker unavailable",
                err.to_string(),
            )
        })?;
    match StreamRecord::from_fields(&fields) {
        None => Err(stream_not_found(stream_id)),
        Some(Err(err)) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "state_corrupt",
            "Stream state unreadable",
            err.to_string(),
        )),
        Some(Ok(record)) => Ok(record),
    }
}

fn stream_resource(stream_id: &str, record: &StreamRecord) -> Json<serde_json::Value> {
    Json(json!({
        "data": {
            "type": "stream",
            "id": stream_id,
            "attributes": StreamAttributes {
                status: record.status,
                chunk_count: record.chunk_count,
                bucket: record.bucket.clone(),
                prefix: record.prefix.clone(),
                started_at: record.started_at,
            },
        }
    }))
}

async fn stream_status(
    Extension(state): Extension<GatewayState>,
    Path(stream_id): Path<String>,
) -> Response {
    match load_record(&state, &stream_id).await {
        Ok(record) => stream_resource(&stream_id, &record).into_response(),
        Err(response) => response,
    }
}

/// Stop fallback. Works from broker state alone so it can land on any
/// gateway, not just the one holding the recorder's socket. A repeat call
/// reports the current status without publishing a second `StreamStop`.
async fn stop_stream(
    Extension(state): Extension<GatewayState>,
    Path(stream_id): Path<String>,
) -> Response {
    let mut record = match load_record(&state, &stream_id).await {
        Ok(record) => record,
        Err(response) => return response,
    };

    if record.status == StreamStatus::Live {
        let ending = vec![(
            StreamRecord::F_STATUS.to_string(),
            StreamStatus::Ending.to_string(),
        )];
        if let Err(err) = state
            .broker
            .hash_set(&stream::state_key(&stream_id), ending)
            .await
        {
            return error_response(
                StatusCode::BAD_GATEWAY,
                "broker_error",
                "Broker unavailable",
                err.to_string(),
            );
        }
        if let Err(err) = state
            .broker
            .log_append(
                stream::CONTROL_LOG,
                session::control_fields(&ControlEvent::StreamStop {
                    stream_id: stream_id.clone(),
                    stats: StopStats::default(),
                }),
            )
            .await
        {
            return error_response(
                StatusCode::BAD_GATEWAY,
                "broker_error",
                "Broker unavailable",
                err.to_string(),
            );
        }

        // Mirror the websocket path so a recorder attached to this gateway
        // stops accepting chunks immediately.
        if let Some(live) = state
            .streams
            .lock()
            .expect("streams lock")
            .get_mut(&stream_id)
        {
            live.status = StreamStatus::Ending;
        }

        let patch = RecordingPatch {
            stream_ended_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(err) = state.recordings.update(&stream_id, patch).await {
            warn!(%stream_id, %err, "recording record update failed on stop");
        }

        info!(%stream_id, "stream stopped via rest fallback");
        record.status = StreamStatus::Ending;
    }

    stream_resource(&stream_id, &record).into_response()
}

/// Issues a presigned playback URL for one segment or the manifest.
async fn media_url(
    Extension(state): Extension<GatewayState>,
    Path((stream_id, name)): Path<(String, String)>,
) -> Response {
    if !keys::is_safe_media_name(&name) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_media_name",
            "Invalid media name",
            format!("{name:?} is not a servable media name"),
        );
    }

    let record = match load_record(&state, &stream_id).await {
        Ok(record) => record,
        Err(response) => return response,
    };

    let key = keys::hls_key(&record.prefix, &stream_id, &name);
    match state.store.presign_read(&key, MEDIA_URL_EXPIRY).await {
        Ok(url) => Json(json!({
            "data": {
                "type": "mediaUrl",
                "id": name,
                "attributes": {
                    "url": url,
                    "expiresInSecs": MEDIA_URL_EXPIRY.as_secs(),
                },
            }
        }))
        .into_response(),
        Err(err) => error_response(
            StatusCode::BAD_GATEWAY,
            "presign_failed",
            "Could not sign URL",
            err.to_string(),
        ),
    }
}
