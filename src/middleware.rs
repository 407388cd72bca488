use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{error, warn};

/// Logs failed requests with their latency. Successful responses stay
/// quiet; websocket upgrades are skipped entirely since their duration is
/// the connection lifetime, not a request latency.
pub async fn log_request_errors(req: Request<Body>, next: Next) -> Response {
    let is_upgrade = req.headers().contains_key(axum::http::header::UPGRADE);
    let uri = req.uri().clone();
    let method = req.method().clone();
    let started = Instant::now();

    let response = next.run(req).await;
    if is_upgrade {
        return response;
    }

    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis();
    if status.is_client_error() {
        warn!(
            method = %method,
            uri = %uri,
            status = %status,
            elapsed_ms,
            "client error"
        );
    } else if status.is_server_error() {
        error!(
            method = %method,
            uri = %uri,
            status = %status,
            elapsed_ms,
            "server error"
        );
    }

    response
}
