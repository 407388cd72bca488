use futures::{SinkExt, StreamExt};
use livecast::Config;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Test harness that runs a gateway-only process over the in-memory
/// broker and a tempdir-backed object store.
struct TestServer {
    _handle: JoinHandle<()>,
    port: u16,
    workspace: tempfile::TempDir,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let port = portpicker::pick_unused_port().expect("No available port");
        let workspace = tempfile::tempdir().expect("workspace dir");

        let config = Config {
            role: "gateway".into(),
            listen_on_port: port,
            broker_url: "memory".into(),
            storage_backend: "local".into(),
            workspace: workspace.path().to_string_lossy().into_owned(),
            ..Default::default()
        };

        let handle = tokio::spawn(async move {
            if let Err(err) = livecast::run(config).await {
                eprintln!("server exited: {err}");
            }
        });

        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();

        // Poll until the gateway is ready
        for _ in 0..50 {
            if let Ok(response) = client
                .get(format!("http://127.0.0.1:{port}/healthz"))
                .send()
                .await
            {
                if response.status().is_success() {
                    break;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }

        TestServer {
            _handle: handle,
            port,
            workspace,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    async fn connect_ws(&self) -> WsClient {
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws/stream", self.port))
            .await
            .expect("websocket connect");
        ws
    }

    async fn stream_attributes(&self, stream_id: &str) -> (reqwest::StatusCode, Value) {
        let response = self
            .client
            .get(self.url(&format!("/api/streams/{stream_id}")))
            .send()
            .await
            .unwrap();
        let status = response.status();
        let body: Value = response.json().await.unwrap();
        (status, body)
    }
}

async fn send_json(ws: &mut WsClient, json: &str) {
    ws.send(Message::Text(json.to_string())).await.unwrap();
}

async fn recv_json(ws: &mut WsClient) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame within deadline")
            .expect("socket open")
            .expect("frame readable")
        {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn health_endpoint_responds() {
    let server = TestServer::start().await;
    let response = server.client.get(server.url("/healthz")).send().await.unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn unknown_stream_returns_an_error_envelope() {
    let server = TestServer::start().await;
    let (status, body) = server.stream_attributes("nope").await;
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
    assert_eq!(body["code"], "stream_not_found");
    assert!(body["title"].is_string());
    assert!(body["detail"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn recorder_lifecycle_start_chunks_stop() {
    let server = TestServer::start().await;
    let mut ws = server.connect_ws().await;

    send_json(&mut ws, r#"{"type":"start","recordingId":"s1"}"#).await;
    let started = recv_json(&mut ws).await;
    assert_eq!(started["type"], "started");
    assert_eq!(started["recordingId"], "s1");
    assert_eq!(started["status"], "Live");

    // Ping/pong stays available mid-stream.
    send_json(&mut ws, r#"{"type":"ping"}"#).await;
    let pong = recv_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_i64());

    for chunk in 0..3u8 {
        ws.send(Message::Binary(vec![chunk; 64])).await.unwrap();
    }
    // Chunk persistence is acked implicitly via the counter.
    let mut chunk_count = 0;
    for _ in 0..50 {
        let (_, body) = server.stream_attributes("s1").await;
        chunk_count = body["data"]["attributes"]["chunkCount"].as_u64().unwrap_or(0);
        if chunk_count == 3 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(chunk_count, 3);

    // Chunk objects land under the date-scoped key layout.
    let mut found = Vec::new();
    for entry in walkdir(server.workspace.path()) {
        if entry.ends_with(".webm") {
            found.push(entry);
        }
    }
    found.sort();
    assert_eq!(found.len(), 3);
    assert!(found[0].ends_with("chunks/chunk_00000000.webm"));
    assert!(found[2].ends_with("chunks/chunk_00000002.webm"));

    send_json(
        &mut ws,
        r#"{"type":"stop","duration":12,"pauseCount":0,"pauseDurationTotal":0,"pauseEvents":[]}"#,
    )
    .await;
    let stopped = recv_json(&mut ws).await;
    assert_eq!(stopped["type"], "stopped");
    assert_eq!(stopped["status"], "Ending");

    let (_, body) = server.stream_attributes("s1").await;
    assert_eq!(body["data"]["type"], "stream");
    assert_eq!(body["data"]["id"], "s1");
    assert_eq!(body["data"]["attributes"]["status"], "Ending");

    // A second stop acks identically instead of erroring.
    send_json(&mut ws, r#"{"type":"stop"}"#).await;
    let stopped_again = recv_json(&mut ws).await;
    assert_eq!(stopped_again["type"], "stopped");
    assert_eq!(stopped_again["status"], "Ending");
}

#[tokio::test]
async fn binary_before_start_is_a_protocol_error() {
    let server = TestServer::start().await;
    let mut ws = server.connect_ws().await;

    ws.send(Message::Binary(vec![0u8; 16])).await.unwrap();
    let error = recv_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert!(error["detail"].as_str().unwrap().contains("before start"));

    // The gateway closes the connection after the error frame.
    let next = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("close within deadline");
    match next {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_control_type_is_rejected() {
    let server = TestServer::start().await;
    let mut ws = server.connect_ws().await;

    send_json(&mut ws, r#"{"type":"rewind","to":3}"#).await;
    let error = recv_json(&mut ws).await;
    assert_eq!(error["type"], "error");
}

#[tokio::test]
async fn rest_stop_fallback_is_idempotent() {
    let server = TestServer::start().await;
    let mut ws = server.connect_ws().await;

    send_json(&mut ws, r#"{"type":"start","recordingId":"s2"}"#).await;
    let started = recv_json(&mut ws).await;
    assert_eq!(started["type"], "started");

    let response = server
        .client
        .post(server.url("/api/streams/s2/stop"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["attributes"]["status"], "Ending");

    // Stopping again reports the same status without a second transition.
    let response = server
        .client
        .post(server.url("/api/streams/s2/stop"))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["attributes"]["status"], "Ending");
}

#[tokio::test]
async fn media_urls_reject_unsafe_names() {
    let server = TestServer::start().await;
    let response = server
        .client
        .get(server.url("/api/streams/s1/media/..%2F..%2Fetc%2Fpasswd"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "invalid_media_name");
}

fn walkdir(root: &std::path::Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                files.push(path.to_string_lossy().into_owned());
            }
        }
    }
    files
}
