//! End-to-end gateway scenarios with scripted fake workers.
//!
//! Workers are `/bin/sh` scripts that speak the line-delimited log protocol
//! on stdout. For HTTP triggers, the "worker side" of the announced unix
//! socket is served by the test itself.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tower::ServiceExt;

use fngate::config::EmulatorConfig;
use fngate::loader::TriggerLoader;
use fngate::metrics::InvocationCounters;
use fngate::registry::{EmulatorRegistry, StaticRegistry};
use fngate::server::{router, AppState};

fn app_for_script(dir: &TempDir, script: &str) -> axum::Router {
    let entry = dir.path().join("worker.sh");
    std::fs::write(&entry, script).unwrap();
    let config = Arc::new(EmulatorConfig {
        node_binary: "/bin/sh".into(),
        runtime_entry: entry,
        functions_dir: dir.path().to_path_buf(),
        project_id: "demo-proj".into(),
        ..Default::default()
    });
    let registry: Arc<dyn EmulatorRegistry> = Arc::new(StaticRegistry::new());
    router(AppState {
        loader: Arc::new(TriggerLoader::new(config.clone(), registry.clone())),
        config,
        registry,
        counters: Arc::new(InvocationCounters::new()),
    })
}

fn http_worker_script(socket_path: &Path) -> String {
    format!(
        concat!(
            "echo '{{\"level\":\"SYSTEM\",\"type\":\"triggers-parsed\",\"text\":\"\",",
            "\"data\":{{\"triggers\":{{\"echo\":{{\"definition\":{{\"name\":\"echo\",",
            "\"httpsTrigger\":{{}}}}}}}}}}}}'\n",
            "echo '{{\"level\":\"SYSTEM\",\"type\":\"runtime-status\",\"text\":\"ready\",",
            "\"data\":{{\"socketPath\":\"{socket}\"}}}}'\n",
            "exec sleep 2\n",
        ),
        socket = socket_path.display()
    )
}

const EVENT_WORKER_SCRIPT: &str = concat!(
    "echo '{\"level\":\"SYSTEM\",\"type\":\"triggers-parsed\",\"text\":\"\",",
    "\"data\":{\"triggers\":{\"onWrite\":{\"definition\":{\"name\":\"onWrite\",",
    "\"eventTrigger\":{\"service\":\"firestore\",\"resource\":\"r\"}}}}}}'\n",
    "echo '{\"level\":\"SYSTEM\",\"type\":\"runtime-status\",\"text\":\"ready\",",
    "\"data\":{\"socketPath\":\"/tmp/unused.sock\"}}'\n",
    "exit 0\n",
);

/// Serves an HTTP echo on the unix socket: replies 200 with the request
/// body and tags the response so header forwarding is observable.
fn start_echo_socket(path: &Path) {
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(|request: hyper::Request<Incoming>| async move {
                    let uri = request.uri().to_string();
                    let body = request.into_body().collect().await?.to_bytes();
                    Ok::<_, hyper::Error>(
                        hyper::Response::builder()
                            .status(200)
                            .header("x-worker", "echo")
                            .header("x-request-uri", uri)
                            .body(Full::new(body))
                            .unwrap(),
                    )
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
}

/// Accepts connections on the unix socket but never replies.
fn start_silent_socket(path: &Path) {
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// S1: HTTP echo round trip. Outbound bytes equal inbound bytes; worker
// headers appear exactly once.
#[tokio::test]
async fn http_echo_round_trip() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("w1.sock");
    start_echo_socket(&socket_path);
    let app = app_for_script(&dir, &http_worker_script(&socket_path));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/demo-proj/us-central1/echo")
                .method("POST")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get_all("x-worker")
            .iter()
            .collect::<Vec<_>>()
            .len(),
        1
    );
    assert_eq!(body_string(response).await, "hello");
}

// Query strings travel to the worker untouched.
#[tokio::test]
async fn http_request_uri_reaches_worker() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("w2.sock");
    start_echo_socket(&socket_path);
    let app = app_for_script(&dir, &http_worker_script(&socket_path));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/demo-proj/us-central1/echo/deep/path?greeting=hi")
                .method("GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let uri = response.headers().get("x-request-uri").unwrap();
    assert_eq!(
        uri.to_str().unwrap(),
        "/demo-proj/us-central1/echo/deep/path?greeting=hi"
    );
}

// The internal sibling-facing route binds to the same handler.
#[tokio::test]
async fn internal_route_reaches_the_same_worker() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("w3.sock");
    start_echo_socket(&socket_path);
    let app = app_for_script(&dir, &http_worker_script(&socket_path));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/functions/projects/demo-proj/triggers/echo")
                .method("POST")
                .body(Body::from("internal"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "internal");
}

// S2: event trigger invocations are acknowledged after worker exit.
#[tokio::test]
async fn event_trigger_acknowledged() {
    let dir = TempDir::new().unwrap();
    let app = app_for_script(&dir, EVENT_WORKER_SCRIPT);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/demo-proj/us-central1/onWrite")
                .method("POST")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"path":"/a"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, r#"{"status":"acknowledged"}"#);
}

// S4: a FATAL log kills the worker and its text lands in the reply body.
#[tokio::test]
async fn fatal_log_surfaces_in_response() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("w4.sock");
    start_silent_socket(&socket_path);

    let script = format!(
        concat!(
            "echo '{{\"level\":\"SYSTEM\",\"type\":\"triggers-parsed\",\"text\":\"\",",
            "\"data\":{{\"triggers\":{{\"echo\":{{\"definition\":{{\"name\":\"echo\",",
            "\"httpsTrigger\":{{}}}}}}}}}}}}'\n",
            "echo '{{\"level\":\"SYSTEM\",\"type\":\"runtime-status\",\"text\":\"ready\",",
            "\"data\":{{\"socketPath\":\"{socket}\"}}}}'\n",
            "echo '{{\"level\":\"FATAL\",\"type\":\"\",\"text\":\"boom\",\"data\":{{}}}}'\n",
            "exec sleep 5\n",
        ),
        socket = socket_path.display()
    );
    let app = app_for_script(&dir, &script);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/demo-proj/us-central1/echo")
                .method("POST")
                .body(Body::from("hello"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_string(response).await.contains("boom"));
}

// S6: a trigger the worker does not know yields a 5xx.
#[tokio::test]
async fn unknown_trigger_is_a_server_error() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("w5.sock");
    start_echo_socket(&socket_path);
    let app = app_for_script(&dir, &http_worker_script(&socket_path));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/demo-proj/us-central1/ghost")
                .method("POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_string(response).await.contains("ghost"));
}

// S3: invoking an event trigger on an unsupported service yields a 5xx.
#[tokio::test]
async fn unsupported_service_is_a_server_error() {
    let dir = TempDir::new().unwrap();
    let script = concat!(
        "echo '{\"level\":\"SYSTEM\",\"type\":\"triggers-parsed\",\"text\":\"\",",
        "\"data\":{\"triggers\":{\"onAuth\":{\"definition\":{\"name\":\"onAuth\",",
        "\"eventTrigger\":{\"service\":\"firebase.auth\"}}}}}}'\n",
        "echo '{\"level\":\"SYSTEM\",\"type\":\"runtime-status\",\"text\":\"ready\",",
        "\"data\":{\"socketPath\":\"/tmp/unused.sock\"}}'\n",
        "exit 0\n",
    );
    let app = app_for_script(&dir, script);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/demo-proj/us-central1/onAuth")
                .method("POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_string(response).await.contains("firebase.auth"));
}

// CORS preflight is answered for any origin.
#[tokio::test]
async fn cors_preflight_allows_any_origin() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("w6.sock");
    start_echo_socket(&socket_path);
    let app = app_for_script(&dir, &http_worker_script(&socket_path));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/demo-proj/us-central1/echo")
                .method("OPTIONS")
                .header("origin", "http://example.com")
                .header("access-control-request-method", "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
}
