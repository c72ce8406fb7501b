//! Per-invocation proxy.
//!
//! Binds one incoming request to one freshly spawned worker. Event triggers
//! are acknowledged after the worker exits; HTTP triggers get the request
//! replayed over the worker's unix socket and the reply streamed back.

use std::collections::HashMap;

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tracing::debug;

use crate::config::EmulatorConfig;
use crate::display;
use crate::error::EmulatorError;
use crate::metrics::InvocationCounters;
use crate::protocol::{LogLevel, TRIGGERS_PARSED};
use crate::runtime::{LogWaiter, Runtime, RuntimeBundle, WorkerOpts};
use crate::triggers::{TriggerDefinition, TriggerKind};

/// Handles one matched invocation route end to end. Exactly one worker is
/// spawned; the reply is produced exactly once.
pub async fn invoke(
    config: &EmulatorConfig,
    ports: HashMap<String, u16>,
    counters: &InvocationCounters,
    trigger_name: &str,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, EmulatorError> {
    // The body doubles as the event proto when the trigger turns out to be
    // an event trigger; HTTP triggers accept arbitrary bytes.
    let (proto, payload_err) = if body.is_empty() {
        (None, None)
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e)),
        }
    };

    let bundle = RuntimeBundle::new(config, ports, trigger_name, proto);
    let runtime = Runtime::spawn(config, &bundle, WorkerOpts::default())?;
    if let Some(events) = runtime.take_events() {
        tokio::spawn(display::forward_stream(events));
    }

    // Install waiters before awaiting ready: workers may emit either record
    // first during startup.
    let parsed_waiter = runtime.waiter(LogLevel::System, Some(TRIGGERS_PARSED));
    let fatal_waiter = runtime.waiter(LogLevel::Fatal, None);

    let socket_path = match runtime.ready().await {
        Ok(socket_path) => socket_path,
        Err(e) => {
            reap(runtime);
            return Err(e);
        }
    };
    let parsed = match parsed_waiter.recv().await {
        Ok(record) => record,
        Err(e) => {
            reap(runtime);
            return Err(e);
        }
    };

    let definition = parsed
        .data
        .get("triggers")
        .and_then(|triggers| triggers.get(trigger_name))
        .and_then(|entry| entry.get("definition"))
        .cloned();
    let Some(definition) = definition else {
        reap(runtime);
        return Err(EmulatorError::UnknownTrigger(trigger_name.to_string()));
    };
    let definition: TriggerDefinition = match serde_json::from_value(definition) {
        Ok(definition) => definition,
        Err(e) => {
            reap(runtime);
            return Err(EmulatorError::IpcTransport(format!(
                "malformed trigger definition: {e}"
            )));
        }
    };

    match definition.kind() {
        TriggerKind::Https => {
            counters.record("https");
            proxy_https(runtime, fatal_waiter, &socket_path, method, uri, headers, body).await
        }
        TriggerKind::Event => {
            let service = definition.service().unwrap_or("unknown").to_string();
            counters.record(&service);
            if let Some(e) = payload_err {
                reap(runtime);
                return Err(EmulatorError::BadPayload(e));
            }
            if !definition.is_supported() {
                reap(runtime);
                return Err(EmulatorError::UnsupportedTrigger {
                    name: trigger_name.to_string(),
                    service,
                });
            }
            // The worker's side-effect execution is opaque; a non-zero exit
            // is still acknowledged.
            let code = runtime.exited().await;
            debug!(code, trigger = trigger_name, "event worker exited");
            Ok((StatusCode::OK, Json(json!({ "status": "acknowledged" }))).into_response())
        }
    }
}

/// Replays the buffered request over the worker's unix socket and streams
/// the reply back. A FATAL record racing the worker's response wins and
/// surfaces as a 5xx carrying the FATAL text.
async fn proxy_https(
    runtime: Runtime,
    fatal_waiter: LogWaiter,
    socket_path: &str,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, EmulatorError> {
    let stream = match UnixStream::connect(socket_path).await {
        Ok(stream) => stream,
        Err(e) => {
            reap(runtime);
            return Err(EmulatorError::IpcTransport(e.to_string()));
        }
    };
    let io = TokioIo::new(stream);
    let (mut sender, connection) = match hyper::client::conn::http1::handshake(io).await {
        Ok(parts) => parts,
        Err(e) => {
            reap(runtime);
            return Err(EmulatorError::IpcTransport(e.to_string()));
        }
    };
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "worker connection closed");
        }
    });

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = hyper::Request::builder().method(method).uri(path_and_query);
    for (name, value) in headers.iter() {
        request = request.header(name, value);
    }
    if !headers.contains_key(HOST) {
        request = request.header(HOST, "localhost");
    }
    let request = match request.body(Full::new(body)) {
        Ok(request) => request,
        Err(e) => {
            reap(runtime);
            return Err(EmulatorError::IpcTransport(e.to_string()));
        }
    };

    let response = tokio::select! {
        result = sender.send_request(request) => match result {
            Ok(response) => response,
            Err(e) => {
                reap(runtime);
                return Err(EmulatorError::IpcTransport(e.to_string()));
            }
        },
        fatal = fatal_waiter.recv() => {
            let text = fatal.map(|record| record.text).unwrap_or_default();
            reap(runtime);
            return Ok((StatusCode::INTERNAL_SERVER_ERROR, text).into_response());
        }
    };

    // Status and headers are written exactly once, here; the body streams
    // through and ends when the worker side does, error or not.
    let (parts, incoming) = response.into_parts();
    let mut reply = hyper::Response::builder().status(parts.status);
    for (name, value) in parts.headers.iter() {
        reply = reply.header(name, value);
    }
    let reply = reply
        .body(Body::new(incoming))
        .map_err(|e| EmulatorError::IpcTransport(e.to_string()))?;

    reap(runtime);
    Ok(reply)
}

/// Holds the runtime until its natural exit; invocations never block on
/// this, and client disconnects never kill the worker.
fn reap(runtime: Runtime) {
    tokio::spawn(async move {
        let code = runtime.exited().await;
        debug!(code, "worker exited");
    });
}
