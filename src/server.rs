//! The gateway HTTP server and its lifecycle surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::header::{HeaderName, ACCEPT, AUTHORIZATION, CONTENT_TYPE, ORIGIN};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::EmulatorConfig;
use crate::loader::TriggerLoader;
use crate::metrics::InvocationCounters;
use crate::proxy;
use crate::registry::EmulatorRegistry;
use crate::triggers::TriggerDefinition;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EmulatorConfig>,
    pub loader: Arc<TriggerLoader>,
    pub registry: Arc<dyn EmulatorRegistry>,
    pub counters: Arc<InvocationCounters>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS, Method::POST])
        .allow_headers([
            ORIGIN,
            HeaderName::from_static("x-requested-with"),
            CONTENT_TYPE,
            AUTHORIZATION,
            ACCEPT,
        ]);

    Router::new()
        .route("/", get(list_triggers))
        .route(
            "/:project_id/:region/:trigger_name",
            get(dispatch).post(dispatch),
        )
        .route(
            "/:project_id/:region/:trigger_name/*rest",
            get(dispatch).post(dispatch),
        )
        .route(
            "/functions/projects/:project_id/triggers/:trigger_name",
            get(dispatch).post(dispatch),
        )
        .route(
            "/functions/projects/:project_id/triggers/:trigger_name/*rest",
            get(dispatch).post(dispatch),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Diagnostic enumeration of the current triggers; runs a fresh diagnostic
/// worker on every call.
async fn list_triggers(State(state): State<AppState>) -> Response {
    match state.loader.reload().await {
        Ok(table) => {
            let mut definitions: Vec<TriggerDefinition> = table.values().cloned().collect();
            definitions.sort_by(|a, b| a.name.cmp(&b.name));
            Json(definitions).into_response()
        }
        Err(e) => {
            warn!(error = %e, "trigger enumeration failed");
            (e.status_code(), e.to_string()).into_response()
        }
    }
}

/// Common handler behind the developer-visible and internal routes.
async fn dispatch(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(trigger_name) = params.get("trigger_name").cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match proxy::invoke(
        &state.config,
        state.registry.ports(),
        &state.counters,
        &trigger_name,
        method,
        &uri,
        &headers,
        body,
    )
    .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(trigger = %trigger_name, error = %e, "invocation failed");
            (e.status_code(), e.to_string()).into_response()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmulatorInfo {
    pub host: String,
    pub port: u16,
}

/// The emulator core behind the CLI: bind, load triggers, watch, stop.
pub struct FunctionsEmulator {
    config: Arc<EmulatorConfig>,
    loader: Arc<TriggerLoader>,
    registry: Arc<dyn EmulatorRegistry>,
    counters: Arc<InvocationCounters>,
    bound_addr: StdMutex<Option<SocketAddr>>,
    shutdown: StdMutex<Option<oneshot::Sender<()>>>,
    watch_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl FunctionsEmulator {
    pub fn new(config: EmulatorConfig, registry: Arc<dyn EmulatorRegistry>) -> Self {
        let config = Arc::new(config);
        let loader = Arc::new(TriggerLoader::new(config.clone(), registry.clone()));
        Self {
            config,
            loader,
            registry,
            counters: Arc::new(InvocationCounters::new()),
            bound_addr: StdMutex::new(None),
            shutdown: StdMutex::new(None),
            watch_handle: StdMutex::new(None),
        }
    }

    fn app_state(&self) -> AppState {
        AppState {
            config: self.config.clone(),
            loader: self.loader.clone(),
            registry: self.registry.clone(),
            counters: self.counters.clone(),
        }
    }

    /// Binds the gateway and serves it on a background task.
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "functions gateway listening");
        *self.bound_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);

        let app = router(self.app_state());
        let (tx, rx) = oneshot::channel();
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "gateway server failed");
            }
        });
        Ok(())
    }

    /// Runs the first trigger load immediately, then installs the debounced
    /// reload watcher. A failing first load is logged and tolerated; the
    /// watcher will retry on the next change.
    pub async fn connect(&self) -> anyhow::Result<()> {
        if let Err(e) = self.loader.reload().await {
            warn!(error = %e, "initial trigger load failed");
        }
        let handle = self.loader.watch()?;
        *self.watch_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Fire-and-forget: signals the server to close and drops the watcher.
    /// In-flight invocations finish on the serve task.
    pub fn stop(&self) {
        if let Some(tx) = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
        if let Some(handle) = self
            .watch_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    pub fn info(&self) -> EmulatorInfo {
        let port = self
            .bound_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|addr| addr.port())
            .unwrap_or(self.config.port);
        EmulatorInfo {
            host: self.config.host.clone(),
            port,
        }
    }

    pub async fn triggers(&self) -> Vec<TriggerDefinition> {
        self.loader.snapshot().await.values().cloned().collect()
    }

    pub fn invocation_counts(&self) -> HashMap<String, u64> {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::registry::StaticRegistry;

    fn state_for_script(dir: &TempDir, script: &str) -> AppState {
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
        AppState {
            loader: Arc::new(TriggerLoader::new(config.clone(), registry.clone())),
            config,
            registry,
            counters: Arc::new(InvocationCounters::new()),
        }
    }

    const DIAGNOSTIC_SCRIPT: &str = concat!(
        "echo '{\"level\":\"SYSTEM\",\"type\":\"triggers-parsed\",\"text\":\"\",",
        "\"data\":{\"triggerDefinitions\":[{\"name\":\"echo\",\"httpsTrigger\":{}}]}}'\n",
        "exit 0\n",
    );

    #[tokio::test]
    async fn root_route_enumerates_triggers() {
        let dir = TempDir::new().unwrap();
        let app = router(state_for_script(&dir, DIAGNOSTIC_SCRIPT));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let listed: Vec<TriggerDefinition> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "echo");
    }

    #[tokio::test]
    async fn unmatched_route_is_not_found() {
        let dir = TempDir::new().unwrap();
        let app = router(state_for_script(&dir, DIAGNOSTIC_SCRIPT));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/only/two")
                    .method("POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lifecycle_start_info_stop() {
        let dir = TempDir::new().unwrap();
        let entry = dir.path().join("worker.sh");
        std::fs::write(&entry, DIAGNOSTIC_SCRIPT).unwrap();
        let config = EmulatorConfig {
            node_binary: "/bin/sh".into(),
            runtime_entry: entry,
            functions_dir: dir.path().to_path_buf(),
            project_id: "demo-proj".into(),
            port: 0,
            ..Default::default()
        };
        let emulator = FunctionsEmulator::new(config, Arc::new(StaticRegistry::new()));

        emulator.start().await.unwrap();
        let info = emulator.info();
        assert_eq!(info.host, "127.0.0.1");
        assert_ne!(info.port, 0);

        emulator.connect().await.unwrap();
        let triggers = emulator.triggers().await;
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].name, "echo");

        emulator.stop();
        // stop() is idempotent.
        emulator.stop();
    }
}
