//! Trigger discovery.
//!
//! A loader cycle spawns one diagnostic worker (empty trigger id), waits for
//! its `triggers-parsed` record, and replaces the shared trigger table
//! wholesale. Newly seen triggers are registered with sibling emulators
//! exactly once per process lifetime. A filesystem watcher on the functions
//! directory schedules reloads behind a one second trailing-edge debounce.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EmulatorConfig;
use crate::display;
use crate::error::EmulatorError;
use crate::protocol::{LogLevel, TRIGGERS_PARSED};
use crate::registrar;
use crate::registry::EmulatorRegistry;
use crate::runtime::{Runtime, RuntimeBundle, WorkerOpts};
use crate::triggers::{table_from_definitions, TriggerDefinition, TriggerKind, TriggerTable};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

pub struct TriggerLoader {
    config: Arc<EmulatorConfig>,
    registry: Arc<dyn EmulatorRegistry>,
    table: RwLock<Arc<TriggerTable>>,
    /// Names already registered with siblings; monotonic.
    known: Mutex<HashSet<String>>,
    /// Serializes diagnostic runs from paths the debouncer does not cover.
    reload_gate: Mutex<()>,
    http: reqwest::Client,
}

impl TriggerLoader {
    pub fn new(config: Arc<EmulatorConfig>, registry: Arc<dyn EmulatorRegistry>) -> Self {
        Self {
            config,
            registry,
            table: RwLock::new(Arc::new(TriggerTable::new())),
            known: Mutex::new(HashSet::new()),
            reload_gate: Mutex::new(()),
            http: reqwest::Client::new(),
        }
    }

    /// Current table snapshot; valid for the duration of one invocation.
    pub async fn snapshot(&self) -> Arc<TriggerTable> {
        self.table.read().await.clone()
    }

    /// Runs one diagnostic worker and publishes the table it reports. On
    /// error the previous table stays in place.
    pub async fn reload(&self) -> Result<Arc<TriggerTable>, EmulatorError> {
        let _gate = self.reload_gate.lock().await;

        let bundle = RuntimeBundle::diagnostic(&self.config, self.registry.ports());
        let runtime = Runtime::spawn(&self.config, &bundle, WorkerOpts::default())?;
        let waiter = runtime.waiter(LogLevel::System, Some(TRIGGERS_PARSED));
        if let Some(events) = runtime.take_events() {
            tokio::spawn(display::forward_stream(events));
        }

        let record = waiter.recv().await?;
        let definitions = record
            .data
            .get("triggerDefinitions")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        let definitions: Vec<TriggerDefinition> = serde_json::from_value(definitions)
            .map_err(|e| EmulatorError::IpcTransport(format!("bad triggers-parsed payload: {e}")))?;

        let table = Arc::new(table_from_definitions(definitions));
        *self.table.write().await = table.clone();
        debug!(triggers = table.len(), "trigger table replaced");

        self.register_new(&table).await;

        tokio::spawn(async move {
            let code = runtime.exited().await;
            debug!(code, "diagnostic worker exited");
        });

        Ok(table)
    }

    /// Registers table entries not yet in the known set. Registration
    /// failures are logged and skipped; the name still enters the known set
    /// so siblings are never re-registered on later reloads.
    async fn register_new(&self, table: &TriggerTable) {
        let mut known = self.known.lock().await;
        for (name, definition) in table.iter() {
            if known.contains(name) {
                continue;
            }
            match definition.kind() {
                TriggerKind::Https => {
                    info!(
                        trigger = %name,
                        url = %definition.public_url(
                            &self.config.host,
                            self.config.port,
                            &self.config.project_id,
                        ),
                        "HTTP function ready"
                    );
                }
                TriggerKind::Event => self.register_event(name, definition).await,
            }
            known.insert(name.clone());
        }
    }

    async fn register_event(&self, name: &str, definition: &TriggerDefinition) {
        let service = match definition.service() {
            Some(service) if definition.is_supported() => service,
            other => {
                warn!(
                    trigger = %name,
                    service = other.unwrap_or("unknown"),
                    "function uses a service that is not yet supported"
                );
                return;
            }
        };
        let Some(payload) = definition.event_trigger.as_ref() else {
            warn!(trigger = %name, "event trigger has no payload; skipping registration");
            return;
        };
        let Some((host, port)) = self.registry.lookup(service) else {
            warn!(
                trigger = %name,
                service,
                "sibling emulator is not running; trigger will not fire"
            );
            return;
        };
        match registrar::register_event_trigger(
            &self.http,
            &host,
            port,
            &self.config.project_id,
            name,
            payload,
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => debug!(trigger = %name, "sibling emulator returned a non-ack body"),
            Err(e) => warn!(trigger = %name, error = %e, "failed to register trigger with sibling"),
        }
    }

    /// Installs the filesystem watcher and returns the reload task. The
    /// first load is the caller's job (`connect()` runs it immediately);
    /// everything after goes through the debounce window.
    pub fn watch(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    if event.paths.iter().any(|path| is_watch_relevant(path)) {
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!(error = %e, "functions directory watcher error"),
            }
        })?;
        watcher.watch(&self.config.functions_dir, RecursiveMode::Recursive)?;
        info!(dir = %self.config.functions_dir.display(), "watching functions directory");

        let loader = Arc::clone(self);
        Ok(tokio::spawn(async move {
            // The watcher thread lives exactly as long as this task.
            let _watcher = watcher;
            debounce(rx, DEBOUNCE_WINDOW, || {
                let loader = Arc::clone(&loader);
                async move {
                    if let Err(e) = loader.reload().await {
                        warn!(error = %e, "trigger reload failed; keeping previous table");
                    }
                }
            })
            .await;
        }))
    }
}

/// Trailing-edge debounce: the first event opens a window, further events
/// extend it, and `action` runs once per burst after the window goes idle.
pub(crate) async fn debounce<F, Fut>(mut rx: mpsc::UnboundedReceiver<()>, window: Duration, action: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    while rx.recv().await.is_some() {
        loop {
            match tokio::time::timeout(window, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    action().await;
                    return;
                }
                Err(_) => break,
            }
        }
        action().await;
    }
}

/// Reload filter: ignore `node_modules` subtrees, dot-prefixed path
/// components, and `*.log` files.
fn is_watch_relevant(path: &Path) -> bool {
    for component in path.components() {
        if let Component::Normal(part) = component {
            let part = part.to_string_lossy();
            if part == "node_modules" || part.starts_with('.') {
                return false;
            }
        }
    }
    !path
        .extension()
        .map_or(false, |extension| extension == "log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    use crate::registry::StaticRegistry;

    fn loader_for_script(dir: &TempDir, script: &str, registry: StaticRegistry) -> Arc<TriggerLoader> {
        let entry = dir.path().join("diagnostic.sh");
        std::fs::write(&entry, script).unwrap();
        let config = EmulatorConfig {
            node_binary: "/bin/sh".into(),
            runtime_entry: entry,
            functions_dir: dir.path().to_path_buf(),
            project_id: "demo-proj".into(),
            ..Default::default()
        };
        Arc::new(TriggerLoader::new(Arc::new(config), Arc::new(registry)))
    }

    fn parsed_line(definitions: &str) -> String {
        format!(
            "echo '{{\"level\":\"SYSTEM\",\"type\":\"triggers-parsed\",\"text\":\"\",\"data\":{{\"triggerDefinitions\":{definitions}}}}}'\nexit 0\n"
        )
    }

    #[tokio::test]
    async fn reload_replaces_the_table() {
        let dir = TempDir::new().unwrap();
        let script = parsed_line(r#"[{"name":"echo","httpsTrigger":{}}]"#);
        let loader = loader_for_script(&dir, &script, StaticRegistry::new());

        let table = loader.reload().await.unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.contains_key("echo"));
        assert!(loader.snapshot().await.contains_key("echo"));
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_table() {
        let dir = TempDir::new().unwrap();
        let script = parsed_line(r#"[{"name":"echo","httpsTrigger":{}}]"#);
        let loader = loader_for_script(&dir, &script, StaticRegistry::new());
        loader.reload().await.unwrap();

        // Replace the diagnostic with one that dies before reporting.
        std::fs::write(dir.path().join("diagnostic.sh"), "exit 1\n").unwrap();
        let err = loader.reload().await.unwrap_err();
        assert!(matches!(err, EmulatorError::NoMatchingLog));
        assert!(loader.snapshot().await.contains_key("echo"));
    }

    #[tokio::test]
    async fn firestore_trigger_registers_with_sibling_exactly_once() {
        use axum::routing::put;
        use axum::Router;

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_route = hits.clone();
        let app = Router::new().route(
            "/emulator/v1/projects/:project/triggers/:name",
            put(move || {
                let hits = hits_in_route.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "{}"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let registry = StaticRegistry::new();
        registry.insert("firestore", "127.0.0.1", port);

        let dir = TempDir::new().unwrap();
        let script = parsed_line(
            r#"[{"name":"onWrite","eventTrigger":{"service":"firestore","resource":"r"}}]"#,
        );
        let loader = loader_for_script(&dir, &script, registry);

        loader.reload().await.unwrap();
        loader.reload().await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsupported_service_does_not_fail_the_reload() {
        let dir = TempDir::new().unwrap();
        let script = parsed_line(r#"[{"name":"onAuth","eventTrigger":{"service":"firebase.auth"}}]"#);
        let loader = loader_for_script(&dir, &script, StaticRegistry::new());

        let table = loader.reload().await.unwrap();
        assert!(table.contains_key("onAuth"));
        assert!(!table["onAuth"].is_supported());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_events_triggers_exactly_one_action() {
        let (tx, rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = tokio::spawn(debounce(rx, DEBOUNCE_WINDOW, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        for _ in 0..10 {
            tx.send(()).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A later burst schedules one more.
        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        drop(tx);
        task.await.unwrap();
    }

    #[test]
    fn watch_filter_rules() {
        assert!(is_watch_relevant(&PathBuf::from("functions/index.js")));
        assert!(is_watch_relevant(&PathBuf::from("functions/lib/util.js")));
        assert!(!is_watch_relevant(&PathBuf::from(
            "functions/node_modules/dep/index.js"
        )));
        assert!(!is_watch_relevant(&PathBuf::from("functions/.git/HEAD")));
        assert!(!is_watch_relevant(&PathBuf::from("functions/.env")));
        assert!(!is_watch_relevant(&PathBuf::from("functions/debug.log")));
    }
}
