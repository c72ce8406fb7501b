//! Routes worker log records into the gateway's own tracing output.

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::protocol::{LogLevel, LogRecord, RUNTIME_PARSE_ERROR, RUNTIME_STATUS};

/// Drains a runtime's event stream into [`forward`] until the stream closes.
pub async fn forward_stream(mut events: broadcast::Receiver<LogRecord>) {
    loop {
        match events.recv().await {
            Ok(record) => forward(&record),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "worker log stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

pub fn forward(record: &LogRecord) {
    match record.level {
        LogLevel::System => forward_system(record),
        LogLevel::Debug => debug!(target: "worker", "{}", record.text),
        LogLevel::User | LogLevel::Info => info!(target: "worker", "{}", record.text),
        LogLevel::Warn => warn!(target: "worker", "{}", record.text),
        LogLevel::Fatal => error!(target: "worker", "{}", record.text),
    }
}

/// The SYSTEM vocabulary. Unknown types are dropped without comment.
fn forward_system(record: &LogRecord) {
    match record.kind.as_str() {
        RUNTIME_STATUS => debug!(status = %record.text, "worker status"),
        RUNTIME_PARSE_ERROR => warn!(
            line = record.data_str("line").unwrap_or(""),
            "worker emitted an unparseable log line"
        ),
        "googleapis-network-access" => warn!(
            href = record.data_str("href").unwrap_or(""),
            "worker attempted to reach a production Google API"
        ),
        "unidentified-network-access" => warn!(
            href = record.data_str("href").unwrap_or(""),
            "worker attempted to reach an unknown external host"
        ),
        "functions-config-missing-value" => warn!(
            value_path = record.data_str("valuePath").unwrap_or(""),
            "worker read a missing functions config value"
        ),
        "default-admin-app-used" => {
            warn!("worker initialized the default admin app");
        }
        "non-default-admin-app-used" => {
            warn!("worker initialized a non-default admin app; it will bypass emulator mocks");
        }
        "missing-module" => warn!(
            module = record.data_str("name").unwrap_or(""),
            is_dev = record
                .data
                .get("isDev")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
            "worker requires a module that is not declared"
        ),
        "uninstalled-module" => warn!(
            module = record.data_str("name").unwrap_or(""),
            "declared module is not installed on disk"
        ),
        "out-of-date-module" => warn!(
            module = record.data_str("name").unwrap_or(""),
            min_version = record.data_str("minVersion").unwrap_or(""),
            "module is older than the minimum supported version"
        ),
        "missing-package-json" => {
            warn!("no package manifest found in the functions directory");
        }
        "admin-not-initialized" => {
            warn!("worker initialized the admin SDK too late to be instrumented");
        }
        _ => {}
    }
}
