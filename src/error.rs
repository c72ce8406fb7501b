use axum::http::StatusCode;
use thiserror::Error;

/// Error kinds for the gateway core. Per-invocation errors terminate only
/// that invocation's worker and response; loader errors leave the previous
/// trigger table in place.
#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("worker exited before announcing its socket")]
    WorkerExitedBeforeReady,

    #[error("worker exited before emitting a matching log record")]
    NoMatchingLog,

    #[error("unknown trigger `{0}`")]
    UnknownTrigger(String),

    #[error("trigger `{name}` uses unsupported service `{service}`")]
    UnsupportedTrigger { name: String, service: String },

    #[error("request body is not valid JSON: {0}")]
    BadPayload(#[source] serde_json::Error),

    #[error("worker transport error: {0}")]
    IpcTransport(String),

    #[error("sibling registration failed: {0}")]
    SiblingRegistration(#[from] reqwest::Error),
}

impl EmulatorError {
    /// HTTP status an invocation handler replies with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            EmulatorError::BadPayload(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
