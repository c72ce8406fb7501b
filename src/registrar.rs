//! Publishes event-trigger subscriptions to sibling emulators.

use reqwest::Client;
use serde_json::{json, Value};
use tracing::info;

use crate::error::EmulatorError;

/// PUTs `{"eventTrigger": payload}` to the sibling's trigger endpoint.
/// Returns `Ok(true)` on the literal `{}` acknowledgement, `Ok(false)` for
/// any other body (ignored upstream: no success log, no retry), and an
/// error only for transport failures.
pub async fn register_event_trigger(
    client: &Client,
    host: &str,
    port: u16,
    project_id: &str,
    name: &str,
    payload: &Value,
) -> Result<bool, EmulatorError> {
    let url = format!("http://{host}:{port}/emulator/v1/projects/{project_id}/triggers/{name}");
    let response = client
        .put(&url)
        .json(&json!({ "eventTrigger": payload }))
        .send()
        .await?;
    let body = response.text().await?;
    if body.trim() == "{}" {
        info!(trigger = name, "registered event trigger with sibling emulator");
        Ok(true)
    } else {
        Ok(false)
    }
}
