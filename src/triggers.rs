//! Trigger descriptors and the shared trigger table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event services the gateway can route to a sibling emulator.
pub const SUPPORTED_SERVICES: &[&str] = &["firestore"];

pub const DEFAULT_REGION: &str = "us-central1";

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

/// Immutable descriptor of one user-authored function, as reported by a
/// worker's `triggers-parsed` record. The `httpsTrigger`/`eventTrigger`
/// payloads are opaque except for `eventTrigger.service`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerDefinition {
    pub name: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_trigger: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_trigger: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Https,
    Event,
}

impl TriggerDefinition {
    pub fn kind(&self) -> TriggerKind {
        if self.https_trigger.is_some() {
            TriggerKind::Https
        } else {
            TriggerKind::Event
        }
    }

    /// Service identifier of an event trigger.
    pub fn service(&self) -> Option<&str> {
        self.event_trigger
            .as_ref()
            .and_then(|payload| payload.get("service"))
            .and_then(Value::as_str)
    }

    /// HTTP triggers are always invocable; event triggers only when their
    /// service is in the allow-list.
    pub fn is_supported(&self) -> bool {
        match self.kind() {
            TriggerKind::Https => true,
            TriggerKind::Event => self
                .service()
                .map_or(false, |service| SUPPORTED_SERVICES.contains(&service)),
        }
    }

    /// Public URL the gateway serves this function on.
    pub fn public_url(&self, host: &str, port: u16, project_id: &str) -> String {
        format!(
            "http://{}:{}/{}/{}/{}",
            host, port, project_id, self.region, self.name
        )
    }
}

/// Name → definition. Replaced wholesale by each successful reload; readers
/// snapshot the `Arc` and keep it for the duration of one invocation.
pub type TriggerTable = HashMap<String, TriggerDefinition>;

pub fn table_from_definitions(definitions: Vec<TriggerDefinition>) -> TriggerTable {
    definitions
        .into_iter()
        .map(|definition| (definition.name.clone(), definition))
        .collect()
}
