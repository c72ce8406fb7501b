use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Static configuration for one gateway process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Host the gateway binds and advertises in public function URLs.
    pub host: String,
    /// Port the gateway binds. `0` binds an ephemeral port.
    pub port: u16,
    pub project_id: String,
    /// Directory holding the developer's functions source; workers run with
    /// this as their cwd and the reload watcher observes it.
    pub functions_dir: PathBuf,
    /// Binary used to launch workers.
    pub node_binary: String,
    /// Entry script handed to the worker binary.
    pub runtime_entry: PathBuf,
    #[serde(default)]
    pub disabled_features: Vec<String>,
}

impl EmulatorConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            project_id: "demo".to_string(),
            functions_dir: PathBuf::from("."),
            node_binary: "node".to_string(),
            runtime_entry: PathBuf::from("runtime.js"),
            disabled_features: Vec::new(),
        }
    }
}
