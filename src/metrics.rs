use std::collections::HashMap;

use dashmap::DashMap;
use tracing::debug;

/// Invocation counts keyed by service tag (`https` for HTTP triggers, the
/// event service name otherwise).
#[derive(Debug, Default)]
pub struct InvocationCounters {
    counts: DashMap<String, u64>,
}

impl InvocationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, service: &str) {
        let mut entry = self.counts.entry(service.to_string()).or_insert(0);
        *entry += 1;
        debug!(service, count = *entry, "function invoked");
    }

    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
