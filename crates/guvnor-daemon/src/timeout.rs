use std::{collections::HashMap, time::Duration};

/// Methods that may legitimately run for a long time and are never bounded.
const UNBOUNDED: [&str; 4] = ["send", "dumpHeap", "forceGc", "write"];

/// Decides which remote methods get a response deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    timeout: Duration,
}

impl TimeoutPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout_for(&self, method: &str) -> Option<Duration> {
        if UNBOUNDED.contains(&method) {
            None
        } else {
            Some(self.timeout)
        }
    }

    /// Builds the method table for a freshly connected remote.
    pub fn bind(&self, methods: &[String]) -> HashMap<String, Option<Duration>> {
        methods
            .iter()
            .map(|m| {
                let limit = self.timeout_for(m);
                match limit {
                    Some(after) => tracing::debug!(method = %m, ?after, "binding remote method"),
                    None => tracing::debug!(method = %m, "binding remote method without timeout"),
                }
                (m.clone(), limit)
            })
            .collect()
    }
}
