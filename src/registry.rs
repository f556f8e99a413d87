//! In-memory view of backend instance connection states.
//!
//! The registry answers "is this instance usable right now" in O(1). It
//! is fed by the watchdog health sweep and by the connection-update
//! ingestion endpoint; the durable list of known instances lives in the
//! `rp_instances` table (see `instances.rs`).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Connecting,
    Close,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Open => "open",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Option<ConnectionState> {
        match s {
            "open" => Some(ConnectionState::Open),
            "connecting" => Some(ConnectionState::Connecting),
            "close" => Some(ConnectionState::Close),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
pub struct InstanceRegistry {
    states: DashMap<String, ConnectionState>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of an instance. Unknown names report `close`.
    pub fn state(&self, name: &str) -> ConnectionState {
        self.states
            .get(name)
            .map(|s| *s.value())
            .unwrap_or(ConnectionState::Close)
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.state(name) == ConnectionState::Open
    }

    pub fn set_state(&self, name: &str, state: ConnectionState) {
        self.states.insert(name.to_string(), state);
    }

    pub fn remove(&self, name: &str) {
        self.states.remove(name);
    }

    /// Subset of `names` currently reporting `open`, in input order.
    pub fn open_subset(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|n| self.is_open(n))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_instance_reports_close() {
        let reg = InstanceRegistry::new();
        assert_eq!(reg.state("ghost"), ConnectionState::Close);
        assert!(!reg.is_open("ghost"));
    }

    #[test]
    fn set_state_and_open_subset() {
        let reg = InstanceRegistry::new();
        reg.set_state("a", ConnectionState::Open);
        reg.set_state("b", ConnectionState::Connecting);
        reg.set_state("c", ConnectionState::Open);

        let names: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        assert_eq!(reg.open_subset(&names), vec!["a", "c"]);
    }

    #[test]
    fn remove_clears_state() {
        let reg = InstanceRegistry::new();
        reg.set_state("a", ConnectionState::Open);
        reg.remove("a");
        assert_eq!(reg.state("a"), ConnectionState::Close);
    }
}
