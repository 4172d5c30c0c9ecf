//! Node state gate: a compare-and-swap guard around the node lifecycle state.
use std::fmt;
use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lifecycle state of this node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Stopped => "STOPPED",
            NodeState::Starting => "STARTING",
            NodeState::Started => "STARTED",
            NodeState::Stopping => "STOPPING",
        };
        f.write_str(s)
    }
}

/// Sole source of truth for "is a start or stop in progress".
///
/// Competing callers are refused immediately instead of being queued, so a
/// supervisor or health check can call `initialize_start` as often as it likes.
#[derive(Clone, Debug)]
pub struct StateGate {
    state: Arc<AtomicCell<NodeState>>,
}

impl StateGate {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicCell::new(NodeState::Stopped)),
        }
    }

    pub fn state(&self) -> NodeState {
        self.state.load()
    }

    /// STOPPED -> STARTING. Returns false and leaves the state untouched otherwise.
    pub fn initialize_start(&self) -> bool {
        self.transition(NodeState::Stopped, NodeState::Starting)
    }

    /// Only valid after a successful `initialize_start`.
    pub fn set_started(&self) {
        self.state.store(NodeState::Started);
        debug!("node state is now {}", NodeState::Started);
    }

    /// STARTED -> STOPPING. Returns false and leaves the state untouched otherwise.
    pub fn initialize_stop(&self) -> bool {
        self.transition(NodeState::Started, NodeState::Stopping)
    }

    /// Only valid after a successful `initialize_stop`.
    pub fn set_stopped(&self) {
        self.state.store(NodeState::Stopped);
        debug!("node state is now {}", NodeState::Stopped);
    }

    fn transition(&self, from: NodeState, to: NodeState) -> bool {
        match self.state.compare_exchange(from, to) {
            Ok(_) => {
                debug!("node state {} -> {}", from, to);
                true
            }
            Err(current) => {
                warn!("refusing {} -> {}: node is {}", from, to, current);
                false
            }
        }
    }
}

impl Default for StateGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let gate = StateGate::new();
        assert_eq!(gate.state(), NodeState::Stopped);

        assert!(gate.initialize_start());
        assert_eq!(gate.state(), NodeState::Starting);
        gate.set_started();
        assert_eq!(gate.state(), NodeState::Started);

        assert!(gate.initialize_stop());
        assert_eq!(gate.state(), NodeState::Stopping);
        gate.set_stopped();
        assert_eq!(gate.state(), NodeState::Stopped);
    }

    #[test]
    fn test_initialize_start_twice_yields_one_true() {
        let gate = StateGate::new();
        assert!(gate.initialize_start());
        assert!(!gate.initialize_start());
        assert_eq!(gate.state(), NodeState::Starting);
    }

    #[test]
    fn test_refusals_do_not_mutate() {
        let gate = StateGate::new();
        // stop while stopped
        assert!(!gate.initialize_stop());
        assert_eq!(gate.state(), NodeState::Stopped);

        assert!(gate.initialize_start());
        assert!(!gate.initialize_stop());
        assert_eq!(gate.state(), NodeState::Starting);

        gate.set_started();
        assert!(!gate.initialize_start());
        assert_eq!(gate.state(), NodeState::Started);

        assert!(gate.initialize_stop());
        assert!(!gate.initialize_start());
        assert!(!gate.initialize_stop());
        assert_eq!(gate.state(), NodeState::Stopping);
    }

    #[test]
    fn test_concurrent_starts_single_winner() {
        let gate = StateGate::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let g = gate.clone();
                std::thread::spawn(move || g.initialize_start())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_display_matches_serde() {
        assert_eq!(NodeState::Starting.to_string(), "STARTING");
        assert_eq!(serde_json::to_string(&NodeState::Stopping).unwrap(), "\"STOPPING\"");
    }
}
