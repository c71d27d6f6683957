//! Cluster membership state (§4.4, §4.7).
//!
//! `NodeState` here is the same four-state lifecycle the source tracks for
//! multi-region Raft coordination (`Standalone → Forming → Follower/Leader`)
//! applied to OpenState nodes instead. The HTTP health surface that used to
//! live in this module now lives in `http.rs` alongside the rest of the
//! external interface (§10.4 consolidates all externally-visible endpoints
//! in one place), so this module is left holding only the shared state
//! handle other components (`raft.rs`, `leader.rs`, `gossip.rs`, `http.rs`)
//! read and update.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::config::Config;

// ── Node state ────────────────────────────────────────────────────────────

/// The current Raft state of this node.
///
/// ```text
/// Forming → Follower   (quorum reached, this node is a follower)
/// Forming → Leader     (quorum reached, this node won election)
/// Leader  → Follower   (leadership lost after partition/restart)
/// ```
///
/// A single-node (`bootstrap_expect == 1`) deployment moves directly from
/// `Forming` to `Leader` without ever touching `Follower`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    /// Gossip/Raft not yet initialised.
    Standalone,
    /// Raft is starting; waiting to reach quorum with peers.
    Forming,
    /// In cluster as a Raft follower.
    Follower,
    /// Elected Raft leader.
    Leader,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Standalone => "standalone",
            NodeState::Forming => "forming",
            NodeState::Follower => "follower",
            NodeState::Leader => "leader",
        }
    }

    /// True once the node has joined the cluster and is eligible to serve
    /// writes (as leader) or forward them (as follower).
    pub fn cluster_ready(&self) -> bool {
        matches!(self, NodeState::Follower | NodeState::Leader)
    }
}

// ── Cluster handle ────────────────────────────────────────────────────────

/// Shared cluster state handle — cheap to clone, safe to share across
/// tasks. The gossip loop, the leader reconciliation loop, and the HTTP
/// surface all hold a clone.
#[derive(Clone)]
pub struct ClusterHandle {
    state: Arc<Mutex<NodeState>>,
    config: Arc<Config>,
    peer_count: Arc<AtomicUsize>,
}

impl ClusterHandle {
    pub fn new(config: Config) -> Self {
        let initial = if config.bootstrap_expect <= 1 {
            NodeState::Forming
        } else {
            NodeState::Standalone
        };
        ClusterHandle {
            state: Arc::new(Mutex::new(initial)),
            config: Arc::new(config),
            peer_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn state(&self) -> NodeState {
        self.state.lock().unwrap().clone()
    }

    /// Transitions to a new state. Called from `raft.rs`'s metrics watcher
    /// whenever openraft reports a leadership change.
    pub fn set_state(&self, new_state: NodeState) {
        let old = {
            let mut guard = self.state.lock().unwrap();
            let old = guard.clone();
            *guard = new_state.clone();
            old
        };
        if old != new_state {
            info!(
                node_id = %self.config.node_id,
                old_state = old.as_str(),
                new_state = new_state.as_str(),
                "node state changed"
            );
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Known live gossip peers (excluding self). Updated by `gossip.rs`.
    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }

    pub fn set_peer_count(&self, n: usize) {
        self.peer_count.store(n, Ordering::Relaxed);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_starts_forming() {
        let handle = ClusterHandle::new(Config::for_testing());
        assert_eq!(handle.state(), NodeState::Forming);
        assert!(!handle.state().cluster_ready());
    }

    #[test]
    fn multi_node_starts_standalone_until_gossip_settles() {
        let mut config = Config::for_testing();
        config.bootstrap_expect = 3;
        let handle = ClusterHandle::new(config);
        assert_eq!(handle.state(), NodeState::Standalone);
    }

    #[test]
    fn state_transitions() {
        let handle = ClusterHandle::new(Config::for_testing());
        handle.set_state(NodeState::Follower);
        assert_eq!(handle.state(), NodeState::Follower);
        assert!(handle.state().cluster_ready());

        handle.set_state(NodeState::Leader);
        assert_eq!(handle.state(), NodeState::Leader);
    }

    #[test]
    fn node_state_strings() {
        assert_eq!(NodeState::Standalone.as_str(), "standalone");
        assert_eq!(NodeState::Forming.as_str(), "forming");
        assert_eq!(NodeState::Follower.as_str(), "follower");
        assert_eq!(NodeState::Leader.as_str(), "leader");
    }

    #[test]
    fn handle_clone_shares_state() {
        let handle1 = ClusterHandle::new(Config::for_testing());
        let handle2 = handle1.clone();
        handle1.set_state(NodeState::Follower);
        assert_eq!(handle2.state(), NodeState::Follower);
    }

    #[test]
    fn peer_count_shared_across_clones() {
        let handle1 = ClusterHandle::new(Config::for_testing());
        let handle2 = handle1.clone();
        handle1.set_peer_count(4);
        assert_eq!(handle2.peer_count(), 4);
    }
}
