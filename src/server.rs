//! Top-level server assembly (component G, §4.7).
//!
//! Grounded on the source `NewServer`: wires together Raft, gossip
//! membership, the leader monitor, and an async bootstrap join, in the
//! same order. One correction from the source is applied here per the
//! redesign notes: the Raft voter identity is always the stable UUID
//! `node_id`, never the human-assigned `node_name` the source used as its
//! `raft.ServerID` (`s.config.NodeName`) — a renamed node there loses its
//! log continuity, which this implementation avoids entirely by never
//! tying Raft identity to a mutable label.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cluster::ClusterHandle;
use crate::config::Config;
use crate::gossip::{Gossip, MemberInfo};
use crate::raft::{node_id_from_str, start_raft_node, RaftNode};
use crate::store::StateStore;

pub struct OpenStateServer {
    pub config: Config,
    pub cluster: ClusterHandle,
    pub store: Arc<StateStore>,
    pub raft: Arc<RaftNode>,
    pub gossip: Arc<Gossip>,
}

impl OpenStateServer {
    pub async fn new(config: Config) -> std::io::Result<Arc<OpenStateServer>> {
        let cluster = ClusterHandle::new(config.clone());
        let store = Arc::new(StateStore::new());

        let self_info = MemberInfo {
            role: "openstate".into(),
            node_id: config.node_id.clone(),
            node_name: config.node_name.clone(),
            raft_addr: config.raft_advertise,
            gossip_addr: config.gossip_advertise,
            http_addr: config.http_advertise,
        };

        let raft = start_raft_node(cluster.clone(), store.clone()).await;

        let (gossip, events_rx) = Gossip::bind(self_info, cluster.clone()).await?;

        let server = Arc::new(OpenStateServer {
            config: config.clone(),
            cluster: cluster.clone(),
            store,
            raft: raft.clone(),
            gossip: gossip.clone(),
        });

        tokio::spawn(crate::leader::monitor_leadership(
            raft,
            gossip.clone(),
            events_rx,
            cluster,
        ));

        tokio::spawn(bootstrap_join(gossip, config.peers.clone()));

        Ok(server)
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// The HTTP address of the current leader, resolved from the gossip
    /// membership table by matching the Raft voter id to the `node_id` it
    /// was derived from. `None` if no leader is known or the leader isn't
    /// (yet) visible in the local membership view.
    pub fn leader_http_addr(&self) -> Option<String> {
        let leader_id = self.raft.raft.metrics().borrow().current_leader?;
        if leader_id == self.raft.node_id {
            return Some(self.config.http_advertise.to_string());
        }
        self.gossip
            .members()
            .into_iter()
            .find(|m| node_id_from_str(&m.node_id) == leader_id)
            .map(|m| m.http_addr.to_string())
    }
}

/// Joins the gossip ring given the configured peer seed list — the
/// asynchronous analogue of the source's `bootstrapHandler`.
async fn bootstrap_join(gossip: Arc<Gossip>, peers: Vec<String>) {
    if peers.is_empty() {
        return;
    }
    let addrs: Vec<std::net::SocketAddr> = peers
        .iter()
        .filter_map(|p| match p.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(peer = %p, error = %e, "skipping unparsable peer seed");
                None
            }
        })
        .collect();

    info!(count = addrs.len(), "joining gossip ring");
    gossip.seed(&addrs).await;
}
