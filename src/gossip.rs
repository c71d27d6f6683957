//! Membership gossip (§4.4).
//!
//! No gossip/SWIM crate is available in this dependency stack, so this is a
//! small UDP protocol built directly on `tokio::net::UdpSocket`, modeled on
//! the Join/Leave/Fail event dispatch the source runs over Serf
//! (`serfEventHandler`/`memberJoin`/`memberLeave`/`memberFailed`) and the
//! `role=openstate` member-tagging predicate in `isServer`.
//!
//! Protocol: every node periodically broadcasts a `Ping` carrying its own
//! tagged `MemberInfo` plus its current membership table to every known
//! peer address (full mesh — adequate at the cluster sizes this system
//! targets, unlike Serf's epidemic broadcast which scales to thousands of
//! nodes). A node not heard from within `FAILURE_TIMEOUT` is marked failed
//! and reported on the event channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterHandle, NodeState};

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const FAILURE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DATAGRAM: usize = 16 * 1024;

/// The tagged fields the source attaches to every Serf member
/// (`role`, `id`, `raft_addr`, `serf_addr`, `http_addr`) so peers can tell
/// OpenState nodes apart from any other gossip traffic sharing the network
/// and can dial the right port for each subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberInfo {
    pub role: String,
    pub node_id: String,
    pub node_name: String,
    pub raft_addr: SocketAddr,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
}

impl MemberInfo {
    /// The `role=openstate` predicate from `isServer` — members that don't
    /// carry it are ignored rather than treated as a malformed packet, in
    /// case this gossip port is ever shared with another protocol.
    const ROLE: &'static str = "openstate";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Packet {
    from: MemberInfo,
    members: Vec<MemberInfo>,
}

/// Join, Leave, or Fail — the three event kinds `memberEvent` pushes onto
/// the reconcile channel for the leader loop to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Join(MemberInfo),
    Leave(MemberInfo),
    Fail(MemberInfo),
}

struct Peer {
    info: MemberInfo,
    last_seen: Instant,
}

/// Shared membership table plus the event channel leader.rs drains.
pub struct Gossip {
    socket: Arc<UdpSocket>,
    self_info: MemberInfo,
    peers: Mutex<HashMap<String, Peer>>,
    events_tx: mpsc::Sender<MembershipEvent>,
}

impl Gossip {
    pub async fn bind(
        self_info: MemberInfo,
        cluster: ClusterHandle,
    ) -> std::io::Result<(Arc<Gossip>, mpsc::Receiver<MembershipEvent>)> {
        let socket = UdpSocket::bind(self_info.gossip_addr).await?;
        let (events_tx, events_rx) = mpsc::channel(256);

        let gossip = Arc::new(Gossip {
            socket: Arc::new(socket),
            self_info,
            peers: Mutex::new(HashMap::new()),
            events_tx,
        });

        tokio::spawn(recv_loop(gossip.clone(), cluster.clone()));
        tokio::spawn(probe_loop(gossip.clone()));
        tokio::spawn(failure_loop(gossip.clone(), cluster));

        Ok((gossip, events_rx))
    }

    /// Seed the membership table with known addresses from `Config::peers`
    /// and send them an immediate probe so gossip converges without
    /// waiting a full `PROBE_INTERVAL`.
    pub async fn seed(&self, peer_addrs: &[SocketAddr]) {
        for addr in peer_addrs {
            let _ = self.send_to(*addr).await;
        }
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.peers.lock().unwrap().values().map(|p| p.info.clone()).collect()
    }

    pub fn member_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    async fn send_to(&self, addr: SocketAddr) -> std::io::Result<()> {
        let packet = Packet {
            from: self.self_info.clone(),
            members: self.members(),
        };
        let bytes = serde_json::to_vec(&packet).unwrap_or_default();
        self.socket.send_to(&bytes, addr).await.map(|_| ())
    }

    fn note_alive(&self, info: MemberInfo) -> Option<MembershipEvent> {
        if info.node_id == self.self_info.node_id {
            return None;
        }
        if info.role != MemberInfo::ROLE {
            return None;
        }
        let mut peers = self.peers.lock().unwrap();
        let is_new = !peers.contains_key(&info.node_id);
        peers.insert(
            info.node_id.clone(),
            Peer {
                info: info.clone(),
                last_seen: Instant::now(),
            },
        );
        if is_new {
            info!(peer = %info.node_name, "Adding peer");
            Some(MembershipEvent::Join(info))
        } else {
            None
        }
    }
}

async fn recv_loop(gossip: Arc<Gossip>, cluster: ClusterHandle) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, _addr) = match gossip.socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "gossip recv error");
                continue;
            }
        };

        let packet: Packet = match serde_json::from_slice(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "dropping malformed gossip packet");
                continue;
            }
        };

        if let Some(event) = gossip.note_alive(packet.from) {
            dispatch(&gossip, &cluster, event).await;
        }
        for member in packet.members {
            if let Some(event) = gossip.note_alive(member) {
                dispatch(&gossip, &cluster, event).await;
            }
        }

        cluster.set_peer_count(gossip.member_count());
    }
}

async fn probe_loop(gossip: Arc<Gossip>) {
    let mut interval = tokio::time::interval(PROBE_INTERVAL);
    loop {
        interval.tick().await;
        let targets: Vec<SocketAddr> = gossip
            .peers
            .lock()
            .unwrap()
            .values()
            .map(|p| p.info.gossip_addr)
            .collect();
        for addr in targets {
            let _ = gossip.send_to(addr).await;
        }
    }
}

/// Marks peers not heard from within `FAILURE_TIMEOUT` as failed —
/// functionally equivalent to `memberFailed`, since this protocol has no
/// separate graceful-leave message distinct from a timeout.
async fn failure_loop(gossip: Arc<Gossip>, cluster: ClusterHandle) {
    let mut interval = tokio::time::interval(PROBE_INTERVAL);
    loop {
        interval.tick().await;
        let now = Instant::now();
        let failed: Vec<MemberInfo> = {
            let mut peers = gossip.peers.lock().unwrap();
            let failed_ids: Vec<String> = peers
                .iter()
                .filter(|(_, p)| now.duration_since(p.last_seen) > FAILURE_TIMEOUT)
                .map(|(id, _)| id.clone())
                .collect();
            failed_ids
                .iter()
                .filter_map(|id| peers.remove(id).map(|p| p.info))
                .collect()
        };

        for info in failed {
            warn!(peer = %info.node_name, "Removing peer");
            dispatch(&gossip, &cluster, MembershipEvent::Fail(info)).await;
        }

        cluster.set_peer_count(gossip.member_count());
    }
}

/// Pushes an event to the reconcile channel only when this node is leader —
/// mirrors `memberEvent`'s `if !s.IsLeader() { return }` guard, since only
/// the leader drives Raft membership changes. `leader.rs` is the consumer;
/// `cluster.rs`'s `NodeState` is the authority on leadership here rather
/// than asking the Raft handle directly, to keep this module decoupled
/// from `raft.rs`.
async fn dispatch(gossip: &Arc<Gossip>, cluster: &ClusterHandle, event: MembershipEvent) {
    if cluster.state() != NodeState::Leader {
        return;
    }
    // A full channel means leader.rs is behind; dropping here and relying
    // on the periodic reconcile sweep mirrors the `select default:` drop in
    // `memberEvent`.
    if gossip.events_tx.try_send(event).is_err() {
        debug!("reconcile channel full, dropping membership event");
    }
}
