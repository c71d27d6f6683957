//! Multi-node forwarding scenario (§8 S4, P6).
//!
//! The pack carries no precedent for a full multi-process Raft bring-up
//! test (the closest analogues, e.g. `lithair-lithair`'s cluster module
//! tests, all drive individual components in isolation rather than two
//! live nodes over real sockets). This test brings up two real nodes in
//! one process instead: node one bootstraps as a single-voter cluster and
//! self-elects, node two starts with no initial membership and waits to be
//! discovered over gossip and added as a voter by node one's leader
//! reconciliation loop. Timeouts are generous because the only clocks in
//! play are gossip's one-second probe interval and Raft's own election
//! timers, not anything this test controls directly.

use std::net::SocketAddr;
use std::time::Duration;

use hyper::{Body, Client, Method, Request, StatusCode};
use openstate::config::Config;
use openstate::grpc::start_grpc_server;
use openstate::http::start_http_server;
use openstate::server::OpenStateServer;

async fn wait_until<F: Fn() -> bool>(f: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    f()
}

fn node_config(
    bootstrap_expect: usize,
    raft_port: u16,
    gossip_port: u16,
    http_port: u16,
) -> Config {
    Config {
        bootstrap_expect,
        dev_mode: true,
        node_id: uuid::Uuid::new_v4().to_string(),
        node_name: format!("test-node-{http_port}"),
        raft_advertise: format!("127.0.0.1:{raft_port}").parse().unwrap(),
        gossip_advertise: format!("127.0.0.1:{gossip_port}").parse().unwrap(),
        http_advertise: format!("127.0.0.1:{http_port}").parse().unwrap(),
        peers: Vec::new(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s4_follower_redirects_writes_to_leader() {
    let node_a = OpenStateServer::new(node_config(1, 32001, 32002, 32003))
        .await
        .expect("node a starts");
    start_grpc_server(node_a.raft.clone(), node_a.config.raft_advertise);
    start_http_server(node_a.clone(), node_a.config.http_advertise);

    assert!(
        wait_until(|| node_a.is_leader(), Duration::from_secs(5)).await,
        "node a failed to self-elect as a single-voter cluster"
    );

    let node_b = OpenStateServer::new(node_config(2, 32011, 32012, 32013))
        .await
        .expect("node b starts");
    start_grpc_server(node_b.raft.clone(), node_b.config.raft_advertise);
    start_http_server(node_b.clone(), node_b.config.http_advertise);

    let node_a_gossip: SocketAddr = node_a.config.gossip_advertise;
    node_b.gossip.seed(&[node_a_gossip]).await;

    // node two has to be discovered over gossip, added as a learner, then
    // promoted to voter before it learns who the leader is.
    assert!(
        wait_until(
            || node_b.raft.raft.metrics().borrow().current_leader.is_some(),
            Duration::from_secs(30),
        )
        .await,
        "node b never learned the cluster leader"
    );
    assert!(!node_b.is_leader());

    let client = Client::new();
    let node_b_addr = node_b.config.http_advertise;
    let node_a_addr = node_a.config.http_advertise;

    let body = serde_json::json!({
        "definition": {
            "name": "traffic",
            "attributes": {},
            "machine": {
                "initial": "green",
                "events": [
                    {"name": "turn_yellow", "destination": "yellow", "sources": ["green"]}
                ]
            }
        }
    })
    .to_string();

    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{node_b_addr}/v1/tasks"))
        .header("Content-Type", "application/json")
        .body(Body::from(body.clone()))
        .unwrap();
    let resp = client.request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::PERMANENT_REDIRECT);
    let location = resp
        .headers()
        .get("Location")
        .expect("redirect carries a Location header")
        .to_str()
        .unwrap()
        .to_string();
    assert!(
        location.contains(&node_a_addr.to_string()),
        "redirect {location} did not point at the leader's http address {node_a_addr}"
    );

    let follow = Request::builder()
        .method(Method::POST)
        .uri(location)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap();
    let follow_resp = client.request(follow).await.unwrap();
    assert_eq!(follow_resp.status(), StatusCode::OK);
}
