//! OpenState server entrypoint (§4.7, §10.7).
//!
//! Loads configuration from the environment, starts the Raft node, gossip
//! membership, the leader monitor, the gRPC transport, and the HTTP
//! surface, then waits for `SIGINT`/`SIGTERM`. Exits 0 on a graceful
//! shutdown, 1 on startup failure — the process-level contract `cmd/`
//! front-ends (an external collaborator, out of scope here) rely on.

use tracing_subscriber::EnvFilter;

use openstate::config::Config;
use openstate::grpc;
use openstate::http;
use openstate::server::OpenStateServer;

fn init_logging() {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into())))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    tracing::info!(
        node_id = %config.node_id,
        node_name = %config.node_name,
        raft_advertise = %config.raft_advertise,
        gossip_advertise = %config.gossip_advertise,
        http_advertise = %config.http_advertise,
        bootstrap_expect = config.bootstrap_expect,
        "starting OpenState server"
    );

    let http_addr = config.http_advertise;
    let raft_addr = config.raft_advertise;

    let server = match OpenStateServer::new(config).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    let grpc_handle = grpc::start_grpc_server(server.raft.clone(), raft_addr);
    let http_handle = http::start_http_server(server.clone(), http_addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
        res = grpc_handle => {
            if let Err(e) = res {
                tracing::error!(error = %e, "gRPC task panicked");
            }
        }
        res = http_handle => {
            if let Err(e) = res {
                tracing::error!(error = %e, "HTTP task panicked");
            }
        }
    }

    tracing::info!("shutting down");
}
