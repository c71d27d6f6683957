//! Server configuration, loaded exclusively from environment variables
//! (§10.4). No YAML/TOML file loader and no CLI flag parser — both are out
//! of scope per §1; `cmd/` front-ends are an external collaborator.

use std::env;
use std::net::SocketAddr;
use thiserror::Error;

pub const DEFAULT_RAFT_PORT: u16 = 7050;
pub const DEFAULT_GOSSIP_PORT: u16 = 4648;
pub const DEFAULT_HTTP_PORT: u16 = 8080;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("invalid address for {var}: {message}")]
    InvalidAddr { var: String, message: String },
}

/// The comprehensive list of server options (§4.7/§10.4).
#[derive(Debug, Clone)]
pub struct Config {
    /// How many servers to expect before attempting leadership. `1` forms a
    /// single-node cluster immediately.
    pub bootstrap_expect: usize,

    /// Dev mode limits persistence and state to in-memory (this crate is
    /// always in-memory, so dev mode only relaxes bootstrap expectations).
    pub dev_mode: bool,

    /// The UUID identity used as the Raft voter id. Never changes in place
    /// — Raft cannot reconcile a renamed peer (§9 "Node identity").
    pub node_id: String,

    /// Human-readable, purely informational node label. Never used as the
    /// Raft `LocalID`.
    pub node_name: String,

    pub raft_advertise: SocketAddr,
    pub gossip_advertise: SocketAddr,
    pub http_advertise: SocketAddr,

    /// Initial peer gossip seeds; only one valid peer is required, gossip
    /// propagates the rest.
    pub peers: Vec<String>,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(v) => v.parse().map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_addr(name: &str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env_or(name, default);
    raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::InvalidAddr {
        var: name.into(),
        message: e.to_string(),
    })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id = env::var("NODE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        let node_name = env::var("NODE_NAME").unwrap_or_else(|_| {
            hostname_fallback()
        });

        let raft_advertise = env_addr(
            "RAFT_ADVERTISE",
            &format!("127.0.0.1:{}", DEFAULT_RAFT_PORT),
        )?;
        let gossip_advertise = env_addr(
            "GOSSIP_ADVERTISE",
            &format!("127.0.0.1:{}", DEFAULT_GOSSIP_PORT),
        )?;
        let http_advertise = env_addr(
            "HTTP_ADVERTISE",
            &format!("127.0.0.1:{}", DEFAULT_HTTP_PORT),
        )?;

        let bootstrap_expect = env_usize("BOOTSTRAP_EXPECT", 1)?;
        let dev_mode = env_bool("DEV_MODE", false);

        let peers = env::var("PEERS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(Config {
            bootstrap_expect,
            dev_mode,
            node_id,
            node_name,
            raft_advertise,
            gossip_advertise,
            http_advertise,
            peers,
        })
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        Config {
            bootstrap_expect: 1,
            dev_mode: true,
            node_id: "test-node-id".into(),
            node_name: "test-node".into(),
            raft_advertise: "127.0.0.1:0".parse().unwrap(),
            gossip_advertise: "127.0.0.1:0".parse().unwrap(),
            http_advertise: "127.0.0.1:0".parse().unwrap(),
            peers: Vec::new(),
        }
    }
}

fn hostname_fallback() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "unknown-node".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        for var in [
            "NODE_ID",
            "NODE_NAME",
            "RAFT_ADVERTISE",
            "GOSSIP_ADVERTISE",
            "HTTP_ADVERTISE",
            "BOOTSTRAP_EXPECT",
            "DEV_MODE",
            "PEERS",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_use_historical_ports() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        let config = Config::from_env().unwrap();
        assert_eq!(config.raft_advertise.port(), DEFAULT_RAFT_PORT);
        assert_eq!(config.gossip_advertise.port(), DEFAULT_GOSSIP_PORT);
        assert_eq!(config.http_advertise.port(), DEFAULT_HTTP_PORT);
        assert_eq!(config.bootstrap_expect, 1);
        assert!(!config.dev_mode);
        assert!(config.peers.is_empty());

        clear_env_vars();
    }

    #[test]
    fn node_id_defaults_to_random_uuid() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        let a = Config::from_env().unwrap();
        let b = Config::from_env().unwrap();
        assert_ne!(a.node_id, b.node_id);

        clear_env_vars();
    }

    #[test]
    fn peers_parsed_from_comma_separated_list() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("PEERS", "10.0.0.1:4648, 10.0.0.2:4648");
        let config = Config::from_env().unwrap();
        assert_eq!(config.peers, vec!["10.0.0.1:4648", "10.0.0.2:4648"]);

        clear_env_vars();
    }

    #[test]
    fn invalid_bootstrap_expect_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("BOOTSTRAP_EXPECT", "not-a-number");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref var, .. } if var == "BOOTSTRAP_EXPECT"));

        clear_env_vars();
    }

    #[test]
    fn invalid_http_advertise_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("HTTP_ADVERTISE", "not-an-address");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddr { ref var, .. } if var == "HTTP_ADVERTISE"));

        clear_env_vars();
    }

    #[test]
    fn dev_mode_true() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env_vars();

        env::set_var("DEV_MODE", "true");
        let config = Config::from_env().unwrap();
        assert!(config.dev_mode);

        clear_env_vars();
    }
}
