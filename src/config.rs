use crate::errinput;
use crate::error::Result;
use crate::raft;
use crate::wal;

use serde::Deserialize;
use std::time::Duration;

/// Node configuration, loaded from a configuration file with TIDEDB_-
/// prefixed environment variable overrides.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// The local node's address, host:port.
    pub listen: String,
    /// All cluster members' addresses, including the local node. A node
    /// started with an empty list is blind and learns the membership from
    /// the leader.
    pub peers: Vec<String>,
    pub log_level: String,
    pub data_dir: String,
    /// Whether writes go through the write-ahead log.
    pub enable_wal: bool,
    /// The WAL force-sync period in milliseconds; 0 disables the sweep.
    pub force_wal_period_in_ms: u64,
    /// The sleep between WAL buffer-pool retries, in milliseconds.
    pub register_buffer_sleep_interval_in_ms: u64,
    /// The cumulative wait at which a WAL registration is rejected, in
    /// milliseconds.
    pub register_buffer_reject_threshold_in_ms: u64,
    /// The heartbeat staleness and election timeout, in milliseconds.
    pub connection_timeout_in_ms: u64,
}

impl Config {
    /// Loads the configuration from the given file.
    pub fn load(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("listen", "0.0.0.0:6667")?
            .set_default("peers", Vec::<String>::new())?
            .set_default("log_level", "info")?
            .set_default("data_dir", "data")?
            .set_default("enable_wal", true)?
            .set_default("force_wal_period_in_ms", 100)?
            .set_default("register_buffer_sleep_interval_in_ms", 200)?
            .set_default("register_buffer_reject_threshold_in_ms", 10_000)?
            .set_default("connection_timeout_in_ms", 20_000)?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("TIDEDB"))
            .build()?
            .try_deserialize()?)
    }

    /// Validates and returns the write-ahead log options.
    pub fn wal_options(&self) -> Result<wal::Options> {
        if self.register_buffer_sleep_interval_in_ms == 0 {
            return errinput!("register_buffer_sleep_interval_in_ms must be positive");
        }
        if self.register_buffer_reject_threshold_in_ms <= self.register_buffer_sleep_interval_in_ms
        {
            return errinput!(
                "register_buffer_reject_threshold_in_ms must exceed the sleep interval"
            );
        }
        Ok(wal::Options {
            dir: std::path::Path::new(&self.data_dir).join("wal"),
            enabled: self.enable_wal,
            force_period: Duration::from_millis(self.force_wal_period_in_ms),
            buffer_sleep_interval: Duration::from_millis(self.register_buffer_sleep_interval_in_ms),
            buffer_reject_threshold: Duration::from_millis(
                self.register_buffer_reject_threshold_in_ms,
            ),
        })
    }

    /// Validates and returns the consensus timing options.
    pub fn raft_options(&self) -> Result<raft::Options> {
        if self.connection_timeout_in_ms == 0 {
            return errinput!("connection_timeout_in_ms must be positive");
        }
        Ok(raft::Options {
            connection_timeout: Duration::from_millis(self.connection_timeout_in_ms),
            ..raft::Options::default()
        })
    }

    /// Returns the local node's identity.
    pub fn node(&self) -> Result<raft::Node> {
        parse_address(&self.listen)
    }

    /// Returns the cluster membership.
    pub fn members(&self) -> Result<Vec<raft::Node>> {
        self.peers.iter().map(|peer| parse_address(peer)).collect()
    }
}

fn parse_address(address: &str) -> Result<raft::Node> {
    let Some((host, port)) = address.rsplit_once(':') else {
        return errinput!("invalid node address {address}, expected host:port");
    };
    let Ok(port) = port.parse() else {
        return errinput!("invalid port in node address {address}");
    };
    Ok(raft::Node::new(host, port))
}
