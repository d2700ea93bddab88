use serde::{Deserialize, Serialize};

/// A cluster member's identity: a stable network address plus an optional
/// cluster-assigned integer identifier. A fresh node generates a random
/// identifier at startup and reports it to the leader on request; the leader
/// tells it to regenerate on a collision.
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
    pub identifier: Option<i32>,
}

impl Node {
    /// Creates a node with no identifier assigned yet.
    pub fn new(host: &str, port: u16) -> Self {
        Self { host: host.to_string(), port, identifier: None }
    }
}

// Node identity is the network address. The identifier is mutable cluster
// state and excluded from equality and hashing, so membership sets survive
// identifier changes.
impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The role a node plays in the cluster, exactly one at a time. Nodes boot
/// as electors and transition only via the consensus driver and its
/// response handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
    Elector,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::Leader => "leader",
            Self::Follower => "follower",
            Self::Elector => "elector",
        })
    }
}
