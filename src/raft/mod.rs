//! Raft-style consensus for the write path. A node is always in exactly one
//! of three roles: a leader broadcasts periodic heartbeats, a follower
//! watches for heartbeat staleness, and an elector runs randomized-timeout
//! elections until it wins leadership or discovers a leader. Log contents
//! are opaque here; only (index, term) coordinates are compared, read from
//! the LogManager collaborator.

mod driver;
mod log;
mod message;
mod node;
mod state;
mod transport;

pub use driver::{Driver, DriverHandle, Options};
pub use log::{LogManager, MemoryLog};
pub use message::{ElectionRequest, ElectionResponse, HeartbeatRequest, HeartbeatResponse};
pub use node::{Node, Role};
pub use state::{RaftState, Status};
pub use transport::{Channel, ElectionHandler, HeartbeatHandler, Transport};

use std::time::Duration;

/// A leader term. Monotonically non-decreasing on every node; every
/// leadership change strictly increases it.
pub type Term = u64;

/// A log index. Starts at 1, indicates no entry if 0.
pub type Index = u64;

/// The interval between leader heartbeat sweeps.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// A failed election restarts after this floor...
const ELECTION_LEAST_TIMEOUT: Duration = Duration::from_secs(5);

/// ...plus a random backoff below this bound, to break repeated ties.
const ELECTION_RANDOM_TIMEOUT: Duration = Duration::from_secs(5);

/// The default timeout after which a silent leader is presumed dead and an
/// election round is abandoned. Overridden by configuration.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(20);

/// A monotonic millisecond clock, driving heartbeat staleness checks. A
/// trait so tests can run on a manual clock.
pub trait Clock: Send + Sync {
    /// Returns the milliseconds elapsed since an arbitrary fixed epoch.
    fn now_millis(&self) -> u64;
}

/// The wall clock, made monotonic by anchoring at construction time.
pub struct SystemClock {
    epoch: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { epoch: std::time::Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
pub(crate) mod testclock {
    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// A manually advanced clock.
    #[derive(Default)]
    pub struct ManualClock(AtomicU64);

    impl ManualClock {
        pub fn advance(&self, millis: u64) {
            self.0.fetch_add(millis, Ordering::Relaxed);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }
}
