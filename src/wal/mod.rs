//! The write-ahead log. A WalManager multiplexes reusable byte buffers
//! across one exclusive LogNode per storage group and file kind, admitting
//! new nodes with bounded backpressure against the shared buffer pool and
//! periodically forcing buffered writes to stable storage.

mod manager;
mod node;

pub use manager::WalManager;
pub use node::LogNode;

use std::path::PathBuf;
use std::time::Duration;

/// A reusable byte buffer drawn from the shared pool. Capacity is decided by
/// the pool; a node fills a buffer up to its capacity before spilling it to
/// its segment file.
pub type Buffer = Vec<u8>;

/// Write-ahead log options.
#[derive(Clone, Debug)]
pub struct Options {
    /// Root directory for WAL segments; each node writes under its own
    /// subdirectory.
    pub dir: PathBuf,
    /// Whether the WAL is enabled at all. When disabled, start() and stop()
    /// are no-ops.
    pub enabled: bool,
    /// The interval between background force-sync sweeps. Zero disables the
    /// sweep.
    pub force_period: Duration,
    /// How long a registration sleeps between buffer-pool retries.
    pub buffer_sleep_interval: Duration,
    /// The cumulative wait at which a registration is rejected.
    pub buffer_reject_threshold: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            enabled: true,
            force_period: Duration::from_millis(100),
            buffer_sleep_interval: Duration::from_millis(200),
            buffer_reject_threshold: Duration::from_millis(10_000),
        }
    }
}
