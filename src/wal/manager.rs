use super::node::LogNode;
use super::{Buffer, Options};
use crate::error::{Error, Result};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Manages all write-ahead log nodes of a process: a registry keyed by node
/// identifier, buffer admission against the shared pool, and a background
/// thread forcing buffered writes to disk. One instance per process by
/// convention, but the manager is an explicit service object with
/// start()/stop() so tests can run several in isolation.
///
/// The registry holds the only long-lived reference to a node; at most one
/// node exists per identifier at any instant. The buffer pool itself is
/// opaque: callers pass a supplier that yields a buffer array or None
/// ("unavailable"), and a sink that takes buffers back. Backpressure lives
/// here, not in the pool: an unavailable pool is polled with a fixed sleep
/// up to a hard rejection deadline.
pub struct WalManager {
    shared: Arc<Shared>,
    /// Dropping the sender wakes the force-sync thread and any admission
    /// waiters, which then cancel.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    force_handle: Mutex<Option<JoinHandle<()>>>,
}

/// State shared with the force-sync thread.
struct Shared {
    opts: Options,
    nodes: Mutex<HashMap<String, Arc<LogNode>>>,
    /// When set, force-sync sweeps are skipped until the system leaves
    /// read-only mode.
    read_only: AtomicBool,
    /// Whether the current stretch of read-only mode has been logged.
    read_only_logged: AtomicBool,
    shutdown_rx: Receiver<()>,
}

impl WalManager {
    /// Creates a new WAL manager. Call start() to launch the force-sync
    /// sweep.
    pub fn new(opts: Options) -> Self {
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);
        Self {
            shared: Arc::new(Shared {
                opts,
                nodes: Mutex::new(HashMap::new()),
                read_only: AtomicBool::new(false),
                read_only_logged: AtomicBool::new(false),
                shutdown_rx,
            }),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            force_handle: Mutex::new(None),
        }
    }

    /// Returns the registered node for the identifier, or registers a new
    /// one. Registration publishes the node first (losing a race against a
    /// concurrent creator simply returns the winner), then obtains buffers
    /// from the supplier. An unavailable pool is retried with a fixed sleep;
    /// once the cumulative wait reaches the rejection threshold the node is
    /// removed again and the registration fails with BufferExhausted. A
    /// manager shutdown mid-wait likewise removes the node and cancels.
    pub fn get_node(
        &self,
        identifier: &str,
        supplier: &dyn Fn() -> Option<Vec<Buffer>>,
    ) -> Result<Arc<LogNode>> {
        let shared = &self.shared;
        let node = {
            let mut nodes = shared.nodes.lock()?;
            if let Some(node) = nodes.get(identifier) {
                return Ok(Arc::clone(node));
            }
            let node = Arc::new(LogNode::new(identifier, shared.opts.dir.join(identifier)));
            nodes.insert(identifier.to_string(), Arc::clone(&node));
            node
        };

        // Only the creator reaches this point, and it no longer holds the
        // registry lock while waiting for the pool.
        let mut slept = Duration::ZERO;
        let buffers = loop {
            if let Some(buffers) = supplier() {
                break buffers;
            }
            if slept.is_zero() {
                error!(
                    "Cannot allocate WAL buffers for {identifier}, reduce the WAL buffer size \
                     or the number of storage groups"
                );
            }
            if slept >= shared.opts.buffer_reject_threshold {
                shared.nodes.lock()?.remove(identifier);
                return Err(Error::BufferExhausted);
            }
            if !shared.sleep(shared.opts.buffer_sleep_interval) {
                shared.nodes.lock()?.remove(identifier);
                return Err(Error::Cancelled);
            }
            slept += shared.opts.buffer_sleep_interval;
        };
        node.init_buffers(buffers);
        Ok(node)
    }

    /// Removes and deletes the node, handing its buffers to the sink for
    /// return to the pool. A no-op for unknown identifiers.
    pub fn delete_node(
        &self,
        identifier: &str,
        sink: &mut dyn FnMut(Vec<Buffer>),
    ) -> Result<()> {
        let node = self.shared.nodes.lock()?.remove(identifier);
        if let Some(node) = node {
            sink(node.delete()?);
        }
        Ok(())
    }

    /// Closes every registered node and clears the registry. Per-node
    /// failures are logged, never propagated.
    pub fn close(&self) {
        let Ok(mut nodes) = self.shared.nodes.lock() else {
            error!("WAL registry lock poisoned, skipping close");
            return;
        };
        info!("Closing {} WAL nodes", nodes.len());
        for node in nodes.values() {
            if let Err(err) = node.close() {
                error!("Failed to close WAL node {}: {}", node.identifier(), err);
            }
        }
        nodes.clear();
        info!("WAL node manager closed");
    }

    /// Starts the periodic force-sync sweep. A no-op when the WAL is
    /// disabled or the force period is zero.
    pub fn start(&self) -> Result<()> {
        if !self.shared.opts.enabled || self.shared.opts.force_period.is_zero() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("wal-forcesync".into())
            .spawn(move || {
                info!("WAL force-sync thread starts");
                while let Err(RecvTimeoutError::Timeout) =
                    shared.shutdown_rx.recv_timeout(shared.opts.force_period)
                {
                    shared.force_task();
                }
                info!("WAL force-sync thread exits");
            })
            .map_err(|err| Error::Startup(format!("cannot spawn WAL force-sync thread: {err}")))?;
        *self.force_handle.lock()? = Some(handle);
        Ok(())
    }

    /// Stops the force-sync sweep, waits for it to exit, and closes all
    /// nodes. Errors are logged, never propagated.
    pub fn stop(&self) {
        if !self.shared.opts.enabled {
            return;
        }
        if let Ok(mut shutdown_tx) = self.shutdown_tx.lock() {
            shutdown_tx.take();
        }
        let handle = self.force_handle.lock().ok().and_then(|mut handle| handle.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("WAL force-sync thread panicked");
            }
        }
        self.close();
    }

    /// Toggles read-only mode. While read-only, force-sync sweeps are
    /// skipped.
    pub fn set_read_only(&self, read_only: bool) {
        self.shared.read_only.store(read_only, Ordering::Relaxed);
    }

    /// Returns the number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.shared.nodes.lock().map(|nodes| nodes.len()).unwrap_or_default()
    }

    #[cfg(test)]
    fn force_task(&self) {
        self.shared.force_task();
    }
}

impl Shared {
    /// One force-sync sweep over all registered nodes. Skipped in read-only
    /// mode, logging the skip once per transition into read-only. Per-node
    /// IO failures are logged and do not abort the sweep.
    fn force_task(&self) {
        if self.read_only.load(Ordering::Relaxed) {
            if !self.read_only_logged.swap(true, Ordering::Relaxed) {
                warn!("System is read-only, the WAL force-sync sweep is paused");
            }
            return;
        }
        self.read_only_logged.store(false, Ordering::Relaxed);

        let nodes: Vec<Arc<LogNode>> = match self.nodes.lock() {
            Ok(nodes) => nodes.values().cloned().collect(),
            Err(_) => {
                error!("WAL registry lock poisoned, skipping force-sync sweep");
                return;
            }
        };
        for node in nodes {
            if let Err(err) = node.force_sync() {
                error!("Cannot force-sync WAL node {}: {}", node.identifier(), err);
            }
        }
    }

    /// Sleeps for the given duration. Returns false if the manager shut
    /// down during the sleep.
    fn sleep(&self, duration: Duration) -> bool {
        matches!(self.shutdown_rx.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Instant;

    fn options(dir: &std::path::Path) -> Options {
        Options {
            dir: dir.to_path_buf(),
            enabled: true,
            force_period: Duration::from_millis(10),
            buffer_sleep_interval: Duration::from_millis(10),
            buffer_reject_threshold: Duration::from_millis(30),
        }
    }

    fn setup() -> (WalManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = WalManager::new(options(dir.path()));
        (manager, dir)
    }

    fn pool() -> impl Fn() -> Option<Vec<Buffer>> {
        || Some(vec![Buffer::with_capacity(64), Buffer::with_capacity(64)])
    }

    fn segment(dir: &std::path::Path, identifier: &str) -> Vec<u8> {
        std::fs::read(dir.join(identifier).join("wal.log")).unwrap_or_default()
    }

    #[test]
    fn get_node_returns_the_unique_instance() -> Result<()> {
        let (manager, _dir) = setup();
        let a = manager.get_node("g1", &pool())?;
        let b = manager.get_node("g1", &pool())?;
        assert!(Arc::ptr_eq(&a, &b));

        let c = manager.get_node("g2", &pool())?;
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(manager.node_count(), 2);
        Ok(())
    }

    #[test]
    fn admission_rejects_then_registers_cleanly() -> Result<()> {
        let (manager, _dir) = setup();

        let started = Instant::now();
        let result = manager.get_node("g1", &|| None);
        assert_eq!(result.err(), Some(Error::BufferExhausted));
        assert!(started.elapsed() >= Duration::from_millis(30));

        // The rejected identifier left no trace; a healthy pool succeeds.
        assert_eq!(manager.node_count(), 0);
        manager.get_node("g1", &pool())?;
        assert_eq!(manager.node_count(), 1);
        Ok(())
    }

    #[test]
    fn admission_retries_until_pool_recovers() -> Result<()> {
        let (manager, _dir) = setup();
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let supplier = || {
            // Unavailable on the first two attempts.
            if attempts.fetch_add(1, Ordering::Relaxed) < 2 {
                None
            } else {
                Some(vec![Buffer::with_capacity(64)])
            }
        };
        manager.get_node("g1", &supplier)?;
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
        Ok(())
    }

    #[test]
    fn delete_node_returns_buffers() -> Result<()> {
        let (manager, _dir) = setup();
        manager.get_node("g1", &pool())?;

        let mut returned = Vec::new();
        manager.delete_node("g1", &mut |buffers| returned.extend(buffers))?;
        assert_eq!(returned.len(), 2);
        assert_eq!(manager.node_count(), 0);

        // Deleting an absent identifier is a no-op.
        let mut called = false;
        manager.delete_node("g1", &mut |_| called = true)?;
        assert!(!called);
        Ok(())
    }

    #[test]
    fn close_clears_the_registry() -> Result<()> {
        let (manager, dir) = setup();
        let node = manager.get_node("g1", &pool())?;
        node.append(b"payload")?;
        manager.close();

        assert_eq!(manager.node_count(), 0);
        // Closing flushed the pending record.
        assert!(!segment(dir.path(), "g1").is_empty());
        // The identifier can be registered anew.
        manager.get_node("g1", &pool())?;
        Ok(())
    }

    #[test]
    fn force_task_skips_while_read_only() -> Result<()> {
        let (manager, dir) = setup();
        let node = manager.get_node("g1", &pool())?;
        node.append(b"payload")?;

        manager.set_read_only(true);
        manager.force_task();
        manager.force_task();
        assert!(segment(dir.path(), "g1").is_empty());

        manager.set_read_only(false);
        manager.force_task();
        assert!(!segment(dir.path(), "g1").is_empty());
        Ok(())
    }

    #[test]
    fn scheduled_force_sync_flushes() -> Result<()> {
        let (manager, dir) = setup();
        manager.start()?;
        let node = manager.get_node("g1", &pool())?;
        node.append(b"payload")?;

        // The sweep runs every 10ms; give it a few rounds.
        std::thread::sleep(Duration::from_millis(100));
        assert!(!segment(dir.path(), "g1").is_empty());

        manager.stop();
        assert_eq!(manager.node_count(), 0);
        Ok(())
    }

    #[test]
    fn stopped_manager_cancels_admission_waits() -> Result<()> {
        let (manager, _dir) = setup();
        manager.start()?;
        manager.stop();

        let started = Instant::now();
        let result = manager.get_node("g1", &|| None);
        assert_eq!(result.err(), Some(Error::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(30));
        assert_eq!(manager.node_count(), 0);
        Ok(())
    }

    #[test]
    fn disabled_wal_is_inert() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = WalManager::new(Options { enabled: false, ..options(dir.path()) });
        manager.start()?;
        assert!(manager.force_handle.lock()?.is_none());
        manager.stop();
        Ok(())
    }
}
