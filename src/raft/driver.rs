use super::node::Role;
use super::state::RaftState;
use super::transport::Transport;
use super::{
    CONNECTION_TIMEOUT, ELECTION_LEAST_TIMEOUT, ELECTION_RANDOM_TIMEOUT, HEARTBEAT_INTERVAL,
};
use crate::error::{Error, Result};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};
use rand::Rng as _;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Consensus timing options.
#[derive(Clone, Debug)]
pub struct Options {
    /// The interval between leader heartbeat sweeps.
    pub heartbeat_interval: Duration,
    /// The window without heartbeats after which a follower gives up on its
    /// leader, and the wait for one election round's votes.
    pub connection_timeout: Duration,
    /// The floor of the sleep between failed election rounds...
    pub election_least_timeout: Duration,
    /// ...plus a random amount below this bound.
    pub election_random_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            connection_timeout: CONNECTION_TIMEOUT,
            election_least_timeout: ELECTION_LEAST_TIMEOUT,
            election_random_timeout: ELECTION_RANDOM_TIMEOUT,
        }
    }
}

/// The consensus control loop. Depending on the node's current role it
/// broadcasts heartbeats (leader), watches for heartbeat staleness
/// (follower), or runs randomized-timeout elections (elector). Runs on its
/// own thread until stopped; every sleep is interruptible by shutdown.
pub struct Driver {
    state: Arc<RaftState>,
    transport: Arc<dyn Transport>,
    opts: Options,
    shutdown: Receiver<()>,
}

/// Stops the driver thread when dropped or explicitly via stop().
pub struct DriverHandle {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
}

impl DriverHandle {
    /// Signals the driver to exit and waits for it.
    pub fn stop(self) {
        drop(self.shutdown);
        if self.thread.join().is_err() {
            warn!("Consensus driver thread panicked");
        }
    }

    /// Blocks until the driver thread exits of its own accord, e.g. a
    /// server binary parking its main thread.
    pub fn join(self) {
        let Self { shutdown, thread } = self;
        if thread.join().is_err() {
            warn!("Consensus driver thread panicked");
        }
        drop(shutdown);
    }
}

impl Driver {
    /// Spawns the consensus driver thread for the given node state.
    pub fn spawn(
        state: Arc<RaftState>,
        transport: Arc<dyn Transport>,
        opts: Options,
    ) -> Result<DriverHandle> {
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);
        let driver = Driver { state, transport, opts, shutdown: shutdown_rx };
        let thread = std::thread::Builder::new()
            .name("consensus".into())
            .spawn(move || driver.run())
            .map_err(|err| Error::Startup(format!("cannot spawn consensus driver: {err}")))?;
        Ok(DriverHandle { shutdown: shutdown_tx, thread })
    }

    fn run(&self) {
        info!("Consensus driver starts");
        loop {
            let role = match self.state.role() {
                Ok(role) => role,
                Err(err) => {
                    error!("Consensus state unavailable: {err}");
                    break;
                }
            };
            let proceed = match role {
                Role::Leader => self.lead(),
                Role::Follower => self.follow(),
                Role::Elector => self.elect(),
            };
            match proceed {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => error!("Unexpected consensus error: {err}"),
            }
        }
        info!("Consensus driver exits");
    }

    /// One leader iteration: sweep heartbeats over all peers, then sleep
    /// for the heartbeat interval.
    fn lead(&self) -> Result<bool> {
        self.heartbeat_sweep()?;
        Ok(self.sleep(self.opts.heartbeat_interval))
    }

    /// Sends one heartbeat to every peer, in address order. Aborts the
    /// remaining sends if leadership is lost mid-sweep; per-target failures
    /// are logged and do not abort it.
    fn heartbeat_sweep(&self) -> Result<()> {
        let Some(base) = self.state.base_heartbeat()? else {
            return Ok(());
        };
        for peer in self.state.peers()? {
            if self.state.role()? != Role::Leader {
                return Ok(());
            }
            let req = self.state.heartbeat_for(&base, &peer)?;
            let state = Arc::clone(&self.state);
            let target = peer.clone();
            let handler = Box::new(move |result: Result<_>| match result {
                Ok(resp) => state.on_heartbeat_response(&target, &resp),
                Err(err) => warn!("Heartbeat to {target} failed: {err}"),
            });
            if let Err(err) = self.transport.send_heartbeat(&peer, req, handler) {
                warn!("Cannot send heartbeat to {peer}: {err}");
            }
        }
        Ok(())
    }

    /// One follower iteration: sleep for the connection timeout, then give
    /// up on the leader if no heartbeat arrived within it.
    fn follow(&self) -> Result<bool> {
        if !self.sleep(self.opts.connection_timeout) {
            return Ok(false);
        }
        if self.state.role()? == Role::Follower
            && self.state.millis_since_heartbeat() >= self.opts.connection_timeout.as_millis() as u64
        {
            match self.state.leader()? {
                Some(leader) => info!("The leader {leader} timed out, starting elections"),
                None => info!("No leader emerged in time, starting elections"),
            }
            self.state.become_elector()?;
        }
        Ok(true)
    }

    /// Runs election rounds until the node wins leadership or discovers a
    /// leader, sleeping a randomized backoff between failed rounds. On exit
    /// the heartbeat staleness window restarts, preventing an immediate
    /// re-election flap.
    fn elect(&self) -> Result<bool> {
        while self.state.role()? == Role::Elector {
            Arc::clone(&self.state)
                .election_round(self.transport.as_ref(), self.opts.connection_timeout)?;
            if self.state.role()? != Role::Elector {
                break;
            }
            let backoff = election_backoff(&self.opts);
            info!("Sleeping {}ms until the next election attempt", backoff.as_millis());
            if !self.sleep(backoff) {
                return Ok(false);
            }
        }
        self.state.reset_heartbeat_time();
        Ok(true)
    }

    /// Sleeps for the given duration. Returns false when shut down.
    fn sleep(&self, duration: Duration) -> bool {
        matches!(self.shutdown.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
    }
}

/// Draws a randomized backoff before the next election attempt.
fn election_backoff(opts: &Options) -> Duration {
    let random = opts.election_random_timeout.as_millis() as u64;
    let jitter = if random > 0 { rand::thread_rng().gen_range(0..random) } else { 0 };
    opts.election_least_timeout + Duration::from_millis(jitter)
}
