use super::log::LogManager;
use super::message::{ElectionRequest, ElectionResponse, HeartbeatRequest, HeartbeatResponse};
use super::node::{Node, Role};
use super::transport::Transport;
use super::{Clock, Term};
use crate::error::Result;

use itertools::Itertools as _;
use log::{debug, error, info};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A point-in-time summary of the local node's consensus position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub role: Role,
    pub leader: Option<Node>,
    pub term: Term,
}

/// The consensus state of the local node, shared between the driver loop
/// and the reply handlers running on transport threads.
///
/// All term mutations are serialized under the term lock, and any state
/// transition that reads then writes the term holds it. The condition
/// variable on the term lock wakes an election coordinator when its quorum
/// is reached or its term is superseded. Lock order is term before inner;
/// the inner lock covers role, leader, and membership bookkeeping.
pub struct RaftState {
    log: Arc<dyn LogManager>,
    clock: Arc<dyn Clock>,
    term: Mutex<Term>,
    term_cond: Condvar,
    inner: Mutex<Inner>,
    /// When the last valid heartbeat arrived, in clock milliseconds.
    last_heartbeat: AtomicU64,
}

struct Inner {
    /// The local node's identity. The identifier can change when the leader
    /// reports a collision.
    node: Node,
    role: Role,
    leader: Option<Node>,
    /// The full membership list including the local node. Identifiers are
    /// recorded here as followers report them.
    members: Vec<Node>,
    /// Members told to regenerate a conflicting identifier on the next
    /// heartbeat.
    id_conflicts: HashSet<Node>,
    /// Members that have not yet received the membership list.
    blind: HashSet<Node>,
    /// Whether the local node itself still awaits the membership list.
    blind_self: bool,
}

/// The shared flags of one election round. The coordinator waits on the
/// term condvar; vote reply handlers decrement the counter and set the
/// flags.
pub(super) struct Election {
    term: Term,
    terminated: AtomicBool,
    valid: AtomicBool,
    /// Affirmative peer votes still needed; the candidate's own vote is
    /// implicit. At or below zero the election is valid.
    votes_needed: AtomicI64,
}

impl RaftState {
    /// Creates the consensus state for a node. An empty membership list
    /// marks the node blind: it starts alone and learns the membership from
    /// the leader's heartbeats. The node generates a random identifier if
    /// it has none yet.
    pub fn new(
        node: Node,
        members: Vec<Node>,
        log: Arc<dyn LogManager>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let mut node = node;
        if node.identifier.is_none() {
            node.identifier = Some(rand::thread_rng().gen());
        }
        let blind_self = members.is_empty();
        let mut members = if blind_self { vec![node.clone()] } else { members };
        if let Some(member) = members.iter_mut().find(|m| **m == node) {
            member.identifier = node.identifier;
        }
        let last_heartbeat = AtomicU64::new(clock.now_millis());
        Arc::new(Self {
            log,
            clock,
            term: Mutex::new(0),
            term_cond: Condvar::new(),
            inner: Mutex::new(Inner {
                node,
                role: Role::Elector,
                leader: None,
                members,
                id_conflicts: HashSet::new(),
                blind: HashSet::new(),
                blind_self,
            }),
            last_heartbeat,
        })
    }

    /// Returns the local node's identity.
    pub fn node(&self) -> Result<Node> {
        Ok(self.inner.lock()?.node.clone())
    }

    /// Returns the current role.
    pub fn role(&self) -> Result<Role> {
        Ok(self.inner.lock()?.role)
    }

    /// Returns the known leader, if any.
    pub fn leader(&self) -> Result<Option<Node>> {
        Ok(self.inner.lock()?.leader.clone())
    }

    /// Returns the current term.
    pub fn term(&self) -> Result<Term> {
        Ok(*self.term.lock()?)
    }

    /// Returns the known cluster membership, including the local node.
    pub fn members(&self) -> Result<Vec<Node>> {
        Ok(self.inner.lock()?.members.clone())
    }

    /// Returns the current role, leader, and term.
    pub fn status(&self) -> Result<Status> {
        let term = *self.term.lock()?;
        let inner = self.inner.lock()?;
        Ok(Status { role: inner.role, leader: inner.leader.clone(), term })
    }

    /// Milliseconds since the last valid heartbeat.
    pub(super) fn millis_since_heartbeat(&self) -> u64 {
        self.clock.now_millis().saturating_sub(self.last_heartbeat.load(Ordering::Relaxed))
    }

    /// Restarts the heartbeat staleness window, e.g. when leaving the
    /// elector state.
    pub(super) fn reset_heartbeat_time(&self) {
        self.last_heartbeat.store(self.clock.now_millis(), Ordering::Relaxed);
    }

    /// Gives up on the current leader and becomes an elector.
    pub(super) fn become_elector(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.role = Role::Elector;
        inner.leader = None;
        Ok(())
    }

    /// Builds the common part of a heartbeat sweep: the current term and
    /// commit index under the term lock, with the local node as leader.
    /// Returns None if the node is no longer leader.
    pub(super) fn base_heartbeat(&self) -> Result<Option<HeartbeatRequest>> {
        let term = self.term.lock()?;
        let inner = self.inner.lock()?;
        if inner.role != Role::Leader {
            return Ok(None);
        }
        Ok(Some(HeartbeatRequest {
            term: *term,
            commit_log_index: self.log.commit_log_index(),
            leader: inner.node.clone(),
            require_identifier: false,
            regenerate_identifier: false,
            node_set: None,
        }))
    }

    /// Specializes a heartbeat for one target: requires the identifier of
    /// targets whose identifier is unknown, tells conflicting targets to
    /// regenerate, and attaches the membership list for blind targets once
    /// every member's identifier is known. The blind flag is cleared
    /// optimistically; a target that misses the list asks again in its next
    /// response.
    pub(super) fn heartbeat_for(
        &self,
        base: &HeartbeatRequest,
        target: &Node,
    ) -> Result<HeartbeatRequest> {
        let mut req = base.clone();
        let mut inner = self.inner.lock()?;
        let identifier = inner.members.iter().find(|m| *m == target).and_then(|m| m.identifier);
        req.require_identifier = identifier.is_none();
        req.regenerate_identifier = inner.id_conflicts.contains(target);
        if inner.blind.contains(target) {
            if inner.members.iter().all(|m| m.identifier.is_some()) {
                debug!("Sending the membership list to {target}");
                req.node_set = Some(inner.members.clone());
                inner.blind.remove(target);
            } else {
                debug!("Membership list not ready for {target}, identifiers still missing");
            }
        }
        Ok(req)
    }

    /// Returns all peers (members except the local node), ordered by
    /// address for deterministic sweeps.
    pub(super) fn peers(&self) -> Result<Vec<Node>> {
        let inner = self.inner.lock()?;
        let node = inner.node.clone();
        Ok(inner
            .members
            .iter()
            .filter(|member| **member != node)
            .cloned()
            .sorted_by_key(|member| (member.host.clone(), member.port))
            .collect())
    }

    /// Handles an inbound heartbeat. Accepts any heartbeat at or above the
    /// current term: adopts the term, follows the sender, and stamps the
    /// staleness clock. Reports the local identifier when asked,
    /// regenerates it when told to, and installs an attached membership
    /// list while blind. Rejects stale terms with the current term.
    pub fn handle_heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let mut term = self.term.lock()?;
        if req.term < *term {
            debug!("Rejecting heartbeat from {} at stale term {}", req.leader, req.term);
            return Ok(HeartbeatResponse {
                accepted: false,
                term: *term,
                follower: None,
                require_node_list: false,
            });
        }
        *term = req.term;

        let mut inner = self.inner.lock()?;
        if inner.role != Role::Follower || inner.leader.as_ref() != Some(&req.leader) {
            info!("Following leader {} in term {}", req.leader, req.term);
        }
        inner.role = Role::Follower;
        inner.leader = Some(req.leader.clone());
        self.last_heartbeat.store(self.clock.now_millis(), Ordering::Relaxed);

        if req.regenerate_identifier {
            let identifier = rand::thread_rng().gen();
            info!("Regenerating conflicting node identifier, now {identifier}");
            inner.node.identifier = Some(identifier);
        }
        if let Some(node_set) = &req.node_set {
            if inner.blind_self {
                info!("Received the membership list with {} nodes", node_set.len());
                inner.members = node_set.clone();
                let node = inner.node.clone();
                if let Some(member) = inner.members.iter_mut().find(|m| **m == node) {
                    member.identifier = node.identifier;
                }
                inner.blind_self = false;
            }
        }

        let follower = (req.require_identifier || req.regenerate_identifier)
            .then(|| inner.node.clone());
        Ok(HeartbeatResponse {
            accepted: true,
            term: req.term,
            follower,
            require_node_list: inner.blind_self,
        })
    }

    /// Handles an inbound vote solicitation. A vote is granted only for a
    /// term above the current one and a candidate log at least as advanced
    /// as the local one. Granting (or merely observing the newer term of a
    /// log-stale candidate) adopts the term and demotes to leaderless
    /// follower. A rejection carries the current term.
    pub fn handle_election(&self, req: &ElectionRequest) -> Result<ElectionResponse> {
        let mut term = self.term.lock()?;
        if req.term <= *term {
            debug!("Rejecting vote request at term {} (current term {})", req.term, *term);
            return Ok(ElectionResponse { granted: false, term: *term });
        }

        let (last_term, last_index) = (self.log.last_log_term(), self.log.last_log_index());
        let granted = (req.last_log_term, req.last_log_index) >= (last_term, last_index);
        *term = req.term;
        let mut inner = self.inner.lock()?;
        inner.role = Role::Follower;
        inner.leader = None;
        if granted {
            info!("Granting vote in term {} election", req.term);
        } else {
            info!(
                "Refusing vote in term {} election, candidate log ({}, {}) behind ours ({}, {})",
                req.term, req.last_log_term, req.last_log_index, last_term, last_index
            );
        }
        Ok(ElectionResponse { granted, term: *term })
    }

    /// One election round. Under the term lock: increments the term, sends
    /// a vote request to every peer, and waits on the term condvar for up
    /// to the given timeout. On wake the round is terminated; if the quorum
    /// was reached in the meantime and the term was not superseded, the
    /// node assumes leadership and self-declares.
    pub(super) fn election_round(
        self: Arc<Self>,
        transport: &dyn Transport,
        timeout: Duration,
    ) -> Result<()> {
        let mut term = self.term.lock()?;
        *term += 1;
        let next_term = *term;
        let peers = self.peers()?;
        let quorum = ((peers.len() + 1) / 2) as i64;
        info!("Election {next_term} starts, quorum threshold {quorum}");

        let election = Arc::new(Election {
            term: next_term,
            terminated: AtomicBool::new(false),
            valid: AtomicBool::new(quorum <= 0),
            votes_needed: AtomicI64::new(quorum),
        });
        let request = ElectionRequest {
            term: next_term,
            last_log_term: self.log.last_log_term(),
            last_log_index: self.log.last_log_index(),
        };

        for peer in &peers {
            debug!("Requesting a vote from {peer}");
            let state = Arc::clone(&self);
            let election = Arc::clone(&election);
            let target = peer.clone();
            let handler = Box::new(move |result: Result<ElectionResponse>| match result {
                Ok(resp) => state.on_vote_response(&election, &resp),
                Err(err) => error!("Cannot get a vote from {target}: {err}"),
            });
            if let Err(err) = transport.start_election(peer, request.clone(), handler) {
                error!("Cannot request a vote from {peer}: {err}");
            }
        }

        // Handlers contend on the term lock, so they can only run once the
        // wait below releases it; a quorum reached before the wait is
        // caught by the valid flag.
        if !election.valid.load(Ordering::SeqCst) {
            debug!("Waiting {}ms for election {} to conclude", timeout.as_millis(), next_term);
            (term, _) = self.term_cond.wait_timeout(term, timeout)?;
        }
        election.terminated.store(true, Ordering::SeqCst);

        if election.valid.load(Ordering::SeqCst) && *term == next_term {
            info!("Election {next_term} accepted, becoming leader");
            let mut inner = self.inner.lock()?;
            inner.role = Role::Leader;
            inner.leader = Some(inner.node.clone());
        } else {
            info!("Election {next_term} was not accepted");
        }
        Ok(())
    }

    /// Handles a vote reply, on a transport thread. A reply with a higher
    /// term forces the node to step down even after the round terminated;
    /// otherwise stale replies are discarded. An affirmative vote
    /// decrements the quorum counter and, at zero, marks the election valid
    /// and wakes the coordinator.
    pub(super) fn on_vote_response(&self, election: &Election, resp: &ElectionResponse) {
        let Ok(mut term) = self.term.lock() else {
            error!("Term lock poisoned, dropping vote reply");
            return;
        };
        if resp.term > *term {
            info!("A vote reply reports higher term {}, stepping down", resp.term);
            *term = resp.term;
            if let Ok(mut inner) = self.inner.lock() {
                inner.role = Role::Follower;
                inner.leader = None;
            }
            self.term_cond.notify_all();
            return;
        }
        if election.terminated.load(Ordering::SeqCst) {
            debug!("Discarding stale vote reply for election {}", election.term);
            return;
        }
        if resp.granted {
            let remaining = election.votes_needed.fetch_sub(1, Ordering::SeqCst) - 1;
            debug!("Vote received, {} more needed in election {}", remaining.max(0), election.term);
            if remaining <= 0 {
                election.valid.store(true, Ordering::SeqCst);
                self.term_cond.notify_all();
            }
        }
    }

    /// Handles a heartbeat reply, on a transport thread. A rejection with a
    /// higher term steps the leader down. An accepted reply may carry the
    /// follower's identifier (recorded, with collision detection) and its
    /// request for the membership list.
    pub(super) fn on_heartbeat_response(&self, target: &Node, resp: &HeartbeatResponse) {
        let Ok(mut term) = self.term.lock() else {
            error!("Term lock poisoned, dropping heartbeat reply");
            return;
        };
        if !resp.accepted {
            if resp.term > *term {
                info!("Heartbeat to {} rejected with higher term {}, stepping down", target, resp.term);
                *term = resp.term;
                if let Ok(mut inner) = self.inner.lock() {
                    inner.role = Role::Follower;
                    inner.leader = None;
                }
                self.term_cond.notify_all();
            }
            return;
        }
        drop(term);

        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if resp.require_node_list {
            inner.blind.insert(target.clone());
        }
        if let Some(identifier) = resp.follower.as_ref().and_then(|f| f.identifier) {
            inner.register_identifier(target, identifier);
        }
    }
}

impl Inner {
    /// Records a follower's reported identifier. An identifier already held
    /// by a different member puts the reporter into the conflict set; a
    /// clean report resolves any previous conflict.
    fn register_identifier(&mut self, target: &Node, identifier: i32) {
        let taken =
            self.members.iter().any(|m| m.identifier == Some(identifier) && m != target);
        if taken {
            info!("Identifier {identifier} of {target} conflicts with another member");
            self.id_conflicts.insert(target.clone());
            return;
        }
        if let Some(member) = self.members.iter_mut().find(|m| *m == target) {
            member.identifier = Some(identifier);
        }
        if self.id_conflicts.remove(target) {
            debug!("Identifier conflict of {target} resolved with {identifier}");
        }
    }
}
