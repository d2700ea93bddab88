//! Multi-node cluster tests, wiring several consensus states over the
//! in-process channel transport.

use tidedb::error::Result;
use tidedb::raft::{
    Channel, Driver, DriverHandle, MemoryLog, Node, Options, RaftState, Role, Status, SystemClock,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snappy timings so elections settle quickly.
fn opts() -> Options {
    Options {
        heartbeat_interval: Duration::from_millis(20),
        connection_timeout: Duration::from_millis(100),
        election_least_timeout: Duration::from_millis(30),
        election_random_timeout: Duration::from_millis(30),
    }
}

struct Cluster {
    transport: Arc<Channel>,
    nodes: Vec<(Node, Arc<RaftState>, Option<DriverHandle>)>,
    /// The last observed term per node, for monotonicity checks.
    terms: HashMap<Node, u64>,
}

impl Cluster {
    /// Starts a cluster of the given size.
    fn start(size: usize) -> Result<Self> {
        let transport = Arc::new(Channel::new());
        let members: Vec<Node> =
            (0..size).map(|i| Node::new(&format!("node-{i}"), 6667)).collect();
        let mut nodes = Vec::new();
        for member in &members {
            let state = RaftState::new(
                member.clone(),
                members.clone(),
                Arc::new(MemoryLog::new()),
                Arc::new(SystemClock::new()),
            );
            transport.register(member, Arc::clone(&state))?;
            let handle = Driver::spawn(Arc::clone(&state), Arc::clone(&transport) as Arc<dyn tidedb::raft::Transport>, opts())?;
            nodes.push((member.clone(), state, Some(handle)));
        }
        Ok(Self { transport, nodes, terms: HashMap::new() })
    }

    /// Returns the statuses of all running nodes, asserting that no node's
    /// term ever regresses.
    fn statuses(&mut self) -> Result<Vec<(Node, Status)>> {
        let mut statuses = Vec::new();
        for (node, state, handle) in &self.nodes {
            if handle.is_none() {
                continue;
            }
            let status = state.status()?;
            let last = self.terms.insert(node.clone(), status.term).unwrap_or_default();
            assert!(status.term >= last, "term regressed on {node}: {last} -> {}", status.term);
            statuses.push((node.clone(), status));
        }
        Ok(statuses)
    }

    /// Waits until the running nodes agree on a single leader in a single
    /// term, and returns it with the term.
    fn wait_for_leader(&mut self) -> Result<(Node, u64)> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let statuses = self.statuses()?;
            let leaders: Vec<_> =
                statuses.iter().filter(|(_, s)| s.role == Role::Leader).collect();
            if let [(leader, status)] = leaders[..] {
                let settled = statuses.iter().all(|(_, s)| {
                    s.term == status.term && (s.role == Role::Leader || s.leader == Some(leader.clone()))
                });
                if settled {
                    return Ok((leader.clone(), status.term));
                }
            }
            assert!(
                Instant::now() < deadline,
                "no stable leader emerged, statuses: {statuses:?}"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Stops the given node's driver and disconnects it from the cluster.
    fn stop(&mut self, node: &Node) -> Result<()> {
        self.transport.deregister(node)?;
        for (member, _, handle) in &mut self.nodes {
            if member == node {
                if let Some(handle) = handle.take() {
                    handle.stop();
                }
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        for (_, _, handle) in &mut self.nodes {
            if let Some(handle) = handle.take() {
                handle.stop();
            }
        }
    }
}

#[test]
fn three_nodes_elect_a_single_leader() -> Result<()> {
    let mut cluster = Cluster::start(3)?;
    let (leader, term) = cluster.wait_for_leader()?;
    assert!(term >= 1);
    assert!(cluster.nodes.iter().any(|(node, _, _)| *node == leader));

    // A later sample still agrees on a single leader, and no term
    // regressed anywhere in the meantime.
    std::thread::sleep(Duration::from_millis(200));
    let (_, still_term) = cluster.wait_for_leader()?;
    assert!(still_term >= term);

    cluster.shutdown();
    Ok(())
}

#[test]
fn killing_the_leader_triggers_failover() -> Result<()> {
    let mut cluster = Cluster::start(3)?;
    let (old_leader, old_term) = cluster.wait_for_leader()?;

    cluster.stop(&old_leader)?;
    let (new_leader, new_term) = cluster.wait_for_leader()?;
    assert_ne!(new_leader, old_leader);
    assert!(new_term > old_term, "failover must raise the term");

    cluster.shutdown();
    Ok(())
}

#[test]
fn blind_node_learns_the_membership_from_the_leader() -> Result<()> {
    // Nodes 0 and 1 know the full three-member cluster; node 2 starts
    // blind with an empty membership list and only discovers the others
    // through the leader's heartbeats.
    let transport = Arc::new(Channel::new());
    let members: Vec<Node> = (0..3).map(|i| Node::new(&format!("node-{i}"), 6667)).collect();
    let mut states = Vec::new();
    let mut handles = Vec::new();
    for (i, member) in members.iter().enumerate() {
        let known = if i == 2 { Vec::new() } else { members.clone() };
        let state = RaftState::new(
            member.clone(),
            known,
            Arc::new(MemoryLog::new()),
            Arc::new(SystemClock::new()),
        );
        transport.register(member, Arc::clone(&state))?;
        handles.push(Driver::spawn(Arc::clone(&state), Arc::clone(&transport) as Arc<dyn tidedb::raft::Transport>, opts())?);
        states.push(state);
    }

    // The blind node ends up following the leader with the full membership
    // list installed, every identifier known.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let membership = states[2].members()?;
        if membership.len() == 3 && membership.iter().all(|m| m.identifier.is_some()) {
            break;
        }
        assert!(Instant::now() < deadline, "blind node never got the membership: {membership:?}");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(states[2].role()?, Role::Follower);
    assert!(states[2].leader()?.is_some());

    for handle in handles {
        handle.stop();
    }
    Ok(())
}
