use super::{Index, Node, Term};
use crate::encoding;

use serde::{Deserialize, Serialize};

/// A leader's liveness broadcast. Doubles as the log-commit advance and as
/// the membership-maintenance channel: the leader uses the auxiliary flags
/// to collect follower identifiers and to feed the membership list to blind
/// nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub term: Term,
    /// The index of the leader's last committed log entry.
    pub commit_log_index: Index,
    pub leader: Node,
    /// Asks the target to report its identifier in the response.
    pub require_identifier: bool,
    /// Asks the target to discard its conflicting identifier and generate a
    /// new one.
    pub regenerate_identifier: bool,
    /// The full membership list, attached once the target is known to be
    /// blind and every member's identifier is known.
    pub node_set: Option<Vec<Node>>,
}

impl encoding::Value for HeartbeatRequest {}

/// A follower's reply to a heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Whether the heartbeat was accepted. A rejection carries the
    /// responder's higher term.
    pub accepted: bool,
    pub term: Term,
    /// The responder's identity with its identifier, reported when the
    /// leader asked for it.
    pub follower: Option<Node>,
    /// Set while the responder has not yet received the membership list.
    pub require_node_list: bool,
}

impl encoding::Value for HeartbeatResponse {}

/// A candidate's vote solicitation. Carries the candidate's log coordinates
/// so voters can refuse candidates with stale logs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElectionRequest {
    pub term: Term,
    pub last_log_term: Term,
    pub last_log_index: Index,
}

impl encoding::Value for ElectionRequest {}

/// A voter's reply. A refusal carries the voter's term, which steps the
/// candidate down when higher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElectionResponse {
    pub granted: bool,
    pub term: Term,
}

impl encoding::Value for ElectionResponse {}
