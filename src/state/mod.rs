//! Coordination State
//!
//! The per-node coordination block (local node id, pause flag, upstream
//! bookkeeping, electoral term and voting status) and the small value
//! types exchanged while voting.

pub mod liveness;
pub mod shared;
pub mod state_file;

pub use liveness::{LivenessProbe, ProcessProbe};
pub use shared::SharedState;
pub use state_file::{StateFile, StoredState};

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::registry::{Node, NodeId};

/// Raw value meaning "no node"
pub const UNKNOWN_NODE_ID: i64 = -1;

/// Raw value published to force every node to restart the election
pub const ELECTION_RERUN_NOTIFICATION: i64 = -2;

/// What a node has been told to do after an election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FollowTarget {
    /// Follow (or become, if it is the local node) this primary
    Node(NodeId),
    /// Discard the round and start over
    Rerun,
}

impl FollowTarget {
    /// Integer form used by the CLI and status output
    pub fn to_raw(self) -> i64 {
        match self {
            FollowTarget::Node(id) => i64::from(id),
            FollowTarget::Rerun => ELECTION_RERUN_NOTIFICATION,
        }
    }

    /// Parse the integer form; `None` for "unknown" or out-of-range values
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            ELECTION_RERUN_NOTIFICATION => Some(FollowTarget::Rerun),
            r if r >= 0 => NodeId::try_from(r).ok().map(FollowTarget::Node),
            _ => None,
        }
    }
}

impl std::fmt::Display for FollowTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FollowTarget::Node(id) => write!(f, "node {}", id),
            FollowTarget::Rerun => write!(f, "election rerun"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStatus {
    NoVote,
    Candidate,
    Voted,
}

impl std::fmt::Display for VotingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VotingStatus::NoVote => write!(f, "no vote"),
            VotingStatus::Candidate => write!(f, "candidate"),
            VotingStatus::Voted => write!(f, "voted"),
        }
    }
}

/// A candidate's standing within one electoral term.
///
/// Ordering is total: higher priority ranks higher, and on equal priority
/// the lower node id ranks higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateRank {
    pub node_id: NodeId,
    pub priority: i32,
}

impl CandidateRank {
    pub fn of(node: &Node) -> Self {
        Self {
            node_id: node.id,
            priority: node.priority,
        }
    }

    pub fn outranks(&self, other: &CandidateRank) -> bool {
        self > other
    }
}

impl Ord for CandidateRank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.node_id.cmp(&self.node_id))
    }
}

impl PartialOrd for CandidateRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Answer to a candidature announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReply {
    /// Whether the peer concedes to the candidate
    pub granted: bool,
    /// The peer's electoral term after handling the announcement
    pub term: u64,
    /// Who the peer currently backs, if anyone
    pub nominee: Option<CandidateRank>,
    pub upstream_node_id: Option<NodeId>,
    /// Seconds since the peer last saw its upstream, -1 if never
    pub upstream_last_seen: i64,
    /// Set on refusal when the term already has a primary: the peer itself
    /// if it runs as primary, otherwise the result it was told about
    pub primary: Option<NodeId>,
}

/// Point-in-time copy of a coordination block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationSnapshot {
    pub local_node_id: Option<NodeId>,
    pub paused: bool,
    pub upstream_node_id: Option<NodeId>,
    pub upstream_last_seen: i64,
    pub voting_status: VotingStatus,
    pub current_electoral_term: u64,
    pub candidate: Option<FollowTarget>,
    pub follow_new_primary: bool,
    pub daemon_pid: Option<u32>,
    pub daemon_running: bool,
}
