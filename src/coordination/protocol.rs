//! Coordination Protocol
//!
//! Wire messages exchanged with a node's coordination server. Every request
//! gets exactly one response.

use serde::{Deserialize, Serialize};

use crate::registry::NodeId;
use crate::state::{CandidateRank, CoordinationSnapshot, FollowTarget, VoteReply};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Node identity ==========
    SetLocalNodeId {
        node_id: NodeId,
    },
    GetLocalNodeId,

    // ========== Upstream tracking ==========
    SetUpstreamLastSeen {
        upstream_node_id: NodeId,
    },
    GetUpstreamLastSeen,
    SetUpstreamNodeId {
        node_id: NodeId,
    },
    GetUpstreamNodeId,

    // ========== Voting ==========
    BeginCandidacy {
        rank: CandidateRank,
    },
    CurrentTerm,
    IncrementCurrentTerm,
    /// Candidature announcement
    AnnounceCandidature {
        rank: CandidateRank,
        term: u64,
    },
    NotifyFollowPrimary {
        target: FollowTarget,
    },
    GetNewPrimary,
    ResetVotingStatus,

    // ========== Daemon control ==========
    Pause {
        paused: bool,
    },
    IsPaused,
    Snapshot,

    // ========== Responses ==========
    Ack,
    NodeIdResponse {
        node_id: Option<NodeId>,
    },
    LastSeenResponse {
        seconds: i64,
    },
    CandidacyResponse {
        term: Option<u64>,
    },
    TermResponse {
        term: u64,
    },
    VoteResponse(VoteReply),
    NewPrimaryResponse {
        target: Option<FollowTarget>,
    },
    PausedResponse {
        paused: bool,
    },
    SnapshotResponse(CoordinationSnapshot),

    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes carried by [`Message::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Upstream would equal the local node id
    InvalidUpstream(NodeId),
    /// Local node id not established yet
    NotInitialised,
    /// Request the server does not answer
    UnexpectedMessage,
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::SetLocalNodeId { .. } => "SetLocalNodeId",
            Message::GetLocalNodeId => "GetLocalNodeId",
            Message::SetUpstreamLastSeen { .. } => "SetUpstreamLastSeen",
            Message::GetUpstreamLastSeen => "GetUpstreamLastSeen",
            Message::SetUpstreamNodeId { .. } => "SetUpstreamNodeId",
            Message::GetUpstreamNodeId => "GetUpstreamNodeId",
            Message::BeginCandidacy { .. } => "BeginCandidacy",
            Message::CurrentTerm => "CurrentTerm",
            Message::IncrementCurrentTerm => "IncrementCurrentTerm",
            Message::AnnounceCandidature { .. } => "AnnounceCandidature",
            Message::NotifyFollowPrimary { .. } => "NotifyFollowPrimary",
            Message::GetNewPrimary => "GetNewPrimary",
            Message::ResetVotingStatus => "ResetVotingStatus",
            Message::Pause { .. } => "Pause",
            Message::IsPaused => "IsPaused",
            Message::Snapshot => "Snapshot",
            Message::Ack => "Ack",
            Message::NodeIdResponse { .. } => "NodeIdResponse",
            Message::LastSeenResponse { .. } => "LastSeenResponse",
            Message::CandidacyResponse { .. } => "CandidacyResponse",
            Message::TermResponse { .. } => "TermResponse",
            Message::VoteResponse(_) => "VoteResponse",
            Message::NewPrimaryResponse { .. } => "NewPrimaryResponse",
            Message::PausedResponse { .. } => "PausedResponse",
            Message::SnapshotResponse(_) => "SnapshotResponse",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted from a peer
    pub const MAX_LENGTH: u32 = 1024 * 1024;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
