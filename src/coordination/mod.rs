//! Coordination
//!
//! Access to a node's coordination block, locally or over TCP. Each daemon
//! hosts its own block behind a [`CoordinationServer`]; peers reach it
//! through [`RemoteCoordination`], and the local daemon uses its
//! [`SharedState`] directly.

mod client;
mod protocol;
mod server;

pub use client::{CoordinationClient, RemoteCoordination};
pub use protocol::{ErrorCode, FrameHeader, Message};
pub use server::CoordinationServer;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::registry::{Node, NodeId};
use crate::state::{CandidateRank, CoordinationSnapshot, FollowTarget, SharedState, VoteReply};

/// Operations on one node's coordination block
#[async_trait::async_trait]
pub trait Coordination: Send + Sync {
    /// Establish the local node id; later calls are ignored
    async fn set_local_node_id(&self, node_id: NodeId) -> Result<()>;

    async fn get_local_node_id(&self) -> Result<Option<NodeId>>;

    /// Record successful contact with the upstream now
    async fn set_upstream_last_seen(&self, upstream_node_id: NodeId) -> Result<()>;

    /// Seconds since the upstream was last seen, or -1 if never
    async fn get_upstream_last_seen(&self) -> Result<i64>;

    async fn set_upstream_node_id(&self, node_id: NodeId) -> Result<()>;

    async fn get_upstream_node_id(&self) -> Result<Option<NodeId>>;

    /// Become a candidate in a new term. Returns the term, or `None` when
    /// the node may not stand (paused, or already backing a better nominee).
    async fn begin_candidacy(&self, rank: CandidateRank) -> Result<Option<u64>>;

    async fn current_term(&self) -> Result<u64>;

    async fn increment_current_term(&self) -> Result<u64>;

    /// Handle a candidature announcement from another node
    async fn other_node_is_candidate(&self, rank: CandidateRank, term: u64) -> Result<VoteReply>;

    /// Publish an election result to this node
    async fn notify_follow_primary(&self, target: FollowTarget) -> Result<()>;

    /// The published result, if one is pending
    async fn get_new_primary(&self) -> Result<Option<FollowTarget>>;

    async fn reset_voting_status(&self) -> Result<()>;

    async fn pause(&self, paused: bool) -> Result<()>;

    async fn is_paused(&self) -> Result<bool>;

    async fn snapshot(&self) -> Result<CoordinationSnapshot>;
}

/// Resolves a node record to a handle on its coordination block
pub trait PeerDirectory: Send + Sync {
    fn connect(&self, node: &Node) -> Arc<dyn Coordination>;
}

/// Peer directory reaching other nodes over TCP
pub struct RpcPeers {
    local_node_id: NodeId,
    local: Arc<SharedState>,
    client: Arc<CoordinationClient>,
}

impl RpcPeers {
    pub fn new(local_node_id: NodeId, local: Arc<SharedState>, client: Arc<CoordinationClient>) -> Self {
        Self {
            local_node_id,
            local,
            client,
        }
    }
}

impl PeerDirectory for RpcPeers {
    fn connect(&self, node: &Node) -> Arc<dyn Coordination> {
        if node.id == self.local_node_id {
            return self.local.clone();
        }
        Arc::new(RemoteCoordination::new(self.client.clone(), node.control_address.clone()))
    }
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Network(format!("Frame of {} bytes exceeds limit", header.length)));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    Ok(Message::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_checksum_mismatch() {
        let message = Message::GetNewPrimary;
        let mut buf = Vec::new();
        write_message(&mut buf, &message).await.unwrap();

        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let mut reader = buf.as_slice();
        assert!(matches!(read_message(&mut reader).await, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::Snapshot).await.unwrap();
        buf.truncate(FrameHeader::SIZE - 2);

        let mut reader = buf.as_slice();
        assert!(matches!(read_message(&mut reader).await, Err(Error::Io(_))));
    }
}
