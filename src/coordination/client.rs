//! Coordination Client
//!
//! TCP client for calling peers' coordination servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::{read_message, write_message, Coordination, ErrorCode, Message};
use crate::error::{Error, Result};
use crate::registry::NodeId;
use crate::state::{CandidateRank, CoordinationSnapshot, FollowTarget, VoteReply};

/// Client for peer coordination servers, keeping one connection per peer
pub struct CoordinationClient {
    /// Connection pool: address -> connection
    pool: RwLock<HashMap<String, Arc<Mutex<TcpStream>>>>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl CoordinationClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a request to a peer and wait for its response
    pub async fn request(&self, address: &str, message: Message) -> Result<Message> {
        match timeout(self.request_timeout, self.request_inner(address, message)).await {
            Ok(result) => result,
            Err(_) => {
                // The pooled stream may hold a half-read response
                self.remove_connection(address).await;
                Err(Error::ConnectionTimeout(address.to_string()))
            }
        }
    }

    async fn request_inner(&self, address: &str, message: Message) -> Result<Message> {
        let pooled = self.pool.read().await.get(address).cloned();

        if let Some(entry) = pooled {
            let mut stream = entry.lock().await;
            let (mut reader, mut writer) = stream.split();

            if write_message(&mut writer, &message).await.is_ok() {
                if let Ok(response) = read_message(&mut reader).await {
                    return Ok(response);
                }
            }
            drop(stream);
            self.remove_connection(address).await;
        }

        let mut stream = self.connect(address).await?;
        let response = {
            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, &message).await?;
            read_message(&mut reader).await?
        };

        self.pool
            .write()
            .await
            .insert(address.to_string(), Arc::new(Mutex::new(stream)));

        Ok(response)
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    async fn remove_connection(&self, address: &str) {
        self.pool.write().await.remove(address);
    }

    /// Close all connections
    pub async fn close_all(&self) {
        self.pool.write().await.clear();
    }

    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}

/// A peer's coordination block, reached over TCP
pub struct RemoteCoordination {
    client: Arc<CoordinationClient>,
    address: String,
}

impl RemoteCoordination {
    pub fn new(client: Arc<CoordinationClient>, address: String) -> Self {
        Self { client, address }
    }

    async fn call(&self, message: Message) -> Result<Message> {
        match self.client.request(&self.address, message).await? {
            Message::Error { code, message } => Err(match code {
                ErrorCode::InvalidUpstream(node_id) => Error::InvalidUpstream(node_id),
                ErrorCode::NotInitialised => Error::NotInitialised,
                _ => Error::Protocol {
                    peer: self.address.clone(),
                    message,
                },
            }),
            response => Ok(response),
        }
    }

    fn unexpected(&self, response: Message) -> Error {
        Error::Protocol {
            peer: self.address.clone(),
            message: format!("unexpected {}", response.type_name()),
        }
    }

    async fn call_ack(&self, message: Message) -> Result<()> {
        match self.call(message).await? {
            Message::Ack => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    async fn call_node_id(&self, message: Message) -> Result<Option<NodeId>> {
        match self.call(message).await? {
            Message::NodeIdResponse { node_id } => Ok(node_id),
            other => Err(self.unexpected(other)),
        }
    }

    async fn call_term(&self, message: Message) -> Result<u64> {
        match self.call(message).await? {
            Message::TermResponse { term } => Ok(term),
            other => Err(self.unexpected(other)),
        }
    }
}

#[async_trait::async_trait]
impl Coordination for RemoteCoordination {
    async fn set_local_node_id(&self, node_id: NodeId) -> Result<()> {
        self.call_ack(Message::SetLocalNodeId { node_id }).await
    }

    async fn get_local_node_id(&self) -> Result<Option<NodeId>> {
        self.call_node_id(Message::GetLocalNodeId).await
    }

    async fn set_upstream_last_seen(&self, upstream_node_id: NodeId) -> Result<()> {
        self.call_ack(Message::SetUpstreamLastSeen { upstream_node_id }).await
    }

    async fn get_upstream_last_seen(&self) -> Result<i64> {
        match self.call(Message::GetUpstreamLastSeen).await? {
            Message::LastSeenResponse { seconds } => Ok(seconds),
            other => Err(self.unexpected(other)),
        }
    }

    async fn set_upstream_node_id(&self, node_id: NodeId) -> Result<()> {
        self.call_ack(Message::SetUpstreamNodeId { node_id }).await
    }

    async fn get_upstream_node_id(&self) -> Result<Option<NodeId>> {
        self.call_node_id(Message::GetUpstreamNodeId).await
    }

    async fn begin_candidacy(&self, rank: CandidateRank) -> Result<Option<u64>> {
        match self.call(Message::BeginCandidacy { rank }).await? {
            Message::CandidacyResponse { term } => Ok(term),
            other => Err(self.unexpected(other)),
        }
    }

    async fn current_term(&self) -> Result<u64> {
        self.call_term(Message::CurrentTerm).await
    }

    async fn increment_current_term(&self) -> Result<u64> {
        self.call_term(Message::IncrementCurrentTerm).await
    }

    async fn other_node_is_candidate(&self, rank: CandidateRank, term: u64) -> Result<VoteReply> {
        match self.call(Message::AnnounceCandidature { rank, term }).await? {
            Message::VoteResponse(reply) => Ok(reply),
            other => Err(self.unexpected(other)),
        }
    }

    async fn notify_follow_primary(&self, target: FollowTarget) -> Result<()> {
        self.call_ack(Message::NotifyFollowPrimary { target }).await
    }

    async fn get_new_primary(&self) -> Result<Option<FollowTarget>> {
        match self.call(Message::GetNewPrimary).await? {
            Message::NewPrimaryResponse { target } => Ok(target),
            other => Err(self.unexpected(other)),
        }
    }

    async fn reset_voting_status(&self) -> Result<()> {
        self.call_ack(Message::ResetVotingStatus).await
    }

    async fn pause(&self, paused: bool) -> Result<()> {
        self.call_ack(Message::Pause { paused }).await
    }

    async fn is_paused(&self) -> Result<bool> {
        match self.call(Message::IsPaused).await? {
            Message::PausedResponse { paused } => Ok(paused),
            other => Err(self.unexpected(other)),
        }
    }

    async fn snapshot(&self) -> Result<CoordinationSnapshot> {
        match self.call(Message::Snapshot).await? {
            Message::SnapshotResponse(snapshot) => Ok(snapshot),
            other => Err(self.unexpected(other)),
        }
    }
}
