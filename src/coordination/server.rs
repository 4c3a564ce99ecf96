//! Coordination Server
//!
//! TCP server exposing the local coordination block to peers.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_message, write_message, Coordination, ErrorCode, Message};
use crate::error::{Error, Result};
use crate::state::SharedState;

/// Serves coordination requests against the local [`SharedState`]
pub struct CoordinationServer {
    /// Bind address
    bind_address: String,
    state: Arc<SharedState>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl CoordinationServer {
    pub fn new(bind_address: String, state: Arc<SharedState>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            state,
            shutdown: shutdown_tx,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Coordination server listening on {}", self.bind_address);
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let state = self.state.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), state).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Coordination server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn handle_connection(socket: TcpStream, peer_addr: String, state: Arc<SharedState>) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(request) => {
                tracing::trace!("Received {} from {}", request.type_name(), peer_addr);
                let response = dispatch(state.as_ref(), request).await;
                write_message(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}

/// Answer one request
pub(crate) async fn dispatch(state: &dyn Coordination, request: Message) -> Message {
    let result = match request {
        Message::SetLocalNodeId { node_id } => state.set_local_node_id(node_id).await.map(|_| Message::Ack),
        Message::GetLocalNodeId => state
            .get_local_node_id()
            .await
            .map(|node_id| Message::NodeIdResponse { node_id }),
        Message::SetUpstreamLastSeen { upstream_node_id } => state
            .set_upstream_last_seen(upstream_node_id)
            .await
            .map(|_| Message::Ack),
        Message::GetUpstreamLastSeen => state
            .get_upstream_last_seen()
            .await
            .map(|seconds| Message::LastSeenResponse { seconds }),
        Message::SetUpstreamNodeId { node_id } => {
            state.set_upstream_node_id(node_id).await.map(|_| Message::Ack)
        }
        Message::GetUpstreamNodeId => state
            .get_upstream_node_id()
            .await
            .map(|node_id| Message::NodeIdResponse { node_id }),
        Message::BeginCandidacy { rank } => state
            .begin_candidacy(rank)
            .await
            .map(|term| Message::CandidacyResponse { term }),
        Message::CurrentTerm => state.current_term().await.map(|term| Message::TermResponse { term }),
        Message::IncrementCurrentTerm => state
            .increment_current_term()
            .await
            .map(|term| Message::TermResponse { term }),
        Message::AnnounceCandidature { rank, term } => state
            .other_node_is_candidate(rank, term)
            .await
            .map(Message::VoteResponse),
        Message::NotifyFollowPrimary { target } => {
            state.notify_follow_primary(target).await.map(|_| Message::Ack)
        }
        Message::GetNewPrimary => state
            .get_new_primary()
            .await
            .map(|target| Message::NewPrimaryResponse { target }),
        Message::ResetVotingStatus => state.reset_voting_status().await.map(|_| Message::Ack),
        Message::Pause { paused } => state.pause(paused).await.map(|_| Message::Ack),
        Message::IsPaused => state.is_paused().await.map(|paused| Message::PausedResponse { paused }),
        Message::Snapshot => state.snapshot().await.map(Message::SnapshotResponse),
        other => {
            return Message::Error {
                code: ErrorCode::UnexpectedMessage,
                message: format!("{} is not a request", other.type_name()),
            }
        }
    };

    result.unwrap_or_else(|e| {
        let code = match e {
            Error::InvalidUpstream(node_id) => ErrorCode::InvalidUpstream(node_id),
            Error::NotInitialised => ErrorCode::NotInitialised,
            _ => ErrorCode::Internal,
        };
        Message::Error {
            code,
            message: e.to_string(),
        }
    })
}
