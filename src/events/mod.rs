//! Events
//!
//! Every transition of interest produces an [`EventRecord`]. The recorder
//! logs it, appends it to the local journal, copies it to the registry on a
//! best-effort basis and broadcasts it to in-process subscribers.

mod journal;

pub use journal::EventJournal;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::error::{Error, Result};
use crate::registry::{NodeId, NodeRegistry};

/// Kind of event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Upstream lost and failover handling started (or refused)
    StandbyFailover,
    /// This node promoted itself after winning an election
    FailoverPromote,
    /// This node now follows a new primary
    FailoverFollow,
    /// Failover was abandoned
    FailoverAborted,
    /// No winner within the rerun interval
    ElectionRerun,
    /// Another node won, or had already won, the electoral term
    ElectionLost,
    /// The candidate did not reach the required number of votes
    ElectionUndecided,
    UpstreamDisconnect,
    UpstreamReconnect,
    LocalDisconnect,
    LocalReconnect,
    /// More than one active primary observed
    SplitBrain,
    ChildNodeDisconnect,
    ChildNodeReconnect,
    ChildNodeNewConnect,
    ChildNodesDisconnectCommand,
    DaemonStart,
    DaemonShutdown,
    DaemonPause,
    DaemonUnpause,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StandbyFailover => "standby_failover",
            EventType::FailoverPromote => "repmgrd_failover_promote",
            EventType::FailoverFollow => "repmgrd_failover_follow",
            EventType::FailoverAborted => "repmgrd_failover_aborted",
            EventType::ElectionRerun => "repmgrd_election_rerun",
            EventType::ElectionLost => "repmgrd_election_lost",
            EventType::ElectionUndecided => "repmgrd_election_undecided",
            EventType::UpstreamDisconnect => "repmgrd_upstream_disconnect",
            EventType::UpstreamReconnect => "repmgrd_upstream_reconnect",
            EventType::LocalDisconnect => "repmgrd_local_disconnect",
            EventType::LocalReconnect => "repmgrd_local_reconnect",
            EventType::SplitBrain => "repmgrd_split_brain",
            EventType::ChildNodeDisconnect => "child_node_disconnect",
            EventType::ChildNodeReconnect => "child_node_reconnect",
            EventType::ChildNodeNewConnect => "child_node_new_connect",
            EventType::ChildNodesDisconnectCommand => "child_nodes_disconnect_command",
            EventType::DaemonStart => "repmgrd_start",
            EventType::DaemonShutdown => "repmgrd_shutdown",
            EventType::DaemonPause => "repmgrd_pause",
            EventType::DaemonUnpause => "repmgrd_unpause",
        }
    }

    const ALL: [EventType; 20] = [
        EventType::StandbyFailover,
        EventType::FailoverPromote,
        EventType::FailoverFollow,
        EventType::FailoverAborted,
        EventType::ElectionRerun,
        EventType::ElectionLost,
        EventType::ElectionUndecided,
        EventType::UpstreamDisconnect,
        EventType::UpstreamReconnect,
        EventType::LocalDisconnect,
        EventType::LocalReconnect,
        EventType::SplitBrain,
        EventType::ChildNodeDisconnect,
        EventType::ChildNodeReconnect,
        EventType::ChildNodeNewConnect,
        EventType::ChildNodesDisconnectCommand,
        EventType::DaemonStart,
        EventType::DaemonShutdown,
        EventType::DaemonPause,
        EventType::DaemonUnpause,
    ];
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::State(format!("unknown event type '{}'", s)))
    }
}

/// A recorded event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub node_id: NodeId,
    pub event_type: EventType,
    pub successful: bool,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(node_id: NodeId, event_type: EventType, successful: bool, details: impl Into<String>) -> Self {
        Self {
            node_id,
            event_type,
            successful,
            details: details.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Fans each event out to the log, the journal, the registry and subscribers
pub struct EventRecorder {
    registry: Arc<dyn NodeRegistry>,
    journal: Option<EventJournal>,
    recent: RwLock<VecDeque<EventRecord>>,
    capacity: usize,
    tx: broadcast::Sender<EventRecord>,
}

impl EventRecorder {
    pub fn new(registry: Arc<dyn NodeRegistry>, journal: Option<EventJournal>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            registry,
            journal,
            recent: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            tx,
        }
    }

    /// Record an event. Never fails; storage problems are logged.
    pub async fn record(&self, event: EventRecord) {
        match (event.event_type, event.successful) {
            (EventType::SplitBrain, _) => tracing::error!(
                "[{}] node {}: {}", event.event_type, event.node_id, event.details
            ),
            (_, true) => tracing::info!(
                "[{}] node {}: {}", event.event_type, event.node_id, event.details
            ),
            (_, false) => tracing::warn!(
                "[{}] node {}: {}", event.event_type, event.node_id, event.details
            ),
        }

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&event).await {
                tracing::warn!("Failed to journal event {}: {}", event.event_type, e);
            }
        }

        if let Err(e) = self.registry.record_event(&event).await {
            tracing::debug!("Event {} not written to registry: {}", event.event_type, e);
        }

        {
            let mut recent = self.recent.write().await;
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Shorthand for building and recording an event
    pub async fn emit(&self, node_id: NodeId, event_type: EventType, successful: bool, details: impl Into<String>) {
        self.record(EventRecord::new(node_id, event_type, successful, details)).await;
    }

    /// Subscribe to events recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }

    /// Recently recorded events, newest first
    pub async fn recent(&self, limit: usize) -> Vec<EventRecord> {
        self.recent.read().await.iter().rev().take(limit).cloned().collect()
    }

    /// Whether an event of this type has been recorded recently
    pub async fn has_recent(&self, event_type: EventType) -> bool {
        self.recent.read().await.iter().any(|e| e.event_type == event_type)
    }

    /// Events of one type recorded so far: the journal's total when one
    /// is configured, otherwise what the ring buffer still holds
    pub async fn count(&self, event_type: EventType) -> u64 {
        if let Some(journal) = &self.journal {
            match journal.count(event_type).await {
                Ok(count) => return count,
                Err(e) => tracing::warn!("Failed to count journalled {} events: {}", event_type, e),
            }
        }
        let recent = self.recent.read().await;
        recent.iter().filter(|e| e.event_type == event_type).count() as u64
    }
}
