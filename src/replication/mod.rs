//! Replication status
//!
//! Connectivity and replication health of a node, as seen by the health
//! monitor. The database-specific queries live behind [`ReplicationSource`].

mod postgres;

pub use postgres::PgReplicationSource;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::{Node, NodeId, NodeType};
use crate::state::CoordinationSnapshot;

/// Write-ahead log position
pub type Lsn = u64;

/// Parse the textual `X/Y` form; `None` if malformed
pub fn parse_lsn(s: &str) -> Option<Lsn> {
    let (high, low) = s.trim().split_once('/')?;
    let high = u32::from_str_radix(high, 16).ok()?;
    let low = u32::from_str_radix(low, 16).ok()?;
    Some((u64::from(high) << 32) | u64::from(low))
}

pub fn format_lsn(lsn: Lsn) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// Seconds of replay lag: zero when everything received has been
/// replayed, otherwise the age of the last replayed transaction
pub fn replication_lag(
    receive_lsn: Lsn,
    replay_lsn: Lsn,
    last_xact_replay: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> i64 {
    if receive_lsn == replay_lsn {
        return 0;
    }
    match last_xact_replay {
        Some(ts) => (now - ts).num_seconds().max(0),
        None => 0,
    }
}

/// Ephemeral replication status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub in_recovery: bool,
    pub last_wal_receive_lsn: Lsn,
    pub last_wal_replay_lsn: Lsn,
    /// Seconds
    pub replication_lag_time: i64,
    pub wal_replay_paused: bool,
    pub receiving_streamed_wal: bool,
    /// Seconds since the upstream was last seen, -1 if never
    pub upstream_last_seen: i64,
    pub upstream_node_id: Option<NodeId>,
}

impl Default for ReplicationStatus {
    fn default() -> Self {
        Self {
            in_recovery: false,
            last_wal_receive_lsn: 0,
            last_wal_replay_lsn: 0,
            replication_lag_time: 0,
            wal_replay_paused: false,
            receiving_streamed_wal: true,
            upstream_last_seen: -1,
            upstream_node_id: None,
        }
    }
}

impl ReplicationStatus {
    /// Fill the upstream fields from the coordination block. A node that
    /// is not in recovery reports no upstream.
    pub fn with_coordination(mut self, snapshot: &CoordinationSnapshot) -> Self {
        if self.in_recovery {
            self.upstream_last_seen = snapshot.upstream_last_seen;
            self.upstream_node_id = snapshot.upstream_node_id;
        } else {
            self.upstream_last_seen = -1;
            self.upstream_node_id = None;
        }
        self
    }
}

/// WAL sender and physical slot usage on a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStats {
    pub max_wal_senders: i64,
    pub attached_wal_receivers: i64,
    pub max_replication_slots: i64,
    pub total_replication_slots: i64,
    pub active_replication_slots: i64,
    pub inactive_replication_slots: i64,
}

/// Reads connectivity and replication state from nodes
#[async_trait::async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Check that the node accepts connections
    async fn ping(&self, node: &Node) -> Result<()>;

    async fn replication_status(&self, node: &Node) -> Result<ReplicationStatus>;

    /// Whether the server is a standby replaying WAL
    async fn is_in_recovery(&self, node: &Node) -> Result<bool>;

    /// Names of downstream nodes currently streaming from `node`
    async fn attached_children(&self, node: &Node) -> Result<Vec<String>>;

    async fn slot_stats(&self, node: &Node) -> Result<SlotStats>;
}

/// Find a node that is actually running as primary.
///
/// Registry copies on standbys can lag behind a promotion, so the server
/// itself is asked. The node the records name as primary is tried first,
/// then every other active data node not in `exclude`.
pub async fn find_primary(
    source: &dyn ReplicationSource,
    nodes: &[Node],
    exclude: &[NodeId],
) -> Option<Node> {
    let mut candidates: Vec<&Node> = nodes
        .iter()
        .filter(|n| n.active && !n.is_witness() && !exclude.contains(&n.id))
        .collect();
    candidates.sort_by_key(|n| n.node_type != NodeType::Primary);

    for node in candidates {
        match source.is_in_recovery(node).await {
            Ok(false) => return Some(node.clone()),
            Ok(true) => {}
            Err(e) => tracing::debug!("node {} not reachable while looking for the primary: {}", node.id, e),
        }
    }
    None
}
