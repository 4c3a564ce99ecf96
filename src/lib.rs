//! repguard - Replication Failover Manager
//!
//! A per-node daemon that watches a streaming replication cluster and,
//! when the primary fails, coordinates with the daemons on the surviving
//! nodes to elect and promote exactly one standby.
//!
//! # Architecture
//!
//! Every node runs one daemon. Each daemon hosts its node's coordination
//! block (voting status, electoral term, pause flag, last upstream contact)
//! behind a small TCP server; elections are carried out by calling the
//! coordination blocks of the sibling nodes. The node registry, a table in
//! the cluster database, remains the authoritative record of roles.
//!
//! # Features
//!
//! - Upstream monitoring with reconnect budget and degraded mode
//! - Term-based elections with priority/id tie-break and pluggable consensus
//! - Best-effort notification fan-out with registry convergence
//! - Split-brain detection for a returning primary
//! - Child node monitoring on the primary
//! - Persistent pause state across restarts
//! - Local event journal, HTTP admin API and node checks

pub mod api;
pub mod check;
pub mod config;
pub mod coordination;
pub mod election;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod monitor;
pub mod notifier;
pub mod registry;
pub mod replication;
pub mod state;

#[cfg(test)]
mod testkit;

pub use config::RepguardConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::RepguardConfig;
    pub use crate::coordination::{Coordination, PeerDirectory};
    pub use crate::election::{ConsensusPolicy, ElectionCoordinator, ElectionOutcome};
    pub use crate::error::{Error, Result};
    pub use crate::monitor::{HealthMonitor, TickOutcome};
    pub use crate::registry::{Node, NodeId, NodeRegistry, NodeType};
    pub use crate::state::{FollowTarget, SharedState, VotingStatus};
}
