//! Node Registry
//!
//! The authoritative record of known replication nodes. The failover core
//! never embeds SQL; it reads and writes node records through
//! [`NodeRegistry`].

mod postgres;

pub use postgres::PgRegistry;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::events::EventRecord;

/// Stable numeric node identifier. Always non-negative.
pub type NodeId = u32;

/// Role of a node in the replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Accepts writes; has no upstream
    Primary,
    /// Streams from an upstream node
    Standby,
    /// Takes part in voting bookkeeping, never replicates or leads
    Witness,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Primary => "primary",
            NodeType::Standby => "standby",
            NodeType::Witness => "witness",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(NodeType::Primary),
            "standby" => Ok(NodeType::Standby),
            "witness" => Ok(NodeType::Witness),
            other => Err(Error::Registry(format!("unknown node type '{}'", other))),
        }
    }
}

/// A replication participant as recorded in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeType,
    /// `None` for a primary
    pub upstream_node_id: Option<NodeId>,
    pub name: String,
    /// Database connection string
    pub conninfo: String,
    /// Address of the node's coordination server (host:port)
    pub control_address: String,
    pub repluser: String,
    pub slot_name: Option<String>,
    pub location: String,
    /// Failover preference, higher wins
    pub priority: i32,
    pub active: bool,
}

impl Node {
    /// Check that this record does not name itself as upstream
    pub fn validate(&self) -> Result<()> {
        if self.upstream_node_id == Some(self.id) {
            return Err(Error::InvalidUpstream(self.id));
        }
        if self.node_type == NodeType::Primary && self.upstream_node_id.is_some() {
            return Err(Error::Registry(format!(
                "primary node {} cannot have an upstream",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether this node may ever become a promotion candidate
    pub fn can_lead(&self) -> bool {
        self.node_type != NodeType::Witness && self.priority > 0
    }

    pub fn is_witness(&self) -> bool {
        self.node_type == NodeType::Witness
    }
}

/// Read/write access to node records
#[async_trait::async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Fetch a single node record
    async fn get_node(&self, id: NodeId) -> Result<Option<Node>>;

    /// Fetch all node records, active or not, ordered by id
    async fn get_all_nodes(&self) -> Result<Vec<Node>>;

    /// Fetch the active primary, if any
    async fn get_primary(&self) -> Result<Option<Node>>;

    /// Update a node's role, upstream and active flag in one statement
    async fn update_node_role(
        &self,
        id: NodeId,
        node_type: NodeType,
        upstream_node_id: Option<NodeId>,
        active: bool,
    ) -> Result<()>;

    /// Mark a node active or inactive
    async fn set_node_active(&self, id: NodeId, active: bool) -> Result<()>;

    /// Promote a node: deactivate every other active primary and mark this
    /// node as the active primary, as one transaction
    async fn promote_node(&self, id: NodeId) -> Result<()>;

    /// Persist an event record
    async fn record_event(&self, event: &EventRecord) -> Result<()>;
}

/// Reject an upstream assignment that points a node at itself
pub fn check_upstream(id: NodeId, upstream_node_id: Option<NodeId>) -> Result<()> {
    if upstream_node_id == Some(id) {
        return Err(Error::InvalidUpstream(id));
    }
    Ok(())
}

/// Active nodes that stream from `upstream_id`
pub fn children_of(nodes: &[Node], upstream_id: NodeId) -> Vec<Node> {
    nodes
        .iter()
        .filter(|n| n.active && n.upstream_node_id == Some(upstream_id))
        .cloned()
        .collect()
}

#[cfg(test)]
pub(crate) fn test_node(id: NodeId, node_type: NodeType, upstream: Option<NodeId>, priority: i32) -> Node {
    Node {
        id,
        node_type,
        upstream_node_id: upstream,
        name: format!("node{}", id),
        conninfo: format!("host=node{} dbname=repguard user=repguard", id),
        control_address: format!("127.0.0.1:{}", 17650 + id),
        repluser: "repguard".to_string(),
        slot_name: None,
        location: "default".to_string(),
        priority,
        active: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_validation() {
        let mut node = test_node(2, NodeType::Standby, Some(1), 100);
        assert!(node.validate().is_ok());

        node.upstream_node_id = Some(2);
        assert!(matches!(node.validate(), Err(Error::InvalidUpstream(2))));

        let mut primary = test_node(1, NodeType::Primary, None, 100);
        assert!(primary.validate().is_ok());
        primary.upstream_node_id = Some(3);
        assert!(primary.validate().is_err());
    }

    #[test]
    fn test_node_type_roundtrip_names() {
        for t in [NodeType::Primary, NodeType::Standby, NodeType::Witness] {
            assert_eq!(t.as_str().parse::<NodeType>().unwrap(), t);
        }
        assert!("leader".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_children_and_eligibility() {
        let mut inactive = test_node(4, NodeType::Standby, Some(1), 10);
        inactive.active = false;
        let nodes = vec![
            test_node(1, NodeType::Primary, None, 100),
            test_node(2, NodeType::Standby, Some(1), 50),
            test_node(3, NodeType::Witness, Some(1), 0),
            inactive,
        ];

        let children: Vec<NodeId> = children_of(&nodes, 1).iter().map(|n| n.id).collect();
        assert_eq!(children, vec![2, 3]);
        assert!(nodes[1].can_lead());
        assert!(!nodes[2].can_lead());
    }
}
