//! Failover Notifier
//!
//! Publishes an election result to every active node. Delivery is
//! best-effort: unreachable nodes are logged and skipped, and catch up later
//! by reading the registry.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;

use crate::coordination::PeerDirectory;
use crate::error::Result;
use crate::registry::{NodeId, NodeRegistry};
use crate::state::FollowTarget;

/// Which nodes received a notification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub delivered: Vec<NodeId>,
    pub failed: Vec<NodeId>,
}

pub struct FailoverNotifier {
    registry: Arc<dyn NodeRegistry>,
    peers: Arc<dyn PeerDirectory>,
    query_timeout: Duration,
}

impl FailoverNotifier {
    pub fn new(registry: Arc<dyn NodeRegistry>, peers: Arc<dyn PeerDirectory>, query_timeout: Duration) -> Self {
        Self {
            registry,
            peers,
            query_timeout,
        }
    }

    /// Send `target` to all active nodes except those in `skip`
    pub async fn notify_all(&self, target: FollowTarget, skip: &[NodeId]) -> Result<NotifyReport> {
        let nodes = self.registry.get_all_nodes().await?;
        let recipients: Vec<_> = nodes
            .into_iter()
            .filter(|n| n.active && !skip.contains(&n.id))
            .collect();

        tracing::info!("notifying {} node(s) of {}", recipients.len(), target);

        let sends = recipients.iter().map(|node| {
            let peer = self.peers.connect(node);
            async move {
                let result = timeout(self.query_timeout, peer.notify_follow_primary(target)).await;
                match result {
                    Ok(Ok(())) => (node.id, true),
                    Ok(Err(e)) => {
                        tracing::warn!("unable to notify node {} of {}: {}", node.id, target, e);
                        (node.id, false)
                    }
                    Err(_) => {
                        tracing::warn!("timed out notifying node {} of {}", node.id, target);
                        (node.id, false)
                    }
                }
            }
        });

        let mut report = NotifyReport::default();
        for (node_id, delivered) in join_all(sends).await {
            if delivered {
                report.delivered.push(node_id);
            } else {
                report.failed.push(node_id);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::Coordination;
    use crate::registry::{test_node, NodeType};
    use crate::testkit::Cluster;

    #[tokio::test]
    async fn test_partial_delivery() {
        let cluster = Cluster::new(vec![
            test_node(1, NodeType::Primary, None, 100),
            test_node(2, NodeType::Standby, Some(1), 50),
            test_node(3, NodeType::Standby, Some(1), 10),
            test_node(4, NodeType::Standby, Some(1), 10),
        ])
        .await;
        cluster.peers.set_unreachable(4, true).await;

        let notifier = FailoverNotifier::new(cluster.registry(2), cluster.peers.clone(), Duration::from_secs(1));
        let report = notifier.notify_all(FollowTarget::Node(2), &[1]).await.unwrap();

        assert_eq!(report.delivered, vec![2, 3]);
        assert_eq!(report.failed, vec![4]);
        assert_eq!(
            cluster.state(3).get_new_primary().await.unwrap(),
            Some(FollowTarget::Node(2))
        );
        assert_eq!(cluster.state(1).get_new_primary().await.unwrap(), None);
        assert_eq!(cluster.state(4).get_new_primary().await.unwrap(), None);
    }
}
