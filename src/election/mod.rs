//! Election
//!
//! Runs when a standby has lost its primary. The candidate announces itself
//! to every active sibling, catches up when a sibling reports a higher
//! term, and publishes itself as the new primary once the consensus policy
//! is satisfied. A sibling that names a primary other than the failed one
//! ends the campaign: that term already has a result.
//!
//! Ordering between candidates: the higher term wins; within a term the
//! higher priority wins, and equal priorities go to the lower node id.

mod consensus;

pub use consensus::{ConsensusPolicy, Tally};

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::time::{timeout, Instant};

use crate::coordination::{Coordination, PeerDirectory};
use crate::error::Result;
use crate::notifier::FailoverNotifier;
use crate::registry::{Node, NodeId, NodeRegistry};
use crate::state::{CandidateRank, FollowTarget, VoteReply, VotingStatus};

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Bound on every peer call
    pub async_query_timeout: Duration,
    /// How long to wait for a result before forcing a rerun
    pub election_rerun_interval: Duration,
    /// Abort while a sibling still sees the failed primary
    pub primary_visibility_consensus: bool,
    /// A sibling that saw the primary this recently counts as seeing it
    pub visibility_window_secs: i64,
    pub consensus: ConsensusPolicy,
    /// Bound on stale-term retries within one election
    pub max_term_catchup: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            async_query_timeout: Duration::from_secs(60),
            election_rerun_interval: Duration::from_secs(15),
            primary_visibility_consensus: false,
            visibility_window_secs: 60,
            consensus: ConsensusPolicy::None,
            max_term_catchup: 16,
        }
    }
}

/// How an election ended for the local node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This node won and published itself
    Won { term: u64, votes: usize },
    /// Another node is better placed
    Lost { term: u64, winner: Option<NodeId> },
    /// Not enough votes, no better candidate known
    Undecided { term: u64, votes: usize, required: usize },
    /// A sibling still sees the failed primary
    PrimaryVisible { term: u64, seen_by: NodeId },
    /// The term already has a primary; the local node now follows it
    Superseded { term: u64, primary: NodeId },
    /// The node could not stand (paused or already backing a better candidate)
    Declined,
}

/// Drives elections for the local node
pub struct ElectionCoordinator {
    local: Node,
    state: Arc<dyn Coordination>,
    registry: Arc<dyn NodeRegistry>,
    peers: Arc<dyn PeerDirectory>,
    notifier: Arc<FailoverNotifier>,
    config: ElectionConfig,
}

impl ElectionCoordinator {
    pub fn new(
        local: Node,
        state: Arc<dyn Coordination>,
        registry: Arc<dyn NodeRegistry>,
        peers: Arc<dyn PeerDirectory>,
        notifier: Arc<FailoverNotifier>,
        config: ElectionConfig,
    ) -> Self {
        Self {
            local,
            state,
            registry,
            peers,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    fn rank(&self) -> CandidateRank {
        CandidateRank::of(&self.local)
    }

    /// Stand for election after `failed_primary` became unreachable
    pub async fn run(&self, failed_primary: NodeId) -> Result<ElectionOutcome> {
        match self.begin().await? {
            Some(term) => self.campaign(term, failed_primary).await,
            None => Ok(ElectionOutcome::Declined),
        }
    }

    /// Enter the candidate state; `None` if the node may not stand
    pub async fn begin(&self) -> Result<Option<u64>> {
        let term = self.state.begin_candidacy(self.rank()).await?;
        match term {
            Some(term) => tracing::info!(
                "node {} is a candidate in electoral term {} (priority {})",
                self.local.id, term, self.local.priority
            ),
            None => tracing::info!("node {} not standing for election", self.local.id),
        }
        Ok(term)
    }

    /// Canvass the siblings for `term` and publish the result if won
    pub async fn campaign(&self, term: u64, failed_primary: NodeId) -> Result<ElectionOutcome> {
        let rank = self.rank();
        let siblings: Vec<Node> = self
            .registry
            .get_all_nodes()
            .await?
            .into_iter()
            .filter(|n| n.active && n.id != self.local.id && n.id != failed_primary)
            .collect();
        let electorate = siblings.len() + 1;

        let mut term = term;
        let mut catchups = 0;

        loop {
            let replies = self.announce_candidature(&siblings, term).await;

            if self.config.primary_visibility_consensus {
                if let Some(seen_by) = self.primary_seen_by(&replies, failed_primary) {
                    tracing::warn!(
                        "node {} can still see primary {}; not promoting",
                        seen_by, failed_primary
                    );
                    return Ok(ElectionOutcome::PrimaryVisible { term, seen_by });
                }
            }

            let mut tally = Tally {
                electorate,
                reachable: 1,
                granted: 1,
            };
            let mut higher_term: Option<u64> = None;
            let mut better: Option<CandidateRank> = None;
            let mut settled: Option<NodeId> = None;

            for (node_id, reply) in &replies {
                let Some(reply) = reply else { continue };
                tally.reachable += 1;

                if reply.granted {
                    tracing::debug!("node {} voted for node {} in term {}", node_id, rank.node_id, term);
                    tally.granted += 1;
                } else if let Some(primary) = reply
                    .primary
                    .filter(|p| *p != rank.node_id && *p != failed_primary)
                {
                    tracing::info!("node {} reports node {} as primary", node_id, primary);
                    settled = Some(primary);
                } else if reply.term > term {
                    higher_term = higher_term.max(Some(reply.term));
                } else if let Some(nominee) = reply.nominee.filter(|n| n.outranks(&rank)) {
                    better = better.max(Some(nominee));
                }
            }

            if let Some(primary) = settled {
                return self.stand_down(term, primary).await;
            }

            if let Some(nominee) = better {
                tracing::info!(
                    "node {} (priority {}) outranks node {} in term {}",
                    nominee.node_id, nominee.priority, rank.node_id, term
                );
                return Ok(ElectionOutcome::Lost {
                    term,
                    winner: Some(nominee.node_id),
                });
            }

            if !self.still_candidate(term).await? {
                return self.conceded(term).await;
            }

            if let Some(peer_term) = higher_term {
                if catchups >= self.config.max_term_catchup {
                    tracing::warn!("giving up catching up with electoral term {}", peer_term);
                    let required = self.config.consensus.required_votes(tally.electorate, tally.reachable);
                    return Ok(ElectionOutcome::Undecided {
                        term,
                        votes: tally.granted,
                        required,
                    });
                }

                let mut current = term;
                while current <= peer_term {
                    current = self.state.increment_current_term().await?;
                }
                tracing::info!(
                    "electoral term {} is stale, sibling reports {}; retrying in term {}",
                    term, peer_term, current
                );
                term = current;
                catchups += 1;
                continue;
            }

            if !self.config.consensus.is_satisfied(&tally) {
                let required = self.config.consensus.required_votes(tally.electorate, tally.reachable);
                tracing::warn!(
                    "node {} has {} of {} required votes in term {} ({} consensus)",
                    rank.node_id, tally.granted, required, term, self.config.consensus
                );
                return Ok(ElectionOutcome::Undecided {
                    term,
                    votes: tally.granted,
                    required,
                });
            }

            tracing::info!(
                "node {} won electoral term {} with {} of {} votes",
                rank.node_id, term, tally.granted, tally.electorate
            );
            self.notifier
                .notify_all(FollowTarget::Node(rank.node_id), &[failed_primary])
                .await?;

            return Ok(ElectionOutcome::Won {
                term,
                votes: tally.granted,
            });
        }
    }

    /// Ask each sibling whether it concedes; an unreachable sibling abstains
    pub async fn announce_candidature(&self, siblings: &[Node], term: u64) -> Vec<(NodeId, Option<VoteReply>)> {
        let rank = self.rank();
        let calls = siblings.iter().map(|node| {
            let peer = self.peers.connect(node);
            async move {
                let reply = match timeout(
                    self.config.async_query_timeout,
                    peer.other_node_is_candidate(rank, term),
                )
                .await
                {
                    Ok(Ok(reply)) => Some(reply),
                    Ok(Err(e)) => {
                        tracing::warn!("node {} did not answer candidature: {}", node.id, e);
                        None
                    }
                    Err(_) => {
                        tracing::warn!("node {} timed out answering candidature", node.id);
                        None
                    }
                };
                (node.id, reply)
            }
        });

        join_all(calls).await
    }

    fn primary_seen_by(&self, replies: &[(NodeId, Option<VoteReply>)], failed_primary: NodeId) -> Option<NodeId> {
        replies.iter().find_map(|(node_id, reply)| {
            let reply = reply.as_ref()?;
            let sees = reply.upstream_node_id == Some(failed_primary)
                && reply.upstream_last_seen >= 0
                && reply.upstream_last_seen < self.config.visibility_window_secs;
            sees.then_some(*node_id)
        })
    }

    /// Whether the local block still backs this node in `term`
    async fn still_candidate(&self, term: u64) -> Result<bool> {
        let snapshot = self.state.snapshot().await?;
        Ok(snapshot.voting_status == VotingStatus::Candidate
            && snapshot.candidate == Some(FollowTarget::Node(self.local.id))
            && snapshot.current_electoral_term == term)
    }

    /// Record `primary` locally as the result of this round
    async fn stand_down(&self, term: u64, primary: NodeId) -> Result<ElectionOutcome> {
        tracing::info!(
            "node {} is already primary; node {} withdraws from electoral term {}",
            primary, self.local.id, term
        );
        self.state.notify_follow_primary(FollowTarget::Node(primary)).await?;
        Ok(ElectionOutcome::Superseded { term, primary })
    }

    async fn conceded(&self, term: u64) -> Result<ElectionOutcome> {
        let snapshot = self.state.snapshot().await?;
        let winner = match snapshot.candidate {
            Some(FollowTarget::Node(id)) if id != self.local.id => Some(id),
            _ => None,
        };
        tracing::info!(
            "node {} conceded during electoral term {} (now term {}, backing {:?})",
            self.local.id, term, snapshot.current_electoral_term, winner
        );
        Ok(ElectionOutcome::Lost {
            term: snapshot.current_electoral_term,
            winner,
        })
    }

    /// Poll the local block for a published result, up to `limit`
    pub async fn wait_for_result(&self, limit: Duration, poll: Duration) -> Result<Option<FollowTarget>> {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(target) = self.state.get_new_primary().await? {
                return Ok(Some(target));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Rerun interval with up to a quarter added at random, so that nodes
    /// that lost together do not all publish a rerun at once
    pub fn rerun_delay(&self) -> Duration {
        let base = self.config.election_rerun_interval;
        let max_jitter = u64::try_from(base.as_millis() / 4).unwrap_or(0);
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        base + Duration::from_millis(jitter)
    }

    /// Tell every node to discard the current round
    pub async fn publish_rerun(&self, failed_primary: NodeId) -> Result<()> {
        tracing::warn!("no election result; requesting an election rerun");
        let report = self
            .notifier
            .notify_all(FollowTarget::Rerun, &[failed_primary])
            .await?;
        if !report.failed.is_empty() {
            tracing::warn!("rerun not delivered to node(s) {:?}", report.failed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{test_node, NodeType};
    use crate::testkit::Cluster;
    use rand::seq::SliceRandom;

    fn three_nodes() -> Vec<Node> {
        vec![
            test_node(1, NodeType::Primary, None, 100),
            test_node(2, NodeType::Standby, Some(1), 50),
            test_node(3, NodeType::Standby, Some(1), 10),
        ]
    }

    #[tokio::test]
    async fn test_single_candidate_wins_and_notifies_everyone() {
        let cluster = Cluster::new(three_nodes()).await;
        cluster.peers.set_unreachable(1, true).await;

        let election = cluster.election(2, ElectionConfig::default());
        let outcome = election.run(1).await.unwrap();

        assert_eq!(outcome, ElectionOutcome::Won { term: 1, votes: 2 });
        for id in [2, 3] {
            assert_eq!(
                cluster.state(id).get_new_primary().await.unwrap(),
                Some(FollowTarget::Node(2))
            );
        }
    }

    #[tokio::test]
    async fn test_stale_term_catches_up() {
        let cluster = Cluster::new(vec![
            test_node(1, NodeType::Primary, None, 100),
            test_node(2, NodeType::Standby, Some(1), 50),
            test_node(3, NodeType::Standby, Some(1), 10),
            test_node(4, NodeType::Standby, Some(1), 10),
        ])
        .await;
        cluster.peers.set_unreachable(1, true).await;

        // Sibling 3 has seen term 2 in an earlier round
        for _ in 0..2 {
            cluster.state(3).increment_current_term().await.unwrap();
        }

        let election = cluster.election(2, ElectionConfig::default());
        let outcome = election.run(1).await.unwrap();

        assert_eq!(outcome, ElectionOutcome::Won { term: 3, votes: 3 });
        assert_eq!(cluster.state(2).current_term().await.unwrap(), 3);
        assert_eq!(cluster.state(3).current_term().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_paused_node_declines() {
        let cluster = Cluster::new(three_nodes()).await;
        cluster.state(2).pause(true).await.unwrap();

        let election = cluster.election(2, ElectionConfig::default());
        assert_eq!(election.run(1).await.unwrap(), ElectionOutcome::Declined);
        assert_eq!(cluster.state(2).current_term().await.unwrap(), 0);
        assert_eq!(cluster.state(3).get_new_primary().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lower_priority_loses() {
        let cluster = Cluster::new(three_nodes()).await;
        cluster.peers.set_unreachable(1, true).await;

        let high = cluster.election(2, ElectionConfig::default());
        let low = cluster.election(3, ElectionConfig::default());
        let t2 = high.begin().await.unwrap().unwrap();
        let t3 = low.begin().await.unwrap().unwrap();
        assert_eq!(t2, t3);

        let outcome = low.campaign(t3, 1).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::Lost { term: 1, winner: Some(2) });
    }

    #[tokio::test]
    async fn test_tie_break_is_deterministic_under_random_order() {
        let nodes = vec![
            test_node(1, NodeType::Primary, None, 100),
            test_node(2, NodeType::Standby, Some(1), 50),
            test_node(3, NodeType::Standby, Some(1), 50),
            test_node(4, NodeType::Standby, Some(1), 50),
            test_node(5, NodeType::Standby, Some(1), 10),
        ];

        for _ in 0..20 {
            let cluster = Cluster::new(nodes.clone()).await;
            cluster.peers.set_unreachable(1, true).await;
            cluster.peers.set_max_delay(Duration::from_millis(5));

            let mut candidates: Vec<NodeId> = vec![2, 3, 4, 5];
            candidates.shuffle(&mut rand::thread_rng());

            let elections: Vec<_> = candidates
                .iter()
                .map(|id| (*id, cluster.election(*id, ElectionConfig::default())))
                .collect();

            let mut terms = Vec::new();
            for (_, election) in &elections {
                terms.push(election.begin().await.unwrap().unwrap());
            }

            let outcomes = join_all(
                elections
                    .iter()
                    .zip(terms)
                    .map(|((_, election), term)| election.campaign(term, 1)),
            )
            .await;

            let winners: Vec<NodeId> = elections
                .iter()
                .zip(&outcomes)
                .filter(|(_, o)| matches!(o, Ok(ElectionOutcome::Won { .. })))
                .map(|((id, _), _)| *id)
                .collect();
            assert_eq!(winners, vec![2], "order {:?}", candidates);

            for id in [3, 4, 5] {
                assert_eq!(
                    cluster.state(id).get_new_primary().await.unwrap(),
                    Some(FollowTarget::Node(2))
                );
            }
        }
    }

    #[tokio::test]
    async fn test_visibility_veto() {
        let cluster = Cluster::new(three_nodes()).await;
        cluster.peers.set_unreachable(1, true).await;
        // Sibling 3 still hears from the primary
        cluster.state(3).set_upstream_last_seen(1).await.unwrap();

        let config = ElectionConfig {
            primary_visibility_consensus: true,
            ..ElectionConfig::default()
        };
        let election = cluster.election(2, config);

        assert_eq!(
            election.run(1).await.unwrap(),
            ElectionOutcome::PrimaryVisible { term: 1, seen_by: 3 }
        );
        assert_eq!(cluster.state(3).get_new_primary().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_majority_policy_with_unreachable_sibling() {
        let cluster = Cluster::new(vec![
            test_node(1, NodeType::Primary, None, 100),
            test_node(2, NodeType::Standby, Some(1), 50),
            test_node(3, NodeType::Standby, Some(1), 10),
            test_node(4, NodeType::Standby, Some(1), 10),
        ])
        .await;
        cluster.peers.set_unreachable(1, true).await;
        cluster.peers.set_unreachable(3, true).await;
        cluster.peers.set_unreachable(4, true).await;

        let config = ElectionConfig {
            consensus: ConsensusPolicy::Majority,
            ..ElectionConfig::default()
        };
        let election = cluster.election(2, config);

        assert_eq!(
            election.run(1).await.unwrap(),
            ElectionOutcome::Undecided { term: 1, votes: 1, required: 2 }
        );
    }

    #[tokio::test]
    async fn test_late_candidate_cannot_reopen_settled_term() {
        let cluster = Cluster::new(vec![
            test_node(1, NodeType::Primary, None, 100),
            test_node(2, NodeType::Standby, Some(1), 50),
            test_node(3, NodeType::Standby, Some(1), 10),
            test_node(4, NodeType::Standby, Some(1), 90),
        ])
        .await;
        cluster.peers.set_unreachable(1, true).await;
        cluster.peers.set_unreachable(4, true).await;

        let outcome = cluster.election(2, ElectionConfig::default()).run(1).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::Won { term: 1, votes: 2 });

        // Node 2 has promoted and node 3 has acted on the result
        cluster.state(2).set_local_primary(true).await;
        cluster.state(2).reset_voting_status().await.unwrap();
        cluster.state(3).reset_voting_status().await.unwrap();

        // Node 4 missed the whole round and stands in the same term
        cluster.peers.set_unreachable(4, false).await;
        let outcome = cluster.election(4, ElectionConfig::default()).run(1).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::Superseded { term: 1, primary: 2 });

        assert_eq!(cluster.state(2).get_new_primary().await.unwrap(), None);
        assert_eq!(cluster.state(3).get_new_primary().await.unwrap(), None);
        assert_eq!(
            cluster.state(4).get_new_primary().await.unwrap(),
            Some(FollowTarget::Node(2))
        );
        assert_eq!(cluster.state(3).settled().await, Some((1, 2)));
    }

    #[tokio::test]
    async fn test_wait_for_result_and_rerun() {
        let cluster = Cluster::new(three_nodes()).await;
        cluster.peers.set_unreachable(1, true).await;

        let election = cluster.election(3, ElectionConfig {
            election_rerun_interval: Duration::from_millis(40),
            ..ElectionConfig::default()
        });
        let delay = election.rerun_delay();
        assert!(delay >= Duration::from_millis(40) && delay <= Duration::from_millis(50));

        let waited = election
            .wait_for_result(Duration::from_millis(30), Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(waited, None);

        election.publish_rerun(1).await.unwrap();
        assert_eq!(
            cluster.state(2).get_new_primary().await.unwrap(),
            Some(FollowTarget::Rerun)
        );
        assert_eq!(
            election
                .wait_for_result(Duration::from_millis(30), Duration::from_millis(5))
                .await
                .unwrap(),
            Some(FollowTarget::Rerun)
        );
    }
}
