//! Health Monitor
//!
//! The daemon's main loop. Each tick it consumes any pending election
//! result, refreshes the local node record and then checks the node
//! according to its role:
//!
//! - standby: watch the upstream; when it stays unreachable, converge on a
//!   node already running as primary or stand for election
//! - primary: watch the local node, detect a second primary and track
//!   child nodes
//!
//! Which node runs as primary is asked of the servers themselves; the local
//! copy of the node records can predate a promotion.
//! - witness: watch the primary like a standby, but never stand

mod children;
mod rejoin;

pub use children::{ChildChange, ChildMonitorConfig, ChildTracker, Threshold};
pub use rejoin::{expand_placeholders, run_shell, CommandRejoin, RejoinAction};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;

use crate::coordination::{Coordination, PeerDirectory};
use crate::election::{ElectionConfig, ElectionCoordinator, ElectionOutcome};
use crate::error::{Error, Result};
use crate::events::{EventRecorder, EventType};
use crate::notifier::FailoverNotifier;
use crate::registry::{children_of, Node, NodeId, NodeRegistry, NodeType};
use crate::replication::{find_primary, ReplicationSource, ReplicationStatus};
use crate::state::{FollowTarget, SharedState, VotingStatus};

/// What a standby does when its primary disappears
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMode {
    #[default]
    Automatic,
    /// Record the failure and wait for an operator
    Manual,
}

impl std::fmt::Display for FailoverMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverMode::Automatic => write!(f, "automatic"),
            FailoverMode::Manual => write!(f, "manual"),
        }
    }
}

/// Monitor runtime settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub monitor_interval: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    /// Give up after this long in degraded monitoring
    pub degraded_monitoring_timeout: Option<Duration>,
    pub failover_mode: FailoverMode,
    /// How long a losing candidate waits to be told who won
    pub primary_notification_timeout: Duration,
    pub standby_disconnect_on_failover: bool,
    pub children: ChildMonitorConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(2),
            reconnect_attempts: 6,
            reconnect_interval: Duration::from_secs(10),
            degraded_monitoring_timeout: None,
            failover_mode: FailoverMode::Automatic,
            primary_notification_timeout: Duration::from_secs(60),
            standby_disconnect_on_failover: false,
            children: ChildMonitorConfig::default(),
        }
    }
}

/// Result of one monitoring cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy,
    /// Something is wrong and no action could be taken
    Degraded,
    /// Upstream lost; this node cannot stand and waits to be told
    Waiting,
    Promoted,
    Followed(NodeId),
    /// The round was discarded; the next tick starts afresh
    Rerun,
    /// The election ended without a result for this node
    Election(ElectionOutcome),
}

#[derive(Debug, Default)]
struct MonitorFlags {
    upstream_down: bool,
    local_down: bool,
    manual_reported: bool,
    degraded_since: Option<Instant>,
}

/// Per-node health monitor
pub struct HealthMonitor {
    node: RwLock<Node>,
    state: Arc<SharedState>,
    registry: Arc<dyn NodeRegistry>,
    replication: Arc<dyn ReplicationSource>,
    peers: Arc<dyn PeerDirectory>,
    notifier: Arc<FailoverNotifier>,
    rejoin: Arc<dyn RejoinAction>,
    events: Arc<EventRecorder>,
    config: MonitorConfig,
    election_config: ElectionConfig,
    flags: Mutex<MonitorFlags>,
    children: Mutex<ChildTracker>,
    last_status: RwLock<Option<ReplicationStatus>>,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: Node,
        state: Arc<SharedState>,
        registry: Arc<dyn NodeRegistry>,
        replication: Arc<dyn ReplicationSource>,
        peers: Arc<dyn PeerDirectory>,
        rejoin: Arc<dyn RejoinAction>,
        events: Arc<EventRecorder>,
        config: MonitorConfig,
        election_config: ElectionConfig,
    ) -> Self {
        let notifier = Arc::new(FailoverNotifier::new(
            registry.clone(),
            peers.clone(),
            election_config.async_query_timeout,
        ));

        Self {
            node: RwLock::new(node),
            state,
            registry,
            replication,
            peers,
            notifier,
            rejoin,
            events,
            config,
            election_config,
            flags: Mutex::new(MonitorFlags::default()),
            children: Mutex::new(ChildTracker::default()),
            last_status: RwLock::new(None),
        }
    }

    /// The local node record as last read from the registry
    pub async fn node(&self) -> Node {
        self.node.read().await.clone()
    }

    /// Replication status from the last successful check
    pub async fn last_status(&self) -> Option<ReplicationStatus> {
        self.last_status.read().await.clone()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Monitor until `shutdown` turns true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let node = self.node().await;
        tracing::info!(
            "monitoring node {} ({}) as {}; failover mode {}",
            node.id, node.name, node.node_type, self.config.failover_mode
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(outcome) => tracing::trace!("monitoring cycle: {:?}", outcome),
                Err(e @ Error::DegradedTimeout(_)) => return Err(e),
                Err(e) if e.is_structural() => return Err(e),
                Err(e) => tracing::warn!("monitoring cycle failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.monitor_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!("monitoring stopped");
        Ok(())
    }

    /// Run one monitoring cycle
    pub async fn tick(&self) -> Result<TickOutcome> {
        let outcome = match self.state.get_new_primary().await? {
            Some(target) => self.handle_notification(target).await?,
            None => {
                let node = self.refresh_node().await;
                self.state
                    .set_local_primary(node.node_type == NodeType::Primary)
                    .await;
                match node.node_type {
                    NodeType::Primary => self.monitor_primary(&node).await?,
                    NodeType::Standby | NodeType::Witness => self.monitor_standby(&node).await?,
                }
            }
        };
        self.check_degraded(outcome).await
    }

    async fn refresh_node(&self) -> Node {
        let id = self.node.read().await.id;
        match self.registry.get_node(id).await {
            Ok(Some(node)) => {
                *self.node.write().await = node.clone();
                node
            }
            Ok(None) => {
                tracing::warn!("node {} is no longer in the registry", id);
                self.node().await
            }
            Err(e) => {
                tracing::debug!("registry unavailable, using cached record: {}", e);
                self.node().await
            }
        }
    }

    async fn check_degraded(&self, outcome: TickOutcome) -> Result<TickOutcome> {
        let mut flags = self.flags.lock().await;

        if outcome != TickOutcome::Degraded {
            if flags.degraded_since.take().is_some() {
                tracing::info!("leaving degraded monitoring");
            }
            return Ok(outcome);
        }

        let now = Instant::now();
        let since = *flags.degraded_since.get_or_insert_with(|| {
            tracing::warn!("entering degraded monitoring");
            now
        });

        if let Some(limit) = self.config.degraded_monitoring_timeout {
            if now.duration_since(since) >= limit {
                tracing::error!(
                    "degraded monitoring timeout ({}s) exceeded; terminating",
                    limit.as_secs()
                );
                return Err(Error::DegradedTimeout(limit.as_secs()));
            }
        }
        Ok(outcome)
    }

    /// Ping `target`, retrying up to the configured number of attempts
    async fn reach(&self, target: &Node) -> bool {
        if self.replication.ping(target).await.is_ok() {
            return true;
        }

        let attempts = self.config.reconnect_attempts;
        for attempt in 1..=attempts {
            tracing::info!(
                "checking state of node {}, {} of {} attempts",
                target.id, attempt, attempts
            );
            tokio::time::sleep(self.config.reconnect_interval).await;
            if self.replication.ping(target).await.is_ok() {
                tracing::info!("node {} has recovered, reconnected", target.id);
                return true;
            }
        }
        false
    }

    // Standby and witness

    async fn monitor_standby(&self, node: &Node) -> Result<TickOutcome> {
        let Some(upstream) = self.resolve_upstream(node).await? else {
            tracing::warn!("node {} has no known upstream", node.id);
            return Ok(TickOutcome::Degraded);
        };

        if self.reach(&upstream).await {
            self.upstream_ok(node, &upstream).await?;
            return Ok(TickOutcome::Healthy);
        }

        self.upstream_lost(node, &upstream).await
    }

    async fn resolve_upstream(&self, node: &Node) -> Result<Option<Node>> {
        let upstream_id = match node.upstream_node_id {
            Some(id) => Some(id),
            None => self.state.get_upstream_node_id().await?,
        };

        if let Some(id) = upstream_id {
            if id == node.id {
                return Err(Error::InvalidUpstream(id));
            }
            match self.registry.get_node(id).await {
                Ok(Some(upstream)) => return Ok(Some(upstream)),
                Ok(None) => tracing::warn!("upstream node {} not found in the registry", id),
                Err(e) => tracing::debug!("unable to read upstream node {}: {}", id, e),
            }
        }

        // Fall back to the registered primary
        match self.registry.get_primary().await {
            Ok(Some(primary)) if primary.id != node.id => Ok(Some(primary)),
            _ => Ok(None),
        }
    }

    async fn upstream_ok(&self, node: &Node, upstream: &Node) -> Result<()> {
        self.state.set_upstream_node_id(upstream.id).await?;
        self.state.set_upstream_last_seen(upstream.id).await?;

        let was_down = {
            let mut flags = self.flags.lock().await;
            flags.manual_reported = false;
            std::mem::replace(&mut flags.upstream_down, false)
        };
        if was_down {
            self.events
                .emit(
                    node.id,
                    EventType::UpstreamReconnect,
                    true,
                    format!("reconnected to upstream node {}", upstream.id),
                )
                .await;
        }

        // Our own candidacy is stale once the upstream is back
        if self.state.voting_status().await == VotingStatus::Candidate {
            tracing::info!("upstream node {} is reachable; discarding election state", upstream.id);
            self.state.reset_voting_status().await?;
        }

        match self.replication.replication_status(node).await {
            Ok(status) => {
                let snapshot = self.state.snapshot().await?;
                let status = status.with_coordination(&snapshot);
                tracing::debug!(
                    "node {} replication lag {}s (upstream node {})",
                    node.id, status.replication_lag_time, upstream.id
                );
                *self.last_status.write().await = Some(status);
            }
            Err(e) => tracing::debug!("unable to read replication status: {}", e),
        }
        Ok(())
    }

    async fn upstream_lost(&self, node: &Node, upstream: &Node) -> Result<TickOutcome> {
        let first_failure = {
            let mut flags = self.flags.lock().await;
            !std::mem::replace(&mut flags.upstream_down, true)
        };
        if first_failure {
            self.events
                .emit(
                    node.id,
                    EventType::UpstreamDisconnect,
                    false,
                    format!(
                        "unable to connect to upstream node {} after {} attempts",
                        upstream.id, self.config.reconnect_attempts
                    ),
                )
                .await;
        }

        if self.state.is_paused().await? {
            tracing::info!("node {} is paused; not taking failover action", node.id);
            return Ok(TickOutcome::Degraded);
        }

        // A cascaded standby re-attaches to the primary
        if upstream.node_type != NodeType::Primary {
            return match self.reachable_primary(node, upstream.id).await {
                Some(primary) => self.converge_on(node, &primary).await,
                None => Ok(TickOutcome::Degraded),
            };
        }

        // A primary may already have been promoted while we could not hear about it
        if let Some(primary) = self.reachable_primary(node, upstream.id).await {
            return self.converge_on(node, &primary).await;
        }

        if self.config.failover_mode == FailoverMode::Manual {
            let report = {
                let mut flags = self.flags.lock().await;
                !std::mem::replace(&mut flags.manual_reported, true)
            };
            if report {
                self.events
                    .emit(
                        node.id,
                        EventType::StandbyFailover,
                        false,
                        format!(
                            "upstream node {} unreachable; failover mode is manual, no action taken",
                            upstream.id
                        ),
                    )
                    .await;
            }
            return Ok(TickOutcome::Degraded);
        }

        if !node.can_lead() {
            tracing::debug!("node {} cannot be promoted; waiting for a new primary", node.id);
            return Ok(TickOutcome::Waiting);
        }

        self.fail_over(node, upstream).await
    }

    /// A node other than `failed` and this one that is running as primary
    async fn reachable_primary(&self, node: &Node, failed: NodeId) -> Option<Node> {
        let nodes = match self.registry.get_all_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::debug!("unable to read node records: {}", e);
                return None;
            }
        };
        find_primary(self.replication.as_ref(), &nodes, &[failed, node.id]).await
    }

    async fn converge_on(&self, node: &Node, primary: &Node) -> Result<TickOutcome> {
        tracing::info!(
            "node {} is running as primary; node {} will follow it",
            primary.id, node.id
        );
        self.state
            .notify_follow_primary(FollowTarget::Node(primary.id))
            .await?;
        self.handle_notification(FollowTarget::Node(primary.id)).await
    }

    async fn fail_over(&self, node: &Node, upstream: &Node) -> Result<TickOutcome> {
        if self.config.standby_disconnect_on_failover {
            if let Err(e) = self.rejoin.disconnect_wal_receiver(node).await {
                tracing::warn!("unable to disconnect WAL receiver: {}", e);
            }
        }

        let election = ElectionCoordinator::new(
            node.clone(),
            self.state.clone(),
            self.registry.clone(),
            self.peers.clone(),
            self.notifier.clone(),
            self.election_config.clone(),
        );

        let outcome = match election.begin().await? {
            Some(term) => {
                self.events
                    .emit(
                        node.id,
                        EventType::StandbyFailover,
                        true,
                        format!(
                            "upstream node {} unreachable; node {} is a candidate in electoral term {}",
                            upstream.id, node.id, term
                        ),
                    )
                    .await;
                election.campaign(term, upstream.id).await?
            }
            None => {
                self.events
                    .emit(
                        node.id,
                        EventType::StandbyFailover,
                        false,
                        format!(
                            "upstream node {} unreachable; node {} not standing for election",
                            upstream.id, node.id
                        ),
                    )
                    .await;
                ElectionOutcome::Declined
            }
        };

        let wait = match &outcome {
            ElectionOutcome::Won { .. } => {
                let target = self
                    .state
                    .get_new_primary()
                    .await?
                    .unwrap_or(FollowTarget::Node(node.id));
                return self.handle_notification(target).await;
            }
            ElectionOutcome::PrimaryVisible { seen_by, .. } => {
                self.events
                    .emit(
                        node.id,
                        EventType::FailoverAborted,
                        false,
                        format!(
                            "node {} can still see primary node {}; promotion cancelled",
                            seen_by, upstream.id
                        ),
                    )
                    .await;
                self.state.reset_voting_status().await?;
                return Ok(TickOutcome::Election(outcome));
            }
            ElectionOutcome::Lost { term, winner } => {
                let details = match winner {
                    Some(winner) => format!("node {} lost electoral term {} to node {}", node.id, term, winner),
                    None => format!("node {} lost electoral term {}", node.id, term),
                };
                self.events
                    .emit(node.id, EventType::ElectionLost, false, details)
                    .await;
                self.config.primary_notification_timeout
            }
            ElectionOutcome::Superseded { term, primary } => {
                self.events
                    .emit(
                        node.id,
                        EventType::ElectionLost,
                        false,
                        format!(
                            "electoral term {} already settled; node {} is running as primary",
                            term, primary
                        ),
                    )
                    .await;
                self.config.primary_notification_timeout
            }
            ElectionOutcome::Declined => self.config.primary_notification_timeout,
            ElectionOutcome::Undecided { term, votes, required } => {
                self.events
                    .emit(
                        node.id,
                        EventType::ElectionUndecided,
                        false,
                        format!(
                            "node {} has {} of {} required votes in electoral term {}",
                            node.id, votes, required, term
                        ),
                    )
                    .await;
                election.rerun_delay()
            }
        };

        tracing::info!("waiting up to {:?} for the election result", wait);
        let poll = self.config.monitor_interval.min(Duration::from_secs(1));
        if let Some(target) = election.wait_for_result(wait, poll).await? {
            return self.handle_notification(target).await;
        }

        election.publish_rerun(upstream.id).await?;
        match self.state.get_new_primary().await? {
            Some(target) => self.handle_notification(target).await,
            None => {
                self.state.reset_voting_status().await?;
                Ok(TickOutcome::Election(outcome))
            }
        }
    }

    // Election results

    async fn handle_notification(&self, target: FollowTarget) -> Result<TickOutcome> {
        let node = self.node().await;
        match target {
            FollowTarget::Rerun => {
                self.state.reset_voting_status().await?;
                self.events
                    .emit(node.id, EventType::ElectionRerun, true, "election rerun requested")
                    .await;
                Ok(TickOutcome::Rerun)
            }
            FollowTarget::Node(id) if id == node.id => self.promote_self(&node).await,
            FollowTarget::Node(id) => {
                if node.node_type == NodeType::Primary && !self.runs_as_primary(id).await {
                    self.state.reset_voting_status().await?;
                    self.events
                        .emit(
                            node.id,
                            EventType::FailoverFollow,
                            false,
                            format!("node {} refusing to follow node {}: not running as primary", node.id, id),
                        )
                        .await;
                    // Still primary; the next cycle monitors it as such
                    return Ok(TickOutcome::Healthy);
                }
                self.follow_new_primary(&node, id).await
            }
        }
    }

    async fn runs_as_primary(&self, id: NodeId) -> bool {
        let candidate = match self.registry.get_node(id).await {
            Ok(Some(candidate)) => candidate,
            _ => return false,
        };
        matches!(self.replication.is_in_recovery(&candidate).await, Ok(false))
    }

    async fn promote_self(&self, node: &Node) -> Result<TickOutcome> {
        let failed = node.upstream_node_id;

        if let Err(e) = self.rejoin.promote(node).await {
            self.state.reset_voting_status().await?;
            self.events
                .emit(
                    node.id,
                    EventType::FailoverPromote,
                    false,
                    format!("promotion of node {} failed: {}", node.id, e),
                )
                .await;
            return Ok(TickOutcome::Degraded);
        }

        let mut details = match failed {
            Some(old) => format!("node {} promoted to primary; old primary node {} marked as failed", node.id, old),
            None => format!("node {} promoted to primary", node.id),
        };
        if let Err(e) = self.registry.promote_node(node.id).await {
            tracing::warn!("unable to record promotion in the registry: {}", e);
            details.push_str(&format!(" (registry not updated: {})", e));
        }

        {
            let mut cached = self.node.write().await;
            cached.node_type = NodeType::Primary;
            cached.upstream_node_id = None;
            cached.active = true;
        }
        self.flags.lock().await.upstream_down = false;
        self.state.set_local_primary(true).await;
        self.state.reset_voting_status().await?;

        self.events
            .emit(node.id, EventType::FailoverPromote, true, details)
            .await;
        Ok(TickOutcome::Promoted)
    }

    async fn follow_new_primary(&self, node: &Node, primary_id: NodeId) -> Result<TickOutcome> {
        let primary = match self.registry.get_node(primary_id).await {
            Ok(Some(primary)) => primary,
            Ok(None) => {
                return self
                    .follow_failed(node, primary_id, format!("node {} not found in the registry", primary_id))
                    .await;
            }
            Err(e) => return self.follow_failed(node, primary_id, e.to_string()).await,
        };

        // Witnesses do not stream; only their bookkeeping moves
        if !node.is_witness() {
            if let Err(e) = self.rejoin.follow(node, &primary).await {
                return self.follow_failed(node, primary_id, e.to_string()).await;
            }
        }

        let node_type = if node.is_witness() {
            NodeType::Witness
        } else {
            NodeType::Standby
        };
        if let Err(e) = self
            .registry
            .update_node_role(node.id, node_type, Some(primary_id), true)
            .await
        {
            tracing::warn!("unable to record new upstream in the registry: {}", e);
        }

        self.state.set_upstream_node_id(primary_id).await?;
        self.state.set_upstream_last_seen(primary_id).await?;
        {
            let mut cached = self.node.write().await;
            cached.node_type = node_type;
            cached.upstream_node_id = Some(primary_id);
            cached.active = true;
        }
        self.flags.lock().await.upstream_down = false;
        self.state.set_local_primary(false).await;
        self.state.reset_voting_status().await?;

        self.events
            .emit(
                node.id,
                EventType::FailoverFollow,
                true,
                format!("node {} now following new upstream node {}", node.id, primary_id),
            )
            .await;
        Ok(TickOutcome::Followed(primary_id))
    }

    async fn follow_failed(&self, node: &Node, primary_id: NodeId, reason: String) -> Result<TickOutcome> {
        self.state.reset_voting_status().await?;
        self.events
            .emit(
                node.id,
                EventType::FailoverFollow,
                false,
                format!("node {} unable to follow node {}: {}", node.id, primary_id, reason),
            )
            .await;
        Ok(TickOutcome::Degraded)
    }

    // Primary

    async fn monitor_primary(&self, node: &Node) -> Result<TickOutcome> {
        if let Err(e) = self.replication.ping(node).await {
            let first_failure = {
                let mut flags = self.flags.lock().await;
                !std::mem::replace(&mut flags.local_down, true)
            };
            if first_failure {
                self.events
                    .emit(
                        node.id,
                        EventType::LocalDisconnect,
                        false,
                        format!("unable to connect to local node: {}", e),
                    )
                    .await;
            }
            return Ok(TickOutcome::Degraded);
        }

        let recovered = std::mem::replace(&mut self.flags.lock().await.local_down, false);
        if recovered {
            self.events
                .emit(node.id, EventType::LocalReconnect, true, "reconnected to local node")
                .await;
        }

        // Only the node whose own view still names it primary finds the
        // other one: the promoted node has marked it inactive.
        let nodes = match self.registry.get_all_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::debug!("unable to read node records: {}", e);
                Vec::new()
            }
        };
        if let Some(primary) = find_primary(self.replication.as_ref(), &nodes, &[node.id]).await {
            self.events
                .emit(
                    node.id,
                    EventType::SplitBrain,
                    false,
                    format!(
                        "node {} is running as primary but node {} is also running as primary",
                        node.id, primary.id
                    ),
                )
                .await;
            self.state
                .notify_follow_primary(FollowTarget::Node(primary.id))
                .await?;
            return self.handle_notification(FollowTarget::Node(primary.id)).await;
        }

        self.check_children(node).await;
        Ok(TickOutcome::Healthy)
    }

    async fn check_children(&self, node: &Node) {
        let config = &self.config.children;
        let now = Instant::now();
        if !self.children.lock().await.due(now, config.check_interval) {
            return;
        }

        let nodes = match self.registry.get_all_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::debug!("unable to read child nodes: {}", e);
                return;
            }
        };
        let attached = match self.replication.attached_children(node).await {
            Ok(names) => names,
            Err(e) => {
                tracing::debug!("unable to read attached children: {}", e);
                return;
            }
        };

        let mut observed = Vec::new();
        for child in children_of(&nodes, node.id) {
            let up = if child.is_witness() {
                if !config.include_witness {
                    continue;
                }
                self.replication.ping(&child).await.is_ok()
            } else {
                attached.contains(&child.name)
            };
            observed.push((child, up));
        }

        let (changes, threshold, (connected, disconnected)) = {
            let mut tracker = self.children.lock().await;
            let changes = tracker.observe(&observed, now);
            let threshold = tracker.threshold(config, now);
            (changes, threshold, tracker.counts())
        };

        for change in changes {
            let (event_type, ok, details) = match change {
                ChildChange::Disconnected(id, name) => (
                    EventType::ChildNodeDisconnect,
                    false,
                    format!("node {} ({}) has disconnected", id, name),
                ),
                ChildChange::Reconnected(id, name) => (
                    EventType::ChildNodeReconnect,
                    true,
                    format!("node {} ({}) has reconnected", id, name),
                ),
                ChildChange::NewConnection(id, name) => (
                    EventType::ChildNodeNewConnect,
                    true,
                    format!("new node {} ({}) has connected", id, name),
                ),
            };
            self.events.emit(node.id, event_type, ok, details).await;
        }

        if threshold != Threshold::Fire {
            return;
        }

        let counts = format!("{} child node(s) connected, {} disconnected", connected, disconnected);
        let (ok, details) = match &config.disconnect_command {
            Some(command) => match self.rejoin.child_nodes_disconnect(node, command).await {
                Ok(()) => (true, counts),
                Err(e) => (false, format!("{}; {}", counts, e)),
            },
            None => (false, format!("{}; no child_nodes_disconnect_command configured", counts)),
        };
        self.events
            .emit(node.id, EventType::ChildNodesDisconnectCommand, ok, details)
            .await;
    }
}
