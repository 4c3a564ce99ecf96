//! In-memory stand-ins for the registry, the peer network and the
//! replication source, for exercising whole clusters in one process.
//!
//! Every node reads node records from its own server, so a node cut off
//! from a promotion keeps a stale view until it is repointed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, RwLock};

use crate::coordination::{Coordination, PeerDirectory};
use crate::election::{ElectionConfig, ElectionCoordinator};
use crate::error::{Error, Result};
use crate::events::{EventRecord, EventRecorder};
use crate::monitor::{HealthMonitor, MonitorConfig, RejoinAction};
use crate::notifier::FailoverNotifier;
use crate::registry::{Node, NodeId, NodeRegistry, NodeType};
use crate::replication::{ReplicationSource, ReplicationStatus, SlotStats};
use crate::state::{
    CandidateRank, CoordinationSnapshot, FollowTarget, ProcessProbe, SharedState, VoteReply,
};

/// Registry held in memory
pub struct MemoryRegistry {
    nodes: RwLock<Vec<Node>>,
    events: RwLock<Vec<EventRecord>>,
}

impl MemoryRegistry {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
            events: RwLock::new(Vec::new()),
        }
    }

    pub async fn events(&self) -> Vec<EventRecord> {
        self.events.read().await.clone()
    }

    pub async fn node(&self, id: NodeId) -> Node {
        self.nodes
            .read()
            .await
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .unwrap_or_else(|| panic!("node {} not registered", id))
    }

    async fn modify(&self, id: NodeId, f: impl FnOnce(&mut Node)) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(Error::NodeNotFound(id))?;
        f(node);
        Ok(())
    }
}

#[async_trait::async_trait]
impl NodeRegistry for MemoryRegistry {
    async fn get_node(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self.nodes.read().await.iter().find(|n| n.id == id).cloned())
    }

    async fn get_all_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes = self.nodes.read().await.clone();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn get_primary(&self) -> Result<Option<Node>> {
        Ok(self
            .nodes
            .read()
            .await
            .iter()
            .find(|n| n.active && n.node_type == NodeType::Primary)
            .cloned())
    }

    async fn update_node_role(
        &self,
        id: NodeId,
        node_type: NodeType,
        upstream_node_id: Option<NodeId>,
        active: bool,
    ) -> Result<()> {
        crate::registry::check_upstream(id, upstream_node_id)?;
        self.modify(id, |n| {
            n.node_type = node_type;
            n.upstream_node_id = upstream_node_id;
            n.active = active;
        })
        .await
    }

    async fn set_node_active(&self, id: NodeId, active: bool) -> Result<()> {
        self.modify(id, |n| n.active = active).await
    }

    async fn promote_node(&self, id: NodeId) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if !nodes.iter().any(|n| n.id == id) {
            return Err(Error::NodeNotFound(id));
        }
        for node in nodes.iter_mut() {
            if node.id == id {
                node.node_type = NodeType::Primary;
                node.upstream_node_id = None;
                node.active = true;
            } else if node.node_type == NodeType::Primary && node.active {
                node.active = false;
            }
        }
        Ok(())
    }

    async fn record_event(&self, event: &EventRecord) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}

struct PeerNet {
    states: HashMap<NodeId, Arc<SharedState>>,
    unreachable: RwLock<HashSet<NodeId>>,
    max_delay_ms: AtomicU64,
}

/// Peer directory over in-process coordination blocks
pub struct LocalPeers {
    net: Arc<PeerNet>,
}

impl LocalPeers {
    /// Cut a node off from (or restore it to) coordination traffic
    pub async fn set_unreachable(&self, id: NodeId, unreachable: bool) {
        let mut set = self.net.unreachable.write().await;
        if unreachable {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    /// Delay every call by a random amount up to `max`
    pub fn set_max_delay(&self, max: Duration) {
        let ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self.net.max_delay_ms.store(ms, Ordering::SeqCst);
    }
}

impl PeerDirectory for LocalPeers {
    fn connect(&self, node: &Node) -> Arc<dyn Coordination> {
        Arc::new(LocalPeer {
            id: node.id,
            net: self.net.clone(),
        })
    }
}

struct LocalPeer {
    id: NodeId,
    net: Arc<PeerNet>,
}

impl LocalPeer {
    async fn target(&self) -> Result<Arc<SharedState>> {
        let max = self.net.max_delay_ms.load(Ordering::SeqCst);
        if max > 0 {
            let delay = rand::thread_rng().gen_range(0..=max);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.net.unreachable.read().await.contains(&self.id) {
            return Err(Error::ConnectionFailed {
                address: format!("node{}", self.id),
                reason: "unreachable".into(),
            });
        }
        self.net
            .states
            .get(&self.id)
            .cloned()
            .ok_or(Error::NodeNotFound(self.id))
    }
}

#[async_trait::async_trait]
impl Coordination for LocalPeer {
    async fn set_local_node_id(&self, node_id: NodeId) -> Result<()> {
        self.target().await?.set_local_node_id(node_id).await
    }

    async fn get_local_node_id(&self) -> Result<Option<NodeId>> {
        self.target().await?.get_local_node_id().await
    }

    async fn set_upstream_last_seen(&self, upstream_node_id: NodeId) -> Result<()> {
        self.target().await?.set_upstream_last_seen(upstream_node_id).await
    }

    async fn get_upstream_last_seen(&self) -> Result<i64> {
        self.target().await?.get_upstream_last_seen().await
    }

    async fn set_upstream_node_id(&self, node_id: NodeId) -> Result<()> {
        self.target().await?.set_upstream_node_id(node_id).await
    }

    async fn get_upstream_node_id(&self) -> Result<Option<NodeId>> {
        self.target().await?.get_upstream_node_id().await
    }

    async fn begin_candidacy(&self, rank: CandidateRank) -> Result<Option<u64>> {
        self.target().await?.begin_candidacy(rank).await
    }

    async fn current_term(&self) -> Result<u64> {
        self.target().await?.current_term().await
    }

    async fn increment_current_term(&self) -> Result<u64> {
        self.target().await?.increment_current_term().await
    }

    async fn other_node_is_candidate(&self, rank: CandidateRank, term: u64) -> Result<VoteReply> {
        self.target().await?.other_node_is_candidate(rank, term).await
    }

    async fn notify_follow_primary(&self, target: FollowTarget) -> Result<()> {
        self.target().await?.notify_follow_primary(target).await
    }

    async fn get_new_primary(&self) -> Result<Option<FollowTarget>> {
        self.target().await?.get_new_primary().await
    }

    async fn reset_voting_status(&self) -> Result<()> {
        self.target().await?.reset_voting_status().await
    }

    async fn pause(&self, paused: bool) -> Result<()> {
        self.target().await?.pause(paused).await
    }

    async fn is_paused(&self) -> Result<bool> {
        self.target().await?.is_paused().await
    }

    async fn snapshot(&self) -> Result<CoordinationSnapshot> {
        self.target().await?.snapshot().await
    }
}

/// One database server in the simulated cluster
struct Server {
    down: bool,
    /// Server this one streams from; `None` while running as primary
    upstream: Option<NodeId>,
    witness: bool,
    /// This server's copy of the node records
    catalog: Vec<Node>,
}

/// Simulated database servers, each holding its own copy of the node
/// records. A copy only changes when a write reaches the primary it
/// streams from, or when the server is repointed at a new upstream.
pub struct ScriptedReplication {
    servers: RwLock<HashMap<NodeId, Server>>,
    children: RwLock<HashMap<NodeId, Vec<String>>>,
    events: RwLock<Vec<EventRecord>>,
}

impl ScriptedReplication {
    pub fn new(nodes: &[Node]) -> Self {
        let servers = nodes
            .iter()
            .map(|n| {
                let upstream = match n.node_type {
                    NodeType::Primary => None,
                    _ => n.upstream_node_id,
                };
                let server = Server {
                    down: false,
                    upstream,
                    witness: n.is_witness(),
                    catalog: nodes.to_vec(),
                };
                (n.id, server)
            })
            .collect();

        Self {
            servers: RwLock::new(servers),
            children: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
        }
    }

    /// Stop or restart a server. A restarted standby catches up with its
    /// primary's copy of the records.
    pub async fn set_down(&self, id: NodeId, down: bool) {
        let mut servers = self.servers.write().await;
        if let Some(server) = servers.get_mut(&id) {
            server.down = down;
        }
        if !down {
            resync(&mut servers, id);
        }
    }

    pub async fn set_children(&self, id: NodeId, names: &[&str]) {
        self.children
            .write()
            .await
            .insert(id, names.iter().map(|s| s.to_string()).collect());
    }

    pub async fn events(&self) -> Vec<EventRecord> {
        self.events.read().await.clone()
    }

    /// Take the server out of recovery
    async fn promote(&self, id: NodeId) {
        if let Some(server) = self.servers.write().await.get_mut(&id) {
            server.upstream = None;
        }
    }

    /// Repoint the server at `upstream` and catch up with its records
    async fn attach(&self, id: NodeId, upstream: NodeId) {
        let mut servers = self.servers.write().await;
        if let Some(server) = servers.get_mut(&id) {
            server.upstream = Some(upstream);
        }
        resync(&mut servers, id);
    }

    async fn check(&self, node: &Node) -> Result<()> {
        match self.servers.read().await.get(&node.id) {
            Some(server) if !server.down => Ok(()),
            _ => Err(Error::ConnectionFailed {
                address: node.conninfo.clone(),
                reason: "connection refused".into(),
            }),
        }
    }

    async fn catalog(&self, owner: NodeId) -> Result<Vec<Node>> {
        match self.servers.read().await.get(&owner) {
            Some(server) if !server.down => Ok(server.catalog.clone()),
            _ => Err(Error::ConnectionFailed {
                address: format!("node{}", owner),
                reason: "connection refused".into(),
            }),
        }
    }

    /// Apply a write on `writer` and stream it to every server below it
    async fn write_on(&self, writer: NodeId, f: impl FnOnce(&mut Vec<Node>) -> Result<()> + Send) -> Result<()> {
        let mut servers = self.servers.write().await;
        let catalog = {
            let server = servers
                .get_mut(&writer)
                .filter(|s| !s.down)
                .ok_or(Error::NoPrimary)?;
            f(&mut server.catalog)?;
            server.catalog.clone()
        };

        let followers: Vec<NodeId> = servers
            .iter()
            .filter(|(id, s)| **id != writer && !s.down && (s.witness || root(&servers, **id) == Some(writer)))
            .map(|(id, _)| *id)
            .collect();
        for id in followers {
            if let Some(server) = servers.get_mut(&id) {
                server.catalog = catalog.clone();
            }
        }
        Ok(())
    }

    /// The server writes from `owner` land on, found the way the
    /// registry finds it: the first candidate that is not in recovery
    async fn writer_for(&self, owner: NodeId) -> Result<NodeId> {
        let nodes = self.catalog(owner).await?;
        let servers = self.servers.read().await;
        let mut candidates: Vec<&Node> = nodes.iter().filter(|n| n.active && !n.is_witness()).collect();
        candidates.sort_by_key(|n| n.node_type != NodeType::Primary);
        candidates
            .into_iter()
            .find(|n| matches!(servers.get(&n.id), Some(s) if !s.down && s.upstream.is_none()))
            .map(|n| n.id)
            .ok_or(Error::NoPrimary)
    }
}

/// Top of the replication chain `id` belongs to
fn root(servers: &HashMap<NodeId, Server>, id: NodeId) -> Option<NodeId> {
    let mut current = id;
    for _ in 0..=servers.len() {
        match servers.get(&current)?.upstream {
            None => return Some(current),
            Some(next) => current = next,
        }
    }
    None
}

fn resync(servers: &mut HashMap<NodeId, Server>, id: NodeId) {
    let Some(top) = root(servers, id).filter(|top| *top != id) else {
        return;
    };
    let catalog = match servers.get(&top) {
        Some(server) if !server.down => server.catalog.clone(),
        _ => return,
    };
    if let Some(server) = servers.get_mut(&id) {
        server.catalog = catalog;
    }
}

#[async_trait::async_trait]
impl ReplicationSource for ScriptedReplication {
    async fn ping(&self, node: &Node) -> Result<()> {
        self.check(node).await
    }

    async fn replication_status(&self, node: &Node) -> Result<ReplicationStatus> {
        Ok(ReplicationStatus {
            in_recovery: self.is_in_recovery(node).await?,
            ..ReplicationStatus::default()
        })
    }

    async fn is_in_recovery(&self, node: &Node) -> Result<bool> {
        self.check(node).await?;
        let servers = self.servers.read().await;
        Ok(servers
            .get(&node.id)
            .map_or(false, |s| !s.witness && s.upstream.is_some()))
    }

    async fn attached_children(&self, node: &Node) -> Result<Vec<String>> {
        self.check(node).await?;
        Ok(self.children.read().await.get(&node.id).cloned().unwrap_or_default())
    }

    async fn slot_stats(&self, node: &Node) -> Result<SlotStats> {
        self.check(node).await?;
        Ok(SlotStats::default())
    }
}

/// One node's view of the registry: reads come from its own server,
/// writes go to whichever server is running as primary
pub struct RegistryView {
    owner: NodeId,
    db: Arc<ScriptedReplication>,
}

impl RegistryView {
    pub async fn node(&self, id: NodeId) -> Node {
        self.get_node(id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("node {} not registered", id))
    }

    async fn modify(&self, id: NodeId, f: impl FnOnce(&mut Node) + Send) -> Result<()> {
        let writer = self.db.writer_for(self.owner).await?;
        self.db
            .write_on(writer, |nodes| {
                let node = nodes.iter_mut().find(|n| n.id == id).ok_or(Error::NodeNotFound(id))?;
                f(node);
                Ok(())
            })
            .await
    }
}

#[async_trait::async_trait]
impl NodeRegistry for RegistryView {
    async fn get_node(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self.db.catalog(self.owner).await?.into_iter().find(|n| n.id == id))
    }

    async fn get_all_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes = self.db.catalog(self.owner).await?;
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn get_primary(&self) -> Result<Option<Node>> {
        Ok(self
            .db
            .catalog(self.owner)
            .await?
            .into_iter()
            .find(|n| n.active && n.node_type == NodeType::Primary))
    }

    async fn update_node_role(
        &self,
        id: NodeId,
        node_type: NodeType,
        upstream_node_id: Option<NodeId>,
        active: bool,
    ) -> Result<()> {
        crate::registry::check_upstream(id, upstream_node_id)?;
        self.modify(id, move |n| {
            n.node_type = node_type;
            n.upstream_node_id = upstream_node_id;
            n.active = active;
        })
        .await
    }

    async fn set_node_active(&self, id: NodeId, active: bool) -> Result<()> {
        self.modify(id, move |n| n.active = active).await
    }

    async fn promote_node(&self, id: NodeId) -> Result<()> {
        // Issued by the freshly promoted node against its own server
        self.db
            .write_on(self.owner, |nodes| {
                if !nodes.iter().any(|n| n.id == id) {
                    return Err(Error::NodeNotFound(id));
                }
                for node in nodes.iter_mut() {
                    if node.id == id {
                        node.node_type = NodeType::Primary;
                        node.upstream_node_id = None;
                        node.active = true;
                    } else if node.node_type == NodeType::Primary && node.active {
                        node.active = false;
                    }
                }
                Ok(())
            })
            .await
    }

    async fn record_event(&self, event: &EventRecord) -> Result<()> {
        self.db.events.write().await.push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejoinCall {
    Promote(NodeId),
    Follow(NodeId, NodeId),
    DisconnectWalReceiver(NodeId),
    ChildNodesDisconnect(NodeId, String),
}

/// Records rejoin actions and applies them to the simulated servers
pub struct RecordingRejoin {
    db: Arc<ScriptedReplication>,
    calls: Mutex<Vec<RejoinCall>>,
    fail_promote: AtomicBool,
}

impl RecordingRejoin {
    pub fn new(db: Arc<ScriptedReplication>) -> Self {
        Self {
            db,
            calls: Mutex::new(Vec::new()),
            fail_promote: AtomicBool::new(false),
        }
    }

    pub async fn calls(&self) -> Vec<RejoinCall> {
        self.calls.lock().await.clone()
    }

    pub fn fail_promote(&self, fail: bool) {
        self.fail_promote.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RejoinAction for RecordingRejoin {
    async fn promote(&self, node: &Node) -> Result<()> {
        if self.fail_promote.load(Ordering::SeqCst) {
            return Err(Error::Command {
                command: "promote".into(),
                reason: "exit status: 1".into(),
            });
        }
        self.db.promote(node.id).await;
        self.calls.lock().await.push(RejoinCall::Promote(node.id));
        Ok(())
    }

    async fn follow(&self, node: &Node, new_primary: &Node) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(RejoinCall::Follow(node.id, new_primary.id));
        self.db.attach(node.id, new_primary.id).await;
        Ok(())
    }

    async fn disconnect_wal_receiver(&self, node: &Node) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(RejoinCall::DisconnectWalReceiver(node.id));
        Ok(())
    }

    async fn child_nodes_disconnect(&self, node: &Node, command: &str) -> Result<()> {
        self.calls
            .lock()
            .await
            .push(RejoinCall::ChildNodesDisconnect(node.id, command.to_string()));
        Ok(())
    }
}

/// A whole cluster in one process
pub struct Cluster {
    pub peers: Arc<LocalPeers>,
    pub replication: Arc<ScriptedReplication>,
    nodes: HashMap<NodeId, Node>,
    states: HashMap<NodeId, Arc<SharedState>>,
}

impl Cluster {
    pub async fn new(nodes: Vec<Node>) -> Self {
        let mut states = HashMap::new();
        for node in &nodes {
            let state = Arc::new(SharedState::new(None, Arc::new(ProcessProbe)));
            state.set_local_node_id(node.id).await.unwrap();
            if let Some(upstream) = node.upstream_node_id {
                state.set_upstream_node_id(upstream).await.unwrap();
            }
            states.insert(node.id, state);
        }

        let peers = Arc::new(LocalPeers {
            net: Arc::new(PeerNet {
                states: states.clone(),
                unreachable: RwLock::new(HashSet::new()),
                max_delay_ms: AtomicU64::new(0),
            }),
        });

        Self {
            peers,
            replication: Arc::new(ScriptedReplication::new(&nodes)),
            nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
            states,
        }
    }

    pub fn state(&self, id: NodeId) -> Arc<SharedState> {
        self.states
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("no state for node {}", id))
    }

    /// Registry as seen from node `id`
    pub fn registry(&self, id: NodeId) -> Arc<RegistryView> {
        Arc::new(RegistryView {
            owner: id,
            db: self.replication.clone(),
        })
    }

    /// Events recorded anywhere in the cluster
    pub async fn events(&self) -> Vec<EventRecord> {
        self.replication.events().await
    }

    fn node(&self, id: NodeId) -> Node {
        self.nodes
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("node {} not in cluster", id))
    }

    pub fn election(&self, id: NodeId, config: ElectionConfig) -> ElectionCoordinator {
        let registry = self.registry(id);
        let notifier = Arc::new(FailoverNotifier::new(
            registry.clone(),
            self.peers.clone(),
            config.async_query_timeout,
        ));
        ElectionCoordinator::new(
            self.node(id),
            self.state(id),
            registry,
            self.peers.clone(),
            notifier,
            config,
        )
    }

    pub fn monitor(&self, id: NodeId, config: MonitorConfig) -> (HealthMonitor, Arc<RecordingRejoin>) {
        let election = ElectionConfig {
            async_query_timeout: Duration::from_secs(1),
            election_rerun_interval: Duration::from_millis(50),
            ..ElectionConfig::default()
        };
        self.monitor_with(id, config, election)
    }

    pub fn monitor_with(
        &self,
        id: NodeId,
        config: MonitorConfig,
        election: ElectionConfig,
    ) -> (HealthMonitor, Arc<RecordingRejoin>) {
        let registry = self.registry(id);
        let rejoin = Arc::new(RecordingRejoin::new(self.replication.clone()));
        let events = Arc::new(EventRecorder::new(registry.clone(), None, 64));
        let monitor = HealthMonitor::new(
            self.node(id),
            self.state(id),
            registry,
            self.replication.clone(),
            self.peers.clone(),
            rejoin.clone(),
            events,
            config,
            election,
        );
        (monitor, rejoin)
    }
}
