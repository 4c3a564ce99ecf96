//! Shared Coordination State
//!
//! One coordination block per node, guarded by a single reader/writer lock.
//! Critical sections never perform I/O: the pause state file and the pid
//! liveness probe are consulted after the lock is released. Writes of the
//! state file are ordered by a separate mutex.
//!
//! Once a result has been published to a node, announcements for that term
//! or any earlier one are refused, and a node running as primary refuses
//! every announcement.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use super::{
    CandidateRank, CoordinationSnapshot, FollowTarget, LivenessProbe, StateFile, StoredState,
    VoteReply, VotingStatus,
};
use crate::coordination::Coordination;
use crate::error::{Error, Result};
use crate::registry::NodeId;

#[derive(Debug, Clone)]
struct CoordinationBlock {
    local_node_id: Option<NodeId>,
    daemon_pid: Option<u32>,
    daemon_pidfile: Option<PathBuf>,
    paused: bool,
    upstream_node_id: Option<NodeId>,
    upstream_last_seen: Option<DateTime<Utc>>,
    voting_status: VotingStatus,
    current_electoral_term: u64,
    candidate: Option<FollowTarget>,
    candidate_priority: i32,
    follow_new_primary: bool,
    /// Term and winner of the last published result
    settled: Option<(u64, NodeId)>,
    local_primary: bool,
}

impl Default for CoordinationBlock {
    fn default() -> Self {
        Self {
            local_node_id: None,
            daemon_pid: None,
            daemon_pidfile: None,
            paused: false,
            upstream_node_id: None,
            upstream_last_seen: None,
            voting_status: VotingStatus::NoVote,
            current_electoral_term: 0,
            candidate: None,
            candidate_priority: 0,
            follow_new_primary: false,
            settled: None,
            local_primary: false,
        }
    }
}

impl CoordinationBlock {
    /// The node this block currently backs in an election
    fn nominee(&self) -> Option<CandidateRank> {
        if self.voting_status == VotingStatus::NoVote {
            return None;
        }
        match self.candidate {
            Some(FollowTarget::Node(node_id)) => Some(CandidateRank {
                node_id,
                priority: self.candidate_priority,
            }),
            _ => None,
        }
    }

    fn last_seen_secs(&self) -> i64 {
        match self.upstream_last_seen {
            Some(at) => (Utc::now() - at).num_seconds().max(0),
            None => -1,
        }
    }

    fn reply(&self, granted: bool) -> VoteReply {
        VoteReply {
            granted,
            term: self.current_electoral_term,
            nominee: self.nominee(),
            upstream_node_id: self.upstream_node_id,
            upstream_last_seen: self.last_seen_secs(),
            primary: None,
        }
    }

    /// Refusal naming the primary already in place
    fn settled_reply(&self, primary: NodeId) -> VoteReply {
        VoteReply {
            primary: Some(primary),
            ..self.reply(false)
        }
    }
}

/// The coordination block of the local node
pub struct SharedState {
    inner: RwLock<CoordinationBlock>,
    state_file: Option<StateFile>,
    file_lock: Mutex<()>,
    probe: Arc<dyn LivenessProbe>,
}

impl SharedState {
    pub fn new(state_file: Option<StateFile>, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            inner: RwLock::new(CoordinationBlock::default()),
            state_file,
            file_lock: Mutex::new(()),
            probe,
        }
    }

    /// Register the monitoring daemon; `None` clears the registration
    pub async fn set_daemon_pid(&self, pid: Option<u32>, pidfile: Option<PathBuf>) {
        let mut block = self.inner.write().await;
        block.daemon_pid = pid;
        block.daemon_pidfile = if pid.is_some() { pidfile } else { None };
    }

    pub async fn get_daemon_pid(&self) -> Option<u32> {
        self.inner.read().await.daemon_pid
    }

    pub async fn get_daemon_pidfile(&self) -> Option<PathBuf> {
        self.inner.read().await.daemon_pidfile.clone()
    }

    /// Whether a registered daemon pid refers to a live process (advisory)
    pub async fn is_daemon_running(&self) -> bool {
        let pid = self.inner.read().await.daemon_pid;
        pid.map(|pid| self.probe.is_alive(pid)).unwrap_or(false)
    }

    pub async fn voting_status(&self) -> VotingStatus {
        self.inner.read().await.voting_status
    }

    /// Record whether the local node currently runs as primary
    pub async fn set_local_primary(&self, primary: bool) {
        let mut block = self.inner.write().await;
        if block.local_primary != primary {
            tracing::debug!("local node running as primary: {}", primary);
            block.local_primary = primary;
        }
    }

    /// Term and winner of the last result published to this node
    pub async fn settled(&self) -> Option<(u64, NodeId)> {
        self.inner.read().await.settled
    }

    /// Set the pause flag and persist it. Returns the previous value.
    pub async fn set_paused(&self, paused: bool) -> Result<bool> {
        let _file = self.file_lock.lock().await;
        let (previous, local) = {
            let mut block = self.inner.write().await;
            (std::mem::replace(&mut block.paused, paused), block.local_node_id)
        };

        match (local, &self.state_file) {
            (Some(node_id), Some(state_file)) => {
                state_file.write(StoredState { node_id, paused }).await?;
            }
            (None, Some(_)) => {
                tracing::warn!("local node id not set; pause state not persisted");
            }
            _ => {}
        }
        Ok(previous)
    }
}

#[async_trait::async_trait]
impl Coordination for SharedState {
    async fn set_local_node_id(&self, node_id: NodeId) -> Result<()> {
        {
            let mut block = self.inner.write().await;
            if let Some(existing) = block.local_node_id {
                if existing != node_id {
                    tracing::debug!(
                        "local node id already set to {}, ignoring {}",
                        existing, node_id
                    );
                }
                return Ok(());
            }
            block.local_node_id = Some(node_id);
        }

        let Some(state_file) = &self.state_file else {
            return Ok(());
        };

        match state_file.read().await {
            Ok(Some(StoredState { node_id: stored, paused })) if stored == node_id => {
                let mut block = self.inner.write().await;
                if block.local_node_id == Some(stored) {
                    block.paused = paused;
                }
                if paused {
                    tracing::info!("node {} restored as paused from {}", node_id, state_file.path().display());
                }
            }
            Ok(Some(StoredState { node_id: stored, .. })) => {
                tracing::warn!(
                    "state file {} belongs to node {}, not {}; ignoring",
                    state_file.path().display(), stored, node_id
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("unable to read state file {}: {}", state_file.path().display(), e);
            }
        }

        Ok(())
    }

    async fn get_local_node_id(&self) -> Result<Option<NodeId>> {
        Ok(self.inner.read().await.local_node_id)
    }

    async fn set_upstream_last_seen(&self, upstream_node_id: NodeId) -> Result<()> {
        let mut block = self.inner.write().await;
        if block.local_node_id == Some(upstream_node_id) {
            return Err(Error::InvalidUpstream(upstream_node_id));
        }
        block.upstream_last_seen = Some(Utc::now());
        block.upstream_node_id = Some(upstream_node_id);
        Ok(())
    }

    async fn get_upstream_last_seen(&self) -> Result<i64> {
        Ok(self.inner.read().await.last_seen_secs())
    }

    async fn set_upstream_node_id(&self, node_id: NodeId) -> Result<()> {
        let mut block = self.inner.write().await;
        if block.local_node_id == Some(node_id) {
            return Err(Error::InvalidUpstream(node_id));
        }
        block.upstream_node_id = Some(node_id);
        Ok(())
    }

    async fn get_upstream_node_id(&self) -> Result<Option<NodeId>> {
        Ok(self.inner.read().await.upstream_node_id)
    }

    async fn begin_candidacy(&self, rank: CandidateRank) -> Result<Option<u64>> {
        let mut block = self.inner.write().await;
        let local = block.local_node_id.ok_or(Error::NotInitialised)?;
        if local != rank.node_id {
            return Err(Error::Election(format!(
                "node {} cannot stand as candidate {}",
                local, rank.node_id
            )));
        }

        if block.paused || block.follow_new_primary || block.local_primary {
            return Ok(None);
        }
        if let Some(nominee) = block.nominee() {
            if block.voting_status == VotingStatus::Voted && nominee.outranks(&rank) {
                return Ok(None);
            }
        }

        block.current_electoral_term += 1;
        block.voting_status = VotingStatus::Candidate;
        block.candidate = Some(FollowTarget::Node(rank.node_id));
        block.candidate_priority = rank.priority;

        Ok(Some(block.current_electoral_term))
    }

    async fn current_term(&self) -> Result<u64> {
        Ok(self.inner.read().await.current_electoral_term)
    }

    async fn increment_current_term(&self) -> Result<u64> {
        let mut block = self.inner.write().await;
        block.current_electoral_term += 1;
        Ok(block.current_electoral_term)
    }

    async fn other_node_is_candidate(&self, rank: CandidateRank, term: u64) -> Result<VoteReply> {
        let mut block = self.inner.write().await;

        let Some(local) = block.local_node_id else {
            return Ok(block.reply(false));
        };
        if local == rank.node_id || block.paused {
            return Ok(block.reply(false));
        }

        if block.local_primary {
            return Ok(block.settled_reply(local));
        }

        // A result is already published; only confirm it
        if block.follow_new_primary {
            return Ok(match block.candidate {
                Some(FollowTarget::Node(id)) if id == rank.node_id => block.reply(true),
                Some(FollowTarget::Node(id)) => block.settled_reply(id),
                _ => block.reply(false),
            });
        }

        if let Some((settled_term, primary)) = block.settled {
            if term <= settled_term {
                let confirmed = primary == rank.node_id;
                return Ok(if confirmed { block.reply(true) } else { block.settled_reply(primary) });
            }
        }

        if term < block.current_electoral_term {
            return Ok(block.reply(false));
        }

        if term == block.current_electoral_term {
            if let Some(nominee) = block.nominee() {
                if nominee == rank {
                    return Ok(block.reply(true));
                }
                if nominee.outranks(&rank) {
                    return Ok(block.reply(false));
                }
            }
        }

        block.current_electoral_term = term;
        block.voting_status = VotingStatus::Voted;
        block.candidate = Some(FollowTarget::Node(rank.node_id));
        block.candidate_priority = rank.priority;

        Ok(block.reply(true))
    }

    async fn notify_follow_primary(&self, target: FollowTarget) -> Result<()> {
        let mut block = self.inner.write().await;
        if block.local_node_id.is_none() {
            return Ok(());
        }
        block.candidate = Some(target);
        block.follow_new_primary = true;
        if let FollowTarget::Node(primary) = target {
            block.settled = Some((block.current_electoral_term, primary));
        }
        Ok(())
    }

    async fn get_new_primary(&self) -> Result<Option<FollowTarget>> {
        let block = self.inner.read().await;
        Ok(if block.follow_new_primary { block.candidate } else { None })
    }

    async fn reset_voting_status(&self) -> Result<()> {
        let mut block = self.inner.write().await;
        if block.local_node_id.is_some() {
            block.voting_status = VotingStatus::NoVote;
            block.candidate = None;
            block.candidate_priority = 0;
            block.follow_new_primary = false;
        }
        Ok(())
    }

    async fn pause(&self, paused: bool) -> Result<()> {
        self.set_paused(paused).await.map(|_| ())
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(self.inner.read().await.paused)
    }

    async fn snapshot(&self) -> Result<CoordinationSnapshot> {
        let block = self.inner.read().await.clone();
        let daemon_running = block
            .daemon_pid
            .map(|pid| self.probe.is_alive(pid))
            .unwrap_or(false);

        Ok(CoordinationSnapshot {
            local_node_id: block.local_node_id,
            paused: block.paused,
            upstream_node_id: block.upstream_node_id,
            upstream_last_seen: block.last_seen_secs(),
            voting_status: block.voting_status,
            current_electoral_term: block.current_electoral_term,
            candidate: block.candidate,
            follow_new_primary: block.follow_new_primary,
            daemon_pid: block.daemon_pid,
            daemon_running,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProcessProbe;
    use tempfile::tempdir;

    struct FixedProbe(bool);

    impl LivenessProbe for FixedProbe {
        fn is_alive(&self, _pid: u32) -> bool {
            self.0
        }
    }

    fn state() -> SharedState {
        SharedState::new(None, Arc::new(ProcessProbe))
    }

    fn rank(node_id: NodeId, priority: i32) -> CandidateRank {
        CandidateRank { node_id, priority }
    }

    #[tokio::test]
    async fn test_local_node_id_first_writer_wins() {
        let state = state();
        assert_eq!(state.get_local_node_id().await.unwrap(), None);

        state.set_local_node_id(3).await.unwrap();
        state.set_local_node_id(5).await.unwrap();
        assert_eq!(state.get_local_node_id().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_self_upstream_rejected_without_mutation() {
        let state = state();
        state.set_local_node_id(2).await.unwrap();
        state.set_upstream_node_id(1).await.unwrap();

        assert!(matches!(
            state.set_upstream_node_id(2).await,
            Err(Error::InvalidUpstream(2))
        ));
        assert_eq!(state.get_upstream_node_id().await.unwrap(), Some(1));

        assert!(state.set_upstream_last_seen(2).await.is_err());
        assert_eq!(state.get_upstream_last_seen().await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_upstream_last_seen() {
        let state = state();
        state.set_local_node_id(2).await.unwrap();
        assert_eq!(state.get_upstream_last_seen().await.unwrap(), -1);

        state.set_upstream_last_seen(1).await.unwrap();
        let secs = state.get_upstream_last_seen().await.unwrap();
        assert!((0..=1).contains(&secs));
        assert_eq!(state.get_upstream_node_id().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_notify_is_noop_before_init() {
        let state = state();
        state.notify_follow_primary(FollowTarget::Node(2)).await.unwrap();
        assert_eq!(state.get_new_primary().await.unwrap(), None);

        state.set_local_node_id(3).await.unwrap();
        state.notify_follow_primary(FollowTarget::Node(2)).await.unwrap();
        assert_eq!(state.get_new_primary().await.unwrap(), Some(FollowTarget::Node(2)));

        state.reset_voting_status().await.unwrap();
        assert_eq!(state.get_new_primary().await.unwrap(), None);
        assert_eq!(state.voting_status().await, VotingStatus::NoVote);
    }

    #[tokio::test]
    async fn test_rerun_notification_distinct_from_nodes() {
        let state = state();
        state.set_local_node_id(1).await.unwrap();
        state.notify_follow_primary(FollowTarget::Rerun).await.unwrap();

        let target = state.get_new_primary().await.unwrap();
        assert_eq!(target, Some(FollowTarget::Rerun));
        assert_ne!(target, Some(FollowTarget::Node(0)));
    }

    #[tokio::test]
    async fn test_term_is_monotonic() {
        let state = state();
        state.set_local_node_id(1).await.unwrap();

        let mut last = state.current_term().await.unwrap();
        let t = state.begin_candidacy(rank(1, 100)).await.unwrap().unwrap();
        assert!(t > last);
        last = t;

        // Older announcement leaves the term alone
        let reply = state.other_node_is_candidate(rank(2, 200), 0).await.unwrap();
        assert!(!reply.granted);
        assert_eq!(state.current_term().await.unwrap(), last);

        let reply = state.other_node_is_candidate(rank(2, 200), 5).await.unwrap();
        assert!(reply.granted);
        assert_eq!(reply.term, 5);

        state.reset_voting_status().await.unwrap();
        assert_eq!(state.current_term().await.unwrap(), 5);
        assert_eq!(state.increment_current_term().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_vote_tie_break_within_term() {
        let state = state();
        state.set_local_node_id(3).await.unwrap();
        let term = state.begin_candidacy(rank(3, 50)).await.unwrap().unwrap();

        // Lower priority loses against our own candidacy
        let reply = state.other_node_is_candidate(rank(4, 10), term).await.unwrap();
        assert!(!reply.granted);
        assert_eq!(reply.nominee, Some(rank(3, 50)));

        // Equal priority, lower id wins
        let reply = state.other_node_is_candidate(rank(2, 50), term).await.unwrap();
        assert!(reply.granted);
        assert_eq!(state.voting_status().await, VotingStatus::Voted);

        // Once voted for 2, a worse candidate in the same term is refused
        let reply = state.other_node_is_candidate(rank(5, 50), term).await.unwrap();
        assert!(!reply.granted);
        assert_eq!(reply.nominee, Some(rank(2, 50)));

        // Re-announcement by the nominee is confirmed
        assert!(state.other_node_is_candidate(rank(2, 50), term).await.unwrap().granted);
    }

    #[tokio::test]
    async fn test_paused_node_neither_stands_nor_concedes() {
        let state = state();
        state.set_local_node_id(2).await.unwrap();
        state.pause(true).await.unwrap();

        assert_eq!(state.begin_candidacy(rank(2, 100)).await.unwrap(), None);
        assert_eq!(state.current_term().await.unwrap(), 0);

        let reply = state.other_node_is_candidate(rank(3, 100), 1).await.unwrap();
        assert!(!reply.granted);

        state.pause(false).await.unwrap();
        assert!(state.begin_candidacy(rank(2, 100)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_uninitialised_node_denies_and_cannot_stand() {
        let state = state();
        let reply = state.other_node_is_candidate(rank(2, 100), 1).await.unwrap();
        assert!(!reply.granted);
        assert!(matches!(
            state.begin_candidacy(rank(2, 100)).await,
            Err(Error::NotInitialised)
        ));
    }

    #[tokio::test]
    async fn test_published_result_only_confirms_winner() {
        let state = state();
        state.set_local_node_id(3).await.unwrap();
        state.notify_follow_primary(FollowTarget::Node(2)).await.unwrap();

        assert!(state.other_node_is_candidate(rank(2, 50), 9).await.unwrap().granted);
        assert!(!state.other_node_is_candidate(rank(1, 100), 9).await.unwrap().granted);
        assert_eq!(state.begin_candidacy(rank(3, 10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_settled_term_refuses_late_candidate() {
        let state = state();
        state.set_local_node_id(3).await.unwrap();

        assert!(state.other_node_is_candidate(rank(2, 50), 1).await.unwrap().granted);
        state.notify_follow_primary(FollowTarget::Node(2)).await.unwrap();
        state.reset_voting_status().await.unwrap();
        assert_eq!(state.settled().await, Some((1, 2)));

        // Same term, different candidate: refused, and told who won
        let reply = state.other_node_is_candidate(rank(4, 100), 1).await.unwrap();
        assert!(!reply.granted);
        assert_eq!(reply.primary, Some(2));
        assert_eq!(state.voting_status().await, VotingStatus::NoVote);

        // A later failover opens a new term
        let reply = state.other_node_is_candidate(rank(4, 100), 2).await.unwrap();
        assert!(reply.granted);
        assert_eq!(reply.primary, None);
    }

    #[tokio::test]
    async fn test_running_primary_neither_concedes_nor_stands() {
        let state = state();
        state.set_local_node_id(2).await.unwrap();
        state.set_local_primary(true).await;

        let reply = state.other_node_is_candidate(rank(4, 100), 7).await.unwrap();
        assert!(!reply.granted);
        assert_eq!(reply.primary, Some(2));
        assert_eq!(state.current_term().await.unwrap(), 0);
        assert_eq!(state.begin_candidacy(rank(2, 100)).await.unwrap(), None);

        state.set_local_primary(false).await;
        assert_eq!(state.begin_candidacy(rank(2, 100)).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_set_paused_reports_previous_value() {
        let state = state();
        state.set_local_node_id(2).await.unwrap();

        assert!(!state.set_paused(true).await.unwrap());
        assert!(state.set_paused(true).await.unwrap());
        assert!(state.set_paused(false).await.unwrap());
        assert!(!state.is_paused().await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_pause_leaves_file_and_memory_agreeing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repguard.state");
        let state = Arc::new(SharedState::new(Some(StateFile::new(&path)), Arc::new(ProcessProbe)));
        state.set_local_node_id(5).await.unwrap();

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let state = state.clone();
                tokio::spawn(async move { state.pause(i % 2 == 0).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = StateFile::new(&path).read().await.unwrap().unwrap();
        assert_eq!(stored.node_id, 5);
        assert_eq!(stored.paused, state.is_paused().await.unwrap());
    }

    #[tokio::test]
    async fn test_pause_survives_restart_voting_state_does_not() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repguard.state");

        {
            let state = SharedState::new(Some(StateFile::new(&path)), Arc::new(ProcessProbe));
            state.set_local_node_id(4).await.unwrap();
            state.begin_candidacy(rank(4, 100)).await.unwrap();
            state.pause(true).await.unwrap();
            assert_eq!(state.current_term().await.unwrap(), 1);
        }

        let restarted = SharedState::new(Some(StateFile::new(&path)), Arc::new(ProcessProbe));
        assert!(!restarted.is_paused().await.unwrap());
        restarted.set_local_node_id(4).await.unwrap();

        assert!(restarted.is_paused().await.unwrap());
        assert_eq!(restarted.current_term().await.unwrap(), 0);
        assert_eq!(restarted.voting_status().await, VotingStatus::NoVote);
    }

    #[tokio::test]
    async fn test_state_file_for_other_node_ignored() {
        let dir = tempdir().unwrap();
        let file = StateFile::new(dir.path().join("repguard.state"));
        file.write(StoredState { node_id: 9, paused: true }).await.unwrap();

        let state = SharedState::new(Some(file), Arc::new(ProcessProbe));
        state.set_local_node_id(4).await.unwrap();
        assert!(!state.is_paused().await.unwrap());
    }

    #[tokio::test]
    async fn test_daemon_pid_registration() {
        let state = SharedState::new(None, Arc::new(FixedProbe(true)));
        assert!(!state.is_daemon_running().await);

        state.set_daemon_pid(Some(4242), Some(PathBuf::from("/run/repguard.pid"))).await;
        assert!(state.is_daemon_running().await);
        assert_eq!(state.get_daemon_pid().await, Some(4242));

        state.set_daemon_pid(None, Some(PathBuf::from("/run/repguard.pid"))).await;
        assert!(!state.is_daemon_running().await);
        assert_eq!(state.get_daemon_pidfile().await, None);

        let dead = SharedState::new(None, Arc::new(FixedProbe(false)));
        dead.set_daemon_pid(Some(4242), None).await;
        assert!(!dead.is_daemon_running().await);
        assert!(!dead.snapshot().await.unwrap().daemon_running);
    }
}
