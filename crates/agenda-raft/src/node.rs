//! The consensus state machine itself: election timing, vote counting, log
//! replication, and commit-index advancement. One [`LocalRaftNode`] per
//! process; `agenda-repository` drives it through the [`RaftNode`] trait and
//! drains its apply channel to update the projection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agenda_types::error::AgendaError;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};

use crate::log::{LogEntry, LogIndex, RaftStorage, Term};
use crate::role::Role;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RaftTransport, RequestVoteRequest,
    RequestVoteResponse,
};

/// Timing parameters. Election timeouts are randomized within the
/// `[election_timeout_min, election_timeout_max)` window on every restart of
/// the timer, so peers don't perpetually tie and re-split a vote.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}

impl RaftConfig {
    fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        let millis = if max > min {
            rand::thread_rng().gen_range(min..max)
        } else {
            min
        };
        Duration::from_millis(millis)
    }
}

/// A committed log entry handed to the application layer. `respond` is
/// `Some` only on the node that originally accepted the proposal (via
/// [`RaftNode::propose`]); every other node applies the same entry with
/// `respond: None` since nobody there is waiting on it.
pub struct Applied {
    pub entry: LogEntry,
    pub respond: Option<oneshot::Sender<Result<Bytes, AgendaError>>>,
}

struct NodeState {
    role: Role,
    current_leader: Option<String>,
}

/// What every `agenda-node` process needs to participate in the consensus
/// group, reachable as a trait object from `agenda-repository` so it can be
/// swapped out in tests for a fake that always accepts proposals.
#[async_trait]
pub trait RaftNode: Send + Sync {
    /// Appends `command` to the log if this node is currently the leader;
    /// the returned receiver resolves once the entry is either committed and
    /// applied (`Ok`) or this node learns it can no longer guarantee that
    /// (`Err`).
    async fn propose(&self, command: Bytes) -> oneshot::Receiver<Result<Bytes, AgendaError>>;
    async fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse;
    async fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse;
    async fn is_leader(&self) -> bool;
    async fn current_leader(&self) -> Option<String>;
    async fn current_term(&self) -> Term;
    async fn role(&self) -> Role;
    fn id(&self) -> &str;
}

pub struct LocalRaftNode {
    id: String,
    peers: Vec<String>,
    storage: Arc<dyn RaftStorage>,
    transport: Arc<dyn RaftTransport>,
    config: RaftConfig,
    state: RwLock<NodeState>,
    heartbeat_notify: Notify,
    pending: Mutex<HashMap<LogIndex, oneshot::Sender<Result<Bytes, AgendaError>>>>,
    next_index: Mutex<HashMap<String, LogIndex>>,
    match_index: Mutex<HashMap<String, LogIndex>>,
    last_applied: Mutex<LogIndex>,
    apply_tx: mpsc::UnboundedSender<Applied>,
}

impl LocalRaftNode {
    /// Builds the node and spawns its election timer. Returns the apply
    /// channel's receiving half; the caller (`agenda-repository`) owns
    /// draining it and feeding each entry to the `AgendaStore`.
    pub fn spawn(
        id: impl Into<String>,
        peers: Vec<String>,
        storage: Arc<dyn RaftStorage>,
        transport: Arc<dyn RaftTransport>,
        config: RaftConfig,
    ) -> (Arc<LocalRaftNode>, mpsc::UnboundedReceiver<Applied>) {
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let node = Arc::new(LocalRaftNode {
            id: id.into(),
            peers,
            storage,
            transport,
            config,
            state: RwLock::new(NodeState { role: Role::Follower, current_leader: None }),
            heartbeat_notify: Notify::new(),
            pending: Mutex::new(HashMap::new()),
            next_index: Mutex::new(HashMap::new()),
            match_index: Mutex::new(HashMap::new()),
            last_applied: Mutex::new(0),
            apply_tx,
        });
        tokio::spawn(node.clone().run_election_timer());
        (node, apply_rx)
    }

    async fn run_election_timer(self: Arc<Self>) {
        loop {
            let timeout = self.config.random_election_timeout();
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let is_leader = matches!(self.state.read().await.role, Role::Leader);
                    if !is_leader {
                        self.clone().start_election().await;
                    }
                }
                _ = self.heartbeat_notify.notified() => {
                    // Heard from a leader or granted a vote; timer restarts.
                }
            }
        }
    }

    async fn start_election(self: Arc<Self>) {
        let (last_index, last_term) = self.storage.last_index_and_term().await.unwrap_or((0, 0));
        let new_term = self.storage.current_term().await.unwrap_or(0) + 1;
        if self
            .storage
            .set_term_and_vote(new_term, Some(self.id.clone()))
            .await
            .is_err()
        {
            return;
        }
        {
            let mut state = self.state.write().await;
            state.role = Role::Candidate;
            state.current_leader = None;
        }
        tracing::info!(node = %self.id, term = new_term, "starting election");

        if self.peers.is_empty() {
            // Single-node cluster: a vote of one is already a majority.
            self.clone().become_leader(new_term).await;
            return;
        }

        let mut handles = Vec::with_capacity(self.peers.len());
        for peer in self.peers.clone() {
            let this = self.clone();
            let request = RequestVoteRequest {
                term: new_term,
                candidate_id: self.id.clone(),
                last_log_index: last_index,
                last_log_term: last_term,
            };
            handles.push(tokio::spawn(async move {
                this.transport.request_vote(&peer, request).await
            }));
        }

        let mut granted = 1usize; // vote for self
        for handle in handles {
            let Ok(result) = handle.await else { continue };
            let Ok(response) = result else { continue };
            if response.term > new_term {
                self.step_down(response.term).await;
                return;
            }
            if response.vote_granted {
                granted += 1;
            }
        }

        let total_nodes = self.peers.len() + 1;
        if still_candidate_for_term(&self, new_term).await && granted * 2 > total_nodes {
            self.clone().become_leader(new_term).await;
        } else {
            let mut state = self.state.write().await;
            if state.role == Role::Candidate {
                state.role = Role::Follower;
            }
        }
    }

    async fn become_leader(self: Arc<Self>, term: Term) {
        {
            let mut state = self.state.write().await;
            state.role = Role::Leader;
            state.current_leader = Some(self.id.clone());
        }
        tracing::info!(node = %self.id, term, "became leader");
        self.heartbeat_notify.notify_one();

        let (last_index, _) = self.storage.last_index_and_term().await.unwrap_or((0, 0));
        {
            let mut next_index = self.next_index.lock().unwrap();
            let mut match_index = self.match_index.lock().unwrap();
            next_index.clear();
            match_index.clear();
            for peer in &self.peers {
                next_index.insert(peer.clone(), last_index + 1);
                match_index.insert(peer.clone(), 0);
            }
        }

        tokio::spawn(self.run_leader(term));
    }

    async fn run_leader(self: Arc<Self>, term: Term) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            ticker.tick().await;
            {
                let state = self.state.read().await;
                if state.role != Role::Leader {
                    return;
                }
            }
            let current_term = self.storage.current_term().await.unwrap_or(term);
            if current_term != term {
                return;
            }

            let mut handles = Vec::with_capacity(self.peers.len());
            for peer in self.peers.clone() {
                let this = self.clone();
                handles.push(tokio::spawn(async move { this.replicate_to_peer(peer, term).await }));
            }
            for handle in handles {
                let _ = handle.await;
            }

            self.recompute_commit_index(term).await;
        }
    }

    async fn replicate_to_peer(self: Arc<Self>, peer: String, term: Term) {
        let next = *self.next_index.lock().unwrap().get(&peer).unwrap_or(&1);
        let prev_index = next.saturating_sub(1);
        let prev_term = if prev_index == 0 {
            0
        } else {
            self.storage
                .entry_at(prev_index)
                .await
                .ok()
                .flatten()
                .map(|e| e.term)
                .unwrap_or(0)
        };
        let entries = self.storage.entries_from(next).await.unwrap_or_default();
        let leader_commit = self.storage.commit_index().await.unwrap_or(0);
        let request = AppendEntriesRequest {
            term,
            leader_id: self.id.clone(),
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries: entries.clone(),
            leader_commit,
        };

        match self.transport.append_entries(&peer, request).await {
            Ok(response) => {
                if response.term > term {
                    self.step_down(response.term).await;
                    return;
                }
                if response.success {
                    if let Some(last) = entries.last() {
                        self.match_index.lock().unwrap().insert(peer.clone(), last.index);
                        self.next_index.lock().unwrap().insert(peer.clone(), last.index + 1);
                    }
                } else {
                    let mut next_index = self.next_index.lock().unwrap();
                    let current = *next_index.get(&peer).unwrap_or(&1);
                    let fallback = current.saturating_sub(1).max(1);
                    let new_next = response.conflict_index.unwrap_or(fallback).max(1).min(current);
                    next_index.insert(peer, new_next);
                }
            }
            Err(err) => {
                tracing::warn!(peer = %peer, error = %err, "append_entries rpc failed");
            }
        }
    }

    async fn recompute_commit_index(&self, term: Term) {
        let (leader_last_index, _) = self.storage.last_index_and_term().await.unwrap_or((0, 0));
        let mut indices: Vec<LogIndex> = self.match_index.lock().unwrap().values().copied().collect();
        indices.push(leader_last_index);
        indices.sort_unstable();

        let total_nodes = self.peers.len() + 1;
        // The entry at this sorted position is held by a majority of nodes.
        let majority_slot = total_nodes.saturating_sub(total_nodes / 2 + 1);
        let Some(&candidate) = indices.get(majority_slot) else { return };

        let current_commit = self.storage.commit_index().await.unwrap_or(0);
        if candidate <= current_commit {
            return;
        }
        // Raft safety: a leader only commits entries from its own term
        // directly; older-term entries ride along once a same-term entry
        // commits past them.
        if let Ok(Some(entry)) = self.storage.entry_at(candidate).await {
            if entry.term == term {
                self.advance_commit_and_dispatch(candidate).await;
            }
        }
    }

    async fn advance_commit_and_dispatch(&self, new_commit: LogIndex) {
        let last_applied = *self.last_applied.lock().unwrap();
        for index in (last_applied + 1)..=new_commit {
            let Ok(Some(entry)) = self.storage.entry_at(index).await else { continue };
            let respond = self.pending.lock().unwrap().remove(&index);
            if self.apply_tx.send(Applied { entry, respond }).is_err() {
                tracing::error!(index, "apply channel closed, dropping committed entry");
            }
        }
        *self.last_applied.lock().unwrap() = new_commit;
        let _ = self.storage.set_commit_index(new_commit).await;
    }

    async fn step_down(&self, new_term: Term) {
        let _ = self.storage.set_term_and_vote(new_term, None).await;
        let mut state = self.state.write().await;
        state.role = Role::Follower;
        state.current_leader = None;
    }
}

/// Guards against a slow election whose votes trickle in after this node has
/// already moved on to (or past) a different term.
async fn still_candidate_for_term(node: &LocalRaftNode, term: Term) -> bool {
    node.storage.current_term().await.unwrap_or(0) == term
        && matches!(node.state.read().await.role, Role::Candidate)
}

#[async_trait]
impl RaftNode for LocalRaftNode {
    async fn propose(&self, command: Bytes) -> oneshot::Receiver<Result<Bytes, AgendaError>> {
        let (tx, rx) = oneshot::channel();

        let is_leader = matches!(self.state.read().await.role, Role::Leader);
        if !is_leader {
            let leader_hint = self.state.read().await.current_leader.clone();
            let _ = tx.send(Err(AgendaError::NotLeader { leader_hint }));
            return rx;
        }

        let term = self.storage.current_term().await.unwrap_or(0);
        let (last_index, _) = self.storage.last_index_and_term().await.unwrap_or((0, 0));
        let index = last_index + 1;
        let entry = LogEntry { term, index, command };

        if self.storage.append(entry).await.is_err() {
            let _ = tx.send(Err(AgendaError::Transient("failed to append to log".into())));
            return rx;
        }

        self.pending.lock().unwrap().insert(index, tx);

        // Single-node clusters commit immediately; nothing else will ever
        // acknowledge this entry.
        if self.peers.is_empty() {
            self.advance_commit_and_dispatch(index).await;
        }

        rx
    }

    async fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let current_term = self.storage.current_term().await.unwrap_or(0);
        if request.term < current_term {
            return RequestVoteResponse { term: current_term, vote_granted: false };
        }
        if request.term > current_term {
            self.step_down(request.term).await;
        }

        let voted_for = self.storage.voted_for().await.unwrap_or(None);
        let (last_index, last_term) = self.storage.last_index_and_term().await.unwrap_or((0, 0));
        let log_is_at_least_as_up_to_date = request.last_log_term > last_term
            || (request.last_log_term == last_term && request.last_log_index >= last_index);
        let can_vote =
            voted_for.is_none() || voted_for.as_deref() == Some(request.candidate_id.as_str());

        if can_vote && log_is_at_least_as_up_to_date {
            let _ = self
                .storage
                .set_term_and_vote(request.term, Some(request.candidate_id.clone()))
                .await;
            self.heartbeat_notify.notify_one();
            RequestVoteResponse { term: request.term, vote_granted: true }
        } else {
            RequestVoteResponse { term: request.term.max(current_term), vote_granted: false }
        }
    }

    async fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let current_term = self.storage.current_term().await.unwrap_or(0);
        if request.term < current_term {
            return AppendEntriesResponse { term: current_term, success: false, conflict_index: None };
        }
        if request.term > current_term {
            self.step_down(request.term).await;
        }

        self.heartbeat_notify.notify_one();
        {
            let mut state = self.state.write().await;
            state.role = Role::Follower;
            state.current_leader = Some(request.leader_id.clone());
        }

        if request.prev_log_index > 0 {
            match self.storage.entry_at(request.prev_log_index).await.unwrap_or(None) {
                Some(entry) if entry.term == request.prev_log_term => {}
                Some(_) => {
                    return AppendEntriesResponse {
                        term: request.term,
                        success: false,
                        conflict_index: Some(request.prev_log_index),
                    };
                }
                None => {
                    let (last_index, _) = self.storage.last_index_and_term().await.unwrap_or((0, 0));
                    return AppendEntriesResponse {
                        term: request.term,
                        success: false,
                        conflict_index: Some(last_index.min(request.prev_log_index)),
                    };
                }
            }
        }

        for entry in &request.entries {
            match self.storage.entry_at(entry.index).await.unwrap_or(None) {
                Some(existing) if existing.term != entry.term => {
                    let _ = self.storage.truncate_from(entry.index).await;
                    let _ = self.storage.append(entry.clone()).await;
                }
                Some(_) => {} // already have this exact entry
                None => {
                    let _ = self.storage.append(entry.clone()).await;
                }
            }
        }

        let current_commit = self.storage.commit_index().await.unwrap_or(0);
        if request.leader_commit > current_commit {
            let (last_index, _) = self.storage.last_index_and_term().await.unwrap_or((0, 0));
            let new_commit = request.leader_commit.min(last_index);
            self.advance_commit_and_dispatch(new_commit).await;
        }

        AppendEntriesResponse { term: request.term.max(current_term), success: true, conflict_index: None }
    }

    async fn is_leader(&self) -> bool {
        matches!(self.state.read().await.role, Role::Leader)
    }

    async fn current_leader(&self) -> Option<String> {
        self.state.read().await.current_leader.clone()
    }

    async fn current_term(&self) -> Term {
        self.storage.current_term().await.unwrap_or(0)
    }

    async fn role(&self) -> Role {
        self.state.read().await.role
    }

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryRaftStorage;

    struct NoopTransport;

    #[async_trait]
    impl RaftTransport for NoopTransport {
        async fn request_vote(
            &self,
            _peer: &str,
            request: RequestVoteRequest,
        ) -> anyhow::Result<RequestVoteResponse> {
            Ok(RequestVoteResponse { term: request.term, vote_granted: true })
        }

        async fn append_entries(
            &self,
            _peer: &str,
            request: AppendEntriesRequest,
        ) -> anyhow::Result<AppendEntriesResponse> {
            Ok(AppendEntriesResponse { term: request.term, success: true, conflict_index: None })
        }
    }

    #[tokio::test]
    async fn single_node_cluster_commits_immediately() {
        let storage = Arc::new(MemoryRaftStorage::new());
        let transport = Arc::new(NoopTransport);
        let (node, mut apply_rx) =
            LocalRaftNode::spawn("n1", vec![], storage, transport, RaftConfig::default());

        // No peers, so this node must elect itself leader before it can
        // accept proposals; give the election timer a chance to fire.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(node.is_leader().await);

        let rx = node.propose(Bytes::from_static(b"cmd")).await;
        let applied = apply_rx.recv().await.expect("committed entry dispatched");
        assert_eq!(applied.entry.command, Bytes::from_static(b"cmd"));
        assert!(applied.respond.is_some());
        applied.respond.unwrap().send(Ok(Bytes::from_static(b"ok"))).unwrap();

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn proposing_to_a_follower_is_rejected() {
        let storage = Arc::new(MemoryRaftStorage::new());
        let transport = Arc::new(NoopTransport);
        let (node, _apply_rx) = LocalRaftNode::spawn(
            "n1",
            vec!["n2".to_string()],
            storage,
            transport,
            RaftConfig::default(),
        );

        let rx = node.propose(Bytes::from_static(b"cmd")).await;
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(AgendaError::NotLeader { .. })));
    }
}
