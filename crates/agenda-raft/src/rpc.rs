//! Wire messages exchanged between Raft peers, and the transport seam that
//! lets `agenda-node` carry them over whatever it likes (the bus, a direct
//! `tonic` channel) without this crate knowing about either.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::log::{LogEntry, LogIndex, Term};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: String,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: String,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// When `success` is false, the follower's best guess at where its log
    /// diverges, so the leader can back off `next_index` in one round trip
    /// instead of walking it down one entry at a time.
    pub conflict_index: Option<LogIndex>,
}

/// What a `RaftNode` needs from its environment to talk to peers. Kept
/// deliberately thin (one method per RPC kind) so an in-memory
/// implementation for tests and a `tonic`-backed one for `agenda-node` can
/// both satisfy it without adapters.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> anyhow::Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse>;
}
