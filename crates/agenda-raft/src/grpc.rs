//! Wire transport for peer-to-peer Raft RPCs, generated via `tonic-build`
//! the same way `agenda-supervisor::grpc` wires up the Bully protocol's
//! `SendMessage` call: one `.proto` file, a thin `From`/`Into` layer, and a
//! server that delegates straight into the node's own handlers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

use crate::log::LogEntry;
use crate::node::RaftNode;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RaftTransport, RequestVoteRequest,
    RequestVoteResponse,
};

#[allow(clippy::enum_variant_names)]
pub mod proto {
    tonic::include_proto!("agenda.raft.v1");
}

pub use proto::raft_client::RaftClient;
pub use proto::raft_server::RaftServer;
use proto::raft_server::Raft;

impl From<LogEntry> for proto::LogEntry {
    fn from(entry: LogEntry) -> Self {
        proto::LogEntry { term: entry.term, index: entry.index, command: entry.command.to_vec() }
    }
}

impl From<proto::LogEntry> for LogEntry {
    fn from(entry: proto::LogEntry) -> Self {
        LogEntry { term: entry.term, index: entry.index, command: Bytes::from(entry.command) }
    }
}

impl From<RequestVoteRequest> for proto::RequestVoteRequest {
    fn from(r: RequestVoteRequest) -> Self {
        proto::RequestVoteRequest {
            term: r.term,
            candidate_id: r.candidate_id,
            last_log_index: r.last_log_index,
            last_log_term: r.last_log_term,
        }
    }
}

impl From<proto::RequestVoteRequest> for RequestVoteRequest {
    fn from(r: proto::RequestVoteRequest) -> Self {
        RequestVoteRequest {
            term: r.term,
            candidate_id: r.candidate_id,
            last_log_index: r.last_log_index,
            last_log_term: r.last_log_term,
        }
    }
}

impl From<RequestVoteResponse> for proto::RequestVoteResponse {
    fn from(r: RequestVoteResponse) -> Self {
        proto::RequestVoteResponse { term: r.term, vote_granted: r.vote_granted }
    }
}

impl From<proto::RequestVoteResponse> for RequestVoteResponse {
    fn from(r: proto::RequestVoteResponse) -> Self {
        RequestVoteResponse { term: r.term, vote_granted: r.vote_granted }
    }
}

impl From<AppendEntriesRequest> for proto::AppendEntriesRequest {
    fn from(r: AppendEntriesRequest) -> Self {
        proto::AppendEntriesRequest {
            term: r.term,
            leader_id: r.leader_id,
            prev_log_index: r.prev_log_index,
            prev_log_term: r.prev_log_term,
            entries: r.entries.into_iter().map(Into::into).collect(),
            leader_commit: r.leader_commit,
        }
    }
}

impl From<proto::AppendEntriesRequest> for AppendEntriesRequest {
    fn from(r: proto::AppendEntriesRequest) -> Self {
        AppendEntriesRequest {
            term: r.term,
            leader_id: r.leader_id,
            prev_log_index: r.prev_log_index,
            prev_log_term: r.prev_log_term,
            entries: r.entries.into_iter().map(Into::into).collect(),
            leader_commit: r.leader_commit,
        }
    }
}

impl From<AppendEntriesResponse> for proto::AppendEntriesResponse {
    fn from(r: AppendEntriesResponse) -> Self {
        proto::AppendEntriesResponse { term: r.term, success: r.success, conflict_index: r.conflict_index }
    }
}

impl From<proto::AppendEntriesResponse> for AppendEntriesResponse {
    fn from(r: proto::AppendEntriesResponse) -> Self {
        AppendEntriesResponse { term: r.term, success: r.success, conflict_index: r.conflict_index }
    }
}

/// Server side: delegates straight into whichever [`RaftNode`] is running in
/// this process, mirroring `SupervisorService`'s thin-wrapper shape.
pub struct RaftGrpcService {
    pub node: Arc<dyn RaftNode>,
}

#[tonic::async_trait]
impl Raft for RaftGrpcService {
    async fn request_vote(
        &self,
        request: Request<proto::RequestVoteRequest>,
    ) -> Result<Response<proto::RequestVoteResponse>, Status> {
        let reply = self.node.handle_request_vote(request.into_inner().into()).await;
        Ok(Response::new(reply.into()))
    }

    async fn append_entries(
        &self,
        request: Request<proto::AppendEntriesRequest>,
    ) -> Result<Response<proto::AppendEntriesResponse>, Status> {
        let reply = self.node.handle_append_entries(request.into_inner().into()).await;
        Ok(Response::new(reply.into()))
    }
}

/// Client side: one channel per peer address, connected lazily and cached so
/// repeated heartbeats don't pay a fresh handshake. Addresses that can't be
/// parsed or connected surface as `Err`, which the node treats as an
/// unresponsive peer for this round — the same "probe failed, treat as no
/// vote" handling `agenda-supervisor::elector` uses for its own transport.
pub struct RaftGrpcTransport {
    connect_timeout: Duration,
}

impl RaftGrpcTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        RaftGrpcTransport { connect_timeout }
    }

    async fn connect(&self, peer: &str) -> anyhow::Result<RaftClient<Channel>> {
        let uri = if peer.starts_with("http://") || peer.starts_with("https://") {
            peer.to_string()
        } else {
            format!("http://{peer}")
        };
        let endpoint = Endpoint::from_shared(uri)?.connect_timeout(self.connect_timeout);
        let channel = endpoint.connect().await?;
        Ok(RaftClient::new(channel))
    }
}

#[async_trait]
impl RaftTransport for RaftGrpcTransport {
    async fn request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> anyhow::Result<RequestVoteResponse> {
        let mut client = self.connect(peer).await?;
        let response = client.request_vote(Request::new(request.into())).await?;
        Ok(response.into_inner().into())
    }

    async fn append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let mut client = self.connect(peer).await?;
        let response = client.append_entries(Request::new(request.into())).await?;
        Ok(response.into_inner().into())
    }
}
