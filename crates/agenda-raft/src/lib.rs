//! Raft consensus node: leader election, log replication, and commit-index
//! advancement over an opaque command log. This crate knows nothing about
//! calendars, groups, or users — it only replicates and orders byte strings;
//! `agenda-repository` gives those bytes meaning.

pub mod grpc;
pub mod log;
pub mod node;
pub mod role;
pub mod rpc;

pub use grpc::{RaftGrpcService, RaftGrpcTransport};
pub use log::{LogEntry, LogIndex, RaftStorage, MemoryRaftStorage, Term};
pub use node::{Applied, LocalRaftNode, RaftConfig, RaftNode};
pub use role::Role;
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RaftTransport, RequestVoteRequest,
    RequestVoteResponse,
};
