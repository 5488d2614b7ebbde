//! The replicated repository: the only thing in this workspace allowed to
//! turn a client request into a mutation. Grounded on
//! `bpmn-lite-core::engine::BpmnLiteEngine`, the facade that sits between
//! the wire layer and a `ProcessStore` — here the facade sits between
//! `agenda-service` and a `RaftNode` + `AgendaStore` pair instead.
//!
//! Writes are leader-gated and go through [`AgendaRepository::propose`]:
//! the leader assigns the id and timestamp, marshals a [`Command`], and
//! proposes it to the Raft log. Every node — leader included — applies the
//! committed entry to its own `AgendaStore` from the apply loop spawned in
//! [`AgendaRepository::new`]; the proposer's own apply then produces the
//! value it hands back to the caller. Reads never touch the log: they are
//! served directly off the local `AgendaStore`, which may be a commit or two
//! behind the leader (the "stale-by-a-commit" contract `agenda-service`'s
//! callers are expected to tolerate).

mod command;

use std::sync::Arc;

use agenda_raft::{Applied, RaftNode};
use agenda_storage::{
    AgendaStore, EventPatch, GroupPatch, NewEvent, NewGroup, NewUser, UserPatch,
};
use agenda_types::entities::{
    Event, Group, GroupEvent, GroupEventStatus, GroupEventStatusValue, GroupInvitation,
    GroupMember, GroupRole, Id, PublicUser,
};
use agenda_types::error::AgendaError;
use bytes::Bytes;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use command::Command;

/// Fields a client supplies to create a user; `id` and `created_at` are
/// leader-assigned, not taken from the caller.
#[derive(Clone, Debug)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub hashed_password: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct CreateEventRequest {
    pub title: String,
    pub description: String,
    pub start_time: chrono::DateTime<Utc>,
    pub end_time: chrono::DateTime<Utc>,
    pub user_id: Id,
}

#[derive(Clone, Debug)]
pub struct CreateGroupRequest {
    pub name: String,
    pub description: String,
    pub created_by: Id,
    pub is_hierarchical: bool,
    pub parent_group_id: Option<Id>,
}

pub struct AgendaRepository {
    raft: Arc<dyn RaftNode>,
    store: Arc<dyn AgendaStore>,
}

impl AgendaRepository {
    /// Wires a Raft node to a store and spawns the apply loop that keeps
    /// them in sync. `apply_rx` is the receiving half `LocalRaftNode::spawn`
    /// returned — a repository owns exactly one of these for the lifetime of
    /// the process.
    pub fn new(
        raft: Arc<dyn RaftNode>,
        store: Arc<dyn AgendaStore>,
        apply_rx: mpsc::UnboundedReceiver<Applied>,
    ) -> Arc<Self> {
        let repo = Arc::new(AgendaRepository { raft, store });
        tokio::spawn(repo.clone().run_apply_loop(apply_rx));
        repo
    }

    /// Exposes the underlying Raft node for status reporting (the
    /// `/raft/status` HTTP endpoint in `agenda-service`); never used to
    /// bypass [`AgendaRepository::propose`] for writes.
    pub fn raft(&self) -> &Arc<dyn RaftNode> {
        &self.raft
    }

    async fn run_apply_loop(self: Arc<Self>, mut apply_rx: mpsc::UnboundedReceiver<Applied>) {
        while let Some(applied) = apply_rx.recv().await {
            let result = self.apply(&applied.entry.command).await;
            if let Err(ref err) = result {
                tracing::warn!(error = %err, "failed to apply committed entry");
            }
            if let Some(respond) = applied.respond {
                let _ = respond.send(result);
            }
        }
    }

    /// Applies one committed command to the local store. Runs on *every*
    /// replica, so it must be deterministic: the command already carries any
    /// leader-assigned id or timestamp, nothing here may call `Uuid::new_v4`
    /// or `Utc::now`.
    async fn apply(&self, command: &Bytes) -> Result<Bytes, AgendaError> {
        let command: Command = serde_json::from_slice(command)
            .map_err(|e| AgendaError::InvalidArgument(format!("malformed command: {e}")))?;

        match command {
            Command::CreateUser(new_user) => {
                let user = self.store.create_user(new_user).await?;
                encode(&PublicUser::from(&user))
            }
            Command::UpdateUser { id, patch, now } => {
                let user = self.store.update_user(id, patch, now).await?;
                encode(&PublicUser::from(&user))
            }
            Command::DeleteUser { id } => {
                self.store.delete_user(id).await?;
                encode(&())
            }
            Command::CreateEvent(new_event) => encode(&self.store.create_event(new_event).await?),
            Command::UpdateEvent { id, patch } => encode(&self.store.update_event(id, patch).await?),
            Command::DeleteEvent { id } => {
                self.store.delete_event(id).await?;
                encode(&())
            }
            Command::CreateGroup(new_group) => encode(&self.store.create_group(new_group).await?),
            Command::UpdateGroup { id, patch, now } => encode(&self.store.update_group(id, patch, now).await?),
            Command::DeleteGroup { id } => {
                self.store.delete_group(id).await?;
                encode(&())
            }
            Command::AddMember { group_id, user_id, role, now } => {
                encode(&self.store.add_member(group_id, user_id, role, now).await?)
            }
            Command::RemoveMember { group_id, user_id } => {
                self.store.remove_member(group_id, user_id).await?;
                encode(&())
            }
            Command::UpdateMemberRole { group_id, user_id, role } => {
                encode(&self.store.update_member_role(group_id, user_id, role).await?)
            }
            Command::CreateInvite { id, group_id, invited_user_id, invited_by, now } => {
                encode(&self.store.create_invite(id, group_id, invited_user_id, invited_by, now).await?)
            }
            Command::AcceptInvite { id, now } => encode(&self.store.accept_invite(id, now).await?),
            Command::RejectInvite { id, now } => encode(&self.store.reject_invite(id, now).await?),
            Command::CancelInvite { id, now } => encode(&self.store.cancel_invite(id, now).await?),
            Command::CreateGroupEvent { id, group_id, event_id, added_by, is_hierarchical, now } => {
                encode(
                    &self
                        .store
                        .create_group_event(id, group_id, event_id, added_by, is_hierarchical, now)
                        .await?,
                )
            }
            Command::UpdateGroupEventStatus { group_id, event_id, user_id, status, now } => {
                encode(&self.store.update_group_event_status(group_id, event_id, user_id, status, now).await?)
            }
        }
    }

    /// Leader-gates, marshals, proposes, and waits for the apply loop to
    /// settle `command`; `Err(NotLeader)` short-circuits before ever
    /// touching the log, matching spec's fail-fast requirement on followers.
    async fn propose<R: DeserializeOwned>(&self, command: Command) -> Result<R, AgendaError> {
        if !self.raft.is_leader().await {
            return Err(AgendaError::NotLeader { leader_hint: self.raft.current_leader().await });
        }
        let payload = serde_json::to_vec(&command)
            .map(Bytes::from)
            .map_err(|e| AgendaError::InvalidArgument(e.to_string()))?;
        let rx = self.raft.propose(payload).await;
        let bytes = rx.await.map_err(|_| AgendaError::Cancelled)??;
        serde_json::from_slice(&bytes).map_err(|e| AgendaError::Transient(e.to_string()))
    }

    // ── Users ──

    pub async fn create_user(&self, req: CreateUserRequest) -> Result<PublicUser, AgendaError> {
        let new_user = NewUser {
            id: Uuid::new_v4(),
            username: req.username,
            email: req.email,
            hashed_password: req.hashed_password,
            created_at: Utc::now(),
        };
        self.propose(Command::CreateUser(new_user)).await
    }

    pub async fn get_user(&self, id: Id) -> Result<Option<PublicUser>, AgendaError> {
        Ok(self.store.get_user(id).await?.as_ref().map(PublicUser::from))
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<PublicUser>, AgendaError> {
        Ok(self.store.get_user_by_email(email).await?.as_ref().map(PublicUser::from))
    }

    /// Returns the public profile alongside the raw `hashed_password`, for
    /// `agenda-service`'s `user.login` handler to verify a submitted password
    /// against. Nothing else in this crate reads `hashed_password` off a
    /// `User` row; bcrypt verification itself stays out of this crate
    /// entirely, consistent with the password-hashing scheme being an
    /// external-collaborator concern rather than core repository logic.
    pub async fn get_login_credentials(
        &self,
        email: &str,
    ) -> Result<Option<(PublicUser, Vec<u8>)>, AgendaError> {
        let user = self.store.get_user_by_email(email).await?;
        Ok(user.as_ref().map(|u| (PublicUser::from(u), u.hashed_password.clone())))
    }

    pub async fn update_user(&self, id: Id, patch: UserPatch) -> Result<PublicUser, AgendaError> {
        self.propose(Command::UpdateUser { id, patch, now: Utc::now() }).await
    }

    pub async fn delete_user(&self, id: Id) -> Result<(), AgendaError> {
        self.propose(Command::DeleteUser { id }).await
    }

    // ── Events ──

    pub async fn create_event(&self, req: CreateEventRequest) -> Result<Event, AgendaError> {
        let new_event = NewEvent {
            id: Uuid::new_v4(),
            title: req.title,
            description: req.description,
            start_time: req.start_time,
            end_time: req.end_time,
            user_id: req.user_id,
        };
        self.propose(Command::CreateEvent(new_event)).await
    }

    pub async fn get_event(&self, id: Id) -> Result<Option<Event>, AgendaError> {
        self.store.get_event(id).await
    }

    pub async fn update_event(&self, id: Id, patch: EventPatch) -> Result<Event, AgendaError> {
        self.propose(Command::UpdateEvent { id, patch }).await
    }

    pub async fn delete_event(&self, id: Id) -> Result<(), AgendaError> {
        self.propose(Command::DeleteEvent { id }).await
    }

    pub async fn list_events_for_user(
        &self,
        user_id: Id,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Event>, AgendaError> {
        self.store.list_events_for_user(user_id, offset, limit).await
    }

    // ── Groups ──

    pub async fn create_group(&self, req: CreateGroupRequest) -> Result<Group, AgendaError> {
        let new_group = NewGroup {
            id: Uuid::new_v4(),
            name: req.name,
            description: req.description,
            created_by: req.created_by,
            is_hierarchical: req.is_hierarchical,
            parent_group_id: req.parent_group_id,
            created_at: Utc::now(),
        };
        self.propose(Command::CreateGroup(new_group)).await
    }

    pub async fn get_group(&self, id: Id) -> Result<Option<Group>, AgendaError> {
        self.store.get_group(id).await
    }

    pub async fn update_group(&self, id: Id, patch: GroupPatch) -> Result<Group, AgendaError> {
        self.propose(Command::UpdateGroup { id, patch, now: Utc::now() }).await
    }

    pub async fn delete_group(&self, id: Id) -> Result<(), AgendaError> {
        self.propose(Command::DeleteGroup { id }).await
    }

    pub async fn list_groups_for_user(&self, user_id: Id) -> Result<Vec<Group>, AgendaError> {
        self.store.list_groups_for_user(user_id).await
    }

    // ── Group membership ──

    pub async fn add_member(
        &self,
        group_id: Id,
        user_id: Id,
        role: GroupRole,
    ) -> Result<GroupMember, AgendaError> {
        self.propose(Command::AddMember { group_id, user_id, role, now: Utc::now() }).await
    }

    pub async fn list_members(&self, group_id: Id) -> Result<Vec<GroupMember>, AgendaError> {
        self.store.list_members(group_id).await
    }

    pub async fn remove_member(&self, group_id: Id, user_id: Id) -> Result<(), AgendaError> {
        self.propose(Command::RemoveMember { group_id, user_id }).await
    }

    pub async fn update_member_role(
        &self,
        group_id: Id,
        user_id: Id,
        role: GroupRole,
    ) -> Result<GroupMember, AgendaError> {
        self.propose(Command::UpdateMemberRole { group_id, user_id, role }).await
    }

    // ── Group invitations ──

    pub async fn create_invite(
        &self,
        group_id: Id,
        invited_user_id: Id,
        invited_by: Id,
    ) -> Result<GroupInvitation, AgendaError> {
        self.propose(Command::CreateInvite {
            id: Uuid::new_v4(),
            group_id,
            invited_user_id,
            invited_by,
            now: Utc::now(),
        })
        .await
    }

    pub async fn accept_invite(&self, id: Id) -> Result<GroupInvitation, AgendaError> {
        self.propose(Command::AcceptInvite { id, now: Utc::now() }).await
    }

    pub async fn reject_invite(&self, id: Id) -> Result<GroupInvitation, AgendaError> {
        self.propose(Command::RejectInvite { id, now: Utc::now() }).await
    }

    pub async fn cancel_invite(&self, id: Id) -> Result<GroupInvitation, AgendaError> {
        self.propose(Command::CancelInvite { id, now: Utc::now() }).await
    }

    pub async fn get_invite(&self, id: Id) -> Result<Option<GroupInvitation>, AgendaError> {
        self.store.get_invite(id).await
    }

    pub async fn list_invites(&self, group_id: Id) -> Result<Vec<GroupInvitation>, AgendaError> {
        self.store.list_invites(group_id).await
    }

    // ── Group events ──

    /// Looks up the group's `is_hierarchical` flag locally before proposing:
    /// this is a read, so it tolerates the same staleness as every other
    /// read in this repository, and it saves the state machine from having
    /// to trust a caller-supplied flag that might disagree with the group.
    pub async fn create_group_event(
        &self,
        group_id: Id,
        event_id: Id,
        added_by: Id,
    ) -> Result<GroupEvent, AgendaError> {
        let group = self
            .store
            .get_group(group_id)
            .await?
            .ok_or_else(|| AgendaError::NotFound(format!("group {group_id}")))?;
        self.propose(Command::CreateGroupEvent {
            id: Uuid::new_v4(),
            group_id,
            event_id,
            added_by,
            is_hierarchical: group.is_hierarchical,
            now: Utc::now(),
        })
        .await
    }

    pub async fn list_group_events(&self, group_id: Id) -> Result<Vec<GroupEvent>, AgendaError> {
        self.store.list_group_events(group_id).await
    }

    pub async fn update_group_event_status(
        &self,
        group_id: Id,
        event_id: Id,
        user_id: Id,
        status: GroupEventStatusValue,
    ) -> Result<GroupEventStatus, AgendaError> {
        self.propose(Command::UpdateGroupEventStatus {
            group_id,
            event_id,
            user_id,
            status,
            now: Utc::now(),
        })
        .await
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Bytes, AgendaError> {
    serde_json::to_vec(value).map(Bytes::from).map_err(|e| AgendaError::Transient(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agenda_raft::{LocalRaftNode, RaftConfig, RaftTransport};
    use agenda_raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
    use agenda_raft::log::MemoryRaftStorage;
    use agenda_storage::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

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

    async fn single_node_repository() -> Arc<AgendaRepository> {
        let storage = Arc::new(MemoryRaftStorage::new());
        let transport = Arc::new(NoopTransport);
        let (node, apply_rx) =
            LocalRaftNode::spawn("n1", vec![], storage, transport, RaftConfig::default());
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(node.is_leader().await);
        let store = Arc::new(MemoryStore::new());
        AgendaRepository::new(node, store, apply_rx)
    }

    #[tokio::test]
    async fn create_and_read_user_round_trips() {
        let repo = single_node_repository().await;
        let created = repo
            .create_user(CreateUserRequest {
                username: "ada".into(),
                email: "Ada@Example.com".into(),
                hashed_password: vec![1, 2, 3],
            })
            .await
            .unwrap();

        let fetched = repo.get_user(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.username, "ada");

        let by_email = repo.get_user_by_email("ada@example.com").await.unwrap().unwrap();
        assert_eq!(by_email.id, created.id);
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected_through_the_log() {
        let repo = single_node_repository().await;
        repo.create_user(CreateUserRequest {
            username: "ada".into(),
            email: "ada@example.com".into(),
            hashed_password: vec![1],
        })
        .await
        .unwrap();

        let err = repo
            .create_user(CreateUserRequest {
                username: "ada2".into(),
                email: "ada@example.com".into(),
                hashed_password: vec![2],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgendaError::Conflict(_)));
    }

    #[tokio::test]
    async fn group_event_hierarchical_flag_is_derived_not_trusted() {
        let repo = single_node_repository().await;
        let owner = repo
            .create_user(CreateUserRequest {
                username: "owner".into(),
                email: "owner@example.com".into(),
                hashed_password: vec![],
            })
            .await
            .unwrap();
        let group = repo
            .create_group(CreateGroupRequest {
                name: "team".into(),
                description: "".into(),
                created_by: owner.id,
                is_hierarchical: true,
                parent_group_id: None,
            })
            .await
            .unwrap();
        let event = repo
            .create_event(CreateEventRequest {
                title: "standup".into(),
                description: "".into(),
                start_time: "2030-01-01T10:00:00Z".parse().unwrap(),
                end_time: "2030-01-01T10:30:00Z".parse().unwrap(),
                user_id: owner.id,
            })
            .await
            .unwrap();

        let group_event = repo.create_group_event(group.id, event.id, owner.id).await.unwrap();
        assert!(group_event.is_hierarchical);
        assert_eq!(group_event.status, GroupEventStatusValue::Accepted);
    }
}
