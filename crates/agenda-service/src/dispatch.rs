//! Decodes inbound bus envelopes, dispatches by verb to the repository, and
//! publishes the correlated response. Grounded on `agenda-rpc`'s dispatcher
//! (subscribe-loop-with-resubscribe-on-stream-end) for the transport side,
//! and on `bpmn-lite-server::grpc::BpmnLiteService`'s thin-wrapper-over-a-
//! facade shape for the handler side.

use std::sync::Arc;

use agenda_bus::Bus;
use agenda_raft::RaftNode;
use agenda_repository::{AgendaRepository, CreateEventRequest, CreateGroupRequest, CreateUserRequest};
use agenda_storage::{EventPatch, GroupPatch, UserPatch};
use agenda_types::entities::{GroupEventStatusValue, GroupRole, Id};
use agenda_types::envelope::{topics, RequestEnvelope, ResponseEnvelope};
use agenda_types::error::AgendaError;
use agenda_types::verb::{clamp_limit, Verb};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Subscribes to every request topic this process serves and dispatches
/// each decoded envelope against a single [`AgendaRepository`].
pub struct DomainService {
    bus: Arc<dyn Bus>,
    repo: Arc<AgendaRepository>,
}

impl DomainService {
    pub fn new(bus: Arc<dyn Bus>, repo: Arc<AgendaRepository>) -> Arc<Self> {
        Arc::new(DomainService { bus, repo })
    }

    /// Starts one listener task per request topic. Both request topics in
    /// spec.md §6's matrix (`users_events` carries user *and*
    /// personal-event verbs; `groups_events` carries group verbs) are
    /// served by the same dispatcher, since the verb itself — not the
    /// topic — selects the handler.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) {
        for topic in [topics::USERS_EVENTS, topics::GROUPS_EVENTS] {
            tokio::spawn(self.clone().run_topic_loop(topic, shutdown.clone()));
        }
    }

    async fn run_topic_loop(self: Arc<Self>, topic: &'static str, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let mut stream = match self.bus.subscribe(topic).await {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::error!(topic, %err, "subscribe failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    continue;
                }
            };
            tracing::info!(topic, "domain service subscribed");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!(topic, "shutting down topic listener");
                        return;
                    }
                    item = stream.next() => {
                        match item {
                            Some(payload) => {
                                let svc = self.clone();
                                tokio::spawn(async move { svc.handle_envelope(payload).await; });
                            }
                            None => {
                                tracing::warn!(topic, "subscription stream ended, resubscribing");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_envelope(self: Arc<Self>, payload: Bytes) {
        let request: RequestEnvelope = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(%err, "dropping malformed request envelope");
                return;
            }
        };
        let reply_to = request.metadata.reply_to.clone();
        let response = self.process(request).await;
        let body = match serde_json::to_vec(&response) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(%err, "failed to encode response envelope");
                return;
            }
        };
        if let Err(err) = self.bus.publish(&reply_to, Bytes::from(body)).await {
            tracing::warn!(%err, topic = %reply_to, "failed to publish response");
        }
    }

    async fn process(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let id = request.id;
        let Some(verb) = Verb::parse(&request.kind) else {
            let message = AgendaError::InvalidArgument(format!("unknown verb: {}", request.kind)).to_string();
            return ResponseEnvelope::err(id, request.kind, message);
        };
        // The bus response carries the core error text verbatim; the
        // substring rewrite into user-facing copy happens only at the HTTP
        // front door, never here.
        match self.dispatch(verb, request.data).await {
            Ok(data) => ResponseEnvelope::ok(id, verb.as_str(), data),
            Err(err) => ResponseEnvelope::err(id, verb.as_str(), err.to_string()),
        }
    }

    async fn dispatch(&self, verb: Verb, data: Value) -> Result<Value, AgendaError> {
        match verb {
            Verb::UserCreate => self.user_create(decode(data)?).await,
            Verb::UserLogin => self.user_login(decode(data)?).await,
            Verb::UserGet => {
                let p: IdPayload = decode(data)?;
                to_value(&self.repo.get_user(p.id).await?)
            }
            Verb::UserGetByEmail => {
                let p: EmailPayload = decode(data)?;
                to_value(&self.repo.get_user_by_email(&p.email).await?)
            }
            Verb::UserUpdate => self.user_update(decode(data)?).await,
            Verb::UserDelete => self.user_delete(decode(data)?).await,

            Verb::AgendaEventCreate => self.event_create(decode(data)?).await,
            Verb::AgendaEventGet => {
                let p: IdPayload = decode(data)?;
                to_value(&self.repo.get_event(p.id).await?)
            }
            Verb::AgendaEventUpdate => self.event_update(decode(data)?).await,
            Verb::AgendaEventDelete => {
                let p: IdPayload = decode(data)?;
                self.repo.delete_event(p.id).await?;
                Ok(Value::Null)
            }
            Verb::AgendaEventList => {
                let p: EventListPayload = decode(data)?;
                let limit = clamp_limit(p.limit);
                let offset = p.offset.unwrap_or(0);
                to_value(&self.repo.list_events_for_user(p.user_id, offset, limit).await?)
            }

            Verb::GroupCreate => self.group_create(decode(data)?).await,
            Verb::GroupUpdate => self.group_update(decode(data)?).await,
            Verb::GroupDelete => self.group_delete(decode(data)?).await,
            Verb::UserGroupsList => {
                let p: UserGroupsListPayload = decode(data)?;
                to_value(&self.repo.list_groups_for_user(p.user_id).await?)
            }

            Verb::GroupMemberAdd => self.member_add(decode(data)?).await,
            Verb::GroupMemberList => {
                let p: GroupMemberListPayload = decode(data)?;
                to_value(&self.repo.list_members(p.group_id).await?)
            }
            Verb::GroupMemberRemove => self.member_remove(decode(data)?).await,
            Verb::GroupMemberUpdate => self.member_update(decode(data)?).await,

            Verb::GroupInviteCreate => self.invite_create(decode(data)?).await,
            Verb::GroupInviteAccept => {
                let p: IdPayload = decode(data)?;
                to_value(&self.repo.accept_invite(p.id).await?)
            }
            Verb::GroupInviteReject => {
                let p: IdPayload = decode(data)?;
                to_value(&self.repo.reject_invite(p.id).await?)
            }
            Verb::GroupInviteCancel => {
                let p: IdPayload = decode(data)?;
                to_value(&self.repo.cancel_invite(p.id).await?)
            }
            Verb::GroupInviteGet => {
                let p: IdPayload = decode(data)?;
                to_value(&self.repo.get_invite(p.id).await?)
            }
            Verb::GroupInviteList => {
                let p: GroupInviteListPayload = decode(data)?;
                let mut invites = self.repo.list_invites(p.group_id).await?;
                if let Some(user_id) = p.user_id {
                    invites.retain(|invite| invite.invited_user_id == user_id);
                }
                to_value(&invites)
            }

            Verb::GroupEventCreate => {
                let p: GroupEventCreatePayload = decode(data)?;
                to_value(&self.repo.create_group_event(p.group_id, p.event_id, p.added_by).await?)
            }
            Verb::GroupEventList => {
                let p: GroupEventListPayload = decode(data)?;
                to_value(&self.repo.list_group_events(p.group_id).await?)
            }
            Verb::GroupEventStatusUpdate => {
                let p: GroupEventStatusUpdatePayload = decode(data)?;
                to_value(
                    &self
                        .repo
                        .update_group_event_status(p.group_id, p.event_id, p.user_id, p.status)
                        .await?,
                )
            }
        }
    }

    async fn user_create(&self, p: UserCreatePayload) -> Result<Value, AgendaError> {
        let hashed_password = hash_password(&p.password)?;
        let user = self
            .repo
            .create_user(CreateUserRequest { username: p.username, email: p.email, hashed_password })
            .await?;
        to_value(&user)
    }

    async fn user_login(&self, p: UserLoginPayload) -> Result<Value, AgendaError> {
        let (user, hashed_password) = self
            .repo
            .get_login_credentials(&p.email)
            .await?
            .ok_or_else(|| AgendaError::Unauthorized("invalid credentials".to_string()))?;
        if !verify_password(&p.password, &hashed_password)? {
            return Err(AgendaError::Unauthorized("invalid credentials".to_string()));
        }
        to_value(&user)
    }

    async fn user_update(&self, p: UserUpdatePayload) -> Result<Value, AgendaError> {
        let hashed_password = p.password.as_deref().map(hash_password).transpose()?;
        let patch = UserPatch { username: p.username, email: p.email, hashed_password, is_active: p.is_active };
        to_value(&self.repo.update_user(p.id, patch).await?)
    }

    async fn user_delete(&self, p: UserDeletePayload) -> Result<Value, AgendaError> {
        let id = match (p.user_id, p.email) {
            (Some(_), Some(_)) => {
                return Err(AgendaError::InvalidArgument(
                    "specify either user_id or email, not both".to_string(),
                ))
            }
            (Some(id), None) => id,
            (None, Some(email)) => {
                self.repo
                    .get_user_by_email(&email)
                    .await?
                    .ok_or_else(|| AgendaError::NotFound(format!("user {email}")))?
                    .id
            }
            (None, None) => {
                return Err(AgendaError::InvalidArgument("must supply user_id or email".to_string()))
            }
        };
        self.repo.delete_user(id).await?;
        Ok(Value::Null)
    }

    async fn event_create(&self, p: EventCreatePayload) -> Result<Value, AgendaError> {
        to_value(
            &self
                .repo
                .create_event(CreateEventRequest {
                    title: p.title,
                    description: p.description,
                    start_time: p.start_time,
                    end_time: p.end_time,
                    user_id: p.user_id,
                })
                .await?,
        )
    }

    async fn event_update(&self, p: EventUpdatePayload) -> Result<Value, AgendaError> {
        let patch = EventPatch {
            title: p.title,
            description: p.description,
            start_time: p.start_time,
            end_time: p.end_time,
        };
        to_value(&self.repo.update_event(p.id, patch).await?)
    }

    async fn group_create(&self, p: GroupCreatePayload) -> Result<Value, AgendaError> {
        to_value(
            &self
                .repo
                .create_group(CreateGroupRequest {
                    name: p.name,
                    description: p.description,
                    created_by: p.created_by,
                    is_hierarchical: p.is_hierarchical,
                    parent_group_id: p.parent_group_id,
                })
                .await?,
        )
    }

    async fn group_update(&self, p: GroupUpdatePayload) -> Result<Value, AgendaError> {
        self.require_admin(p.id, p.actor_id).await?;
        let patch = GroupPatch { name: p.name, description: p.description, parent_group_id: p.parent_group_id };
        to_value(&self.repo.update_group(p.id, patch).await?)
    }

    async fn group_delete(&self, p: GroupDeletePayload) -> Result<Value, AgendaError> {
        self.require_admin(p.id, p.actor_id).await?;
        self.repo.delete_group(p.id).await?;
        Ok(Value::Null)
    }

    async fn member_add(&self, p: GroupMemberAddPayload) -> Result<Value, AgendaError> {
        self.require_admin(p.group_id, p.actor_id).await?;
        to_value(&self.repo.add_member(p.group_id, p.user_id, p.role).await?)
    }

    async fn member_remove(&self, p: GroupMemberRemovePayload) -> Result<Value, AgendaError> {
        self.require_admin(p.group_id, p.actor_id).await?;
        self.repo.remove_member(p.group_id, p.user_id).await?;
        Ok(Value::Null)
    }

    async fn member_update(&self, p: GroupMemberUpdatePayload) -> Result<Value, AgendaError> {
        self.require_admin(p.group_id, p.actor_id).await?;
        to_value(&self.repo.update_member_role(p.group_id, p.user_id, p.role).await?)
    }

    async fn invite_create(&self, p: GroupInviteCreatePayload) -> Result<Value, AgendaError> {
        self.require_admin(p.group_id, p.invited_by).await?;
        to_value(&self.repo.create_invite(p.group_id, p.invited_user_id, p.invited_by).await?)
    }

    /// Non-admins attempting an admin-gated operation get *Unauthorized*
    /// per spec.md §7; membership is read locally like every other query.
    async fn require_admin(&self, group_id: Id, actor_id: Id) -> Result<(), AgendaError> {
        let members = self.repo.list_members(group_id).await?;
        let is_admin = members
            .iter()
            .any(|member| member.user_id == actor_id && matches!(member.role, GroupRole::Admin));
        if is_admin {
            Ok(())
        } else {
            Err(AgendaError::Unauthorized(format!("user {actor_id} is not an admin of group {group_id}")))
        }
    }

    /// `{id, state, leader}` for the storage HTTP surface in spec.md §6.
    pub async fn raft_status(&self) -> RaftStatus {
        let raft = self.repo.raft();
        RaftStatus {
            id: raft.id().to_string(),
            state: format!("{:?}", raft.role().await),
            leader: raft.current_leader().await,
        }
    }
}

#[derive(Serialize)]
pub struct RaftStatus {
    pub id: String,
    pub state: String,
    pub leader: Option<String>,
}

fn decode<T: DeserializeOwned>(data: Value) -> Result<T, AgendaError> {
    serde_json::from_value(data).map_err(|e| AgendaError::InvalidArgument(format!("malformed payload: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, AgendaError> {
    serde_json::to_value(value).map_err(|e| AgendaError::Transient(e.to_string()))
}

/// Password hashing is an external-collaborator concern per spec.md §1; it
/// is implemented here, at the bus-facing boundary, so it never leaks into
/// `agenda-repository` or `agenda-storage`.
fn hash_password(password: &str) -> Result<Vec<u8>, AgendaError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map(String::into_bytes)
        .map_err(|e| AgendaError::InvalidArgument(e.to_string()))
}

fn verify_password(password: &str, hashed: &[u8]) -> Result<bool, AgendaError> {
    let hashed = std::str::from_utf8(hashed).map_err(|e| AgendaError::Transient(e.to_string()))?;
    bcrypt::verify(password, hashed).map_err(|e| AgendaError::Transient(e.to_string()))
}

#[derive(Deserialize)]
struct UserCreatePayload {
    email: String,
    password: String,
    username: String,
}

#[derive(Deserialize)]
struct UserLoginPayload {
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct IdPayload {
    id: Id,
}

#[derive(Deserialize)]
struct EmailPayload {
    email: String,
}

#[derive(Deserialize)]
struct UserUpdatePayload {
    id: Id,
    username: Option<String>,
    email: Option<String>,
    password: Option<String>,
    is_active: Option<bool>,
}

#[derive(Deserialize)]
struct UserDeletePayload {
    user_id: Option<Id>,
    email: Option<String>,
}

#[derive(Deserialize)]
struct EventCreatePayload {
    title: String,
    description: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    user_id: Id,
}

#[derive(Deserialize)]
struct EventUpdatePayload {
    id: Id,
    title: Option<String>,
    description: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct EventListPayload {
    user_id: Id,
    offset: Option<u32>,
    limit: Option<u32>,
}

#[derive(Deserialize)]
struct GroupCreatePayload {
    name: String,
    description: String,
    created_by: Id,
    is_hierarchical: bool,
    parent_group_id: Option<Id>,
}

/// Distinguishes an absent JSON field from an explicit `null`: plain
/// `Option<Option<T>>` deserialization collapses both to the outer `None`,
/// which would make "detach to root" indistinguishable from "leave alone".
fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
struct GroupUpdatePayload {
    id: Id,
    actor_id: Id,
    name: Option<String>,
    description: Option<String>,
    /// Absent means "leave the parent alone", `null` means "detach to
    /// root", a group id means "reparent under this group".
    #[serde(default, deserialize_with = "deserialize_some")]
    parent_group_id: Option<Option<Id>>,
}

#[derive(Deserialize)]
struct GroupDeletePayload {
    id: Id,
    actor_id: Id,
}

#[derive(Deserialize)]
struct UserGroupsListPayload {
    user_id: Id,
}

#[derive(Deserialize)]
struct GroupMemberAddPayload {
    group_id: Id,
    user_id: Id,
    role: GroupRole,
    actor_id: Id,
}

#[derive(Deserialize)]
struct GroupMemberListPayload {
    group_id: Id,
}

#[derive(Deserialize)]
struct GroupMemberRemovePayload {
    group_id: Id,
    user_id: Id,
    actor_id: Id,
}

#[derive(Deserialize)]
struct GroupMemberUpdatePayload {
    group_id: Id,
    user_id: Id,
    role: GroupRole,
    actor_id: Id,
}

#[derive(Deserialize)]
struct GroupInviteCreatePayload {
    group_id: Id,
    invited_user_id: Id,
    invited_by: Id,
}

#[derive(Deserialize)]
struct GroupInviteListPayload {
    group_id: Id,
    user_id: Option<Id>,
}

#[derive(Deserialize)]
struct GroupEventCreatePayload {
    group_id: Id,
    event_id: Id,
    added_by: Id,
}

#[derive(Deserialize)]
struct GroupEventListPayload {
    group_id: Id,
}

#[derive(Deserialize)]
struct GroupEventStatusUpdatePayload {
    group_id: Id,
    event_id: Id,
    user_id: Id,
    status: GroupEventStatusValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use agenda_bus::InMemoryBus;
    use agenda_raft::log::MemoryRaftStorage;
    use agenda_raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
    use agenda_raft::{LocalRaftNode, RaftConfig, RaftTransport};
    use agenda_storage::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    struct NoopTransport;

    #[async_trait]
    impl RaftTransport for NoopTransport {
        async fn request_vote(&self, _peer: &str, request: RequestVoteRequest) -> anyhow::Result<RequestVoteResponse> {
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

    async fn test_service() -> (Arc<DomainService>, Arc<dyn Bus>) {
        let storage = Arc::new(MemoryRaftStorage::new());
        let transport = Arc::new(NoopTransport);
        let (node, apply_rx) = LocalRaftNode::spawn("n1", vec![], storage, transport, RaftConfig::default());
        tokio::time::sleep(Duration::from_millis(350)).await;
        let store = Arc::new(MemoryStore::new());
        let repo = AgendaRepository::new(node, store, apply_rx);
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let service = DomainService::new(bus.clone(), repo);
        service.clone().spawn(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        (service, bus)
    }

    async fn roundtrip(bus: &Arc<dyn Bus>, request_topic: &str, reply_topic: &str, req: RequestEnvelope) -> ResponseEnvelope {
        let mut replies = bus.subscribe(reply_topic).await.unwrap();
        let body = serde_json::to_vec(&req).unwrap();
        bus.publish(request_topic, Bytes::from(body)).await.unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(5), replies.next()).await.unwrap().unwrap();
        serde_json::from_slice(&payload).unwrap()
    }

    #[tokio::test]
    async fn registration_then_login_returns_the_same_id() {
        let (_service, bus) = test_service().await;

        let create = RequestEnvelope::new(
            "user.create",
            json!({"email": "a@b.c", "password": "Passw0rd", "username": "alice"}),
            "users_events_response",
        );
        let resp = roundtrip(&bus, topics::USERS_EVENTS, "users_events_response", create).await;
        assert!(resp.success, "{:?}", resp.error);
        let created_id = resp.data.unwrap()["id"].clone();

        let login = RequestEnvelope::new(
            "user.login",
            json!({"email": "a@b.c", "password": "Passw0rd"}),
            "users_events_response",
        );
        let resp = roundtrip(&bus, topics::USERS_EVENTS, "users_events_response", login).await;
        assert!(resp.success, "{:?}", resp.error);
        assert_eq!(resp.data.unwrap()["id"], created_id);
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let (_service, bus) = test_service().await;
        let create = RequestEnvelope::new(
            "user.create",
            json!({"email": "a@b.c", "password": "Passw0rd", "username": "alice"}),
            "users_events_response",
        );
        roundtrip(&bus, topics::USERS_EVENTS, "users_events_response", create).await;

        let login = RequestEnvelope::new(
            "user.login",
            json!({"email": "a@b.c", "password": "WrongPassword"}),
            "users_events_response",
        );
        let resp = roundtrip(&bus, topics::USERS_EVENTS, "users_events_response", login).await;
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn overlapping_event_reports_time_conflict() {
        let (_service, bus) = test_service().await;
        let user_id = Uuid::new_v4();

        let first = RequestEnvelope::new(
            "agenda.event.create",
            json!({
                "title": "standup", "description": "",
                "start_time": "2030-01-01T10:00:00Z", "end_time": "2030-01-01T11:00:00Z",
                "user_id": user_id,
            }),
            "events_response",
        );
        let resp = roundtrip(&bus, topics::USERS_EVENTS, "events_response", first).await;
        assert!(resp.success, "{:?}", resp.error);

        let second = RequestEnvelope::new(
            "agenda.event.create",
            json!({
                "title": "overlap", "description": "",
                "start_time": "2030-01-01T10:30:00Z", "end_time": "2030-01-01T11:30:00Z",
                "user_id": user_id,
            }),
            "events_response",
        );
        let resp = roundtrip(&bus, topics::USERS_EVENTS, "events_response", second).await;
        assert!(!resp.success);
        assert!(
            resp.error.contains("time conflict"),
            "unexpected error message: {}",
            resp.error
        );
    }

    #[tokio::test]
    async fn non_admin_cannot_add_member() {
        let (_service, bus) = test_service().await;

        let owner_resp = roundtrip(
            &bus,
            topics::USERS_EVENTS,
            "users_events_response",
            RequestEnvelope::new(
                "user.create",
                json!({"email": "owner@example.com", "password": "x", "username": "owner"}),
                "users_events_response",
            ),
        )
        .await;
        let owner_id = owner_resp.data.unwrap()["id"].clone();

        let outsider_resp = roundtrip(
            &bus,
            topics::USERS_EVENTS,
            "users_events_response",
            RequestEnvelope::new(
                "user.create",
                json!({"email": "outsider@example.com", "password": "x", "username": "outsider"}),
                "users_events_response",
            ),
        )
        .await;
        let outsider_id = outsider_resp.data.unwrap()["id"].clone();

        let group_resp = roundtrip(
            &bus,
            topics::GROUPS_EVENTS,
            "group_events_response",
            RequestEnvelope::new(
                "group.create",
                json!({"name": "team", "description": "", "created_by": owner_id, "is_hierarchical": false}),
                "group_events_response",
            ),
        )
        .await;
        let group_id = group_resp.data.unwrap()["id"].clone();

        let add_resp = roundtrip(
            &bus,
            topics::GROUPS_EVENTS,
            "group_events_response",
            RequestEnvelope::new(
                "group.member.add",
                json!({"group_id": group_id, "user_id": outsider_id, "role": "Member", "actor_id": outsider_id}),
                "group_events_response",
            ),
        )
        .await;
        assert!(!add_resp.success);
    }
}
