use agenda_types::entities::{
    Event, Group, GroupEvent, GroupEventStatus, GroupEventStatusValue, GroupInvitation,
    GroupMember, GroupRole, Id, User,
};
use agenda_types::error::AgendaError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Fields needed to create a user, explicitly enumerated rather than taking
/// a `User` directly: `id`, `created_at` and `updated_at` are leader-assigned
/// by the repository before this is ever called, so the state machine just
/// accepts the finished row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewUser {
    pub id: Id,
    pub username: String,
    pub email: String,
    pub hashed_password: Vec<u8>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserPatch {
    pub username: Option<String>,
    pub email: Option<String>,
    pub hashed_password: Option<Vec<u8>>,
    pub is_active: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewEvent {
    pub id: Id,
    pub title: String,
    pub description: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: chrono::DateTime<chrono::Utc>,
    pub user_id: Id,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewGroup {
    pub id: Id,
    pub name: String,
    pub description: String,
    pub created_by: Id,
    pub is_hierarchical: bool,
    pub parent_group_id: Option<Id>,
    /// Leader-assigned; stamped onto the creator's automatic admin
    /// membership row so every replica agrees on its `joined_at`.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Reparent request: `None` leaves the parent unchanged, `Some(None)`
    /// detaches the group to root, `Some(Some(id))` moves it under `id`.
    /// Double-`Option` so "unchanged" and "detach" are distinguishable on
    /// the wire.
    #[serde(default)]
    pub parent_group_id: Option<Option<Id>>,
}

/// The full persisted projection backing the replicated calendar platform.
/// Every method here is called from exactly one place: the storage state
/// machine handler the replicated log dispatches committed commands to.
/// Reads are also served from here directly, without consulting the log,
/// per the repository layer's stale-by-a-commit contract.
#[async_trait]
pub trait AgendaStore: Send + Sync {
    // ── Users ──

    async fn create_user(&self, new_user: NewUser) -> Result<User, AgendaError>;
    async fn get_user(&self, id: Id) -> Result<Option<User>, AgendaError>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, AgendaError>;
    /// `now` is leader-assigned so every replica stamps an identical
    /// `updated_at` rather than each apply step reading its own clock.
    async fn update_user(
        &self,
        id: Id,
        patch: UserPatch,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<User, AgendaError>;
    /// Cascades per the design's delete semantics: removes the user's group
    /// memberships and reassigns ownership of groups they created to
    /// another admin, or deletes the group outright if they were its last
    /// member.
    async fn delete_user(&self, id: Id) -> Result<(), AgendaError>;

    // ── Events ──

    async fn create_event(&self, new_event: NewEvent) -> Result<Event, AgendaError>;
    async fn get_event(&self, id: Id) -> Result<Option<Event>, AgendaError>;
    async fn update_event(&self, id: Id, patch: EventPatch) -> Result<Event, AgendaError>;
    /// Cascades: removes this event from every group it was added to, along
    /// with the per-user statuses those links accumulated.
    async fn delete_event(&self, id: Id) -> Result<(), AgendaError>;
    async fn list_events_for_user(
        &self,
        user_id: Id,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Event>, AgendaError>;

    // ── Groups ──

    /// The creator is inserted as a non-inherited admin member as part of
    /// the same apply step.
    async fn create_group(&self, new_group: NewGroup) -> Result<Group, AgendaError>;
    async fn get_group(&self, id: Id) -> Result<Option<Group>, AgendaError>;
    /// `now` is only consumed when `patch.parent_group_id` actually moves the
    /// group: it stamps the `joined_at` of whatever inherited membership rows
    /// the reparent recomputes across the group's subtree.
    async fn update_group(
        &self,
        id: Id,
        patch: GroupPatch,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Group, AgendaError>;
    /// Cascades: members, invitations, group-event links, and per-user
    /// statuses all removed atomically.
    async fn delete_group(&self, id: Id) -> Result<(), AgendaError>;
    async fn list_groups_for_user(&self, user_id: Id) -> Result<Vec<Group>, AgendaError>;

    // ── Group membership ──

    /// If `group_id` is hierarchical and `role` is a non-inherited add, also
    /// inserts `is_inherited = true` rows into every descendant group. `now`
    /// is leader-assigned so every replica stamps identical `joined_at`
    /// values on both the direct row and its inherited descendants.
    async fn add_member(
        &self,
        group_id: Id,
        user_id: Id,
        role: GroupRole,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<GroupMember, AgendaError>;
    /// Effective membership: direct rows unioned with inherited rows,
    /// deduplicated by `user_id`, preferring the more privileged role.
    async fn list_members(&self, group_id: Id) -> Result<Vec<GroupMember>, AgendaError>;
    /// Refuses to remove the group's last non-inherited admin.
    async fn remove_member(&self, group_id: Id, user_id: Id) -> Result<(), AgendaError>;
    async fn update_member_role(
        &self,
        group_id: Id,
        user_id: Id,
        role: GroupRole,
    ) -> Result<GroupMember, AgendaError>;

    // ── Group invitations ──

    async fn create_invite(
        &self,
        id: Id,
        group_id: Id,
        invited_user_id: Id,
        invited_by: Id,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<GroupInvitation, AgendaError>;
    /// Accepting also adds the invited user as a (non-inherited, member-role)
    /// group member in the same apply step.
    async fn accept_invite(
        &self,
        id: Id,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<GroupInvitation, AgendaError>;
    async fn reject_invite(
        &self,
        id: Id,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<GroupInvitation, AgendaError>;
    async fn cancel_invite(
        &self,
        id: Id,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<GroupInvitation, AgendaError>;
    async fn get_invite(&self, id: Id) -> Result<Option<GroupInvitation>, AgendaError>;
    async fn list_invites(&self, group_id: Id) -> Result<Vec<GroupInvitation>, AgendaError>;

    // ── Group events ──

    /// In a hierarchical group every member's status row is created already
    /// `accepted` and immutable. In a flat group every member gets a
    /// `pending` row and the link's aggregate status only becomes
    /// `accepted` once every row is.
    async fn create_group_event(
        &self,
        id: Id,
        group_id: Id,
        event_id: Id,
        added_by: Id,
        is_hierarchical: bool,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<GroupEvent, AgendaError>;
    async fn list_group_events(&self, group_id: Id) -> Result<Vec<GroupEvent>, AgendaError>;
    async fn update_group_event_status(
        &self,
        group_id: Id,
        event_id: Id,
        user_id: Id,
        status: GroupEventStatusValue,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<GroupEventStatus, AgendaError>;
}
