//! Domain entities and their invariants.
//!
//! These are the rows of the *derived* projection maintained by the storage
//! state machine (see `agenda-storage`). The replicated log, not this crate,
//! is the source of truth; these types are what a committed command resolves
//! into once applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A 128-bit random identifier (UUID v4 semantics), stable for the lifetime
/// of the entity and never reused.
pub type Id = Uuid;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Id,
    pub username: String,
    /// Case-folded at write time; uniqueness enforced by the state machine.
    pub email: String,
    /// Never serialized out in read responses — see `PublicUser`.
    #[serde(skip_serializing)]
    pub hashed_password: Vec<u8>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The shape actually handed back to callers over the bus: `hashed_password`
/// never leaves the storage service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicUser {
    pub id: Id,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&User> for PublicUser {
    fn from(u: &User) -> Self {
        PublicUser {
            id: u.id,
            username: u.username.clone(),
            email: u.email.clone(),
            is_active: u.is_active,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: Id,
    pub title: String,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub user_id: Id,
}

impl Event {
    /// `[start, end)` half-open interval overlap test.
    pub fn overlaps(&self, other: &Event) -> bool {
        self.start_time < other.end_time && other.start_time < self.end_time
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum GroupRole {
    Admin,
    Member,
}

impl GroupRole {
    /// Admin outranks member; used when deduplicating effective membership
    /// across direct and inherited rows.
    pub fn more_privileged(self, other: GroupRole) -> GroupRole {
        match (self, other) {
            (GroupRole::Admin, _) | (_, GroupRole::Admin) => GroupRole::Admin,
            _ => GroupRole::Member,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: Id,
    pub name: String,
    pub description: String,
    pub created_by: Id,
    pub is_hierarchical: bool,
    pub parent_group_id: Option<Id>,
}

/// Maximum depth of a hierarchical group's parent chain.
pub const MAX_GROUP_DEPTH: usize = 10;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMember {
    pub id: Id,
    pub group_id: Id,
    pub user_id: Id,
    pub role: GroupRole,
    pub is_inherited: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Rejected,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupInvitation {
    pub id: Id,
    pub group_id: Id,
    pub invited_user_id: Id,
    pub invited_by: Id,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum GroupEventStatusValue {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupEvent {
    pub id: Id,
    pub group_id: Id,
    pub event_id: Id,
    pub added_by: Id,
    pub is_hierarchical: bool,
    /// Aggregate status: for hierarchical groups always `Accepted` and
    /// immutable; for flat groups, `Accepted` iff every member's per-user
    /// status (see `GroupEventStatus`) is `Accepted`.
    pub status: GroupEventStatusValue,
    pub added_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupEventStatus {
    pub id: Id,
    pub group_id: Id,
    pub event_id: Id,
    pub user_id: Id,
    pub status: GroupEventStatusValue,
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(start: &str, end: &str) -> Event {
        Event {
            id: Uuid::new_v4(),
            title: "t".into(),
            description: "d".into(),
            start_time: start.parse().unwrap(),
            end_time: end.parse().unwrap(),
            user_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn half_open_overlap() {
        let a = event("2030-01-01T10:00:00Z", "2030-01-01T11:00:00Z");
        let b = event("2030-01-01T11:00:00Z", "2030-01-01T12:00:00Z");
        // touching at the boundary is not an overlap: [10,11) and [11,12) are disjoint
        assert!(!a.overlaps(&b));

        let c = event("2030-01-01T10:30:00Z", "2030-01-01T11:30:00Z");
        assert!(a.overlaps(&c));
    }

    #[test]
    fn role_privilege_merge() {
        assert_eq!(
            GroupRole::Member.more_privileged(GroupRole::Admin),
            GroupRole::Admin
        );
        assert_eq!(
            GroupRole::Member.more_privileged(GroupRole::Member),
            GroupRole::Member
        );
    }
}
