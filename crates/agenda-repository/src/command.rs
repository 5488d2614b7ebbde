//! The wire format proposed to the Raft log. Every variant already carries
//! whatever the leader assigned (ids, timestamps) so every replica's apply
//! step is a pure function of the command — no clocks, no randomness.

use agenda_storage::{EventPatch, GroupPatch, NewEvent, NewGroup, NewUser, UserPatch};
use agenda_types::entities::{GroupEventStatusValue, GroupRole, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Command {
    CreateUser(NewUser),
    UpdateUser { id: Id, patch: UserPatch, now: DateTime<Utc> },
    DeleteUser { id: Id },

    CreateEvent(NewEvent),
    UpdateEvent { id: Id, patch: EventPatch },
    DeleteEvent { id: Id },

    CreateGroup(NewGroup),
    UpdateGroup { id: Id, patch: GroupPatch, now: DateTime<Utc> },
    DeleteGroup { id: Id },

    AddMember { group_id: Id, user_id: Id, role: GroupRole, now: DateTime<Utc> },
    RemoveMember { group_id: Id, user_id: Id },
    UpdateMemberRole { group_id: Id, user_id: Id, role: GroupRole },

    CreateInvite { id: Id, group_id: Id, invited_user_id: Id, invited_by: Id, now: DateTime<Utc> },
    AcceptInvite { id: Id, now: DateTime<Utc> },
    RejectInvite { id: Id, now: DateTime<Utc> },
    CancelInvite { id: Id, now: DateTime<Utc> },

    CreateGroupEvent {
        id: Id,
        group_id: Id,
        event_id: Id,
        added_by: Id,
        is_hierarchical: bool,
        now: DateTime<Utc>,
    },
    UpdateGroupEventStatus {
        group_id: Id,
        event_id: Id,
        user_id: Id,
        status: GroupEventStatusValue,
        now: DateTime<Utc>,
    },
}
