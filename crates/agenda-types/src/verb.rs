//! Verb set: dispatch on the envelope's `type` string into this enum,
//! rejecting anything unrecognized as
//! [`crate::error::AgendaError::InvalidArgument`] instead of forwarding an
//! untyped map further into the system.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    UserCreate,
    UserLogin,
    UserGet,
    UserGetByEmail,
    UserUpdate,
    UserDelete,
    AgendaEventCreate,
    AgendaEventGet,
    AgendaEventUpdate,
    AgendaEventDelete,
    AgendaEventList,
    GroupCreate,
    GroupUpdate,
    GroupDelete,
    UserGroupsList,
    GroupMemberAdd,
    GroupMemberList,
    GroupMemberRemove,
    GroupMemberUpdate,
    GroupInviteCreate,
    GroupInviteAccept,
    GroupInviteReject,
    GroupInviteCancel,
    GroupInviteList,
    GroupInviteGet,
    GroupEventCreate,
    GroupEventList,
    GroupEventStatusUpdate,
}

impl Verb {
    pub const ALL: &'static [(&'static str, Verb)] = &[
        ("user.create", Verb::UserCreate),
        ("user.login", Verb::UserLogin),
        ("user.get", Verb::UserGet),
        ("user.get.by.email", Verb::UserGetByEmail),
        ("user.update", Verb::UserUpdate),
        ("user.delete", Verb::UserDelete),
        ("agenda.event.create", Verb::AgendaEventCreate),
        ("agenda.event.get", Verb::AgendaEventGet),
        ("agenda.event.update", Verb::AgendaEventUpdate),
        ("agenda.event.delete", Verb::AgendaEventDelete),
        ("agenda.event.list", Verb::AgendaEventList),
        ("group.create", Verb::GroupCreate),
        ("group.update", Verb::GroupUpdate),
        ("group.delete", Verb::GroupDelete),
        ("user.groups.list", Verb::UserGroupsList),
        ("group.member.add", Verb::GroupMemberAdd),
        ("group.member.list", Verb::GroupMemberList),
        ("group.member.remove", Verb::GroupMemberRemove),
        ("group.member.update", Verb::GroupMemberUpdate),
        ("group.invite.create", Verb::GroupInviteCreate),
        ("group.invite.accept", Verb::GroupInviteAccept),
        ("group.invite.reject", Verb::GroupInviteReject),
        ("group.invite.cancel", Verb::GroupInviteCancel),
        ("group.invite.list", Verb::GroupInviteList),
        ("group.invite.get", Verb::GroupInviteGet),
        ("group.event.create", Verb::GroupEventCreate),
        ("group.event.list", Verb::GroupEventList),
        ("group.event.status.update", Verb::GroupEventStatusUpdate),
    ];

    pub fn parse(raw: &str) -> Option<Verb> {
        Self::ALL.iter().find(|(s, _)| *s == raw).map(|(_, v)| *v)
    }

    pub fn as_str(self) -> &'static str {
        Self::ALL.iter().find(|(_, v)| *v == self).map(|(s, _)| *s).unwrap()
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// List pagination defaults: `offset`/`limit`, default 0/100, cap 1000.
pub const LIST_DEFAULT_OFFSET: u32 = 0;
pub const LIST_DEFAULT_LIMIT: u32 = 100;
pub const LIST_MAX_LIMIT: u32 = 1000;

pub fn clamp_limit(requested: Option<u32>) -> u32 {
    requested.unwrap_or(LIST_DEFAULT_LIMIT).min(LIST_MAX_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_verb_round_trips_through_its_string() {
        for (s, v) in Verb::ALL {
            assert_eq!(Verb::parse(s), Some(*v));
            assert_eq!(v.as_str(), *s);
        }
    }

    #[test]
    fn unknown_verb_is_none() {
        assert_eq!(Verb::parse("user.frobnicate"), None);
    }

    #[test]
    fn limit_clamps_to_cap() {
        assert_eq!(clamp_limit(Some(5_000)), LIST_MAX_LIMIT);
        assert_eq!(clamp_limit(None), LIST_DEFAULT_LIMIT);
    }
}
