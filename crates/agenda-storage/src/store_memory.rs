use std::collections::HashMap;

use agenda_types::entities::{
    Event, Group, GroupEvent, GroupEventStatus, GroupEventStatusValue, GroupInvitation,
    GroupMember, GroupRole, Id, InvitationStatus, User, MAX_GROUP_DEPTH,
};
use agenda_types::error::AgendaError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{AgendaStore, EventPatch, GroupPatch, NewEvent, NewGroup, NewUser, UserPatch};

/// Fixed namespace used to derive ids for rows a single command creates as a
/// side effect (an inherited membership row, a per-member group-event status
/// row) rather than as its primary subject. Deriving via `Uuid::new_v5` from
/// the command's own inputs keeps every replica's apply step byte-for-byte
/// deterministic without threading an explicit id for every cascade row
/// through the command payload.
const CASCADE_NAMESPACE: Uuid = Uuid::from_bytes([
    0xa9, 0xe1, 0x5d, 0x02, 0x6b, 0x41, 0x4c, 0x8e, 0x9b, 0x77, 0x21, 0xf3, 0x0a, 0x84, 0x6e, 0x55,
]);

fn cascade_id(parts: &[&str]) -> Id {
    Uuid::new_v5(&CASCADE_NAMESPACE, parts.join("/").as_bytes())
}

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Default)]
struct Inner {
    users: HashMap<Id, User>,
    users_by_email: HashMap<String, Id>,
    events: HashMap<Id, Event>,
    groups: HashMap<Id, Group>,
    members: Vec<GroupMember>,
    invitations: HashMap<Id, GroupInvitation>,
    group_events: Vec<GroupEvent>,
    group_event_statuses: Vec<GroupEventStatus>,
}

impl Inner {
    fn ancestor_chain(&self, group_id: Id) -> Vec<Id> {
        let mut chain = Vec::new();
        let mut current = self.groups.get(&group_id).and_then(|g| g.parent_group_id);
        while let Some(id) = current {
            if chain.contains(&id) {
                break; // defensive: a cycle should never exist, never loop forever on one
            }
            chain.push(id);
            current = self.groups.get(&id).and_then(|g| g.parent_group_id);
        }
        chain
    }

    fn direct_children(&self, group_id: Id) -> Vec<Id> {
        self.groups
            .values()
            .filter(|g| g.parent_group_id == Some(group_id))
            .map(|g| g.id)
            .collect()
    }

    /// All descendants, direct and transitive, in breadth-first order.
    fn descendants(&self, group_id: Id) -> Vec<Id> {
        let mut out = Vec::new();
        let mut frontier = self.direct_children(group_id);
        while !frontier.is_empty() {
            out.extend(frontier.iter().copied());
            frontier = frontier.iter().flat_map(|id| self.direct_children(*id)).collect();
        }
        out
    }

    fn effective_members(&self, group_id: Id) -> Vec<GroupMember> {
        let mut by_user: HashMap<Id, GroupMember> = HashMap::new();
        for member in self.members.iter().filter(|m| m.group_id == group_id) {
            by_user
                .entry(member.user_id)
                .and_modify(|existing| {
                    if member.role.more_privileged(existing.role) == member.role
                        && member.role != existing.role
                    {
                        existing.role = member.role;
                    }
                    // A direct row always wins visibility over an inherited one.
                    if !member.is_inherited {
                        existing.is_inherited = false;
                        existing.id = member.id;
                        existing.joined_at = member.joined_at;
                    }
                })
                .or_insert_with(|| member.clone());
        }
        by_user.into_values().collect()
    }

    fn non_inherited_admin_count(&self, group_id: Id) -> usize {
        self.members
            .iter()
            .filter(|m| m.group_id == group_id && !m.is_inherited && m.role == GroupRole::Admin)
            .count()
    }

    /// Recomputes every inherited membership row across `root` and its whole
    /// subtree from scratch, walking parent-before-child so each node's
    /// `effective_members` reflects its own freshly-recomputed parent. Used
    /// both to backfill a brand-new group from its parent's existing
    /// membership (subtree of one) and to re-derive an entire subtree's
    /// inherited rows after a reparent.
    fn reflow_inherited_membership(&mut self, root: Id, now: DateTime<Utc>) {
        let mut frontier = vec![root];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for node_id in frontier {
                self.members.retain(|m| !(m.group_id == node_id && m.is_inherited));

                let parent_id = self.groups.get(&node_id).and_then(|g| g.parent_group_id);
                if let Some(parent_id) = parent_id {
                    let parent_is_hierarchical =
                        self.groups.get(&parent_id).map(|g| g.is_hierarchical).unwrap_or(false);
                    if parent_is_hierarchical {
                        let direct_present: std::collections::HashSet<Id> = self
                            .members
                            .iter()
                            .filter(|m| m.group_id == node_id && !m.is_inherited)
                            .map(|m| m.user_id)
                            .collect();
                        for member in self.effective_members(parent_id) {
                            if direct_present.contains(&member.user_id) {
                                continue;
                            }
                            self.members.push(GroupMember {
                                id: cascade_id(&[
                                    "inherited-member",
                                    &node_id.to_string(),
                                    &member.user_id.to_string(),
                                ]),
                                group_id: node_id,
                                user_id: member.user_id,
                                role: member.role,
                                is_inherited: true,
                                joined_at: now,
                            });
                        }
                    }
                }

                next.extend(self.direct_children(node_id));
            }
            frontier = next;
        }
    }
}

/// In-memory projection backing the replicated calendar platform. Used for
/// local development and every integration test in this workspace.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore { inner: RwLock::new(Inner::default()) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgendaStore for MemoryStore {
    // ── Users ──

    async fn create_user(&self, new_user: NewUser) -> Result<User, AgendaError> {
        let mut inner = self.inner.write().await;
        let key = email_key(&new_user.email);
        if inner.users_by_email.contains_key(&key) {
            return Err(AgendaError::Conflict(format!("email already registered: {}", new_user.email)));
        }
        let user = User {
            id: new_user.id,
            username: new_user.username,
            email: new_user.email,
            hashed_password: new_user.hashed_password,
            is_active: true,
            created_at: new_user.created_at,
            updated_at: new_user.created_at,
        };
        inner.users_by_email.insert(key, user.id);
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: Id) -> Result<Option<User>, AgendaError> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, AgendaError> {
        let inner = self.inner.read().await;
        let key = email_key(email);
        Ok(inner.users_by_email.get(&key).and_then(|id| inner.users.get(id)).cloned())
    }

    async fn update_user(
        &self,
        id: Id,
        patch: UserPatch,
        now: DateTime<Utc>,
    ) -> Result<User, AgendaError> {
        let mut inner = self.inner.write().await;

        if let Some(new_email) = &patch.email {
            let new_key = email_key(new_email);
            let current_key = inner
                .users
                .get(&id)
                .map(|u| email_key(&u.email))
                .ok_or_else(|| AgendaError::NotFound(format!("user {id}")))?;
            if new_key != current_key && inner.users_by_email.contains_key(&new_key) {
                return Err(AgendaError::Conflict(format!("email already registered: {new_email}")));
            }
        }

        let user = inner.users.get_mut(&id).ok_or_else(|| AgendaError::NotFound(format!("user {id}")))?;
        let old_key = email_key(&user.email);

        if let Some(username) = patch.username {
            user.username = username;
        }
        if let Some(email) = patch.email {
            user.email = email;
        }
        if let Some(hashed_password) = patch.hashed_password {
            user.hashed_password = hashed_password;
        }
        if let Some(is_active) = patch.is_active {
            user.is_active = is_active;
        }
        user.updated_at = now;
        let updated = user.clone();

        let new_key = email_key(&updated.email);
        if new_key != old_key {
            inner.users_by_email.remove(&old_key);
            inner.users_by_email.insert(new_key, id);
        }

        Ok(updated)
    }

    async fn delete_user(&self, id: Id) -> Result<(), AgendaError> {
        let mut inner = self.inner.write().await;
        let user = inner.users.remove(&id).ok_or_else(|| AgendaError::NotFound(format!("user {id}")))?;
        inner.users_by_email.remove(&email_key(&user.email));
        inner.members.retain(|m| m.user_id != id);

        let owned_groups: Vec<Id> = inner
            .groups
            .values()
            .filter(|g| g.created_by == id)
            .map(|g| g.id)
            .collect();

        for group_id in owned_groups {
            let successor = inner
                .members
                .iter()
                .find(|m| m.group_id == group_id && !m.is_inherited && m.role == GroupRole::Admin)
                .map(|m| m.user_id)
                .or_else(|| {
                    inner.members.iter().find(|m| m.group_id == group_id).map(|m| m.user_id)
                });

            match successor {
                Some(new_owner) => {
                    if let Some(group) = inner.groups.get_mut(&group_id) {
                        group.created_by = new_owner;
                    }
                }
                None => {
                    drop_group_cascade(&mut inner, group_id);
                }
            }
        }

        Ok(())
    }

    // ── Events ──

    async fn create_event(&self, new_event: NewEvent) -> Result<Event, AgendaError> {
        if new_event.end_time <= new_event.start_time {
            return Err(AgendaError::InvalidArgument("end_time must be after start_time".into()));
        }
        let mut inner = self.inner.write().await;
        let candidate = Event {
            id: new_event.id,
            title: new_event.title,
            description: new_event.description,
            start_time: new_event.start_time,
            end_time: new_event.end_time,
            user_id: new_event.user_id,
        };
        let conflicts = inner
            .events
            .values()
            .any(|e| e.user_id == candidate.user_id && e.overlaps(&candidate));
        if conflicts {
            return Err(AgendaError::time_conflict());
        }
        inner.events.insert(candidate.id, candidate.clone());
        Ok(candidate)
    }

    async fn get_event(&self, id: Id) -> Result<Option<Event>, AgendaError> {
        Ok(self.inner.read().await.events.get(&id).cloned())
    }

    async fn update_event(&self, id: Id, patch: EventPatch) -> Result<Event, AgendaError> {
        let mut inner = self.inner.write().await;
        let mut candidate = inner
            .events
            .get(&id)
            .cloned()
            .ok_or_else(|| AgendaError::NotFound(format!("event {id}")))?;

        if let Some(title) = patch.title {
            candidate.title = title;
        }
        if let Some(description) = patch.description {
            candidate.description = description;
        }
        if let Some(start_time) = patch.start_time {
            candidate.start_time = start_time;
        }
        if let Some(end_time) = patch.end_time {
            candidate.end_time = end_time;
        }
        if candidate.end_time <= candidate.start_time {
            return Err(AgendaError::InvalidArgument("end_time must be after start_time".into()));
        }

        let conflicts = inner
            .events
            .values()
            .any(|e| e.id != id && e.user_id == candidate.user_id && e.overlaps(&candidate));
        if conflicts {
            return Err(AgendaError::time_conflict());
        }

        inner.events.insert(id, candidate.clone());
        Ok(candidate)
    }

    async fn delete_event(&self, id: Id) -> Result<(), AgendaError> {
        let mut inner = self.inner.write().await;
        inner.events.remove(&id).ok_or_else(|| AgendaError::NotFound(format!("event {id}")))?;
        inner.group_events.retain(|ge| ge.event_id != id);
        inner.group_event_statuses.retain(|s| s.event_id != id);
        Ok(())
    }

    async fn list_events_for_user(&self, user_id: Id, offset: u32, limit: u32) -> Result<Vec<Event>, AgendaError> {
        let inner = self.inner.read().await;
        let mut events: Vec<Event> = inner.events.values().filter(|e| e.user_id == user_id).cloned().collect();
        events.sort_by_key(|e| e.start_time);
        Ok(events.into_iter().skip(offset as usize).take(limit as usize).collect())
    }

    // ── Groups ──

    async fn create_group(&self, new_group: NewGroup) -> Result<Group, AgendaError> {
        let mut inner = self.inner.write().await;

        if let Some(parent_id) = new_group.parent_group_id {
            let parent = inner
                .groups
                .get(&parent_id)
                .ok_or_else(|| AgendaError::NotFound(format!("group {parent_id}")))?;
            if new_group.is_hierarchical && !parent.is_hierarchical {
                return Err(AgendaError::InvalidArgument(
                    "a hierarchical group's parent must also be hierarchical".into(),
                ));
            }
            let depth = inner.ancestor_chain(parent_id).len() + 1;
            if depth >= MAX_GROUP_DEPTH {
                return Err(AgendaError::InvalidArgument("group hierarchy exceeds maximum depth".into()));
            }
        }

        let group = Group {
            id: new_group.id,
            name: new_group.name,
            description: new_group.description,
            created_by: new_group.created_by,
            is_hierarchical: new_group.is_hierarchical,
            parent_group_id: new_group.parent_group_id,
        };
        inner.groups.insert(group.id, group.clone());
        inner.members.push(GroupMember {
            id: cascade_id(&["creator-admin", &group.id.to_string()]),
            group_id: group.id,
            user_id: group.created_by,
            role: GroupRole::Admin,
            is_inherited: false,
            joined_at: new_group.created_at,
        });
        // Backfills this group with whatever inherited rows its parent chain
        // already carries, so the invariant holds even when a child is
        // created after its parent already has members.
        inner.reflow_inherited_membership(group.id, new_group.created_at);
        Ok(group)
    }

    async fn get_group(&self, id: Id) -> Result<Option<Group>, AgendaError> {
        Ok(self.inner.read().await.groups.get(&id).cloned())
    }

    async fn update_group(&self, id: Id, patch: GroupPatch, now: DateTime<Utc>) -> Result<Group, AgendaError> {
        let mut inner = self.inner.write().await;
        if !inner.groups.contains_key(&id) {
            return Err(AgendaError::NotFound(format!("group {id}")));
        }

        let reparenting = patch.parent_group_id.is_some();
        if let Some(new_parent) = patch.parent_group_id {
            if new_parent == Some(id) {
                return Err(AgendaError::InvalidArgument("a group cannot be its own parent".into()));
            }
            if let Some(parent_id) = new_parent {
                if !inner.groups.contains_key(&parent_id) {
                    return Err(AgendaError::NotFound(format!("group {parent_id}")));
                }
                // Reparenting under one of your own descendants would create
                // a cycle; checked here, inside the apply step, so a racing
                // concurrent reparent can never sneak one in between a
                // caller's read and its write.
                if inner.descendants(id).contains(&parent_id) {
                    return Err(AgendaError::InvalidArgument(
                        "cannot reparent a group under its own descendant".into(),
                    ));
                }
                let is_hierarchical = inner.groups.get(&id).map(|g| g.is_hierarchical).unwrap_or(false);
                let parent_is_hierarchical =
                    inner.groups.get(&parent_id).map(|g| g.is_hierarchical).unwrap_or(false);
                if is_hierarchical && !parent_is_hierarchical {
                    return Err(AgendaError::InvalidArgument(
                        "a hierarchical group's parent must also be hierarchical".into(),
                    ));
                }
                let depth = inner.ancestor_chain(parent_id).len() + 1;
                if depth >= MAX_GROUP_DEPTH {
                    return Err(AgendaError::InvalidArgument("group hierarchy exceeds maximum depth".into()));
                }
            }
            inner
                .groups
                .get_mut(&id)
                .ok_or_else(|| AgendaError::NotFound(format!("group {id}")))?
                .parent_group_id = new_parent;
        }

        let group = inner.groups.get_mut(&id).ok_or_else(|| AgendaError::NotFound(format!("group {id}")))?;
        if let Some(name) = patch.name {
            group.name = name;
        }
        if let Some(description) = patch.description {
            group.description = description;
        }
        let updated = group.clone();

        if reparenting {
            inner.reflow_inherited_membership(id, now);
        }

        Ok(updated)
    }

    async fn delete_group(&self, id: Id) -> Result<(), AgendaError> {
        let mut inner = self.inner.write().await;
        if !inner.groups.contains_key(&id) {
            return Err(AgendaError::NotFound(format!("group {id}")));
        }
        drop_group_cascade(&mut inner, id);
        Ok(())
    }

    async fn list_groups_for_user(&self, user_id: Id) -> Result<Vec<Group>, AgendaError> {
        let inner = self.inner.read().await;
        let group_ids: std::collections::HashSet<Id> = inner
            .members
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.group_id)
            .collect();
        Ok(group_ids.into_iter().filter_map(|id| inner.groups.get(&id).cloned()).collect())
    }

    // ── Group membership ──

    async fn add_member(
        &self,
        group_id: Id,
        user_id: Id,
        role: GroupRole,
        now: DateTime<Utc>,
    ) -> Result<GroupMember, AgendaError> {
        let mut inner = self.inner.write().await;
        if !inner.groups.contains_key(&group_id) {
            return Err(AgendaError::NotFound(format!("group {group_id}")));
        }
        if inner.members.iter().any(|m| m.group_id == group_id && m.user_id == user_id && !m.is_inherited) {
            return Err(AgendaError::Conflict("user is already a member of this group".into()));
        }

        let member = GroupMember {
            id: cascade_id(&["direct-member", &group_id.to_string(), &user_id.to_string()]),
            group_id,
            user_id,
            role,
            is_inherited: false,
            joined_at: now,
        };
        inner.members.push(member.clone());

        let is_hierarchical = inner.groups.get(&group_id).map(|g| g.is_hierarchical).unwrap_or(false);
        if is_hierarchical {
            for descendant_id in inner.descendants(group_id) {
                if inner.members.iter().any(|m| m.group_id == descendant_id && m.user_id == user_id) {
                    continue;
                }
                inner.members.push(GroupMember {
                    id: cascade_id(&["inherited-member", &descendant_id.to_string(), &user_id.to_string()]),
                    group_id: descendant_id,
                    user_id,
                    role,
                    is_inherited: true,
                    joined_at: now,
                });
            }
        }

        Ok(member)
    }

    async fn list_members(&self, group_id: Id) -> Result<Vec<GroupMember>, AgendaError> {
        let inner = self.inner.read().await;
        if !inner.groups.contains_key(&group_id) {
            return Err(AgendaError::NotFound(format!("group {group_id}")));
        }
        Ok(inner.effective_members(group_id))
    }

    async fn remove_member(&self, group_id: Id, user_id: Id) -> Result<(), AgendaError> {
        let mut inner = self.inner.write().await;
        let removing_admin = inner
            .members
            .iter()
            .any(|m| m.group_id == group_id && m.user_id == user_id && !m.is_inherited && m.role == GroupRole::Admin);
        if removing_admin && inner.non_inherited_admin_count(group_id) <= 1 {
            return Err(AgendaError::InvalidArgument("cannot remove a group's last admin".into()));
        }
        inner.members.retain(|m| !(m.group_id == group_id && m.user_id == user_id && !m.is_inherited));
        Ok(())
    }

    async fn update_member_role(
        &self,
        group_id: Id,
        user_id: Id,
        role: GroupRole,
    ) -> Result<GroupMember, AgendaError> {
        let mut inner = self.inner.write().await;
        let demoting = role == GroupRole::Member;
        if demoting {
            let is_admin = inner
                .members
                .iter()
                .any(|m| m.group_id == group_id && m.user_id == user_id && !m.is_inherited && m.role == GroupRole::Admin);
            if is_admin && inner.non_inherited_admin_count(group_id) <= 1 {
                return Err(AgendaError::InvalidArgument("cannot demote a group's last admin".into()));
            }
        }
        let member = inner
            .members
            .iter_mut()
            .find(|m| m.group_id == group_id && m.user_id == user_id && !m.is_inherited)
            .ok_or_else(|| AgendaError::NotFound(format!("member {user_id} of group {group_id}")))?;
        member.role = role;
        Ok(member.clone())
    }

    // ── Group invitations ──

    async fn create_invite(
        &self,
        id: Id,
        group_id: Id,
        invited_user_id: Id,
        invited_by: Id,
        now: DateTime<Utc>,
    ) -> Result<GroupInvitation, AgendaError> {
        let mut inner = self.inner.write().await;
        if !inner.groups.contains_key(&group_id) {
            return Err(AgendaError::NotFound(format!("group {group_id}")));
        }
        if inner.members.iter().any(|m| m.group_id == group_id && m.user_id == invited_user_id) {
            return Err(AgendaError::Conflict("user is already a member of this group".into()));
        }
        let already_pending = inner.invitations.values().any(|inv| {
            inv.group_id == group_id
                && inv.invited_user_id == invited_user_id
                && inv.status == InvitationStatus::Pending
        });
        if already_pending {
            return Err(AgendaError::Conflict("user already has a pending invitation to this group".into()));
        }

        let invite = GroupInvitation {
            id,
            group_id,
            invited_user_id,
            invited_by,
            status: InvitationStatus::Pending,
            created_at: now,
            responded_at: None,
        };
        inner.invitations.insert(id, invite.clone());
        Ok(invite)
    }

    async fn accept_invite(&self, id: Id, now: DateTime<Utc>) -> Result<GroupInvitation, AgendaError> {
        let mut inner = self.inner.write().await;
        let invite = inner.invitations.get(&id).cloned().ok_or_else(|| AgendaError::NotFound(format!("invitation {id}")))?;
        if invite.status != InvitationStatus::Pending {
            return Err(AgendaError::InvalidArgument("invitation is no longer pending".into()));
        }
        let updated = GroupInvitation { status: InvitationStatus::Accepted, responded_at: Some(now), ..invite.clone() };
        inner.invitations.insert(id, updated.clone());

        inner.members.push(GroupMember {
            id: cascade_id(&["invite-member", &invite.group_id.to_string(), &invite.invited_user_id.to_string()]),
            group_id: invite.group_id,
            user_id: invite.invited_user_id,
            role: GroupRole::Member,
            is_inherited: false,
            joined_at: now,
        });

        Ok(updated)
    }

    async fn reject_invite(&self, id: Id, now: DateTime<Utc>) -> Result<GroupInvitation, AgendaError> {
        let mut inner = self.inner.write().await;
        let invite = inner.invitations.get(&id).cloned().ok_or_else(|| AgendaError::NotFound(format!("invitation {id}")))?;
        if invite.status != InvitationStatus::Pending {
            return Err(AgendaError::InvalidArgument("invitation is no longer pending".into()));
        }
        let updated = GroupInvitation { status: InvitationStatus::Rejected, responded_at: Some(now), ..invite };
        inner.invitations.insert(id, updated.clone());
        Ok(updated)
    }

    async fn cancel_invite(&self, id: Id, now: DateTime<Utc>) -> Result<GroupInvitation, AgendaError> {
        let mut inner = self.inner.write().await;
        let invite = inner.invitations.get(&id).cloned().ok_or_else(|| AgendaError::NotFound(format!("invitation {id}")))?;
        if invite.status != InvitationStatus::Pending {
            return Err(AgendaError::InvalidArgument("invitation is no longer pending".into()));
        }
        let updated = GroupInvitation { status: InvitationStatus::Cancelled, responded_at: Some(now), ..invite };
        inner.invitations.insert(id, updated.clone());
        Ok(updated)
    }

    async fn get_invite(&self, id: Id) -> Result<Option<GroupInvitation>, AgendaError> {
        Ok(self.inner.read().await.invitations.get(&id).cloned())
    }

    async fn list_invites(&self, group_id: Id) -> Result<Vec<GroupInvitation>, AgendaError> {
        Ok(self.inner.read().await.invitations.values().filter(|i| i.group_id == group_id).cloned().collect())
    }

    // ── Group events ──

    async fn create_group_event(
        &self,
        id: Id,
        group_id: Id,
        event_id: Id,
        added_by: Id,
        is_hierarchical: bool,
        now: DateTime<Utc>,
    ) -> Result<GroupEvent, AgendaError> {
        let mut inner = self.inner.write().await;
        if !inner.groups.contains_key(&group_id) {
            return Err(AgendaError::NotFound(format!("group {group_id}")));
        }
        if !inner.events.contains_key(&event_id) {
            return Err(AgendaError::NotFound(format!("event {event_id}")));
        }
        if inner.group_events.iter().any(|ge| ge.group_id == group_id && ge.event_id == event_id) {
            return Err(AgendaError::Conflict("event is already linked to this group".into()));
        }

        let initial_status = if is_hierarchical {
            GroupEventStatusValue::Accepted
        } else {
            GroupEventStatusValue::Pending
        };
        let group_event = GroupEvent {
            id,
            group_id,
            event_id,
            added_by,
            is_hierarchical,
            status: initial_status,
            added_at: now,
        };
        inner.group_events.push(group_event.clone());

        for member in inner.effective_members(group_id) {
            inner.group_event_statuses.push(GroupEventStatus {
                id: cascade_id(&["group-event-status", &group_id.to_string(), &event_id.to_string(), &member.user_id.to_string()]),
                group_id,
                event_id,
                user_id: member.user_id,
                status: initial_status,
                responded_at: if is_hierarchical { Some(now) } else { None },
                created_at: now,
                updated_at: now,
            });
        }

        Ok(group_event)
    }

    async fn list_group_events(&self, group_id: Id) -> Result<Vec<GroupEvent>, AgendaError> {
        Ok(self.inner.read().await.group_events.iter().filter(|ge| ge.group_id == group_id).cloned().collect())
    }

    async fn update_group_event_status(
        &self,
        group_id: Id,
        event_id: Id,
        user_id: Id,
        status: GroupEventStatusValue,
        now: DateTime<Utc>,
    ) -> Result<GroupEventStatus, AgendaError> {
        let mut inner = self.inner.write().await;

        let is_hierarchical = inner
            .group_events
            .iter()
            .find(|ge| ge.group_id == group_id && ge.event_id == event_id)
            .map(|ge| ge.is_hierarchical)
            .ok_or_else(|| AgendaError::NotFound(format!("group event {group_id}/{event_id}")))?;
        if is_hierarchical {
            return Err(AgendaError::InvalidArgument(
                "per-user status is immutable in a hierarchical group".into(),
            ));
        }

        let row = inner
            .group_event_statuses
            .iter_mut()
            .find(|s| s.group_id == group_id && s.event_id == event_id && s.user_id == user_id)
            .ok_or_else(|| AgendaError::NotFound(format!("status for user {user_id}")))?;
        row.status = status;
        row.responded_at = Some(now);
        row.updated_at = now;
        let updated = row.clone();

        let all_accepted = inner
            .group_event_statuses
            .iter()
            .filter(|s| s.group_id == group_id && s.event_id == event_id)
            .all(|s| s.status == GroupEventStatusValue::Accepted);
        if let Some(ge) = inner.group_events.iter_mut().find(|ge| ge.group_id == group_id && ge.event_id == event_id) {
            ge.status = if all_accepted { GroupEventStatusValue::Accepted } else { status };
        }

        Ok(updated)
    }
}

/// Removes a group and everything that hangs off it: members, invitations,
/// group-event links, and their per-user statuses. Shared by `delete_group`
/// and the "last member left, delete the orphaned group" path in
/// `delete_user`.
fn drop_group_cascade(inner: &mut Inner, group_id: Id) {
    inner.groups.remove(&group_id);
    inner.members.retain(|m| m.group_id != group_id);
    inner.invitations.retain(|_, inv| inv.group_id != group_id);
    inner.group_events.retain(|ge| ge.group_id != group_id);
    inner.group_event_statuses.retain(|s| s.group_id != group_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use agenda_types::entities::InvitationStatus;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    async fn seed_user(store: &MemoryStore, email: &str) -> User {
        store
            .create_user(NewUser {
                id: Uuid::new_v4(),
                username: email.split('@').next().unwrap().to_string(),
                email: email.to_string(),
                hashed_password: vec![1, 2, 3],
                created_at: now(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected_case_insensitively() {
        let store = MemoryStore::new();
        seed_user(&store, "a@example.com").await;
        let err = store
            .create_user(NewUser {
                id: Uuid::new_v4(),
                username: "dup".into(),
                email: "A@Example.com".into(),
                hashed_password: vec![],
                created_at: now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgendaError::Conflict(_)));
    }

    #[tokio::test]
    async fn overlapping_events_for_same_user_are_rejected() {
        let store = MemoryStore::new();
        let user = seed_user(&store, "a@example.com").await;
        store
            .create_event(NewEvent {
                id: Uuid::new_v4(),
                title: "standup".into(),
                description: String::new(),
                start_time: now(),
                end_time: now() + chrono::Duration::hours(1),
                user_id: user.id,
            })
            .await
            .unwrap();

        let err = store
            .create_event(NewEvent {
                id: Uuid::new_v4(),
                title: "overlap".into(),
                description: String::new(),
                start_time: now() + chrono::Duration::minutes(30),
                end_time: now() + chrono::Duration::minutes(90),
                user_id: user.id,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgendaError::Conflict(_)));
    }

    #[tokio::test]
    async fn creator_becomes_admin_member() {
        let store = MemoryStore::new();
        let user = seed_user(&store, "owner@example.com").await;
        let group = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "team".into(),
                description: String::new(),
                created_by: user.id,
                is_hierarchical: false,
                parent_group_id: None,
                created_at: now(),
            })
            .await
            .unwrap();

        let members = store.list_members(group.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].role, GroupRole::Admin);
    }

    #[tokio::test]
    async fn adding_member_to_hierarchical_group_propagates_to_descendants() {
        let store = MemoryStore::new();
        let owner = seed_user(&store, "owner@example.com").await;
        let member = seed_user(&store, "member@example.com").await;

        let parent = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "org".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: true,
                parent_group_id: None,
                created_at: now(),
            })
            .await
            .unwrap();
        let child = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "org/team".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: true,
                parent_group_id: Some(parent.id),
                created_at: now(),
            })
            .await
            .unwrap();

        store.add_member(parent.id, member.id, GroupRole::Member, now()).await.unwrap();

        let child_members = store.list_members(child.id).await.unwrap();
        let inherited = child_members.iter().find(|m| m.user_id == member.id).unwrap();
        assert!(inherited.is_inherited);
    }

    #[tokio::test]
    async fn creating_child_group_backfills_existing_parent_members() {
        let store = MemoryStore::new();
        let owner = seed_user(&store, "owner@example.com").await;
        let member = seed_user(&store, "member@example.com").await;

        let parent = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "org".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: true,
                parent_group_id: None,
                created_at: now(),
            })
            .await
            .unwrap();
        store.add_member(parent.id, member.id, GroupRole::Member, now()).await.unwrap();

        // The child is created after the parent already has a member: the
        // member's inherited row must still show up, not just rows added by
        // `add_member` after the fact.
        let child = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "org/team".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: true,
                parent_group_id: Some(parent.id),
                created_at: now(),
            })
            .await
            .unwrap();

        let child_members = store.list_members(child.id).await.unwrap();
        let inherited = child_members.iter().find(|m| m.user_id == member.id).unwrap();
        assert!(inherited.is_inherited);
    }

    #[tokio::test]
    async fn reparenting_group_recomputes_inherited_membership() {
        let store = MemoryStore::new();
        let owner = seed_user(&store, "owner@example.com").await;
        let member = seed_user(&store, "member@example.com").await;

        let old_parent = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "old-org".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: true,
                parent_group_id: None,
                created_at: now(),
            })
            .await
            .unwrap();
        let new_parent = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "new-org".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: true,
                parent_group_id: None,
                created_at: now(),
            })
            .await
            .unwrap();
        store.add_member(new_parent.id, member.id, GroupRole::Member, now()).await.unwrap();

        let child = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "team".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: true,
                parent_group_id: Some(old_parent.id),
                created_at: now(),
            })
            .await
            .unwrap();

        store
            .update_group(
                child.id,
                GroupPatch { parent_group_id: Some(Some(new_parent.id)), ..Default::default() },
                now(),
            )
            .await
            .unwrap();

        let reloaded = store.get_group(child.id).await.unwrap().unwrap();
        assert_eq!(reloaded.parent_group_id, Some(new_parent.id));

        let child_members = store.list_members(child.id).await.unwrap();
        assert!(child_members.iter().any(|m| m.user_id == member.id && m.is_inherited));
    }

    #[tokio::test]
    async fn cannot_reparent_group_under_its_own_descendant() {
        let store = MemoryStore::new();
        let owner = seed_user(&store, "owner@example.com").await;

        let parent = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "org".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: true,
                parent_group_id: None,
                created_at: now(),
            })
            .await
            .unwrap();
        let child = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "org/team".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: true,
                parent_group_id: Some(parent.id),
                created_at: now(),
            })
            .await
            .unwrap();

        let err = store
            .update_group(
                parent.id,
                GroupPatch { parent_group_id: Some(Some(child.id)), ..Default::default() },
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgendaError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn cannot_remove_last_admin() {
        let store = MemoryStore::new();
        let owner = seed_user(&store, "owner@example.com").await;
        let group = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "solo".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: false,
                parent_group_id: None,
                created_at: now(),
            })
            .await
            .unwrap();

        let err = store.remove_member(group.id, owner.id).await.unwrap_err();
        assert!(matches!(err, AgendaError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn deleting_user_reassigns_group_ownership() {
        let store = MemoryStore::new();
        let owner = seed_user(&store, "owner@example.com").await;
        let other = seed_user(&store, "other@example.com").await;
        let group = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "team".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: false,
                parent_group_id: None,
                created_at: now(),
            })
            .await
            .unwrap();
        store.add_member(group.id, other.id, GroupRole::Admin, now()).await.unwrap();

        store.delete_user(owner.id).await.unwrap();

        let reloaded = store.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(reloaded.created_by, other.id);
    }

    #[tokio::test]
    async fn deleting_last_member_deletes_the_group() {
        let store = MemoryStore::new();
        let owner = seed_user(&store, "owner@example.com").await;
        let group = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "solo".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: false,
                parent_group_id: None,
                created_at: now(),
            })
            .await
            .unwrap();

        store.delete_user(owner.id).await.unwrap();
        assert!(store.get_group(group.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flat_group_event_becomes_accepted_only_once_every_member_accepts() {
        let store = MemoryStore::new();
        let owner = seed_user(&store, "owner@example.com").await;
        let member = seed_user(&store, "member@example.com").await;
        let group = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "team".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: false,
                parent_group_id: None,
                created_at: now(),
            })
            .await
            .unwrap();
        store.add_member(group.id, member.id, GroupRole::Member, now()).await.unwrap();

        let event = store
            .create_event(NewEvent {
                id: Uuid::new_v4(),
                title: "offsite".into(),
                description: String::new(),
                start_time: now(),
                end_time: now() + chrono::Duration::hours(2),
                user_id: owner.id,
            })
            .await
            .unwrap();

        let group_event = store
            .create_group_event(Uuid::new_v4(), group.id, event.id, owner.id, false, now())
            .await
            .unwrap();
        assert_eq!(group_event.status, GroupEventStatusValue::Pending);

        store
            .update_group_event_status(group.id, event.id, owner.id, GroupEventStatusValue::Accepted, now())
            .await
            .unwrap();
        let events = store.list_group_events(group.id).await.unwrap();
        assert_eq!(events[0].status, GroupEventStatusValue::Pending);

        store
            .update_group_event_status(group.id, event.id, member.id, GroupEventStatusValue::Accepted, now())
            .await
            .unwrap();
        let events = store.list_group_events(group.id).await.unwrap();
        assert_eq!(events[0].status, GroupEventStatusValue::Accepted);
    }

    #[tokio::test]
    async fn hierarchical_group_event_status_is_immutable() {
        let store = MemoryStore::new();
        let owner = seed_user(&store, "owner@example.com").await;
        let group = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "org".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: true,
                parent_group_id: None,
                created_at: now(),
            })
            .await
            .unwrap();
        let event = store
            .create_event(NewEvent {
                id: Uuid::new_v4(),
                title: "all-hands".into(),
                description: String::new(),
                start_time: now(),
                end_time: now() + chrono::Duration::hours(1),
                user_id: owner.id,
            })
            .await
            .unwrap();
        store.create_group_event(Uuid::new_v4(), group.id, event.id, owner.id, true, now()).await.unwrap();

        let err = store
            .update_group_event_status(group.id, event.id, owner.id, GroupEventStatusValue::Rejected, now())
            .await
            .unwrap_err();
        assert!(matches!(err, AgendaError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn invite_lifecycle_accept_adds_member() {
        let store = MemoryStore::new();
        let owner = seed_user(&store, "owner@example.com").await;
        let invitee = seed_user(&store, "invitee@example.com").await;
        let group = store
            .create_group(NewGroup {
                id: Uuid::new_v4(),
                name: "team".into(),
                description: String::new(),
                created_by: owner.id,
                is_hierarchical: false,
                parent_group_id: None,
                created_at: now(),
            })
            .await
            .unwrap();

        let invite = store.create_invite(Uuid::new_v4(), group.id, invitee.id, owner.id, now()).await.unwrap();
        assert_eq!(invite.status, InvitationStatus::Pending);

        let accepted = store.accept_invite(invite.id, now()).await.unwrap();
        assert_eq!(accepted.status, InvitationStatus::Accepted);

        let members = store.list_members(group.id).await.unwrap();
        assert!(members.iter().any(|m| m.user_id == invitee.id));
    }
}
