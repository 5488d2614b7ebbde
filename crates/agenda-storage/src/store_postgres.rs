//! PostgreSQL-backed `AgendaStore`, modeled directly on
//! `bpmn-lite-core::store_postgres::PostgresProcessStore`: a thin wrapper
//! around a `sqlx::PgPool`, embedded migrations run once at startup, and
//! one `sqlx::query` per access path rather than a query builder.
//!
//! Every multi-row mutation (a cascade delete, a hierarchical membership
//! fan-out, a group-event's per-member status rows) runs inside a single
//! `sqlx::Transaction` so the apply step stays atomic, matching the
//! transactional discipline spec.md §4.4 requires of the state machine.

use agenda_types::entities::{
    Event, Group, GroupEvent, GroupEventStatus, GroupEventStatusValue, GroupInvitation,
    GroupMember, GroupRole, Id, InvitationStatus, User, MAX_GROUP_DEPTH,
};
use agenda_types::error::AgendaError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::store::{AgendaStore, EventPatch, GroupPatch, NewEvent, NewGroup, NewUser, UserPatch};

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

fn role_str(role: GroupRole) -> &'static str {
    match role {
        GroupRole::Admin => "admin",
        GroupRole::Member => "member",
    }
}

fn role_from_str(s: &str) -> GroupRole {
    match s {
        "admin" => GroupRole::Admin,
        _ => GroupRole::Member,
    }
}

fn invite_status_str(status: InvitationStatus) -> &'static str {
    match status {
        InvitationStatus::Pending => "pending",
        InvitationStatus::Accepted => "accepted",
        InvitationStatus::Rejected => "rejected",
        InvitationStatus::Cancelled => "cancelled",
    }
}

fn invite_status_from_str(s: &str) -> InvitationStatus {
    match s {
        "accepted" => InvitationStatus::Accepted,
        "rejected" => InvitationStatus::Rejected,
        "cancelled" => InvitationStatus::Cancelled,
        _ => InvitationStatus::Pending,
    }
}

fn ge_status_str(status: GroupEventStatusValue) -> &'static str {
    match status {
        GroupEventStatusValue::Pending => "pending",
        GroupEventStatusValue::Accepted => "accepted",
        GroupEventStatusValue::Rejected => "rejected",
    }
}

fn ge_status_from_str(s: &str) -> GroupEventStatusValue {
    match s {
        "accepted" => GroupEventStatusValue::Accepted,
        "rejected" => GroupEventStatusValue::Rejected,
        _ => GroupEventStatusValue::Pending,
    }
}

/// Translates a raw `sqlx::Error` into the taxonomy's `Conflict`/`Transient`
/// split the repository layer expects; `NotFound` and validation errors are
/// raised explicitly by the caller before ever reaching the database.
fn db_err(err: sqlx::Error) -> AgendaError {
    if let sqlx::Error::Database(ref db) = err {
        if db.is_unique_violation() {
            return AgendaError::Conflict(db.message().to_string());
        }
    }
    AgendaError::Transient(err.to_string())
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        PostgresStore { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn row_to_user(row: &sqlx::postgres::PgRow) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        hashed_password: row.get("hashed_password"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Event {
    Event {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        user_id: row.get("user_id"),
    }
}

fn row_to_group(row: &sqlx::postgres::PgRow) -> Group {
    Group {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        created_by: row.get("created_by"),
        is_hierarchical: row.get("is_hierarchical"),
        parent_group_id: row.get("parent_group_id"),
    }
}

fn row_to_member(row: &sqlx::postgres::PgRow) -> GroupMember {
    let role: String = row.get("role");
    GroupMember {
        id: row.get("id"),
        group_id: row.get("group_id"),
        user_id: row.get("user_id"),
        role: role_from_str(&role),
        is_inherited: row.get("is_inherited"),
        joined_at: row.get("joined_at"),
    }
}

fn row_to_invite(row: &sqlx::postgres::PgRow) -> GroupInvitation {
    let status: String = row.get("status");
    GroupInvitation {
        id: row.get("id"),
        group_id: row.get("group_id"),
        invited_user_id: row.get("invited_user_id"),
        invited_by: row.get("invited_by"),
        status: invite_status_from_str(&status),
        created_at: row.get("created_at"),
        responded_at: row.get("responded_at"),
    }
}

fn row_to_group_event(row: &sqlx::postgres::PgRow) -> GroupEvent {
    let status: String = row.get("status");
    GroupEvent {
        id: row.get("id"),
        group_id: row.get("group_id"),
        event_id: row.get("event_id"),
        added_by: row.get("added_by"),
        is_hierarchical: row.get("is_hierarchical"),
        status: ge_status_from_str(&status),
        added_at: row.get("added_at"),
    }
}

fn row_to_ge_status(row: &sqlx::postgres::PgRow) -> GroupEventStatus {
    let status: String = row.get("status");
    GroupEventStatus {
        id: row.get("id"),
        group_id: row.get("group_id"),
        event_id: row.get("event_id"),
        user_id: row.get("user_id"),
        status: ge_status_from_str(&status),
        responded_at: row.get("responded_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Walks the parent chain of `group_id` inside an open transaction; used
/// both for depth checking on create and (indirectly, via `descendants`)
/// for hierarchical membership fan-out.
async fn ancestor_depth(tx: &mut Transaction<'_, Postgres>, group_id: Id) -> Result<usize, AgendaError> {
    let mut depth = 0usize;
    let mut current = group_id;
    loop {
        let parent: Option<Id> = sqlx::query("SELECT parent_group_id FROM groups WHERE id = $1")
            .bind(current)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .and_then(|row| row.get::<Option<Id>, _>("parent_group_id"));
        match parent {
            Some(id) => {
                depth += 1;
                current = id;
                if depth >= MAX_GROUP_DEPTH {
                    return Ok(depth);
                }
            }
            None => return Ok(depth),
        }
    }
}

async fn descendant_ids(tx: &mut Transaction<'_, Postgres>, group_id: Id) -> Result<Vec<Id>, AgendaError> {
    let mut out = Vec::new();
    let mut frontier = vec![group_id];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for parent in frontier {
            let rows = sqlx::query("SELECT id FROM groups WHERE parent_group_id = $1")
                .bind(parent)
                .fetch_all(&mut **tx)
                .await
                .map_err(db_err)?;
            for row in rows {
                let id: Id = row.get("id");
                out.push(id);
                next.push(id);
            }
        }
        frontier = next;
    }
    Ok(out)
}

async fn direct_children(tx: &mut Transaction<'_, Postgres>, group_id: Id) -> Result<Vec<Id>, AgendaError> {
    let rows = sqlx::query("SELECT id FROM groups WHERE parent_group_id = $1")
        .bind(group_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(rows.iter().map(|r| r.get("id")).collect())
}

/// Recomputes every inherited membership row across `root` and its whole
/// subtree, walking parent-before-child inside the same transaction so each
/// node's `effective_members` reflects its own freshly-recomputed parent.
/// Mirrors the in-memory store's helper of the same name.
async fn reflow_inherited_membership(
    tx: &mut Transaction<'_, Postgres>,
    root: Id,
    now: DateTime<Utc>,
) -> Result<(), AgendaError> {
    let mut frontier = vec![root];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for node_id in frontier {
            sqlx::query("DELETE FROM group_members WHERE group_id = $1 AND is_inherited = TRUE")
                .bind(node_id)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;

            let parent_id: Option<Id> = sqlx::query("SELECT parent_group_id FROM groups WHERE id = $1")
                .bind(node_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(db_err)?
                .and_then(|row| row.get::<Option<Id>, _>("parent_group_id"));

            if let Some(parent_id) = parent_id {
                let parent_is_hierarchical: bool = sqlx::query("SELECT is_hierarchical FROM groups WHERE id = $1")
                    .bind(parent_id)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(db_err)?
                    .map(|row| row.get("is_hierarchical"))
                    .unwrap_or(false);

                if parent_is_hierarchical {
                    let direct_present: std::collections::HashSet<Id> = sqlx::query(
                        "SELECT user_id FROM group_members WHERE group_id = $1 AND is_inherited = FALSE",
                    )
                    .bind(node_id)
                    .fetch_all(&mut **tx)
                    .await
                    .map_err(db_err)?
                    .iter()
                    .map(|r| r.get("user_id"))
                    .collect();

                    for member in effective_members(tx, parent_id).await? {
                        if direct_present.contains(&member.user_id) {
                            continue;
                        }
                        sqlx::query(
                            "INSERT INTO group_members (id, group_id, user_id, role, is_inherited, joined_at)
                             VALUES ($1, $2, $3, $4, TRUE, $5)",
                        )
                        .bind(uuid::Uuid::new_v4())
                        .bind(node_id)
                        .bind(member.user_id)
                        .bind(role_str(member.role))
                        .bind(now)
                        .execute(&mut **tx)
                        .await
                        .map_err(db_err)?;
                    }
                }
            }

            next.extend(direct_children(tx, node_id).await?);
        }
        frontier = next;
    }
    Ok(())
}

async fn effective_members(
    tx: &mut Transaction<'_, Postgres>,
    group_id: Id,
) -> Result<Vec<GroupMember>, AgendaError> {
    let rows = sqlx::query("SELECT * FROM group_members WHERE group_id = $1")
        .bind(group_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;
    let mut by_user: std::collections::HashMap<Id, GroupMember> = std::collections::HashMap::new();
    for row in &rows {
        let member = row_to_member(row);
        by_user
            .entry(member.user_id)
            .and_modify(|existing| {
                if member.role.more_privileged(existing.role) == member.role && member.role != existing.role {
                    existing.role = member.role;
                }
                if !member.is_inherited {
                    existing.is_inherited = false;
                    existing.id = member.id;
                    existing.joined_at = member.joined_at;
                }
            })
            .or_insert(member);
    }
    Ok(by_user.into_values().collect())
}

#[async_trait]
impl AgendaStore for PostgresStore {
    // ── Users ──

    async fn create_user(&self, new_user: NewUser) -> Result<User, AgendaError> {
        let key = email_key(&new_user.email);
        sqlx::query(
            "INSERT INTO users (id, username, email, email_key, hashed_password, is_active, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, TRUE, $6, $6)",
        )
        .bind(new_user.id)
        .bind(&new_user.username)
        .bind(&new_user.email)
        .bind(&key)
        .bind(&new_user.hashed_password)
        .bind(new_user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                AgendaError::Conflict(format!("email already registered: {}", new_user.email))
            } else {
                db_err(e)
            }
        })?;

        self.get_user(new_user.id)
            .await?
            .ok_or_else(|| AgendaError::NotFound(format!("user {}", new_user.id)))
    }

    async fn get_user(&self, id: Id) -> Result<Option<User>, AgendaError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(row_to_user))
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, AgendaError> {
        let row = sqlx::query("SELECT * FROM users WHERE email_key = $1")
            .bind(email_key(email))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(row_to_user))
    }

    async fn update_user(&self, id: Id, patch: UserPatch, now: DateTime<Utc>) -> Result<User, AgendaError> {
        let existing = self.get_user(id).await?.ok_or_else(|| AgendaError::NotFound(format!("user {id}")))?;
        let username = patch.username.unwrap_or(existing.username);
        let email = patch.email.unwrap_or(existing.email);
        let hashed_password = patch.hashed_password.unwrap_or(existing.hashed_password);
        let is_active = patch.is_active.unwrap_or(existing.is_active);
        let key = email_key(&email);

        sqlx::query(
            "UPDATE users SET username = $1, email = $2, email_key = $3, hashed_password = $4, is_active = $5, updated_at = $6
             WHERE id = $7",
        )
        .bind(&username)
        .bind(&email)
        .bind(&key)
        .bind(&hashed_password)
        .bind(is_active)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                AgendaError::Conflict(format!("email already registered: {email}"))
            } else {
                db_err(e)
            }
        })?;

        self.get_user(id).await?.ok_or_else(|| AgendaError::NotFound(format!("user {id}")))
    }

    async fn delete_user(&self, id: Id) -> Result<(), AgendaError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let existing = sqlx::query("SELECT id FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if existing.is_none() {
            return Err(AgendaError::NotFound(format!("user {id}")));
        }

        let owned_groups: Vec<Id> = sqlx::query("SELECT id FROM groups WHERE created_by = $1")
            .bind(id)
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?
            .iter()
            .map(|r| r.get("id"))
            .collect();

        // Remove this user's own memberships first so "last remaining
        // member" queries below don't still count them.
        sqlx::query("DELETE FROM group_members WHERE user_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for group_id in owned_groups {
            let successor: Option<Id> = sqlx::query(
                "SELECT user_id FROM group_members WHERE group_id = $1 AND is_inherited = FALSE AND role = 'admin' LIMIT 1",
            )
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .map(|r| r.get("user_id"));

            let successor = match successor {
                Some(id) => Some(id),
                None => sqlx::query("SELECT user_id FROM group_members WHERE group_id = $1 LIMIT 1")
                    .bind(group_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?
                    .map(|r| r.get("user_id")),
            };

            match successor {
                Some(new_owner) => {
                    sqlx::query("UPDATE groups SET created_by = $1 WHERE id = $2")
                        .bind(new_owner)
                        .bind(group_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;
                }
                None => {
                    sqlx::query("DELETE FROM groups WHERE id = $1")
                        .bind(group_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;
                }
            }
        }

        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    // ── Events ──

    async fn create_event(&self, new_event: NewEvent) -> Result<Event, AgendaError> {
        if new_event.end_time <= new_event.start_time {
            return Err(AgendaError::InvalidArgument("end_time must be after start_time".into()));
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let conflict = sqlx::query(
            "SELECT 1 FROM events WHERE user_id = $1 AND start_time < $2 AND $3 < end_time LIMIT 1",
        )
        .bind(new_event.user_id)
        .bind(new_event.end_time)
        .bind(new_event.start_time)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if conflict.is_some() {
            return Err(AgendaError::time_conflict());
        }

        sqlx::query(
            "INSERT INTO events (id, title, description, start_time, end_time, user_id) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(new_event.id)
        .bind(&new_event.title)
        .bind(&new_event.description)
        .bind(new_event.start_time)
        .bind(new_event.end_time)
        .bind(new_event.user_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(Event {
            id: new_event.id,
            title: new_event.title,
            description: new_event.description,
            start_time: new_event.start_time,
            end_time: new_event.end_time,
            user_id: new_event.user_id,
        })
    }

    async fn get_event(&self, id: Id) -> Result<Option<Event>, AgendaError> {
        let row = sqlx::query("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(row_to_event))
    }

    async fn update_event(&self, id: Id, patch: EventPatch) -> Result<Event, AgendaError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let existing = sqlx::query("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .map(|r| row_to_event(&r))
            .ok_or_else(|| AgendaError::NotFound(format!("event {id}")))?;

        let title = patch.title.unwrap_or(existing.title);
        let description = patch.description.unwrap_or(existing.description);
        let start_time = patch.start_time.unwrap_or(existing.start_time);
        let end_time = patch.end_time.unwrap_or(existing.end_time);
        if end_time <= start_time {
            return Err(AgendaError::InvalidArgument("end_time must be after start_time".into()));
        }

        let conflict = sqlx::query(
            "SELECT 1 FROM events WHERE id != $1 AND user_id = $2 AND start_time < $3 AND $4 < end_time LIMIT 1",
        )
        .bind(id)
        .bind(existing.user_id)
        .bind(end_time)
        .bind(start_time)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if conflict.is_some() {
            return Err(AgendaError::time_conflict());
        }

        sqlx::query("UPDATE events SET title = $1, description = $2, start_time = $3, end_time = $4 WHERE id = $5")
            .bind(&title)
            .bind(&description)
            .bind(start_time)
            .bind(end_time)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(Event { id, title, description, start_time, end_time, user_id: existing.user_id })
    }

    async fn delete_event(&self, id: Id) -> Result<(), AgendaError> {
        let result = sqlx::query("DELETE FROM events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(AgendaError::NotFound(format!("event {id}")));
        }
        Ok(())
    }

    async fn list_events_for_user(&self, user_id: Id, offset: u32, limit: u32) -> Result<Vec<Event>, AgendaError> {
        let rows = sqlx::query("SELECT * FROM events WHERE user_id = $1 ORDER BY start_time OFFSET $2 LIMIT $3")
            .bind(user_id)
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_event).collect())
    }

    // ── Groups ──

    async fn create_group(&self, new_group: NewGroup) -> Result<Group, AgendaError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(parent_id) = new_group.parent_group_id {
            let parent = sqlx::query("SELECT is_hierarchical FROM groups WHERE id = $1")
                .bind(parent_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .ok_or_else(|| AgendaError::NotFound(format!("group {parent_id}")))?;
            let parent_is_hierarchical: bool = parent.get("is_hierarchical");
            if new_group.is_hierarchical && !parent_is_hierarchical {
                return Err(AgendaError::InvalidArgument(
                    "a hierarchical group's parent must also be hierarchical".into(),
                ));
            }
            let depth = ancestor_depth(&mut tx, parent_id).await? + 1;
            if depth >= MAX_GROUP_DEPTH {
                return Err(AgendaError::InvalidArgument("group hierarchy exceeds maximum depth".into()));
            }
        }

        sqlx::query(
            "INSERT INTO groups (id, name, description, created_by, is_hierarchical, parent_group_id)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(new_group.id)
        .bind(&new_group.name)
        .bind(&new_group.description)
        .bind(new_group.created_by)
        .bind(new_group.is_hierarchical)
        .bind(new_group.parent_group_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO group_members (id, group_id, user_id, role, is_inherited, joined_at)
             VALUES ($1, $2, $3, 'admin', FALSE, $4)",
        )
        .bind(uuid::Uuid::new_v4())
        .bind(new_group.id)
        .bind(new_group.created_by)
        .bind(new_group.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Backfills this group with whatever inherited rows its parent
        // chain already carries, so the invariant holds even when a child
        // is created after its parent already has members.
        reflow_inherited_membership(&mut tx, new_group.id, new_group.created_at).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(Group {
            id: new_group.id,
            name: new_group.name,
            description: new_group.description,
            created_by: new_group.created_by,
            is_hierarchical: new_group.is_hierarchical,
            parent_group_id: new_group.parent_group_id,
        })
    }

    async fn get_group(&self, id: Id) -> Result<Option<Group>, AgendaError> {
        let row = sqlx::query("SELECT * FROM groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(row_to_group))
    }

    async fn update_group(&self, id: Id, patch: GroupPatch, now: DateTime<Utc>) -> Result<Group, AgendaError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let existing_row = sqlx::query("SELECT * FROM groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| AgendaError::NotFound(format!("group {id}")))?;
        let existing = row_to_group(&existing_row);

        let reparenting = patch.parent_group_id.is_some();
        let parent_group_id = if let Some(new_parent) = patch.parent_group_id {
            if new_parent == Some(id) {
                return Err(AgendaError::InvalidArgument("a group cannot be its own parent".into()));
            }
            if let Some(parent_id) = new_parent {
                let parent = sqlx::query("SELECT is_hierarchical FROM groups WHERE id = $1")
                    .bind(parent_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?
                    .ok_or_else(|| AgendaError::NotFound(format!("group {parent_id}")))?;
                let parent_is_hierarchical: bool = parent.get("is_hierarchical");

                // Reparenting under one of your own descendants would create
                // a cycle; checked here, inside the apply transaction, so a
                // racing concurrent reparent can never sneak one in between
                // a caller's read and its write.
                if descendant_ids(&mut tx, id).await?.contains(&parent_id) {
                    return Err(AgendaError::InvalidArgument(
                        "cannot reparent a group under its own descendant".into(),
                    ));
                }
                if existing.is_hierarchical && !parent_is_hierarchical {
                    return Err(AgendaError::InvalidArgument(
                        "a hierarchical group's parent must also be hierarchical".into(),
                    ));
                }
                let depth = ancestor_depth(&mut tx, parent_id).await? + 1;
                if depth >= MAX_GROUP_DEPTH {
                    return Err(AgendaError::InvalidArgument("group hierarchy exceeds maximum depth".into()));
                }
            }
            new_parent
        } else {
            existing.parent_group_id
        };

        let name = patch.name.unwrap_or(existing.name);
        let description = patch.description.unwrap_or(existing.description);
        sqlx::query("UPDATE groups SET name = $1, description = $2, parent_group_id = $3 WHERE id = $4")
            .bind(&name)
            .bind(&description)
            .bind(parent_group_id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        if reparenting {
            reflow_inherited_membership(&mut tx, id, now).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(Group { name, description, parent_group_id, ..existing })
    }

    async fn delete_group(&self, id: Id) -> Result<(), AgendaError> {
        let result = sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(AgendaError::NotFound(format!("group {id}")));
        }
        Ok(())
    }

    async fn list_groups_for_user(&self, user_id: Id) -> Result<Vec<Group>, AgendaError> {
        let rows = sqlx::query(
            "SELECT DISTINCT g.* FROM groups g JOIN group_members m ON m.group_id = g.id WHERE m.user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(row_to_group).collect())
    }

    // ── Group membership ──

    async fn add_member(
        &self,
        group_id: Id,
        user_id: Id,
        role: GroupRole,
        now: DateTime<Utc>,
    ) -> Result<GroupMember, AgendaError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let group = sqlx::query("SELECT is_hierarchical FROM groups WHERE id = $1")
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| AgendaError::NotFound(format!("group {group_id}")))?;
        let is_hierarchical: bool = group.get("is_hierarchical");

        let already = sqlx::query(
            "SELECT 1 FROM group_members WHERE group_id = $1 AND user_id = $2 AND is_inherited = FALSE",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if already.is_some() {
            return Err(AgendaError::Conflict("user is already a member of this group".into()));
        }

        let member_id = uuid::Uuid::new_v4();
        sqlx::query(
            "INSERT INTO group_members (id, group_id, user_id, role, is_inherited, joined_at) VALUES ($1, $2, $3, $4, FALSE, $5)",
        )
        .bind(member_id)
        .bind(group_id)
        .bind(user_id)
        .bind(role_str(role))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if is_hierarchical {
            for descendant_id in descendant_ids(&mut tx, group_id).await? {
                let exists = sqlx::query("SELECT 1 FROM group_members WHERE group_id = $1 AND user_id = $2")
                    .bind(descendant_id)
                    .bind(user_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
                if exists.is_some() {
                    continue;
                }
                sqlx::query(
                    "INSERT INTO group_members (id, group_id, user_id, role, is_inherited, joined_at) VALUES ($1, $2, $3, $4, TRUE, $5)",
                )
                .bind(uuid::Uuid::new_v4())
                .bind(descendant_id)
                .bind(user_id)
                .bind(role_str(role))
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(GroupMember { id: member_id, group_id, user_id, role, is_inherited: false, joined_at: now })
    }

    async fn list_members(&self, group_id: Id) -> Result<Vec<GroupMember>, AgendaError> {
        let exists = sqlx::query("SELECT 1 FROM groups WHERE id = $1")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(AgendaError::NotFound(format!("group {group_id}")));
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let members = effective_members(&mut tx, group_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(members)
    }

    async fn remove_member(&self, group_id: Id, user_id: Id) -> Result<(), AgendaError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let removing_admin = sqlx::query(
            "SELECT 1 FROM group_members WHERE group_id = $1 AND user_id = $2 AND is_inherited = FALSE AND role = 'admin'",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .is_some();

        if removing_admin {
            let admin_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM group_members WHERE group_id = $1 AND is_inherited = FALSE AND role = 'admin'",
            )
            .bind(group_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            if admin_count <= 1 {
                return Err(AgendaError::InvalidArgument("cannot remove a group's last admin".into()));
            }
        }

        let result = sqlx::query(
            "DELETE FROM group_members WHERE group_id = $1 AND user_id = $2 AND is_inherited = FALSE",
        )
        .bind(group_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(AgendaError::NotFound(format!("member {user_id} of group {group_id}")));
        }
        Ok(())
    }

    async fn update_member_role(
        &self,
        group_id: Id,
        user_id: Id,
        role: GroupRole,
    ) -> Result<GroupMember, AgendaError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if role == GroupRole::Member {
            let is_admin = sqlx::query(
                "SELECT 1 FROM group_members WHERE group_id = $1 AND user_id = $2 AND is_inherited = FALSE AND role = 'admin'",
            )
            .bind(group_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .is_some();
            if is_admin {
                let admin_count: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM group_members WHERE group_id = $1 AND is_inherited = FALSE AND role = 'admin'",
                )
                .bind(group_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
                if admin_count <= 1 {
                    return Err(AgendaError::InvalidArgument("cannot demote a group's last admin".into()));
                }
            }
        }

        let row = sqlx::query(
            "UPDATE group_members SET role = $1 WHERE group_id = $2 AND user_id = $3 AND is_inherited = FALSE RETURNING *",
        )
        .bind(role_str(role))
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| AgendaError::NotFound(format!("member {user_id} of group {group_id}")))?;
        tx.commit().await.map_err(db_err)?;
        Ok(row_to_member(&row))
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let group_exists = sqlx::query("SELECT 1 FROM groups WHERE id = $1")
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if group_exists.is_none() {
            return Err(AgendaError::NotFound(format!("group {group_id}")));
        }
        let already_member = sqlx::query("SELECT 1 FROM group_members WHERE group_id = $1 AND user_id = $2")
            .bind(group_id)
            .bind(invited_user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if already_member.is_some() {
            return Err(AgendaError::Conflict("user is already a member of this group".into()));
        }

        sqlx::query(
            "INSERT INTO group_invitations (id, group_id, invited_user_id, invited_by, status, created_at)
             VALUES ($1, $2, $3, $4, 'pending', $5)",
        )
        .bind(id)
        .bind(group_id)
        .bind(invited_user_id)
        .bind(invited_by)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                AgendaError::Conflict("user already has a pending invitation to this group".into())
            } else {
                db_err(e)
            }
        })?;
        tx.commit().await.map_err(db_err)?;

        Ok(GroupInvitation {
            id,
            group_id,
            invited_user_id,
            invited_by,
            status: InvitationStatus::Pending,
            created_at: now,
            responded_at: None,
        })
    }

    async fn accept_invite(&self, id: Id, now: DateTime<Utc>) -> Result<GroupInvitation, AgendaError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let invite = sqlx::query("SELECT * FROM group_invitations WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .map(|r| row_to_invite(&r))
            .ok_or_else(|| AgendaError::NotFound(format!("invitation {id}")))?;
        if invite.status != InvitationStatus::Pending {
            return Err(AgendaError::InvalidArgument("invitation is no longer pending".into()));
        }

        sqlx::query("UPDATE group_invitations SET status = 'accepted', responded_at = $1 WHERE id = $2")
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO group_members (id, group_id, user_id, role, is_inherited, joined_at) VALUES ($1, $2, $3, 'member', FALSE, $4)",
        )
        .bind(uuid::Uuid::new_v4())
        .bind(invite.group_id)
        .bind(invite.invited_user_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(GroupInvitation { status: InvitationStatus::Accepted, responded_at: Some(now), ..invite })
    }

    async fn reject_invite(&self, id: Id, now: DateTime<Utc>) -> Result<GroupInvitation, AgendaError> {
        self.transition_invite(id, now, "rejected", InvitationStatus::Rejected).await
    }

    async fn cancel_invite(&self, id: Id, now: DateTime<Utc>) -> Result<GroupInvitation, AgendaError> {
        self.transition_invite(id, now, "cancelled", InvitationStatus::Cancelled).await
    }

    async fn get_invite(&self, id: Id) -> Result<Option<GroupInvitation>, AgendaError> {
        let row = sqlx::query("SELECT * FROM group_invitations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(row_to_invite))
    }

    async fn list_invites(&self, group_id: Id) -> Result<Vec<GroupInvitation>, AgendaError> {
        let rows = sqlx::query("SELECT * FROM group_invitations WHERE group_id = $1")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_invite).collect())
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if sqlx::query("SELECT 1 FROM groups WHERE id = $1").bind(group_id).fetch_optional(&mut *tx).await.map_err(db_err)?.is_none() {
            return Err(AgendaError::NotFound(format!("group {group_id}")));
        }
        if sqlx::query("SELECT 1 FROM events WHERE id = $1").bind(event_id).fetch_optional(&mut *tx).await.map_err(db_err)?.is_none() {
            return Err(AgendaError::NotFound(format!("event {event_id}")));
        }

        let initial_status = if is_hierarchical { GroupEventStatusValue::Accepted } else { GroupEventStatusValue::Pending };
        sqlx::query(
            "INSERT INTO group_events (id, group_id, event_id, added_by, is_hierarchical, status, added_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(group_id)
        .bind(event_id)
        .bind(added_by)
        .bind(is_hierarchical)
        .bind(ge_status_str(initial_status))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                AgendaError::Conflict("event is already linked to this group".into())
            } else {
                db_err(e)
            }
        })?;

        for member in effective_members(&mut tx, group_id).await? {
            sqlx::query(
                "INSERT INTO group_event_statuses (id, group_id, event_id, user_id, status, responded_at, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $7)",
            )
            .bind(uuid::Uuid::new_v4())
            .bind(group_id)
            .bind(event_id)
            .bind(member.user_id)
            .bind(ge_status_str(initial_status))
            .bind(if is_hierarchical { Some(now) } else { None })
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(GroupEvent { id, group_id, event_id, added_by, is_hierarchical, status: initial_status, added_at: now })
    }

    async fn list_group_events(&self, group_id: Id) -> Result<Vec<GroupEvent>, AgendaError> {
        let rows = sqlx::query("SELECT * FROM group_events WHERE group_id = $1")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(row_to_group_event).collect())
    }

    async fn update_group_event_status(
        &self,
        group_id: Id,
        event_id: Id,
        user_id: Id,
        status: GroupEventStatusValue,
        now: DateTime<Utc>,
    ) -> Result<GroupEventStatus, AgendaError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let group_event = sqlx::query("SELECT is_hierarchical FROM group_events WHERE group_id = $1 AND event_id = $2")
            .bind(group_id)
            .bind(event_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| AgendaError::NotFound(format!("group event {group_id}/{event_id}")))?;
        let is_hierarchical: bool = group_event.get("is_hierarchical");
        if is_hierarchical {
            return Err(AgendaError::InvalidArgument("per-user status is immutable in a hierarchical group".into()));
        }

        let row = sqlx::query(
            "UPDATE group_event_statuses SET status = $1, responded_at = $2, updated_at = $2
             WHERE group_id = $3 AND event_id = $4 AND user_id = $5 RETURNING *",
        )
        .bind(ge_status_str(status))
        .bind(now)
        .bind(group_id)
        .bind(event_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| AgendaError::NotFound(format!("status for user {user_id}")))?;
        let updated = row_to_ge_status(&row);

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM group_event_statuses WHERE group_id = $1 AND event_id = $2")
            .bind(group_id)
            .bind(event_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let accepted: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM group_event_statuses WHERE group_id = $1 AND event_id = $2 AND status = 'accepted'",
        )
        .bind(group_id)
        .bind(event_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let aggregate = if total == accepted { GroupEventStatusValue::Accepted } else { status };

        sqlx::query("UPDATE group_events SET status = $1 WHERE group_id = $2 AND event_id = $3")
            .bind(ge_status_str(aggregate))
            .bind(group_id)
            .bind(event_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(updated)
    }
}

impl PostgresStore {
    async fn transition_invite(
        &self,
        id: Id,
        now: DateTime<Utc>,
        new_status: &str,
        result_status: InvitationStatus,
    ) -> Result<GroupInvitation, AgendaError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let invite = sqlx::query("SELECT * FROM group_invitations WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .map(|r| row_to_invite(&r))
            .ok_or_else(|| AgendaError::NotFound(format!("invitation {id}")))?;
        if invite.status != InvitationStatus::Pending {
            return Err(AgendaError::InvalidArgument("invitation is no longer pending".into()));
        }
        sqlx::query("UPDATE group_invitations SET status = $1, responded_at = $2 WHERE id = $3")
            .bind(new_status)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(GroupInvitation { status: result_status, responded_at: Some(now), ..invite })
    }
}
