//! Error taxonomy, expressed as a typed enum rather than loose error strings.
//! `anyhow::Error` is still used inside a single process for plumbing that
//! never crosses a domain boundary (store internals, I/O); this type is what
//! crosses the repository boundary and rides in a
//! [`crate::envelope::ResponseEnvelope::error`] string.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AgendaError {
    /// A write was routed to a non-leader Raft node.
    #[error("not leader{}", .leader_hint.as_ref().map(|h| format!(" (leader hint: {h})")).unwrap_or_default())]
    NotLeader { leader_hint: Option<String> },

    /// No reply arrived within the caller's deadline.
    #[error("timeout waiting for response")]
    Timeout,

    /// Uniqueness or time-overlap violation at apply time.
    #[error("{0}")]
    Conflict(String),

    /// Entity missing at read or required-for-mutation time.
    #[error("not found: {0}")]
    NotFound(String),

    /// Actor lacks the role required for the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed envelope, missing required field, bad time format.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport failure, connection reset; caller may retry with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The proposal was abandoned because leadership changed mid-flight.
    #[error("proposal cancelled, leadership changed")]
    Cancelled,
}

impl AgendaError {
    /// `Conflict("... time conflict ...")` is the one variant whose message
    /// the front door rewrites into user-facing copy. Kept as a helper so
    /// every producer (there is exactly one: `agenda-storage`'s event
    /// overlap check) spells the substring identically.
    pub fn time_conflict() -> Self {
        AgendaError::Conflict(
            "time conflict: there is already an event scheduled during this time".to_string(),
        )
    }

    /// User-visible rewrite applied at the front door only; the core error
    /// text itself is left untouched everywhere else.
    pub fn user_facing_message(&self) -> String {
        let raw = self.to_string();
        if raw.contains("time conflict") {
            "There is already an event scheduled during this time.".to_string()
        } else {
            raw
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_conflict_rewrite() {
        let e = AgendaError::time_conflict();
        assert_eq!(
            e.user_facing_message(),
            "There is already an event scheduled during this time."
        );
    }

    #[test]
    fn other_errors_pass_through_unchanged() {
        let e = AgendaError::NotFound("event abc".into());
        assert_eq!(e.user_facing_message(), e.to_string());
    }
}
