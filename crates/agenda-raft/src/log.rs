//! Log storage: the durable record of `(term, voted_for)` and the sequence
//! of proposed commands, kept separate from the applied projection that
//! lives in `agenda-storage`. A node can always reconstruct its Raft state
//! from this plus a snapshot; the projection is just a cache of having
//! applied every entry up to `commit_index`.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub type Term = u64;
pub type LogIndex = u64;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    /// Opaque command payload; `agenda-repository` defines its shape.
    pub command: Bytes,
}

/// Durable state every Raft node must persist before it can safely respond
/// to a vote request or acknowledge an append. A crash between a write here
/// and the network reply it gates would otherwise let a node vote twice in
/// the same term, or forget an entry it already promised to keep.
#[async_trait]
pub trait RaftStorage: Send + Sync {
    async fn current_term(&self) -> anyhow::Result<Term>;
    async fn voted_for(&self) -> anyhow::Result<Option<String>>;
    async fn set_term_and_vote(&self, term: Term, voted_for: Option<String>) -> anyhow::Result<()>;

    async fn append(&self, entry: LogEntry) -> anyhow::Result<()>;
    /// Drop every entry at or after `index`, used when a follower's log
    /// diverges from the leader's and must be rewound before reapplying.
    async fn truncate_from(&self, index: LogIndex) -> anyhow::Result<()>;
    async fn entry_at(&self, index: LogIndex) -> anyhow::Result<Option<LogEntry>>;
    async fn entries_from(&self, index: LogIndex) -> anyhow::Result<Vec<LogEntry>>;
    async fn last_index_and_term(&self) -> anyhow::Result<(LogIndex, Term)>;

    async fn commit_index(&self) -> anyhow::Result<LogIndex>;
    async fn set_commit_index(&self, index: LogIndex) -> anyhow::Result<()>;
}

/// In-process log storage backed by a `Vec`. Sufficient for local
/// development and tests; a production deployment would back this with the
/// same `sqlx::PgPool` `agenda-storage` already uses for the projection.
#[derive(Default)]
pub struct MemoryRaftStorage {
    inner: tokio::sync::RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    term: Term,
    voted_for: Option<String>,
    entries: Vec<LogEntry>,
    commit_index: LogIndex,
}

impl MemoryRaftStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RaftStorage for MemoryRaftStorage {
    async fn current_term(&self) -> anyhow::Result<Term> {
        Ok(self.inner.read().await.term)
    }

    async fn voted_for(&self) -> anyhow::Result<Option<String>> {
        Ok(self.inner.read().await.voted_for.clone())
    }

    async fn set_term_and_vote(&self, term: Term, voted_for: Option<String>) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.term = term;
        inner.voted_for = voted_for;
        Ok(())
    }

    async fn append(&self, entry: LogEntry) -> anyhow::Result<()> {
        self.inner.write().await.entries.push(entry);
        Ok(())
    }

    async fn truncate_from(&self, index: LogIndex) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.entries.retain(|e| e.index < index);
        Ok(())
    }

    async fn entry_at(&self, index: LogIndex) -> anyhow::Result<Option<LogEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .entries
            .iter()
            .find(|e| e.index == index)
            .cloned())
    }

    async fn entries_from(&self, index: LogIndex) -> anyhow::Result<Vec<LogEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .entries
            .iter()
            .filter(|e| e.index >= index)
            .cloned()
            .collect())
    }

    async fn last_index_and_term(&self) -> anyhow::Result<(LogIndex, Term)> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .last()
            .map(|e| (e.index, e.term))
            .unwrap_or((0, 0)))
    }

    async fn commit_index(&self) -> anyhow::Result<LogIndex> {
        Ok(self.inner.read().await.commit_index)
    }

    async fn set_commit_index(&self, index: LogIndex) -> anyhow::Result<()> {
        self.inner.write().await.commit_index = index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_read_back() {
        let storage = MemoryRaftStorage::new();
        storage
            .append(LogEntry { term: 1, index: 1, command: Bytes::from_static(b"a") })
            .await
            .unwrap();
        storage
            .append(LogEntry { term: 1, index: 2, command: Bytes::from_static(b"b") })
            .await
            .unwrap();

        assert_eq!(storage.last_index_and_term().await.unwrap(), (2, 1));
        assert_eq!(storage.entries_from(2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn truncate_from_drops_conflicting_suffix() {
        let storage = MemoryRaftStorage::new();
        for i in 1..=3 {
            storage
                .append(LogEntry { term: 1, index: i, command: Bytes::new() })
                .await
                .unwrap();
        }
        storage.truncate_from(2).await.unwrap();
        assert_eq!(storage.last_index_and_term().await.unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn term_and_vote_round_trip() {
        let storage = MemoryRaftStorage::new();
        storage.set_term_and_vote(5, Some("node-2".into())).await.unwrap();
        assert_eq!(storage.current_term().await.unwrap(), 5);
        assert_eq!(storage.voted_for().await.unwrap(), Some("node-2".to_string()));
    }
}
