//! Storage state machine: the durable projection a committed Raft log
//! entry is deterministically applied against, plus the read queries
//! served locally per `agenda-repository`'s stale-by-a-commit contract.
//!
//! `AgendaStore` is implemented twice, mirroring this workspace's own
//! `ProcessStore` split: [`store_memory::MemoryStore`] for local
//! development and every integration test in this workspace, and
//! [`store_postgres::PostgresStore`] behind the `postgres` feature for a
//! real deployment, grounded on `bpmn-lite-core::store_postgres`.

pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;

pub use store::{AgendaStore, EventPatch, GroupPatch, NewEvent, NewGroup, NewUser, UserPatch};
pub use store_memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
