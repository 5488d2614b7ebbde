//! Shared vocabulary for every `agenda-*` crate: domain entities, the bus
//! wire format, the error taxonomy, the verb set, and environment
//! configuration. Nothing in this crate talks to the network or to a store —
//! it is pure data and small pure functions, imported everywhere else.

pub mod config;
pub mod entities;
pub mod envelope;
pub mod error;
pub mod verb;

pub use entities::Id;
pub use error::AgendaError;
