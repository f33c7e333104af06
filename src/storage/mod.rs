//! Dolt storage layer for `membank_rust`.
//!
//! The backend is a Dolt SQL server (MySQL wire protocol with
//! branch/commit/merge extensions). This module provides:
//!
//! - [`schema`] - authoritative DDL and bootstrap
//! - [`pool`] - connection pool & branch coordinator
//! - [`reader`] - read-only queries, always branch-scoped
//! - [`writer`] - mutations with the staged-proof transaction protocol
//! - [`links`] - link graph operations and cycle detection

pub mod links;
pub mod pool;
pub mod reader;
pub mod schema;
pub mod writer;

pub use pool::{BranchCoordinator, PersistentSession, SessionMode};
pub use reader::Reader;
pub use writer::{MutationContext, Writer};
