//! Utility helpers shared across the crate.
//!
//! - [`id`] - content-hash block id generation
//! - [`cursor`] - opaque pagination cursors

pub mod cursor;
pub mod id;
