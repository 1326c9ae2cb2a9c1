//! # gogo-store
//!
//! Durable relational storage for the chat hub, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for chat messages and
//! group membership snapshots. Async callers are expected to run these
//! helpers on a blocking thread.

pub mod database;
pub mod groups;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
