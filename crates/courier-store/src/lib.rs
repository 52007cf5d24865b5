//! # courier-store
//!
//! Durable storage for direct and group messages, group membership and
//! per-user hidden markers and pinned conversations, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every table.
//! Callers that share it across tasks put it behind a mutex.

pub mod database;
pub mod groups;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod sessions;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
