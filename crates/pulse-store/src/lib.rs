//! # pulse-store
//!
//! Durable storage for the pulse realtime server, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for users and presence,
//! conversation membership, messages, per-recipient message status rows and
//! call records. Callers on an async runtime are expected to hop onto a
//! blocking thread before touching it.

pub mod calls;
pub mod conversations;
pub mod database;
pub mod message_status;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
