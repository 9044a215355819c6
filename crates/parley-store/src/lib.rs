//! # parley-store
//!
//! Durable state for the Parley chat engine, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection`. Queries are free functions over `&Connection`
//! grouped by entity, so the same code runs on a plain connection or inside
//! a transaction opened with [`Database::transaction`].

pub mod blocks;
pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;
mod time;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use rusqlite;
