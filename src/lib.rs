//! QuickDesk: helpdesk tickets, replies, votes, users and categories.
//!
//! [`store::LocalStore`] is the session's working copy, persisted as one
//! snapshot. [`db::Database`] is the SQLite-backed authoritative service,
//! and [`sync::SyncedStore`] layers the two.

pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod storage;
pub mod store;
pub mod sync;

pub use error::{Error, Result, ValidationError};
