//! Conversation history persistence.
//!
//! One interface over three relational backends (embedded SQLite, PostgreSQL,
//! MySQL), selected once at startup. Callers never branch on the backend.

pub mod models;
pub mod store;

pub use models::{HistoryEntry, User};
pub use store::HistoryStore;
