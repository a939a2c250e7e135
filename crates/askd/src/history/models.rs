//! Row models for the history store.

use askd_protocol::HistoryEntryPayload;
use chrono::DateTime;

/// One persisted query/response pair. Immutable once written.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryEntry {
    /// Auto-incremented, so ties on `created_at` still order by insertion.
    pub id: i64,
    pub user_id: String,
    /// Null for queries made outside any session.
    pub session_id: Option<String>,
    pub query_text: String,
    pub response_text: String,
    /// Epoch microseconds, UTC.
    pub created_at: i64,
}

impl HistoryEntry {
    /// Creation time rendered as RFC 3339.
    pub fn created_at_rfc3339(&self) -> String {
        DateTime::from_timestamp_micros(self.created_at)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default()
    }

    /// Wire representation.
    pub fn to_payload(&self) -> HistoryEntryPayload {
        HistoryEntryPayload {
            id: self.id,
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            query_text: self.query_text.clone(),
            response_text: self.response_text.clone(),
            created_at: self.created_at_rfc3339(),
        }
    }
}

/// A known caller. Created lazily on first request, never deleted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub user_id: String,
    pub os_uid: i64,
    /// Epoch microseconds, UTC.
    pub created_at: i64,
}
