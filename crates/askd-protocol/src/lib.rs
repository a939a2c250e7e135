//! Bus protocol types for askd.
//!
//! Defines the request/response types exchanged between the `ask` client and
//! the askd daemon. The protocol uses JSON over Unix sockets with
//! newline-delimited messages. Each of the three endpoints (chat, history,
//! user) owns its own socket and its own request/response pair, so a caller
//! of one endpoint never depends on the others being reachable.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Socket file name for the chat endpoint.
pub const CHAT_SOCKET: &str = "askd-chat.sock";

/// Socket file name for the history endpoint.
pub const HISTORY_SOCKET: &str = "askd-history.sock";

/// Socket file name for the user-identity endpoint.
pub const USER_SOCKET: &str = "askd-user.sock";

/// Default directory holding the endpoint sockets.
pub const DEFAULT_SOCKET_DIR: &str = "/run/askd";

// ============================================================================
// Chat endpoint
// ============================================================================

/// Request sent to the chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatRequest {
    /// Submit a question, composed server-side from the carried sources.
    Submit(SubmitRequest),

    /// Open a daemon-resident session for interactive mode.
    StartSession,

    /// Close a previously started session.
    EndSession(EndSessionRequest),

    /// Health check.
    Ping,
}

/// Response from the chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatResponse {
    /// The backend answered.
    Answer(AnswerResponse),

    /// A session was opened.
    SessionStarted(SessionStartedResponse),

    /// A session was closed.
    SessionEnded(SessionEndedResponse),

    /// Pong response to ping.
    Pong,

    /// Error response.
    Error(ErrorResponse),
}

/// Raw input sources for one question. Composition happens in the daemon;
/// the client never merges sources itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Positional query text from the command line.
    #[serde(default)]
    pub question: Option<String>,
    /// Text redirected via stdin.
    #[serde(default)]
    pub stdin: Option<String>,
    /// Path to a file attachment, read by the daemon.
    #[serde(default)]
    pub attachment: Option<PathBuf>,
    /// Whether to include the last captured terminal output.
    #[serde(default)]
    pub use_capture: bool,
    /// Session to associate the history entry with, if any.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Request to close a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndSessionRequest {
    /// Session ID returned by `StartSession`.
    pub session_id: String,
}

/// A successful backend answer.
///
/// `stored` is false when the backend responded but the history write failed
/// (the `response_not_stored` outcome). The response text is still delivered
/// so the caller does not lose an answer that was already generated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    /// The backend's response text.
    pub response: String,
    /// Whether the query/response pair was persisted to history.
    pub stored: bool,
}

/// Response when a session is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartedResponse {
    /// The new session ID.
    pub session_id: String,
}

/// Response when a session is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndedResponse {
    /// The closed session ID.
    pub session_id: String,
}

// ============================================================================
// History endpoint
// ============================================================================

/// Request sent to the history endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryRequest {
    /// List history entries for the calling user.
    List(ListHistoryRequest),

    /// Delete all history entries for the calling user.
    Clear,

    /// Health check.
    Ping,
}

/// Response from the history endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryResponse {
    /// Matching history entries, oldest first.
    Entries(HistoryEntriesResponse),

    /// Entries were deleted.
    Cleared(ClearedResponse),

    /// Pong response to ping.
    Pong,

    /// Error response.
    Error(ErrorResponse),
}

/// Request to list history entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListHistoryRequest {
    /// Which entries to return.
    #[serde(default)]
    pub filter: HistoryFilter,
}

/// Filter applied to a history listing. Always scoped to the calling user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryFilter {
    /// Every entry.
    #[default]
    All,
    /// Only the oldest entry.
    First,
    /// Only the newest entry.
    Last,
    /// Entries whose query or response contains the pattern.
    Keyword {
        pattern: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Entries belonging to one session.
    Session { session_id: String },
}

/// One persisted query/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntryPayload {
    /// Unique, monotonically assigned entry id.
    pub id: i64,
    /// Owning user id.
    pub user_id: String,
    /// Session the entry was recorded under, if any.
    pub session_id: Option<String>,
    /// The composed query text.
    pub query_text: String,
    /// The backend response text.
    pub response_text: String,
    /// Creation time, RFC 3339.
    pub created_at: String,
}

/// Response carrying history entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntriesResponse {
    /// Entries ordered by creation time ascending, id as tie-break.
    pub entries: Vec<HistoryEntryPayload>,
}

/// Response after a clear operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearedResponse {
    /// Number of entries deleted.
    pub deleted: u64,
}

// ============================================================================
// User endpoint
// ============================================================================

/// Request sent to the user-identity endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserRequest {
    /// Resolve the caller's logical user id.
    GetId,

    /// Health check.
    Ping,
}

/// Response from the user-identity endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserResponse {
    /// The caller's resolved identity.
    Id(UserIdResponse),

    /// Pong response to ping.
    Pong,

    /// Error response.
    Error(ErrorResponse),
}

/// The caller's resolved identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdResponse {
    /// Logical user id scoping history.
    pub user_id: String,
    /// The OS uid the id was derived from.
    pub os_uid: u32,
}

// ============================================================================
// Errors
// ============================================================================

/// Error response shared by all endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

/// Error codes. Clients render the specific kind, not a generic failure,
/// so scripting can distinguish e.g. a too-short query from an unreachable
/// service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Query composition
    /// No input source was provided.
    EmptyQuery,
    /// The composed query is too short to be meaningful.
    InvalidQuery,
    /// The attachment path does not exist.
    AttachmentNotFound,
    /// The attachment exists but could not be read.
    AttachmentUnreadable,
    /// The attachment looks like binary data.
    BinaryAttachment,

    // Identity and access
    /// The caller's OS identity could not be mapped to a user.
    IdentityResolution,
    /// The access policy denies this caller.
    PermissionDenied,

    // Persistence
    /// A history store operation failed.
    Storage,
    /// A required database credential is missing.
    CredentialMissing,
    /// History is disabled in the daemon configuration.
    HistoryNotEnabled,
    /// There is no session with the given id.
    SessionNotFound,

    // Backend
    /// The inference backend did not answer within the timeout.
    BackendTimeout,
    /// The inference backend could not be reached.
    BackendUnavailable,
    /// The backend answered but the history write failed.
    ResponseNotStored,

    // Generic
    /// Malformed or unparseable request.
    InvalidRequest,
    /// Internal error.
    Internal,
}
