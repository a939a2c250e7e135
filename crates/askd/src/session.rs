//! Caller identity and chat sessions.
//!
//! A logical user id is derived deterministically from the machine identity
//! and the caller's OS uid: UUIDv5 over a namespace that is itself UUIDv5 of
//! the machine id, with the decimal uid string as the name. The same uid on
//! the same machine always maps to the same user id; the uid itself is never
//! stored in history rows.
//!
//! Sessions are in-memory only. They group history entries while the daemon
//! runs and dissolve with it.

use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::ServiceError;

/// Default machine identity file.
pub const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// A live chat session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
}

/// Derives logical user ids and tracks active sessions.
#[derive(Debug)]
pub struct SessionManager {
    namespace: Uuid,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    /// Build a manager from the machine identity file.
    ///
    /// Fails when the file is missing, empty, or not a hex machine id; a
    /// broken machine identity would silently split one user's history into
    /// several, so this is treated as fatal.
    pub fn from_machine_id_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading machine id from {}", path.display()))?;
        let machine_id = raw.trim();
        if machine_id.is_empty() {
            return Err(anyhow!("machine id file {} is empty", path.display()));
        }
        if !machine_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow!(
                "machine id file {} is not a hex identifier",
                path.display()
            ));
        }
        let namespace = Uuid::new_v5(&Uuid::NAMESPACE_DNS, machine_id.as_bytes());
        Ok(Self {
            namespace,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn new() -> Result<Self> {
        Self::from_machine_id_file(&PathBuf::from(MACHINE_ID_PATH))
    }

    /// Map an OS uid to its logical user id. Deterministic.
    pub fn resolve_user(&self, os_uid: u32) -> String {
        Uuid::new_v5(&self.namespace, os_uid.to_string().as_bytes()).to_string()
    }

    /// Open a new session for the given user and return its id.
    #[instrument(skip(self))]
    pub async fn start_session(&self, user_id: &str) -> String {
        let session_id = Uuid::new_v4().to_string();
        let session = Session {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
        };
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), session);
        debug!(session_id, "session started");
        session_id
    }

    /// Look up an active session. The caller must own it.
    pub async fn get_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Session, ServiceError> {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(session) if session.user_id == user_id => Ok(session.clone()),
            _ => Err(ServiceError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Close a session. Unknown or foreign ids are an error.
    #[instrument(skip(self))]
    pub async fn end_session(&self, session_id: &str, user_id: &str) -> Result<(), ServiceError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session_id) {
            Some(session) if session.user_id == user_id => {
                sessions.remove(session_id);
                debug!(session_id, "session ended");
                Ok(())
            }
            _ => Err(ServiceError::SessionNotFound(session_id.to_string())),
        }
    }
}
