//! Audit logging for bus calls.
//!
//! Every inbound call is recorded as one JSON line: who called, which
//! endpoint, what happened. Audit writes are best effort; a full disk or a
//! missing log file must never take the chat path down with it, so failures
//! are warned about and dropped.

use anyhow::{Context, Result};
use askd_protocol::ErrorCode;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Longest query prefix kept in an audit record.
const QUERY_PREVIEW_LEN: usize = 120;

#[derive(Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub endpoint: String,
    pub operation: String,
    /// None when peer credentials could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// "ok", "denied", or the error code of a failed call.
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

#[derive(Clone)]
pub struct AuditLogger {
    file: Arc<Mutex<File>>,
    path: PathBuf,
}

impl AuditLogger {
    pub async fn new(path: PathBuf) -> Result<Self> {
        ensure_parent_dir(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening audit log file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a completed call.
    pub async fn log_call(
        &self,
        endpoint: &str,
        operation: &str,
        caller_uid: u32,
        user_id: Option<&str>,
        outcome: Result<(), ErrorCode>,
        query: Option<&str>,
    ) {
        let event = AuditEvent {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            endpoint: endpoint.to_string(),
            operation: operation.to_string(),
            caller_uid: Some(caller_uid),
            user_id: user_id.map(String::from),
            outcome: match outcome {
                Ok(()) => "ok".to_string(),
                Err(code) => serde_json::to_value(code)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| "error".to_string()),
            },
            query: query.map(truncate_preview),
        };
        self.write_event(&event).await;
    }

    /// Record a caller the access policy turned away.
    pub async fn log_denied(&self, endpoint: &str, caller_uid: u32) {
        let event = AuditEvent {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            endpoint: endpoint.to_string(),
            operation: "access".to_string(),
            caller_uid: Some(caller_uid),
            user_id: None,
            outcome: "denied".to_string(),
            query: None,
        };
        self.write_event(&event).await;
    }

    /// Record a connection whose peer credentials could not be read.
    pub async fn log_identity_failure(&self, endpoint: &str) {
        let event = AuditEvent {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            endpoint: endpoint.to_string(),
            operation: "access".to_string(),
            caller_uid: None,
            user_id: None,
            outcome: "identity_resolution".to_string(),
            query: None,
        };
        self.write_event(&event).await;
    }

    async fn write_event(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "audit event could not be serialized");
                return;
            }
        };
        let mut file = self.file.lock().await;
        if let Err(err) = file.write_all(line.as_bytes()).await {
            warn!(path = %self.path.display(), error = %err, "audit write failed");
            return;
        }
        let _ = file.write_all(b"\n").await;
    }
}

fn truncate_preview(query: &str) -> String {
    if query.len() <= QUERY_PREVIEW_LEN {
        return query.to_string();
    }
    let mut end = QUERY_PREVIEW_LEN;
    while !query.is_char_boundary(end) {
        end -= 1;
    }
    query[..end].to_string()
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating audit log directory {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_call_writes_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = AuditLogger::new(path.clone()).await.unwrap();

        logger
            .log_call(
                "chat",
                "submit",
                1000,
                Some("user-a"),
                Ok(()),
                Some("how do I list open ports?"),
            )
            .await;
        logger.log_denied("history", 1001).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["endpoint"], "chat");
        assert_eq!(first["caller_uid"], 1000);
        assert_eq!(first["outcome"], "ok");
        assert_eq!(first["query"], "how do I list open ports?");

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["outcome"], "denied");
        assert!(second.get("query").is_none());
    }

    #[tokio::test]
    async fn test_identity_failure_record_has_no_uid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = AuditLogger::new(path.clone()).await.unwrap();

        logger.log_identity_failure("chat").await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let event: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(event["outcome"], "identity_resolution");
        assert!(event.get("caller_uid").is_none());
    }

    #[tokio::test]
    async fn test_error_outcome_uses_wire_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = AuditLogger::new(path.clone()).await.unwrap();

        logger
            .log_call("chat", "submit", 1000, None, Err(ErrorCode::EmptyQuery), None)
            .await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let event: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(event["outcome"], "empty_query");
    }

    #[tokio::test]
    async fn test_long_query_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = AuditLogger::new(path.clone()).await.unwrap();

        let long = "x".repeat(500);
        logger
            .log_call("chat", "submit", 1000, None, Ok(()), Some(&long))
            .await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let event: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(event["query"].as_str().unwrap().len(), QUERY_PREVIEW_LEN);
    }
}
