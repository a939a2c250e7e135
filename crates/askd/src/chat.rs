//! Chat orchestration.
//!
//! Ties query composition, the inference backend, and the history store
//! together for one submission. The backend is only contacted once the query
//! is fully composed and validated; a failed history write after a successful
//! backend call still delivers the answer, flagged as not stored.

use anyhow::anyhow;
use askd_protocol::{AnswerResponse, SubmitRequest};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::backend::InferenceBackend;
use crate::compose::{self, QuerySources};
use crate::config::OutputSection;
use crate::error::ServiceError;
use crate::history::HistoryStore;
use crate::session::SessionManager;

pub struct ChatService {
    backend: Arc<dyn InferenceBackend>,
    /// Absent when history is disabled in the configuration.
    store: Option<HistoryStore>,
    sessions: Arc<SessionManager>,
    output: OutputSection,
}

impl ChatService {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        store: Option<HistoryStore>,
        sessions: Arc<SessionManager>,
        output: OutputSection,
    ) -> Self {
        Self {
            backend,
            store,
            sessions,
            output,
        }
    }

    /// Handle one submission for an already-resolved caller.
    ///
    /// Errors up to and including the backend call leave no trace in
    /// history. A storage failure after the backend answered comes back as
    /// `ResponseNotStored` with the answer attached, so the caller still
    /// gets it.
    #[instrument(skip(self, request), fields(user_id))]
    pub async fn submit(
        &self,
        user_id: &str,
        os_uid: u32,
        request: &SubmitRequest,
    ) -> Result<AnswerResponse, ServiceError> {
        // Session ownership is checked before any expensive work.
        if let Some(session_id) = &request.session_id {
            self.sessions.get_session(session_id, user_id).await?;
        }

        let attachment = match &request.attachment {
            Some(path) => Some(compose::load_attachment(path)?),
            None => None,
        };
        let last_capture = if request.use_capture {
            let capture =
                compose::read_last_capture(&self.output.file, &self.output.prompt_separator);
            if capture.is_none() {
                if self.output.enforce_script {
                    return Err(ServiceError::InvalidRequest(
                        "terminal output was requested but nothing has been captured; \
                         start a captured session first"
                            .to_string(),
                    ));
                }
                warn!(
                    file = %self.output.file.display(),
                    "no captured terminal output found, continuing without it"
                );
            }
            capture
        } else {
            None
        };

        let question = compose::compose(&QuerySources {
            positional: request.question.clone(),
            stdin: request.stdin.clone(),
            attachment,
            last_capture,
        })?;

        let response = self.backend.submit(&question).await?;

        let Some(store) = &self.store else {
            info!(chars = response.len(), "answer delivered, history disabled");
            return Ok(AnswerResponse {
                response,
                stored: false,
            });
        };

        let stored = async {
            store.ensure_user(user_id, os_uid).await?;
            store
                .append(user_id, request.session_id.as_deref(), &question, &response)
                .await?;
            Ok::<(), ServiceError>(())
        }
        .await;

        if let Err(err) = stored {
            warn!(error = %err, "history write failed after backend answered");
            return Err(ServiceError::ResponseNotStored {
                response,
                source: anyhow!(err),
            });
        }

        info!(chars = response.len(), "answer delivered and stored");
        Ok(AnswerResponse {
            response,
            stored: true,
        })
    }

    pub fn history_enabled(&self) -> bool {
        self.store.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseKind, DatabaseSection};
    use crate::credentials::DatabaseCredentials;
    use askd_protocol::HistoryFilter;
    use async_trait::async_trait;
    use std::io::Write;
    use tempfile::TempDir;

    struct ScriptedBackend {
        answer: Result<String, fn() -> ServiceError>,
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        async fn submit(&self, _question: &str) -> Result<String, ServiceError> {
            match &self.answer {
                Ok(text) => Ok(text.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    fn answering(text: &str) -> Arc<dyn InferenceBackend> {
        Arc::new(ScriptedBackend {
            answer: Ok(text.to_string()),
        })
    }

    fn timing_out() -> Arc<dyn InferenceBackend> {
        Arc::new(ScriptedBackend {
            answer: Err(|| ServiceError::BackendTimeout(30)),
        })
    }

    async fn test_store(dir: &TempDir) -> HistoryStore {
        let section = DatabaseSection {
            kind: DatabaseKind::Sqlite,
            connection_string: Some(dir.path().join("history.db")),
            ..DatabaseSection::default()
        };
        HistoryStore::connect(&section, &DatabaseCredentials::default())
            .await
            .unwrap()
    }

    fn test_sessions() -> Arc<SessionManager> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "9f3c8a1b2d4e5f60718293a4b5c6d7e8").unwrap();
        let manager = SessionManager::from_machine_id_file(file.path()).unwrap();
        Arc::new(manager)
    }

    fn submit_request(question: &str) -> SubmitRequest {
        SubmitRequest {
            question: Some(question.to_string()),
            stdin: None,
            attachment: None,
            use_capture: false,
            session_id: None,
        }
    }

    #[tokio::test]
    async fn test_submit_stores_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let service = ChatService::new(
            answering("a security module"),
            Some(store.clone()),
            test_sessions(),
            OutputSection::default(),
        );

        let answer = service
            .submit("user-a", 1000, &submit_request("what is selinux?"))
            .await
            .unwrap();
        assert_eq!(answer.response, "a security module");
        assert!(answer.stored);

        let entries = store.list("user-a", &HistoryFilter::All).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query_text, "what is selinux?");
        assert_eq!(entries[0].response_text, "a security module");

        let user = store.get_user("user-a").await.unwrap().unwrap();
        assert_eq!(user.os_uid, 1000);
    }

    #[tokio::test]
    async fn test_backend_timeout_leaves_history_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let service = ChatService::new(
            timing_out(),
            Some(store.clone()),
            test_sessions(),
            OutputSection::default(),
        );

        let err = service
            .submit("user-a", 1000, &submit_request("what is selinux?"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::BackendTimeout(30)));

        assert!(store.list("user-a", &HistoryFilter::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_never_reaches_backend() {
        struct PanickingBackend;
        #[async_trait]
        impl InferenceBackend for PanickingBackend {
            async fn submit(&self, _question: &str) -> Result<String, ServiceError> {
                panic!("the backend must not be called for an empty query");
            }
        }

        let service = ChatService::new(
            Arc::new(PanickingBackend),
            None,
            test_sessions(),
            OutputSection::default(),
        );
        let err = service
            .submit("user-a", 1000, &submit_request("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::EmptyQuery));
    }

    #[tokio::test]
    async fn test_history_disabled_still_answers() {
        let service = ChatService::new(
            answering("42"),
            None,
            test_sessions(),
            OutputSection::default(),
        );
        let answer = service
            .submit("user-a", 1000, &submit_request("meaning of life?"))
            .await
            .unwrap();
        assert_eq!(answer.response, "42");
        assert!(!answer.stored);
        assert!(!service.history_enabled());
    }

    #[tokio::test]
    async fn test_storage_failure_still_delivers_answer() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        // A closed pool makes every write fail.
        let HistoryStore::Sqlite(pool) = &store else {
            unreachable!()
        };
        pool.close().await;

        let service = ChatService::new(
            answering("still here"),
            Some(store),
            test_sessions(),
            OutputSection::default(),
        );
        let err = service
            .submit("user-a", 1000, &submit_request("what is selinux?"))
            .await
            .unwrap_err();
        match err {
            ServiceError::ResponseNotStored { response, .. } => {
                assert_eq!(response, "still here");
            }
            other => panic!("expected ResponseNotStored, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_session_is_rejected_before_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let service = ChatService::new(
            answering("unused"),
            Some(store.clone()),
            test_sessions(),
            OutputSection::default(),
        );

        let mut request = submit_request("what is selinux?");
        request.session_id = Some("no-such-session".to_string());
        let err = service.submit("user-a", 1000, &request).await.unwrap_err();
        assert!(matches!(err, ServiceError::SessionNotFound(_)));
        assert!(store.list("user-a", &HistoryFilter::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_is_recorded_on_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let sessions = test_sessions();
        let user_id = sessions.resolve_user(1000);
        let session_id = sessions.start_session(&user_id).await;

        let service = ChatService::new(
            answering("in session"),
            Some(store.clone()),
            sessions,
            OutputSection::default(),
        );

        let mut request = submit_request("follow-up question");
        request.session_id = Some(session_id.clone());
        service.submit(&user_id, 1000, &request).await.unwrap();

        let entries = store
            .list(&user_id, &HistoryFilter::Session { session_id })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query_text, "follow-up question");
    }

    #[tokio::test]
    async fn test_missing_capture_is_tolerated_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputSection {
            file: dir.path().join("nonexistent-capture.txt"),
            ..OutputSection::default()
        };
        let service = ChatService::new(answering("42"), None, test_sessions(), output);

        let mut request = submit_request("why did this fail?");
        request.use_capture = true;
        let answer = service.submit("user-a", 1000, &request).await.unwrap();
        assert_eq!(answer.response, "42");
    }

    #[tokio::test]
    async fn test_enforce_script_rejects_missing_capture() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputSection {
            enforce_script: true,
            file: dir.path().join("nonexistent-capture.txt"),
            ..OutputSection::default()
        };
        let service = ChatService::new(answering("unused"), None, test_sessions(), output);

        let mut request = submit_request("why did this fail?");
        request.use_capture = true;
        let err = service.submit("user-a", 1000, &request).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_capture_augments_positional() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("capture.txt");
        std::fs::write(&capture, "$ ls\nfoo bar\n$ df -h\nno space left\n").unwrap();

        struct EchoBackend;
        #[async_trait]
        impl InferenceBackend for EchoBackend {
            async fn submit(&self, question: &str) -> Result<String, ServiceError> {
                Ok(question.to_string())
            }
        }

        let output = OutputSection {
            file: capture,
            ..OutputSection::default()
        };
        let service = ChatService::new(Arc::new(EchoBackend), None, test_sessions(), output);

        let mut request = submit_request("why did this fail?");
        request.use_capture = true;
        let answer = service.submit("user-a", 1000, &request).await.unwrap();
        assert!(answer.response.starts_with("why did this fail?"));
        assert!(answer.response.contains("no space left"));
    }
}
