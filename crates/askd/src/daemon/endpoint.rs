//! Per-connection request handling.
//!
//! Newline-delimited JSON: one request per line, one response line back.
//! Caller identity comes from the socket peer credentials, never from the
//! request body. The policy verdict is computed once per connection; every
//! request on a denied connection gets `PermissionDenied` and its own audit
//! record.

use askd_protocol::{
    AnswerResponse, ChatRequest, ChatResponse, ClearedResponse, ErrorResponse,
    HistoryEntriesResponse, HistoryRequest, HistoryResponse, SessionEndedResponse,
    SessionStartedResponse, UserIdResponse, UserRequest, UserResponse,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::EndpointKind;
use crate::error::ServiceError;

use super::{Daemon, EndpointState};

pub async fn serve_connection(
    daemon: Arc<Daemon>,
    state: Arc<EndpointState>,
    stream: UnixStream,
    shutdown: CancellationToken,
) {
    let uid = match stream.peer_cred() {
        Ok(cred) => cred.uid(),
        Err(err) => {
            warn!(error = %err, "could not read peer credentials, closing connection");
            daemon
                .audit()
                .log_identity_failure(&state.kind.to_string())
                .await;
            let err = ServiceError::IdentityResolution(err.to_string());
            let mut payload = serialize_error(state.kind, err.to_response());
            payload.push('\n');
            let mut stream = stream;
            let _ = stream.write_all(payload.as_bytes()).await;
            return;
        }
    };

    let allowed = daemon.caller_allowed(uid);
    if !allowed {
        warn!(uid, endpoint = %state.kind, "caller denied by access policy");
    }

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!(uid, error = %err, "read error, closing connection");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        daemon.touch();
        state.enter();
        let response = if allowed {
            handle_line(&daemon, state.kind, uid, &line, &shutdown).await
        } else {
            daemon.audit().log_denied(&state.kind.to_string(), uid).await;
            let err = ServiceError::PermissionDenied { uid };
            serialize_error(state.kind, err.to_response())
        };
        state.leave();
        daemon.touch();

        let mut payload = response;
        payload.push('\n');
        if let Err(err) = write_half.write_all(payload.as_bytes()).await {
            debug!(uid, error = %err, "write error, closing connection");
            break;
        }
    }
}

async fn handle_line(
    daemon: &Arc<Daemon>,
    kind: EndpointKind,
    uid: u32,
    line: &str,
    shutdown: &CancellationToken,
) -> String {
    let response = match kind {
        EndpointKind::Chat => {
            serde_json::to_string(&handle_chat(daemon, uid, line, shutdown).await)
        }
        EndpointKind::History => {
            serde_json::to_string(&handle_history(daemon, uid, line, shutdown).await)
        }
        EndpointKind::User => {
            serde_json::to_string(&handle_user(daemon, uid, line, shutdown).await)
        }
    };
    response.unwrap_or_else(|err| {
        error!(error = %err, "response serialization failed");
        r#"{"type":"error","code":"internal","message":"serialization failed"}"#.to_string()
    })
}

fn serialize_error(kind: EndpointKind, err: ErrorResponse) -> String {
    let result = match kind {
        EndpointKind::Chat => serde_json::to_string(&ChatResponse::Error(err)),
        EndpointKind::History => serde_json::to_string(&HistoryResponse::Error(err)),
        EndpointKind::User => serde_json::to_string(&UserResponse::Error(err)),
    };
    result.unwrap_or_else(|_| {
        r#"{"type":"error","code":"internal","message":"serialization failed"}"#.to_string()
    })
}

/// Fetch the context, escalating an init failure to daemon shutdown. Serving
/// with a partially built context is worse than not serving at all.
async fn context_or_shutdown(
    daemon: &Arc<Daemon>,
    shutdown: &CancellationToken,
) -> Result<Arc<super::ServiceContext>, ServiceError> {
    match daemon.context().await {
        Ok(ctx) => Ok(ctx),
        Err(err) => {
            error!(error = %err, "service context init failed, shutting down");
            shutdown.cancel();
            Err(err)
        }
    }
}

async fn handle_chat(
    daemon: &Arc<Daemon>,
    uid: u32,
    line: &str,
    shutdown: &CancellationToken,
) -> ChatResponse {
    let request: ChatRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return ChatResponse::Error(
                ServiceError::InvalidRequest(err.to_string()).to_response(),
            );
        }
    };

    if matches!(request, ChatRequest::Ping) {
        return ChatResponse::Pong;
    }

    let ctx = match context_or_shutdown(daemon, shutdown).await {
        Ok(ctx) => ctx,
        Err(err) => return ChatResponse::Error(err.to_response()),
    };
    let user_id = ctx.sessions.resolve_user(uid);

    match request {
        ChatRequest::Submit(submit) => {
            let Some(chat) = ctx.chat.as_ref() else {
                let err = ServiceError::Internal(anyhow::anyhow!(
                    "chat endpoint served without a chat service"
                ));
                return ChatResponse::Error(err.to_response());
            };
            let query_preview = submit.question.as_deref();
            match chat.submit(&user_id, uid, &submit).await {
                Ok(answer) => {
                    daemon
                        .audit()
                        .log_call("chat", "submit", uid, Some(&user_id), Ok(()), query_preview)
                        .await;
                    ChatResponse::Answer(answer)
                }
                // The answer was generated; deliver it even though the
                // history write failed.
                Err(ServiceError::ResponseNotStored { response, source }) => {
                    warn!(uid, error = %source, "answer delivered without history entry");
                    daemon
                        .audit()
                        .log_call(
                            "chat",
                            "submit",
                            uid,
                            Some(&user_id),
                            Err(askd_protocol::ErrorCode::ResponseNotStored),
                            query_preview,
                        )
                        .await;
                    ChatResponse::Answer(AnswerResponse {
                        response,
                        stored: false,
                    })
                }
                Err(err) => {
                    daemon
                        .audit()
                        .log_call(
                            "chat",
                            "submit",
                            uid,
                            Some(&user_id),
                            Err(err.code()),
                            query_preview,
                        )
                        .await;
                    ChatResponse::Error(err.to_response())
                }
            }
        }
        ChatRequest::StartSession => {
            let session_id = ctx.sessions.start_session(&user_id).await;
            daemon
                .audit()
                .log_call("chat", "start_session", uid, Some(&user_id), Ok(()), None)
                .await;
            ChatResponse::SessionStarted(SessionStartedResponse { session_id })
        }
        ChatRequest::EndSession(end) => {
            match ctx.sessions.end_session(&end.session_id, &user_id).await {
                Ok(()) => {
                    daemon
                        .audit()
                        .log_call("chat", "end_session", uid, Some(&user_id), Ok(()), None)
                        .await;
                    ChatResponse::SessionEnded(SessionEndedResponse {
                        session_id: end.session_id,
                    })
                }
                Err(err) => {
                    daemon
                        .audit()
                        .log_call(
                            "chat",
                            "end_session",
                            uid,
                            Some(&user_id),
                            Err(err.code()),
                            None,
                        )
                        .await;
                    ChatResponse::Error(err.to_response())
                }
            }
        }
        ChatRequest::Ping => ChatResponse::Pong,
    }
}

async fn handle_history(
    daemon: &Arc<Daemon>,
    uid: u32,
    line: &str,
    shutdown: &CancellationToken,
) -> HistoryResponse {
    let request: HistoryRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return HistoryResponse::Error(
                ServiceError::InvalidRequest(err.to_string()).to_response(),
            );
        }
    };

    if matches!(request, HistoryRequest::Ping) {
        return HistoryResponse::Pong;
    }

    let ctx = match context_or_shutdown(daemon, shutdown).await {
        Ok(ctx) => ctx,
        Err(err) => return HistoryResponse::Error(err.to_response()),
    };
    let user_id = ctx.sessions.resolve_user(uid);

    let Some(store) = ctx.store.as_ref() else {
        let err = ServiceError::HistoryNotEnabled;
        daemon
            .audit()
            .log_call(
                "history",
                operation_name(&request),
                uid,
                Some(&user_id),
                Err(err.code()),
                None,
            )
            .await;
        return HistoryResponse::Error(err.to_response());
    };

    match request {
        HistoryRequest::List(list) => match store.list(&user_id, &list.filter).await {
            Ok(entries) => {
                daemon
                    .audit()
                    .log_call("history", "list", uid, Some(&user_id), Ok(()), None)
                    .await;
                HistoryResponse::Entries(HistoryEntriesResponse {
                    entries: entries.iter().map(|e| e.to_payload()).collect(),
                })
            }
            Err(err) => {
                daemon
                    .audit()
                    .log_call("history", "list", uid, Some(&user_id), Err(err.code()), None)
                    .await;
                HistoryResponse::Error(err.to_response())
            }
        },
        HistoryRequest::Clear => match store.clear(&user_id).await {
            Ok(deleted) => {
                daemon
                    .audit()
                    .log_call("history", "clear", uid, Some(&user_id), Ok(()), None)
                    .await;
                HistoryResponse::Cleared(ClearedResponse { deleted })
            }
            Err(err) => {
                daemon
                    .audit()
                    .log_call("history", "clear", uid, Some(&user_id), Err(err.code()), None)
                    .await;
                HistoryResponse::Error(err.to_response())
            }
        },
        HistoryRequest::Ping => HistoryResponse::Pong,
    }
}

fn operation_name(request: &HistoryRequest) -> &'static str {
    match request {
        HistoryRequest::List(_) => "list",
        HistoryRequest::Clear => "clear",
        HistoryRequest::Ping => "ping",
    }
}

async fn handle_user(
    daemon: &Arc<Daemon>,
    uid: u32,
    line: &str,
    shutdown: &CancellationToken,
) -> UserResponse {
    let request: UserRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return UserResponse::Error(
                ServiceError::InvalidRequest(err.to_string()).to_response(),
            );
        }
    };

    match request {
        UserRequest::GetId => {
            let ctx = match context_or_shutdown(daemon, shutdown).await {
                Ok(ctx) => ctx,
                Err(err) => return UserResponse::Error(err.to_response()),
            };
            let user_id = ctx.sessions.resolve_user(uid);
            daemon
                .audit()
                .log_call("user", "get_id", uid, Some(&user_id), Ok(()), None)
                .await;
            UserResponse::Id(UserIdResponse {
                user_id,
                os_uid: uid,
            })
        }
        UserRequest::Ping => UserResponse::Pong,
    }
}
