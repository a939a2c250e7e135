//! Bus clients for talking to the daemon.
//!
//! One connection per request: connect, write one JSON line, read one line
//! back. Error responses come back as a typed [`BusError`] so callers can
//! render the specific failure instead of a generic message.

use anyhow::{Context, Result};
use askd_protocol::{
    ChatRequest, ChatResponse, EndSessionRequest, ErrorResponse, HistoryEntryPayload,
    HistoryFilter, HistoryRequest, HistoryResponse, ListHistoryRequest, SubmitRequest,
    UserIdResponse, UserRequest, UserResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// An error response from the daemon, preserved with its wire code.
#[derive(Debug, Error)]
#[error("{}", .0.message)]
pub struct BusError(pub ErrorResponse);

async fn request<Req, Resp>(socket_path: &Path, req: &Req) -> Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connecting to askd at {}", socket_path.display()))?;

    let mut json = serde_json::to_string(req).context("serializing request")?;
    json.push('\n');
    stream
        .write_all(json.as_bytes())
        .await
        .context("writing request")?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .context("reading response")?;

    serde_json::from_str(&line).context("parsing response")
}

/// Client for the chat endpoint.
#[derive(Debug, Clone)]
pub struct ChatClient {
    socket_path: PathBuf,
}

impl ChatClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Submit a question. Returns the answer and whether it was stored.
    pub async fn submit(&self, submit: SubmitRequest) -> Result<(String, bool)> {
        let resp: ChatResponse =
            request(&self.socket_path, &ChatRequest::Submit(submit)).await?;
        match resp {
            ChatResponse::Answer(a) => Ok((a.response, a.stored)),
            ChatResponse::Error(e) => Err(BusError(e).into()),
            other => anyhow::bail!("unexpected response to submit: {other:?}"),
        }
    }

    pub async fn start_session(&self) -> Result<String> {
        let resp: ChatResponse = request(&self.socket_path, &ChatRequest::StartSession).await?;
        match resp {
            ChatResponse::SessionStarted(s) => Ok(s.session_id),
            ChatResponse::Error(e) => Err(BusError(e).into()),
            other => anyhow::bail!("unexpected response to start_session: {other:?}"),
        }
    }

    pub async fn end_session(&self, session_id: String) -> Result<()> {
        let resp: ChatResponse = request(
            &self.socket_path,
            &ChatRequest::EndSession(EndSessionRequest { session_id }),
        )
        .await?;
        match resp {
            ChatResponse::SessionEnded(_) => Ok(()),
            ChatResponse::Error(e) => Err(BusError(e).into()),
            other => anyhow::bail!("unexpected response to end_session: {other:?}"),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        let resp: ChatResponse = request(&self.socket_path, &ChatRequest::Ping).await?;
        match resp {
            ChatResponse::Pong => Ok(()),
            ChatResponse::Error(e) => Err(BusError(e).into()),
            other => anyhow::bail!("unexpected response to ping: {other:?}"),
        }
    }
}

/// Client for the history endpoint.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    socket_path: PathBuf,
}

impl HistoryClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn list(&self, filter: HistoryFilter) -> Result<Vec<HistoryEntryPayload>> {
        let resp: HistoryResponse = request(
            &self.socket_path,
            &HistoryRequest::List(ListHistoryRequest { filter }),
        )
        .await?;
        match resp {
            HistoryResponse::Entries(e) => Ok(e.entries),
            HistoryResponse::Error(e) => Err(BusError(e).into()),
            other => anyhow::bail!("unexpected response to list: {other:?}"),
        }
    }

    pub async fn clear(&self) -> Result<u64> {
        let resp: HistoryResponse = request(&self.socket_path, &HistoryRequest::Clear).await?;
        match resp {
            HistoryResponse::Cleared(c) => Ok(c.deleted),
            HistoryResponse::Error(e) => Err(BusError(e).into()),
            other => anyhow::bail!("unexpected response to clear: {other:?}"),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        let resp: HistoryResponse = request(&self.socket_path, &HistoryRequest::Ping).await?;
        match resp {
            HistoryResponse::Pong => Ok(()),
            HistoryResponse::Error(e) => Err(BusError(e).into()),
            other => anyhow::bail!("unexpected response to ping: {other:?}"),
        }
    }
}

/// Client for the user-identity endpoint.
#[derive(Debug, Clone)]
pub struct UserClient {
    socket_path: PathBuf,
}

impl UserClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn get_id(&self) -> Result<UserIdResponse> {
        let resp: UserResponse = request(&self.socket_path, &UserRequest::GetId).await?;
        match resp {
            UserResponse::Id(id) => Ok(id),
            UserResponse::Error(e) => Err(BusError(e).into()),
            other => anyhow::bail!("unexpected response to get_id: {other:?}"),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        let resp: UserResponse = request(&self.socket_path, &UserRequest::Ping).await?;
        match resp {
            UserResponse::Pong => Ok(()),
            UserResponse::Error(e) => Err(BusError(e).into()),
            other => anyhow::bail!("unexpected response to ping: {other:?}"),
        }
    }
}
