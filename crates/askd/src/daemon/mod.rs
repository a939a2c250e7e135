//! Daemon lifecycle.
//!
//! One process serves up to three Unix-socket endpoints. Sockets are bound
//! eagerly so callers can connect, but the service context (credentials,
//! history store, session manager) is built lazily on the first inbound
//! request, in that order. A context init failure is fatal for the whole
//! daemon. When no request has arrived for the configured idle timeout the
//! daemon drains in-flight work and exits; the next caller re-activates it
//! through socket activation.

pub mod endpoint;

use anyhow::{Context as _, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UnixListener;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::audit::AuditLogger;
use crate::backend::{HttpBackend, InferenceBackend};
use crate::chat::ChatService;
use crate::config::{AppConfig, EndpointKind};
use crate::credentials::CredentialResolver;
use crate::error::ServiceError;
use crate::history::HistoryStore;
use crate::policy::{AccessPolicy, GroupResolver};
use crate::session::SessionManager;

/// Where an endpoint currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    /// Socket bound, no request seen yet.
    Idle,
    /// First request arrived, context init in progress.
    Activating,
    /// Context up, nothing in flight.
    Ready,
    /// Requests in flight.
    Handling(usize),
}

/// Per-endpoint bookkeeping shared between connection tasks.
pub struct EndpointState {
    pub kind: EndpointKind,
    in_flight: AtomicUsize,
}

impl EndpointState {
    fn new(kind: EndpointKind) -> Self {
        Self {
            kind,
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn enter(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn status(&self, context_ready: bool, activating: bool) -> EndpointStatus {
        match self.in_flight() {
            0 if context_ready => EndpointStatus::Ready,
            0 if activating => EndpointStatus::Activating,
            0 => EndpointStatus::Idle,
            n => EndpointStatus::Handling(n),
        }
    }
}

/// Everything built on first use: credentials, store, sessions, chat.
pub struct ServiceContext {
    pub store: Option<HistoryStore>,
    pub sessions: Arc<SessionManager>,
    pub chat: Option<ChatService>,
}

impl ServiceContext {
    /// Cold-start initialization, in dependency order. Called once; any
    /// failure here takes the daemon down rather than serving half a
    /// context.
    async fn init(config: &AppConfig, machine_id_path: &std::path::Path) -> Result<Self> {
        let resolver = CredentialResolver::from_env();
        let credentials = resolver
            .resolve_database(&config.database)
            .map_err(anyhow::Error::new)
            .context("resolving database credentials")?;

        let store = if config.history.enabled {
            Some(HistoryStore::connect(&config.database, &credentials).await?)
        } else {
            info!("history is disabled, store not opened");
            None
        };

        let sessions = Arc::new(
            SessionManager::from_machine_id_file(machine_id_path)
                .context("initializing session manager")?,
        );

        let chat = if config.daemon.endpoints.contains(&EndpointKind::Chat) {
            let backend: Arc<dyn InferenceBackend> =
                Arc::new(HttpBackend::new(&config.backend).context("building backend client")?);
            Some(ChatService::new(
                backend,
                store.clone(),
                Arc::clone(&sessions),
                config.output.clone(),
            ))
        } else {
            None
        };

        Ok(Self {
            store,
            sessions,
            chat,
        })
    }
}

pub struct Daemon {
    config: AppConfig,
    policy: AccessPolicy,
    groups: GroupResolver,
    audit: AuditLogger,
    machine_id_path: PathBuf,
    context: OnceCell<Arc<ServiceContext>>,
    activating: AtomicBool,
    started: Instant,
    /// Seconds since `started` at the time of the last request.
    last_activity: AtomicU64,
}

impl Daemon {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let policy = match &config.policy.file {
            Some(path) if path.exists() => {
                let policy = AccessPolicy::load(path)?;
                info!(path = %path.display(), "access policy loaded");
                policy
            }
            Some(path) => {
                info!(path = %path.display(), "policy file absent, allowing all callers");
                AccessPolicy::allow_all()
            }
            None => AccessPolicy::allow_all(),
        };

        let audit = AuditLogger::new(config.logging.audit_file.clone()).await?;

        Ok(Self {
            config,
            policy,
            groups: GroupResolver::new(),
            audit,
            machine_id_path: PathBuf::from(crate::session::MACHINE_ID_PATH),
            context: OnceCell::new(),
            activating: AtomicBool::new(false),
            started: Instant::now(),
            last_activity: AtomicU64::new(0),
        })
    }

    /// Override the machine identity file, used by tests.
    pub fn with_machine_id_path(mut self, path: PathBuf) -> Self {
        self.machine_id_path = path;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Whether the policy admits this uid.
    pub fn caller_allowed(&self, uid: u32) -> bool {
        let groups = self.groups.groups_for(uid);
        self.policy.allows(uid, &groups)
    }

    pub fn touch(&self) {
        self.last_activity
            .store(self.started.elapsed().as_secs(), Ordering::SeqCst);
    }

    fn idle_secs(&self) -> u64 {
        self.started
            .elapsed()
            .as_secs()
            .saturating_sub(self.last_activity.load(Ordering::SeqCst))
    }

    /// Get the service context, initializing it on first call.
    pub async fn context(&self) -> Result<Arc<ServiceContext>, ServiceError> {
        let result = self
            .context
            .get_or_try_init(|| async {
                info!("first request, initializing service context");
                self.activating.store(true, Ordering::SeqCst);
                ServiceContext::init(&self.config, &self.machine_id_path)
                    .await
                    .map(Arc::new)
            })
            .await;
        self.activating.store(false, Ordering::SeqCst);
        result
            .cloned()
            .map_err(|err| ServiceError::Internal(anyhow::anyhow!("{err:#}")))
    }

    pub fn context_ready(&self) -> bool {
        self.context.initialized()
    }

    pub fn activating(&self) -> bool {
        self.activating.load(Ordering::SeqCst)
    }

    /// Serve until `shutdown` fires or the idle timeout expires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        std::fs::create_dir_all(&self.config.daemon.socket_dir).with_context(|| {
            format!(
                "creating socket directory {}",
                self.config.daemon.socket_dir.display()
            )
        })?;

        let tracker = TaskTracker::new();
        let mut endpoints: Vec<(Arc<EndpointState>, PathBuf)> = Vec::new();

        // Validation rejects duplicate endpoint names, but a repeated kind
        // here would rebind and unlink a live socket, so drop repeats
        // regardless of where the config came from.
        let mut kinds: Vec<EndpointKind> = Vec::new();
        for kind in &self.config.daemon.endpoints {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        for kind in kinds {
            let path = self.config.socket_path(kind);
            let listener = bind_socket(&path)?;
            let state = Arc::new(EndpointState::new(kind));
            info!(endpoint = %kind, path = %path.display(), "endpoint listening");

            tracker.spawn(accept_loop(
                Arc::clone(&self),
                Arc::clone(&state),
                listener,
                tracker.clone(),
                shutdown.clone(),
            ));
            endpoints.push((state, path));
        }

        sd_notify_ready();
        self.touch();

        let idle_timeout = self.config.daemon.idle_timeout_secs;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if idle_timeout == 0 {
                        continue;
                    }
                    let busy: usize = endpoints.iter().map(|(s, _)| s.in_flight()).sum();
                    if busy == 0 && self.idle_secs() >= idle_timeout {
                        info!(idle_timeout, "idle timeout reached, shutting down");
                        shutdown.cancel();
                        break;
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        // Drain: accept loops exit on cancellation, in-flight connections
        // finish their current request.
        tracker.close();
        tracker.wait().await;

        for (_, path) in &endpoints {
            let _ = std::fs::remove_file(path);
        }
        info!("daemon stopped");
        Ok(())
    }
}

async fn accept_loop(
    daemon: Arc<Daemon>,
    state: Arc<EndpointState>,
    listener: UnixListener,
    tracker: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        debug!(
                            endpoint = %state.kind,
                            status = ?state.status(daemon.context_ready(), daemon.activating()),
                            "client connected"
                        );
                        let daemon = Arc::clone(&daemon);
                        let state = Arc::clone(&state);
                        let shutdown = shutdown.clone();
                        tracker.spawn(async move {
                            endpoint::serve_connection(daemon, state, stream, shutdown).await;
                        });
                    }
                    Err(err) => {
                        error!(endpoint = %state.kind, error = %err, "accept failed");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                debug!(endpoint = %state.kind, "accept loop stopping");
                break;
            }
        }
    }
}

fn bind_socket(path: &std::path::Path) -> Result<UnixListener> {
    // Remove a stale socket from a previous run.
    let _ = std::fs::remove_file(path);
    let listener =
        UnixListener::bind(path).with_context(|| format!("binding to {}", path.display()))?;
    // Unix sockets require write permission for connect().
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o770))
        .with_context(|| format!("setting socket permissions on {}", path.display()))?;
    Ok(listener)
}

/// Notify systemd that the service is ready (sd_notify READY=1).
/// No-op when $NOTIFY_SOCKET is not set.
fn sd_notify_ready() {
    let Some(addr) = std::env::var_os("NOTIFY_SOCKET") else {
        return;
    };
    if let Ok(sock) = std::os::unix::net::UnixDatagram::unbound() {
        let _ = sock.send_to(b"READY=1", &addr);
    }
}
