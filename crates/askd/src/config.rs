//! Daemon configuration.
//!
//! Loaded from a TOML file, by default `/etc/askd/config.toml`. Every section
//! has serde defaults so a partial file is fine; a missing file is not — the
//! daemon refuses to guess its database or backend endpoint.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/askd/config.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendSection,
    pub history: HistorySection,
    pub database: DatabaseSection,
    pub output: OutputSection,
    pub daemon: DaemonSection,
    pub policy: PolicySection,
    pub logging: LoggingSection,
}

/// The `[backend]` section: where queries are forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    /// Inference backend base URL. `/infer` is appended for submissions.
    pub endpoint: String,
    /// Caller-visible timeout for one submission, in seconds.
    pub timeout_secs: u64,
    /// Optional outbound proxies.
    pub proxies: ProxySection,
    /// Client certificate authentication.
    pub auth: AuthSection,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            endpoint: "https://127.0.0.1:8080".to_string(),
            timeout_secs: 30,
            proxies: ProxySection::default(),
            auth: AuthSection::default(),
        }
    }
}

/// Optional HTTP/HTTPS proxies for the backend connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub http: Option<String>,
    pub https: Option<String>,
}

/// Certificate-based authentication towards the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub verify_ssl: bool,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            cert_file: PathBuf::from("/etc/pki/consumer/cert.pem"),
            key_file: PathBuf::from("/etc/pki/consumer/key.pem"),
            verify_ssl: true,
        }
    }
}

/// The `[history]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// Whether conversation turns are persisted at all.
    pub enabled: bool,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Sqlite,
    #[serde(rename = "postgresql")]
    Postgres,
    Mysql,
}

impl DatabaseKind {
    /// Whether this backend requires username/password credentials.
    pub fn requires_auth(self) -> bool {
        !matches!(self, DatabaseKind::Sqlite)
    }
}

/// The `[database]` section. Credential fields may be omitted in favor of
/// credentials-directory entries named `database-username` /
/// `database-password`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    /// Database file path for the embedded backend.
    pub connection_string: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::Sqlite,
            connection_string: Some(PathBuf::from("/var/lib/askd/history.db")),
            host: None,
            port: None,
            username: None,
            password: None,
            database: None,
        }
    }
}

/// The `[output]` section: terminal-capture integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    /// When true, a request for captured terminal output fails if nothing
    /// has been captured; when false it proceeds with a warning.
    pub enforce_script: bool,
    /// Plain-text state file holding captured terminal output.
    pub file: PathBuf,
    /// Separator between captured prompt blocks; the last block is used.
    pub prompt_separator: String,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            enforce_script: false,
            file: PathBuf::from("/tmp/askd_output.txt"),
            prompt_separator: "$".to_string(),
        }
    }
}

/// Bus endpoint names recognized in `[daemon].endpoints`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Chat,
    History,
    User,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::Chat => write!(f, "chat"),
            EndpointKind::History => write!(f, "history"),
            EndpointKind::User => write!(f, "user"),
        }
    }
}

/// The `[daemon]` section: socket placement and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Directory the endpoint sockets are created in.
    pub socket_dir: PathBuf,
    /// Seconds without any inbound call before the daemon exits.
    /// Zero disables the idle timeout.
    pub idle_timeout_secs: u64,
    /// Which endpoints to serve. Each is independently activatable.
    pub endpoints: Vec<EndpointKind>,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(askd_protocol::DEFAULT_SOCKET_DIR),
            idle_timeout_secs: 600,
            endpoints: vec![
                EndpointKind::Chat,
                EndpointKind::History,
                EndpointKind::User,
            ],
        }
    }
}

/// The `[policy]` section: where the access policy lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    /// Allow/deny table path. Absent file means every caller is allowed.
    pub file: Option<PathBuf>,
}

/// The `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level filter for the service log.
    pub level: String,
    /// Append-only audit log path.
    pub audit_file: PathBuf,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            audit_file: PathBuf::from("/var/log/askd/audit.log"),
        }
    }
}

impl AppConfig {
    /// Load configuration from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity checks that should fail before the daemon touches anything.
    pub fn validate(&self) -> Result<()> {
        match self.database.kind {
            DatabaseKind::Sqlite => {
                if self.database.connection_string.is_none() {
                    bail!("database.connection_string is required for the sqlite backend");
                }
            }
            DatabaseKind::Postgres | DatabaseKind::Mysql => {
                for (key, value) in [
                    ("database.host", self.database.host.is_some()),
                    ("database.port", self.database.port.is_some()),
                    ("database.database", self.database.database.is_some()),
                ] {
                    if !value {
                        bail!("{key} is required for the {:?} backend", self.database.kind);
                    }
                }
            }
        }
        if self.daemon.endpoints.is_empty() {
            bail!("daemon.endpoints must name at least one endpoint");
        }
        for (i, kind) in self.daemon.endpoints.iter().enumerate() {
            if self.daemon.endpoints[..i].contains(kind) {
                bail!("daemon.endpoints lists \"{kind}\" more than once");
            }
        }
        Ok(())
    }

    /// Socket path for one endpoint.
    pub fn socket_path(&self, endpoint: EndpointKind) -> PathBuf {
        let name = match endpoint {
            EndpointKind::Chat => askd_protocol::CHAT_SOCKET,
            EndpointKind::History => askd_protocol::HISTORY_SOCKET,
            EndpointKind::User => askd_protocol::USER_SOCKET,
        };
        self.daemon.socket_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.database.kind, DatabaseKind::Sqlite);
        assert!(config.history.enabled);
        assert_eq!(config.backend.timeout_secs, 30);
        assert_eq!(config.output.prompt_separator, "$");
        assert_eq!(config.daemon.endpoints.len(), 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(
            r#"
            [backend]
            endpoint = "https://lightspeed.example.com"
            timeout_secs = 10

            [backend.proxies]
            https = "http://proxy.example.com:3128"

            [backend.auth]
            verify_ssl = false

            [history]
            enabled = false

            [database]
            type = "postgresql"
            host = "127.0.0.1"
            port = 5432
            database = "askd"
            username = "askd"

            [daemon]
            socket_dir = "/tmp/askd-test"
            endpoints = ["history"]
            "#,
        )
        .unwrap();

        assert_eq!(config.database.kind, DatabaseKind::Postgres);
        assert!(!config.history.enabled);
        assert!(!config.backend.auth.verify_ssl);
        assert_eq!(config.daemon.endpoints, vec![EndpointKind::History]);
        assert_eq!(
            config.socket_path(EndpointKind::History),
            PathBuf::from("/tmp/askd-test/askd-history.sock")
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_incomplete_client_server_config() {
        let config: AppConfig = toml::from_str(
            r#"
            [database]
            type = "mysql"
            host = "127.0.0.1"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_endpoints() {
        let config: AppConfig = toml::from_str(
            r#"
            [daemon]
            endpoints = ["chat", "history", "chat"]
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_requires_auth() {
        assert!(!DatabaseKind::Sqlite.requires_auth());
        assert!(DatabaseKind::Postgres.requires_auth());
        assert!(DatabaseKind::Mysql.requires_auth());
    }
}
