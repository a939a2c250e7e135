//! Database credential resolution.
//!
//! Credentials come from the config file first, then from the service
//! manager's credentials directory (the `$CREDENTIALS_DIRECTORY` layout used
//! by systemd `LoadCredential=`), under the fixed names `database-username`
//! and `database-password`. A credentials-directory entry that looks like a
//! database credential but matches neither name is a startup error: a
//! mistyped credential must never silently turn into an unauthenticated
//! database connection.

use crate::config::{DatabaseKind, DatabaseSection};
use crate::error::ServiceError;
use anyhow::{Context, Result, bail};
use std::path::PathBuf;

/// Credential name for the database username.
pub const DATABASE_USERNAME: &str = "database-username";

/// Credential name for the database password.
pub const DATABASE_PASSWORD: &str = "database-password";

/// Where a resolved credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    ConfigFile,
    CredentialsDir,
}

/// One resolved credential, held in memory for the process lifetime only.
#[derive(Clone)]
pub struct Credential {
    pub name: String,
    pub value: String,
    pub source: CredentialSource,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak the value through debug output.
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Resolved database credentials, if the backend needs any.
#[derive(Debug, Clone, Default)]
pub struct DatabaseCredentials {
    pub username: Option<Credential>,
    pub password: Option<Credential>,
}

/// Resolves credentials from config values and the credentials directory.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    credentials_dir: Option<PathBuf>,
}

impl CredentialResolver {
    pub fn new(credentials_dir: Option<PathBuf>) -> Self {
        Self { credentials_dir }
    }

    /// Build a resolver from `$CREDENTIALS_DIRECTORY`.
    pub fn from_env() -> Self {
        Self::new(std::env::var_os("CREDENTIALS_DIRECTORY").map(PathBuf::from))
    }

    /// Resolve one credential: explicit config value first, then the
    /// credentials directory. Returns `None` when neither provides it.
    pub fn resolve(&self, name: &str, configured: Option<&str>) -> Result<Option<Credential>> {
        if let Some(value) = configured {
            return Ok(Some(Credential {
                name: name.to_string(),
                value: value.to_string(),
                source: CredentialSource::ConfigFile,
            }));
        }

        let Some(dir) = &self.credentials_dir else {
            return Ok(None);
        };
        let path = dir.join(name);
        if !path.exists() {
            return Ok(None);
        }

        let value = std::fs::read_to_string(&path)
            .with_context(|| format!("reading credential file {}", path.display()))?;
        let value = value.trim_end_matches('\n').to_string();
        if value.is_empty() {
            bail!("credential file {} is empty", path.display());
        }

        Ok(Some(Credential {
            name: name.to_string(),
            value,
            source: CredentialSource::CredentialsDir,
        }))
    }

    /// Reject credentials-directory entries that look like database
    /// credentials but match neither expected name.
    pub fn validate_naming(&self) -> Result<()> {
        let Some(dir) = &self.credentials_dir else {
            return Ok(());
        };
        if !dir.is_dir() {
            return Ok(());
        }

        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("listing credentials directory {}", dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("database-")
                && name != DATABASE_USERNAME
                && name != DATABASE_PASSWORD
            {
                bail!(
                    "unrecognized database credential '{name}' in {}; \
                     expected '{DATABASE_USERNAME}' or '{DATABASE_PASSWORD}'",
                    dir.display()
                );
            }
        }
        Ok(())
    }

    /// Resolve the credentials the configured database backend needs.
    ///
    /// For backends that require authentication a missing username or
    /// password is `CredentialMissing` — the daemon must not start with a
    /// silently unauthenticated connection. The embedded backend needs none.
    pub fn resolve_database(
        &self,
        database: &DatabaseSection,
    ) -> Result<DatabaseCredentials, ServiceError> {
        self.validate_naming().map_err(ServiceError::Internal)?;

        if !database.kind.requires_auth() {
            return Ok(DatabaseCredentials::default());
        }

        let username = self
            .resolve(DATABASE_USERNAME, database.username.as_deref())
            .map_err(ServiceError::Internal)?
            .ok_or_else(|| ServiceError::CredentialMissing(DATABASE_USERNAME.to_string()))?;
        let password = self
            .resolve(DATABASE_PASSWORD, database.password.as_deref())
            .map_err(ServiceError::Internal)?
            .ok_or_else(|| ServiceError::CredentialMissing(DATABASE_PASSWORD.to_string()))?;

        Ok(DatabaseCredentials {
            username: Some(username),
            password: Some(password),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database(kind: DatabaseKind) -> DatabaseSection {
        DatabaseSection {
            kind,
            host: Some("127.0.0.1".to_string()),
            port: Some(5432),
            database: Some("askd".to_string()),
            ..DatabaseSection::default()
        }
    }

    #[test]
    fn test_config_value_wins_over_credentials_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DATABASE_USERNAME), "from-dir\n").unwrap();

        let resolver = CredentialResolver::new(Some(dir.path().to_path_buf()));
        let cred = resolver
            .resolve(DATABASE_USERNAME, Some("from-config"))
            .unwrap()
            .unwrap();
        assert_eq!(cred.value, "from-config");
        assert_eq!(cred.source, CredentialSource::ConfigFile);
    }

    #[test]
    fn test_credentials_dir_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DATABASE_PASSWORD), "s3cret\n").unwrap();

        let resolver = CredentialResolver::new(Some(dir.path().to_path_buf()));
        let cred = resolver.resolve(DATABASE_PASSWORD, None).unwrap().unwrap();
        assert_eq!(cred.value, "s3cret");
        assert_eq!(cred.source, CredentialSource::CredentialsDir);
    }

    #[test]
    fn test_missing_credential_for_authenticated_backend() {
        let resolver = CredentialResolver::new(None);
        let err = resolver
            .resolve_database(&database(DatabaseKind::Postgres))
            .unwrap_err();
        assert!(matches!(err, ServiceError::CredentialMissing(_)));
    }

    #[test]
    fn test_sqlite_needs_no_credentials() {
        let resolver = CredentialResolver::new(None);
        let creds = resolver
            .resolve_database(&DatabaseSection::default())
            .unwrap();
        assert!(creds.username.is_none());
        assert!(creds.password.is_none());
    }

    #[test]
    fn test_naming_convention_mismatch_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("database-usrname"), "typo").unwrap();

        let resolver = CredentialResolver::new(Some(dir.path().to_path_buf()));
        let err = resolver.validate_naming().unwrap_err();
        assert!(err.to_string().contains("database-usrname"));
    }

    #[test]
    fn test_empty_credential_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DATABASE_USERNAME), "").unwrap();

        let resolver = CredentialResolver::new(Some(dir.path().to_path_buf()));
        assert!(resolver.resolve(DATABASE_USERNAME, None).is_err());
    }
}
