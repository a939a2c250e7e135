//! The history store.
//!
//! A small enum of sqlx pool backends selected at startup from the
//! `[database]` config section. Every operation is transactional: an append
//! either commits one complete row or nothing. Failures surface as
//! `ServiceError::Storage` and are never retried here; retrying is a caller
//! decision.
//!
//! Switching `database.type` between runs starts a fresh, empty store.
//! Cross-backend migration is deliberately unsupported.

use anyhow::{Context, Result, anyhow};
use askd_protocol::HistoryFilter;
use chrono::Utc;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::config::{DatabaseKind, DatabaseSection};
use crate::credentials::DatabaseCredentials;
use crate::error::ServiceError;

use super::models::{HistoryEntry, User};

const SQLITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id    TEXT PRIMARY KEY,
    os_uid     INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS history (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id       TEXT NOT NULL,
    session_id    TEXT,
    query_text    TEXT NOT NULL,
    response_text TEXT NOT NULL,
    created_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_user ON history (user_id, created_at, id);
"#;

const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id    TEXT PRIMARY KEY,
    os_uid     BIGINT NOT NULL,
    created_at BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS history (
    id            BIGSERIAL PRIMARY KEY,
    user_id       TEXT NOT NULL,
    session_id    TEXT,
    query_text    TEXT NOT NULL,
    response_text TEXT NOT NULL,
    created_at    BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_user ON history (user_id, created_at, id);
"#;

// MySQL has no CREATE INDEX IF NOT EXISTS; the index lives in the table DDL.
const MYSQL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id    VARCHAR(64) PRIMARY KEY,
    os_uid     BIGINT NOT NULL,
    created_at BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS history (
    id            BIGINT AUTO_INCREMENT PRIMARY KEY,
    user_id       VARCHAR(64) NOT NULL,
    session_id    VARCHAR(64),
    query_text    TEXT NOT NULL,
    response_text TEXT NOT NULL,
    created_at    BIGINT NOT NULL,
    INDEX idx_history_user (user_id, created_at, id)
);
"#;

/// The history store, one of three backends chosen at startup.
#[derive(Debug, Clone)]
pub enum HistoryStore {
    Sqlite(SqlitePool),
    Postgres(PgPool),
    MySql(MySqlPool),
}

impl HistoryStore {
    /// Connect to the configured backend and create the schema.
    ///
    /// Pool limits stay small; the daemon serves one machine's worth of
    /// callers, not a fleet.
    pub async fn connect(
        database: &DatabaseSection,
        credentials: &DatabaseCredentials,
    ) -> Result<Self> {
        let store = match database.kind {
            DatabaseKind::Sqlite => {
                let path = database
                    .connection_string
                    .as_ref()
                    .context("database.connection_string is required for sqlite")?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("creating database directory {}", parent.display())
                    })?;
                }
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true);
                let pool = SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect_with(options)
                    .await
                    .with_context(|| format!("opening sqlite database {}", path.display()))?;
                HistoryStore::Sqlite(pool)
            }
            DatabaseKind::Postgres => {
                let options = PgConnectOptions::new()
                    .host(database.host.as_deref().context("database.host missing")?)
                    .port(database.port.context("database.port missing")?)
                    .database(
                        database
                            .database
                            .as_deref()
                            .context("database.database missing")?,
                    );
                let options = apply_auth_pg(options, credentials);
                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(options)
                    .await
                    .context("connecting to postgresql")?;
                HistoryStore::Postgres(pool)
            }
            DatabaseKind::Mysql => {
                let options = MySqlConnectOptions::new()
                    .host(database.host.as_deref().context("database.host missing")?)
                    .port(database.port.context("database.port missing")?)
                    .database(
                        database
                            .database
                            .as_deref()
                            .context("database.database missing")?,
                    );
                let options = apply_auth_mysql(options, credentials);
                let pool = MySqlPoolOptions::new()
                    .max_connections(5)
                    .connect_with(options)
                    .await
                    .context("connecting to mysql")?;
                HistoryStore::MySql(pool)
            }
        };

        store.migrate().await?;
        info!(backend = ?database.kind, "history store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let (schema, label) = match self {
            HistoryStore::Sqlite(_) => (SQLITE_SCHEMA, "sqlite"),
            HistoryStore::Postgres(_) => (POSTGRES_SCHEMA, "postgresql"),
            HistoryStore::MySql(_) => (MYSQL_SCHEMA, "mysql"),
        };
        for statement in schema.split(';').filter(|s| !s.trim().is_empty()) {
            match self {
                HistoryStore::Sqlite(pool) => {
                    sqlx::query(statement).execute(pool).await?;
                }
                HistoryStore::Postgres(pool) => {
                    sqlx::query(statement).execute(pool).await?;
                }
                HistoryStore::MySql(pool) => {
                    sqlx::query(statement).execute(pool).await?;
                }
            }
        }
        debug!(backend = label, "schema ensured");
        Ok(())
    }

    /// Create the user row if this OS identity has not been seen before.
    /// Idempotent.
    pub async fn ensure_user(&self, user_id: &str, os_uid: u32) -> Result<(), ServiceError> {
        let now = now_micros();
        let result = match self {
            HistoryStore::Sqlite(pool) => sqlx::query(
                "INSERT OR IGNORE INTO users (user_id, os_uid, created_at) VALUES (?, ?, ?)",
            )
            .bind(user_id)
            .bind(os_uid as i64)
            .bind(now)
            .execute(pool)
            .await
            .map(|_| ()),
            HistoryStore::Postgres(pool) => sqlx::query(
                "INSERT INTO users (user_id, os_uid, created_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (user_id) DO NOTHING",
            )
            .bind(user_id)
            .bind(os_uid as i64)
            .bind(now)
            .execute(pool)
            .await
            .map(|_| ()),
            HistoryStore::MySql(pool) => sqlx::query(
                "INSERT IGNORE INTO users (user_id, os_uid, created_at) VALUES (?, ?, ?)",
            )
            .bind(user_id)
            .bind(os_uid as i64)
            .bind(now)
            .execute(pool)
            .await
            .map(|_| ()),
        };
        result.map_err(storage_err)
    }

    /// Look up a user row.
    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>, ServiceError> {
        match self {
            HistoryStore::Sqlite(pool) => {
                sqlx::query_as("SELECT user_id, os_uid, created_at FROM users WHERE user_id = ?")
                    .bind(user_id)
                    .fetch_optional(pool)
                    .await
            }
            HistoryStore::Postgres(pool) => {
                sqlx::query_as("SELECT user_id, os_uid, created_at FROM users WHERE user_id = $1")
                    .bind(user_id)
                    .fetch_optional(pool)
                    .await
            }
            HistoryStore::MySql(pool) => {
                sqlx::query_as("SELECT user_id, os_uid, created_at FROM users WHERE user_id = ?")
                    .bind(user_id)
                    .fetch_optional(pool)
                    .await
            }
        }
        .map_err(storage_err)
    }

    /// Append one query/response pair. Runs in a transaction: the row is
    /// either fully committed or absent.
    pub async fn append(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        query_text: &str,
        response_text: &str,
    ) -> Result<HistoryEntry, ServiceError> {
        let created_at = now_micros();

        let id: i64 = match self {
            HistoryStore::Sqlite(pool) => {
                let mut tx = pool.begin().await.map_err(storage_err)?;
                let id = sqlx::query_scalar(
                    "INSERT INTO history (user_id, session_id, query_text, response_text, created_at) \
                     VALUES (?, ?, ?, ?, ?) RETURNING id",
                )
                .bind(user_id)
                .bind(session_id)
                .bind(query_text)
                .bind(response_text)
                .bind(created_at)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage_err)?;
                tx.commit().await.map_err(storage_err)?;
                id
            }
            HistoryStore::Postgres(pool) => {
                let mut tx = pool.begin().await.map_err(storage_err)?;
                let id = sqlx::query_scalar(
                    "INSERT INTO history (user_id, session_id, query_text, response_text, created_at) \
                     VALUES ($1, $2, $3, $4, $5) RETURNING id",
                )
                .bind(user_id)
                .bind(session_id)
                .bind(query_text)
                .bind(response_text)
                .bind(created_at)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage_err)?;
                tx.commit().await.map_err(storage_err)?;
                id
            }
            HistoryStore::MySql(pool) => {
                let mut tx = pool.begin().await.map_err(storage_err)?;
                let result = sqlx::query(
                    "INSERT INTO history (user_id, session_id, query_text, response_text, created_at) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(user_id)
                .bind(session_id)
                .bind(query_text)
                .bind(response_text)
                .bind(created_at)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
                tx.commit().await.map_err(storage_err)?;
                result.last_insert_id() as i64
            }
        };

        Ok(HistoryEntry {
            id,
            user_id: user_id.to_string(),
            session_id: session_id.map(String::from),
            query_text: query_text.to_string(),
            response_text: response_text.to_string(),
            created_at,
        })
    }

    /// List entries for one user, oldest first, `id` as tie-break.
    ///
    /// `First`/`Last` return at most one entry; an empty result is not an
    /// error. The keyword filter matches a substring of either the query or
    /// the response text and is applied after fetching so its case rules are
    /// identical on every backend.
    pub async fn list(
        &self,
        user_id: &str,
        filter: &HistoryFilter,
    ) -> Result<Vec<HistoryEntry>, ServiceError> {
        const COLUMNS: &str = "id, user_id, session_id, query_text, response_text, created_at";

        let entries: Vec<HistoryEntry> = match (self, filter) {
            (HistoryStore::Sqlite(pool), HistoryFilter::Session { session_id }) => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM history WHERE user_id = ? AND session_id = ? \
                     ORDER BY created_at ASC, id ASC"
                ))
                .bind(user_id)
                .bind(session_id)
                .fetch_all(pool)
                .await
            }
            (HistoryStore::Sqlite(pool), _) => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM history WHERE user_id = ? \
                     ORDER BY created_at ASC, id ASC"
                ))
                .bind(user_id)
                .fetch_all(pool)
                .await
            }
            (HistoryStore::Postgres(pool), HistoryFilter::Session { session_id }) => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM history WHERE user_id = $1 AND session_id = $2 \
                     ORDER BY created_at ASC, id ASC"
                ))
                .bind(user_id)
                .bind(session_id)
                .fetch_all(pool)
                .await
            }
            (HistoryStore::Postgres(pool), _) => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM history WHERE user_id = $1 \
                     ORDER BY created_at ASC, id ASC"
                ))
                .bind(user_id)
                .fetch_all(pool)
                .await
            }
            (HistoryStore::MySql(pool), HistoryFilter::Session { session_id }) => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM history WHERE user_id = ? AND session_id = ? \
                     ORDER BY created_at ASC, id ASC"
                ))
                .bind(user_id)
                .bind(session_id)
                .fetch_all(pool)
                .await
            }
            (HistoryStore::MySql(pool), _) => {
                sqlx::query_as(&format!(
                    "SELECT {COLUMNS} FROM history WHERE user_id = ? \
                     ORDER BY created_at ASC, id ASC"
                ))
                .bind(user_id)
                .fetch_all(pool)
                .await
            }
        }
        .map_err(storage_err)?;

        Ok(apply_filter(entries, filter))
    }

    /// Delete every entry belonging to `user_id`. Irreversible, and strictly
    /// scoped: other users' entries are untouched.
    pub async fn clear(&self, user_id: &str) -> Result<u64, ServiceError> {
        let deleted = match self {
            HistoryStore::Sqlite(pool) => sqlx::query("DELETE FROM history WHERE user_id = ?")
                .bind(user_id)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
            HistoryStore::Postgres(pool) => sqlx::query("DELETE FROM history WHERE user_id = $1")
                .bind(user_id)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
            HistoryStore::MySql(pool) => sqlx::query("DELETE FROM history WHERE user_id = ?")
                .bind(user_id)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
        }
        .map_err(storage_err)?;

        info!(user_id, deleted, "history cleared");
        Ok(deleted)
    }
}

/// In-memory refinement of the fetched, already-ordered entries.
fn apply_filter(entries: Vec<HistoryEntry>, filter: &HistoryFilter) -> Vec<HistoryEntry> {
    match filter {
        HistoryFilter::All | HistoryFilter::Session { .. } => entries,
        HistoryFilter::First => entries.into_iter().take(1).collect(),
        HistoryFilter::Last => {
            let len = entries.len();
            entries.into_iter().skip(len.saturating_sub(1)).collect()
        }
        HistoryFilter::Keyword {
            pattern,
            case_sensitive,
        } => {
            if *case_sensitive {
                entries
                    .into_iter()
                    .filter(|e| {
                        e.query_text.contains(pattern.as_str())
                            || e.response_text.contains(pattern.as_str())
                    })
                    .collect()
            } else {
                let needle = pattern.to_lowercase();
                entries
                    .into_iter()
                    .filter(|e| {
                        e.query_text.to_lowercase().contains(&needle)
                            || e.response_text.to_lowercase().contains(&needle)
                    })
                    .collect()
            }
        }
    }
}

fn apply_auth_pg(options: PgConnectOptions, credentials: &DatabaseCredentials) -> PgConnectOptions {
    let options = match &credentials.username {
        Some(c) => options.username(&c.value),
        None => options,
    };
    match &credentials.password {
        Some(c) => options.password(&c.value),
        None => options,
    }
}

fn apply_auth_mysql(
    options: MySqlConnectOptions,
    credentials: &DatabaseCredentials,
) -> MySqlConnectOptions {
    let options = match &credentials.username {
        Some(c) => options.username(&c.value),
        None => options,
    };
    match &credentials.password {
        Some(c) => options.password(&c.value),
        None => options,
    }
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn storage_err(err: sqlx::Error) -> ServiceError {
    ServiceError::Storage(anyhow!(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    // File-backed sqlite so every pool connection sees the same database.
    async fn test_store() -> (TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let section = DatabaseSection {
            kind: DatabaseKind::Sqlite,
            connection_string: Some(dir.path().join("history.db")),
            ..DatabaseSection::default()
        };
        let store = HistoryStore::connect(&section, &DatabaseCredentials::default())
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_append_then_list_all() {
        let (_dir, store) = test_store().await;
        let entry = store
            .append("user-a", None, "what is selinux?", "a security module")
            .await
            .unwrap();
        assert!(entry.id > 0);

        let entries = store.list("user-a", &HistoryFilter::All).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query_text, "what is selinux?");
        assert!(entries[0].session_id.is_none());
    }

    #[tokio::test]
    async fn test_first_and_last() {
        let (_dir, store) = test_store().await;
        store.append("user-a", None, "one", "r1").await.unwrap();
        store.append("user-a", None, "two", "r2").await.unwrap();

        let first = store.list("user-a", &HistoryFilter::First).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].query_text, "one");

        let last = store.list("user-a", &HistoryFilter::Last).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].query_text, "two");
    }

    #[tokio::test]
    async fn test_first_last_empty_store_is_not_an_error() {
        let (_dir, store) = test_store().await;
        assert!(store.list("user-a", &HistoryFilter::First).await.unwrap().is_empty());
        assert!(store.list("user-a", &HistoryFilter::Last).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_is_scoped_to_user() {
        let (_dir, store) = test_store().await;
        store.append("user-a", None, "qa1", "ra1").await.unwrap();
        store.append("user-b", None, "qb1", "rb1").await.unwrap();
        store.append("user-a", None, "qa2", "ra2").await.unwrap();

        let deleted = store.clear("user-a").await.unwrap();
        assert_eq!(deleted, 2);

        assert!(store.list("user-a", &HistoryFilter::All).await.unwrap().is_empty());
        let b = store.list("user-b", &HistoryFilter::All).await.unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].query_text, "qb1");
    }

    #[tokio::test]
    async fn test_keyword_filter_both_case_modes() {
        let (_dir, store) = test_store().await;
        store
            .append("user-a", None, "what is SELinux?", "a security module")
            .await
            .unwrap();
        store
            .append("user-a", None, "disk space", "use df -h")
            .await
            .unwrap();

        let insensitive = store
            .list(
                "user-a",
                &HistoryFilter::Keyword {
                    pattern: "selinux".to_string(),
                    case_sensitive: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(insensitive.len(), 1);
        assert_eq!(insensitive[0].query_text, "what is SELinux?");

        let sensitive = store
            .list(
                "user-a",
                &HistoryFilter::Keyword {
                    pattern: "selinux".to_string(),
                    case_sensitive: true,
                },
            )
            .await
            .unwrap();
        assert!(sensitive.is_empty());

        // Matches against the response text too.
        let by_response = store
            .list(
                "user-a",
                &HistoryFilter::Keyword {
                    pattern: "df -h".to_string(),
                    case_sensitive: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(by_response.len(), 1);
        assert_eq!(by_response[0].query_text, "disk space");
    }

    #[tokio::test]
    async fn test_session_filter() {
        let (_dir, store) = test_store().await;
        store
            .append("user-a", Some("sess-1"), "in session", "r")
            .await
            .unwrap();
        store.append("user-a", None, "outside", "r").await.unwrap();

        let entries = store
            .list(
                "user-a",
                &HistoryFilter::Session {
                    session_id: "sess-1".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query_text, "in session");
    }

    #[tokio::test]
    async fn test_concurrent_appends_lose_nothing() {
        let (_dir, store) = test_store().await;
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append("user-a", None, &format!("q{i}"), &format!("r{i}"))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entries = store.list("user-a", &HistoryFilter::All).await.unwrap();
        assert_eq!(entries.len(), 16);

        // Ids are unique even when timestamps collide.
        let mut ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }

    #[tokio::test]
    async fn test_ordering_tie_break_by_id() {
        let (_dir, store) = test_store().await;
        for i in 0..5 {
            store
                .append("user-a", None, &format!("q{i}"), "r")
                .await
                .unwrap();
        }
        let entries = store.list("user-a", &HistoryFilter::All).await.unwrap();
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_ensure_user_is_idempotent() {
        let (_dir, store) = test_store().await;
        store.ensure_user("user-a", 1000).await.unwrap();
        store.ensure_user("user-a", 1000).await.unwrap();
        let user = store.get_user("user-a").await.unwrap().unwrap();
        assert_eq!(user.os_uid, 1000);
    }

    #[tokio::test]
    async fn test_switching_backend_path_starts_empty() {
        // A different database location (as after a backend switch) has no
        // visibility into the previous store's rows.
        let (_dir, store) = test_store().await;
        store.append("user-a", None, "old data", "r").await.unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let section = DatabaseSection {
            kind: DatabaseKind::Sqlite,
            connection_string: Some(PathBuf::from(dir2.path().join("history.db"))),
            ..DatabaseSection::default()
        };
        let fresh = HistoryStore::connect(&section, &DatabaseCredentials::default())
            .await
            .unwrap();
        assert!(fresh.list("user-a", &HistoryFilter::All).await.unwrap().is_empty());
    }
}
