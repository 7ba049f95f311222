use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::watch;

use super::backend::{KvBackend, KvHandle, SchemaState, validate_table_name};
use super::error::{
    CreateSqliteDirectorySnafu, RemoveDatabaseFileSnafu, SchemaUpgradeSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqlitePragmaSnafu, SqliteQuerySnafu,
    StorageError, StorageResult,
};

/// SQLite-backed engine. Each logical table is a `(key, value)` table and the
/// layout version lives in `PRAGMA user_version`.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    database_url: String,
    database_path: Option<PathBuf>,
    busy_timeout: Duration,
    version_tx: Arc<watch::Sender<u32>>,
    handles: Arc<Mutex<Vec<Weak<HandleShared>>>>,
}

impl SqliteBackend {
    pub fn new(database_location: &str, busy_timeout: Duration) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            database_url: normalize_database_url(database_location),
            database_path: database_file_path(database_location),
            busy_timeout,
            version_tx: Arc::new(version_tx),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn tracked_handles(&self) -> Vec<Arc<HandleShared>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl KvBackend for SqliteBackend {
    type Handle = SqliteHandle;

    async fn open(&self) -> StorageResult<SqliteHandle> {
        if let Some(path) = self.database_path.as_deref() {
            ensure_database_directory(path)?;
        }

        let connect_options = SqliteConnectOptions::from_str(&self.database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: self.database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(self.busy_timeout);

        // A single long-lived connection keeps `:memory:` databases alive for the handle's lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: self.database_url.clone(),
            })?;

        let busy_timeout_ms = self.busy_timeout.as_millis();
        sqlx::query(&format!("PRAGMA busy_timeout = {busy_timeout_ms};"))
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        let opened_version = read_user_version(&pool, "sqlite-open-user-version").await?;
        tracing::debug!(
            database_url = %self.database_url,
            version = opened_version,
            "opened sqlite store"
        );

        let shared = Arc::new(HandleShared {
            pool,
            closing: AtomicBool::new(false),
        });
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handles.retain(|handle| handle.strong_count() > 0);
        handles.push(Arc::downgrade(&shared));
        drop(handles);

        Ok(SqliteHandle {
            shared,
            known_version: AtomicU32::new(opened_version),
            version_tx: Arc::clone(&self.version_tx),
        })
    }

    async fn destroy(&self) -> StorageResult<()> {
        for handle in self.tracked_handles() {
            handle.closing.store(true, Ordering::SeqCst);
            handle.pool.close().await;
        }

        let Some(path) = self.database_path.as_deref() else {
            // In-memory databases vanish with their last connection.
            return Ok(());
        };

        for candidate in [
            path.to_path_buf(),
            sidecar_path(path, "-wal"),
            sidecar_path(path, "-shm"),
        ] {
            match std::fs::remove_file(&candidate) {
                Ok(()) => {}
                Err(source) if source.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(source).context(RemoveDatabaseFileSnafu {
                        stage: "sqlite-destroy-remove-file",
                        path: candidate.display().to_string(),
                    });
                }
            }
        }

        tracing::warn!(path = %path.display(), "deleted sqlite store files");
        Ok(())
    }

    fn location(&self) -> String {
        self.database_url.clone()
    }
}

#[derive(Debug)]
struct HandleShared {
    pool: SqlitePool,
    closing: AtomicBool,
}

#[derive(Debug)]
pub struct SqliteHandle {
    shared: Arc<HandleShared>,
    known_version: AtomicU32,
    version_tx: Arc<watch::Sender<u32>>,
}

impl SqliteHandle {
    fn pool(&self) -> &SqlitePool {
        &self.shared.pool
    }

    fn ensure_open(&self, stage: &'static str) -> StorageResult<()> {
        if self.is_closing() {
            return Err(StorageError::ConnectionClosing { stage });
        }
        Ok(())
    }
}

impl KvHandle for SqliteHandle {
    async fn schema(&self) -> StorageResult<SchemaState> {
        self.ensure_open("sqlite-schema")?;
        let version = read_user_version(self.pool(), "sqlite-schema-user-version").await?;

        // Another process may have upgraded the file since this handle opened it.
        let previous = self.known_version.fetch_max(version, Ordering::SeqCst);
        if version > previous {
            self.version_tx.send_if_modified(|current| {
                if version > *current {
                    *current = version;
                    true
                } else {
                    false
                }
            });
        }

        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|source| classify_query_error(source, "sqlite_master", "sqlite-schema-tables"))?;

        let tables = rows
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()
            .context(SqliteQuerySnafu {
                stage: "sqlite-schema-table-name",
            })?;

        Ok(SchemaState { version, tables })
    }

    async fn upgrade(&self, target_version: u32, tables: &[&str]) -> StorageResult<SchemaState> {
        self.ensure_open("sqlite-upgrade")?;
        for table in tables {
            validate_table_name(table, "sqlite-upgrade-table-name")?;
        }

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|source| classify_upgrade_error(source, target_version, "sqlite-upgrade-begin"))?;

        let current = sqlx::query_scalar::<_, i64>("PRAGMA user_version;")
            .fetch_one(&mut *tx)
            .await
            .map_err(|source| classify_upgrade_error(source, target_version, "sqlite-upgrade-read-version"))?;
        if i64::from(target_version) <= current {
            return SchemaUpgradeSnafu {
                stage: "sqlite-upgrade-version",
                details: format!(
                    "target version {target_version} does not exceed current version {current}"
                ),
            }
            .fail();
        }

        // Additive only: existing tables and their rows are left alone.
        for table in tables {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL)"
            ))
            .execute(&mut *tx)
            .await
            .map_err(|source| classify_upgrade_error(source, target_version, "sqlite-upgrade-create-table"))?;
        }

        sqlx::query(&format!("PRAGMA user_version = {target_version};"))
            .execute(&mut *tx)
            .await
            .map_err(|source| classify_upgrade_error(source, target_version, "sqlite-upgrade-write-version"))?;

        tx.commit()
            .await
            .map_err(|source| classify_upgrade_error(source, target_version, "sqlite-upgrade-commit"))?;

        self.known_version.fetch_max(target_version, Ordering::SeqCst);
        self.version_tx.send_replace(target_version);
        tracing::info!(version = target_version, ?tables, "sqlite schema upgraded");

        self.schema().await
    }

    async fn get(&self, table: &str, key: &str) -> StorageResult<Option<String>> {
        self.ensure_open("sqlite-get")?;
        validate_table_name(table, "sqlite-get-table-name")?;
        sqlx::query_scalar::<_, String>(&format!("SELECT value FROM \"{table}\" WHERE key = ?"))
            .bind(key)
            .fetch_optional(self.pool())
            .await
            .map_err(|source| classify_query_error(source, table, "sqlite-get"))
    }

    async fn put(&self, table: &str, key: &str, value: &str) -> StorageResult<()> {
        self.ensure_open("sqlite-put")?;
        validate_table_name(table, "sqlite-put-table-name")?;
        sqlx::query(&format!(
            "INSERT INTO \"{table}\" (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        ))
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await
        .map_err(|source| classify_query_error(source, table, "sqlite-put"))?;
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> StorageResult<()> {
        self.ensure_open("sqlite-delete")?;
        validate_table_name(table, "sqlite-delete-table-name")?;
        sqlx::query(&format!("DELETE FROM \"{table}\" WHERE key = ?"))
            .bind(key)
            .execute(self.pool())
            .await
            .map_err(|source| classify_query_error(source, table, "sqlite-delete"))?;
        Ok(())
    }

    async fn scan(&self, table: &str) -> StorageResult<Vec<(String, String)>> {
        self.ensure_open("sqlite-scan")?;
        validate_table_name(table, "sqlite-scan-table-name")?;
        let rows = sqlx::query(&format!("SELECT key, value FROM \"{table}\" ORDER BY key"))
            .fetch_all(self.pool())
            .await
            .map_err(|source| classify_query_error(source, table, "sqlite-scan"))?;

        rows.iter()
            .map(|row| {
                Ok::<_, sqlx::Error>((
                    row.try_get::<String, _>("key")?,
                    row.try_get::<String, _>("value")?,
                ))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context(SqliteQuerySnafu {
                stage: "sqlite-scan-decode-row",
            })
    }

    fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst) || self.shared.pool.is_closed()
    }

    fn version_changes(&self) -> watch::Receiver<u32> {
        self.version_tx.subscribe()
    }

    async fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.pool.close().await;
    }
}

async fn read_user_version(pool: &SqlitePool, stage: &'static str) -> StorageResult<u32> {
    let version = sqlx::query_scalar::<_, i64>("PRAGMA user_version;")
        .fetch_one(pool)
        .await
        .context(SqlitePragmaSnafu {
            stage,
            pragma: "user_version",
        })?;

    u32::try_from(version).map_err(|_| StorageError::InvariantViolation {
        stage,
        details: format!("sqlite user_version '{version}' cannot map to u32"),
    })
}

fn classify_query_error(source: sqlx::Error, table: &str, stage: &'static str) -> StorageError {
    if let sqlx::Error::Database(database_error) = &source {
        if database_error.message().contains("no such table") {
            return StorageError::StoreNotFound {
                stage,
                table: table.to_string(),
            };
        }
    }
    if matches!(source, sqlx::Error::PoolClosed) {
        return StorageError::ConnectionClosing { stage };
    }

    StorageError::SqliteQuery { stage, source }
}

fn classify_upgrade_error(source: sqlx::Error, target_version: u32, stage: &'static str) -> StorageError {
    if is_busy(&source) {
        return StorageError::UpgradeBlocked {
            stage,
            target_version,
        };
    }
    if matches!(source, sqlx::Error::PoolClosed) {
        return StorageError::ConnectionClosing { stage };
    }

    StorageError::SchemaUpgrade {
        stage,
        details: source.to_string(),
    }
}

// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy(source: &sqlx::Error) -> bool {
    let sqlx::Error::Database(database_error) = source else {
        return false;
    };
    database_error
        .code()
        .and_then(|code| code.parse::<i64>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

fn ensure_database_directory(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn database_file_path(database_location: &str) -> Option<PathBuf> {
    if database_location == ":memory:" || database_location.contains(":memory:") {
        return None;
    }

    let raw = database_location
        .strip_prefix("sqlite://")
        .or_else(|| database_location.strip_prefix("sqlite:"))
        .unwrap_or(database_location);
    let raw = raw.split('?').next().unwrap_or(raw);
    Some(PathBuf::from(raw))
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}
