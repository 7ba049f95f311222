use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage entity '{entity}' with id '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
    #[snafu(display("conversation rejected: {details}"))]
    InvalidConversation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("folder '{folder_id}' would become its own ancestor"))]
    FolderCycle {
        stage: &'static str,
        folder_id: String,
    },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("table '{table}' does not exist in the store"))]
    StoreNotFound {
        stage: &'static str,
        table: String,
    },
    #[snafu(display("table name '{table}' is not a valid identifier"))]
    InvalidTableName {
        stage: &'static str,
        table: String,
    },
    #[snafu(display("schema upgrade failed at {stage}: {details}"))]
    SchemaUpgrade {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("schema upgrade to version {target_version} is blocked by another open connection"))]
    UpgradeBlocked {
        stage: &'static str,
        target_version: u32,
    },
    #[snafu(display("storage connection is closing"))]
    ConnectionClosing { stage: &'static str },
    #[snafu(display("storage transaction aborted at {stage}: {details}"))]
    Transaction {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("a conversation save is already in flight"))]
    SaveInProgress { stage: &'static str },
    #[snafu(display("storage initialization failed: {details}"))]
    InitFailed {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("automatic recovery gave up after {attempts} attempts; reset the store"))]
    RecoveryExhausted { stage: &'static str, attempts: u32 },
    #[snafu(display("recovery failed at {stage}: {details}"))]
    RecoveryFailed {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to encode snapshot at {stage}: {source}"))]
    EncodeSnapshot {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode '{key}' from '{table}': {source}"))]
    DecodeSnapshot {
        stage: &'static str,
        table: String,
        key: String,
        source: serde_json::Error,
    },
    #[snafu(display("import document is not valid JSON: {source}"))]
    DecodeImport {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to configure sqlite pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to remove database file {path}"))]
    RemoveDatabaseFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("fallback slot I/O failed at {path}: {source}"))]
    SlotIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to lock {path}: {source}"))]
    LockFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("lock worker task failed: {source}"))]
    LockTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("failed to load store configuration: {source}"))]
    LoadConfig {
        stage: &'static str,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

impl StorageError {
    /// An expected table is absent; these always route through recovery.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::StoreNotFound { .. })
    }

    pub fn is_connection_closing(&self) -> bool {
        matches!(self, Self::ConnectionClosing { .. })
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::NotFound { stage, .. }
            | Self::InvalidId { stage, .. }
            | Self::InvalidConversation { stage, .. }
            | Self::FolderCycle { stage, .. }
            | Self::InvariantViolation { stage, .. }
            | Self::StoreNotFound { stage, .. }
            | Self::InvalidTableName { stage, .. }
            | Self::SchemaUpgrade { stage, .. }
            | Self::UpgradeBlocked { stage, .. }
            | Self::ConnectionClosing { stage }
            | Self::Transaction { stage, .. }
            | Self::SaveInProgress { stage }
            | Self::InitFailed { stage, .. }
            | Self::RecoveryExhausted { stage, .. }
            | Self::RecoveryFailed { stage, .. }
            | Self::EncodeSnapshot { stage, .. }
            | Self::DecodeSnapshot { stage, .. }
            | Self::DecodeImport { stage, .. }
            | Self::CreateSqliteDirectory { stage, .. }
            | Self::SqliteConnectOptions { stage, .. }
            | Self::SqliteConnect { stage, .. }
            | Self::SqlitePragma { stage, .. }
            | Self::SqliteQuery { stage, .. }
            | Self::RemoveDatabaseFile { stage, .. }
            | Self::SlotIo { stage, .. }
            | Self::LockFile { stage, .. }
            | Self::LockTask { stage, .. }
            | Self::LoadConfig { stage, .. } => *stage,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
