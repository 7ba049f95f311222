use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{LoadConfigSnafu, StorageResult};

pub const STORE_DIRECTORY_NAME: &str = "parley";
pub const DATABASE_FILE_NAME: &str = "conversations.db";
pub const FALLBACK_DIRECTORY_NAME: &str = "fallback";
pub const ENV_PREFIX: &str = "PARLEY_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_path: PathBuf,
    pub fallback_dir: PathBuf,
    /// Directory for cross-process lock files; `None` keeps locking in-process.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
    pub schema_version: u32,
    pub init_retries: u32,
    pub init_backoff_ms: u64,
    pub max_recovery_attempts: u32,
    pub upgrade_blocked_wait_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = Self::default_data_dir();
        Self {
            database_path: data_dir.join(DATABASE_FILE_NAME),
            fallback_dir: data_dir.join(FALLBACK_DIRECTORY_NAME),
            lock_dir: None,
            schema_version: 1,
            init_retries: 3,
            init_backoff_ms: 50,
            max_recovery_attempts: 3,
            upgrade_blocked_wait_ms: 2_000,
        }
    }
}

impl StoreConfig {
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(STORE_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    /// Defaults, then the optional JSON file, then `PARLEY_*` environment overrides.
    pub fn load(config_path: Option<&Path>) -> StorageResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = config_path {
            if path.exists() {
                figment = figment.merge(Json::file(path));
            } else {
                tracing::info!("store config not found at {:?}, using defaults", path);
            }
        }

        figment
            .merge(Env::prefixed(ENV_PREFIX))
            .extract::<Self>()
            .context(LoadConfigSnafu {
                stage: "store-config-extract",
            })
            .map(Self::normalized)
    }

    fn normalized(mut self) -> Self {
        self.schema_version = self.schema_version.max(1);
        self.max_recovery_attempts = self.max_recovery_attempts.max(1);
        self
    }

    pub fn init_backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64 << attempt.min(6);
        Duration::from_millis(self.init_backoff_ms.saturating_mul(factor))
    }

    pub fn upgrade_blocked_wait(&self) -> Duration {
        Duration::from_millis(self.upgrade_blocked_wait_ms)
    }
}
