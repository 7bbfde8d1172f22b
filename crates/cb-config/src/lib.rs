//! # cb-config
//!
//! Layered settings: built-in defaults, then an optional `campus-board.toml`,
//! then `CAMPUS__SECTION__KEY` environment variables (a `.env` file is read
//! first). Secrets never appear in `Debug` output.

pub mod telemetry;

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "campus-board.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to initialise logging: {0}")]
    Telemetry(String),
}

fn secret<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// The hosted backend over HTTP.
    Rest,
    /// Everything in process; nothing leaves the machine.
    Memory,
}

#[derive(Debug, Deserialize)]
pub struct BackendSettings {
    pub mode: BackendMode,
    pub url: String,
    #[serde(deserialize_with = "secret")]
    pub anon_key: SecretString,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedSettings {
    pub page_size: u32,
    pub cache_ttl_secs: u64,
}

impl FeedSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BadgeSettings {
    pub global_limit: u64,
    pub community_limit: u64,
    pub global_name: String,
    pub community_name: String,
    pub temporary_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Cache entries and the admin session live here.
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    pub email_domain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    pub filter: String,
    pub json: bool,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub backend: BackendSettings,
    pub feed: FeedSettings,
    pub badges: BadgeSettings,
    pub storage: StorageSettings,
    pub auth: AuthSettings,
    pub log: LogSettings,
}

impl Settings {
    /// Loads from the working directory's `campus-board.toml`, if any.
    pub fn load() -> Result<Self, ConfigError> {
        // A missing .env is normal.
        dotenvy::dotenv().ok();
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .set_default("backend.mode", "memory")?
            .set_default("backend.url", "")?
            .set_default("backend.anon_key", "")?
            .set_default("feed.page_size", 10)?
            .set_default("feed.cache_ttl_secs", 24 * 60 * 60)?
            .set_default("badges.global_limit", 100)?
            .set_default("badges.community_limit", 20)?
            .set_default("badges.global_name", "Platform Pioneer")?
            .set_default("badges.community_name", "Campus Pioneer")?
            .set_default("badges.temporary_days", 30)?
            .set_default("storage.data_dir", ".campus-board")?
            .set_default("auth.email_domain", "schoolplatform.com")?
            .set_default("log.filter", "info")?
            .set_default("log.json", false)?
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("CAMPUS").prefix_separator("__").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.page_size == 0 {
            return Err(ConfigError::Invalid("feed.page_size must be at least 1".into()));
        }
        if self.backend.mode == BackendMode::Rest && self.backend.url.trim().is_empty() {
            return Err(ConfigError::Invalid("backend.url is required when backend.mode = \"rest\"".into()));
        }
        if !self.auth.email_domain.contains('.') {
            return Err(ConfigError::Invalid(format!("auth.email_domain {:?} is not a domain", self.auth.email_domain)));
        }
        Ok(())
    }
}
