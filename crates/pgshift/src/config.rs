use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::lock::{DEFAULT_ADVISORY_LOCK_ID, LockCoordinator};

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const MIGRATIONS_PATH: &str = "PGSHIFT_MIGRATIONS_PATH";
pub const LOCK_WAIT_SECONDS: &str = "PGSHIFT_LOCK_WAIT_SECONDS";
pub const ADVISORY_LOCK_ID: &str = "PGSHIFT_ADVISORY_LOCK_ID";
pub const DISABLE_LOCK_RETRIES: &str = "DISABLE_LOCK_RETRIES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: Option<String>,
    pub migrations_path: PathBuf,
    pub advisory_lock_id: i64,
    /// How long to wait for another runner's migration lock.
    pub lock_wait: Duration,
    pub disable_lock_retries: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            migrations_path: PathBuf::from("./migrations"),
            advisory_lock_id: DEFAULT_ADVISORY_LOCK_ID,
            lock_wait: Duration::from_secs(60),
            disable_lock_retries: false,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "y" | "yes" | "on"
    )
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} has an invalid value: {value}")))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value source, falling back to defaults
    /// for missing keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self {
            database_url: lookup(DATABASE_URL).filter(|url| !url.is_empty()),
            ..Self::default()
        };

        if let Some(path) = lookup(MIGRATIONS_PATH) {
            config.migrations_path = PathBuf::from(path);
        }
        if let Some(seconds) = lookup(LOCK_WAIT_SECONDS) {
            config.lock_wait = Duration::from_secs(parse(LOCK_WAIT_SECONDS, &seconds)?);
        }
        if let Some(id) = lookup(ADVISORY_LOCK_ID) {
            config.advisory_lock_id = parse(ADVISORY_LOCK_ID, &id)?;
        }
        if let Some(disabled) = lookup(DISABLE_LOCK_RETRIES) {
            config.disable_lock_retries = parse_bool(&disabled);
        }

        Ok(config)
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| Error::Config(format!("{DATABASE_URL} must be set")))
    }

    pub fn coordinator(&self) -> LockCoordinator {
        LockCoordinator::default()
            .advisory_lock_id(self.advisory_lock_id)
            .lock_wait(self.lock_wait)
            .disable_lock_retries(self.disable_lock_retries)
    }
}
