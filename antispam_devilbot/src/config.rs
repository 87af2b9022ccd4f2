use std::{io::ErrorKind, time::Duration};

use serde::Deserialize;
use teloxide::types::UserId;

use crate::{
    broadcast::BroadcastSettings,
    error::{Error, Result},
};

/// Path to the optional config file, relative to the working directory.
pub const CONFIG_PATH: &str = "antispam_devilbot.toml";

/// Bot configuration. Every field has a sane default, so the config file
/// may be missing entirely.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// sqlx connection string of the sqlite database.
    pub database_path: String,
    /// Telegram user IDs of people allowed to use operator commands
    /// like `/announce`.
    pub admins: Vec<u64>,
    /// How many users the username cache holds at most.
    pub username_cache_capacity: usize,
    pub broadcast: BroadcastConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: String::from("sqlite:antispam_devilbot.sqlite"),
            admins: Vec::new(),
            username_cache_capacity: 4096,
            broadcast: BroadcastConfig::default(),
        }
    }
}

/// Timings of the announcement broadcast loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub chat_cache_ttl_secs: u64,
    pub pacing_secs: u64,
    pub cycle_pause_secs: u64,
    pub max_attempts: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            chat_cache_ttl_secs: 5 * 60,
            pacing_secs: 2,
            cycle_pause_secs: 10 * 60,
            max_attempts: 10,
        }
    }
}

impl BroadcastConfig {
    #[must_use]
    pub fn settings(&self) -> BroadcastSettings {
        BroadcastSettings {
            chat_cache_ttl: Duration::from_secs(self.chat_cache_ttl_secs),
            pacing: Duration::from_secs(self.pacing_secs),
            cycle_pause: Duration::from_secs(self.cycle_pause_secs),
            // Zero attempts would mean never sending anything at all.
            max_attempts: self.max_attempts.max(1),
        }
    }
}

impl Config {
    /// Load the config from [`CONFIG_PATH`], or fall back to defaults if there's no such file.
    ///
    /// # Errors
    /// Errors if the file exists but can't be read or parsed.
    pub fn load() -> Result<Config> {
        match std::fs::read_to_string(CONFIG_PATH) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::info!("No {CONFIG_PATH} found, using default config.");
                Ok(Config::default())
            }
            Err(e) => Err(Error::Config(format!("Failed to read {CONFIG_PATH}: {e}"))),
        }
    }

    /// Parse the config from TOML text.
    ///
    /// # Errors
    /// Errors if the text is not valid TOML or doesn't fit the config's shape.
    pub fn parse(text: &str) -> Result<Config> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Returns `true` if this user is a bot operator.
    #[must_use]
    pub fn is_admin(&self, user: UserId) -> bool {
        self.admins.contains(&user.0)
    }
}
