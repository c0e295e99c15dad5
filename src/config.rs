//! Environment configuration

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::precedence::PrecedenceTables;

pub const DEFAULT_DB_PATH: &str = "./spac_facts.db";
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub db_path: String,
    /// Optional TOML file overriding the built-in priority tables.
    pub precedence_file: Option<PathBuf>,
    pub alert_webhook_url: Option<String>,
    pub alert_timeout: Duration,
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            precedence_file: None,
            alert_webhook_url: None,
            alert_timeout: Duration::from_secs(5),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Load from the environment (and `.env`, if present).
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        if let Ok(path) = std::env::var("SPAC_DB_PATH") {
            config.db_path = path;
        }

        config.precedence_file = std::env::var("SPAC_PRECEDENCE_FILE")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        config.alert_webhook_url = std::env::var("SPAC_ALERT_WEBHOOK_URL")
            .ok()
            .filter(|u| !u.trim().is_empty());

        if let Ok(secs) = std::env::var("SPAC_ALERT_TIMEOUT_SECS") {
            if let Ok(n) = secs.parse::<u64>() {
                config.alert_timeout = Duration::from_secs(n.max(1));
            }
        }

        if let Ok(limit) = std::env::var("SPAC_HISTORY_LIMIT") {
            if let Ok(n) = limit.parse::<usize>() {
                config.history_limit = n.clamp(1, MAX_HISTORY_LIMIT);
            }
        }

        config
    }

    /// Priority tables: the configured file when set, built-in defaults otherwise.
    pub fn load_precedence(&self) -> Result<PrecedenceTables> {
        match &self.precedence_file {
            Some(path) => {
                let tables = PrecedenceTables::load(Path::new(path))?;
                info!(path = %path.display(), "Loaded source priority tables");
                Ok(tables)
            }
            None => Ok(PrecedenceTables::default()),
        }
    }
}
