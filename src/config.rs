use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Runtime settings: `floorwatch.toml` (optional), then `FLOORWATCH_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Enrichment is skipped when unset.
    #[serde(default)]
    pub enrich_endpoint: Option<String>,
    #[serde(default)]
    pub enrich_token: Option<String>,
    #[serde(default = "default_retry_delay_ms")]
    pub enrich_retry_delay_ms: u64,
    #[serde(default = "default_refresh_concurrency")]
    pub refresh_concurrency: usize,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/floorwatch.sqlite")
}

fn default_retry_delay_ms() -> u64 {
    3000
}

fn default_refresh_concurrency() -> usize {
    4
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            enrich_endpoint: None,
            enrich_token: None,
            enrich_retry_delay_ms: default_retry_delay_ms(),
            refresh_concurrency: default_refresh_concurrency(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("floorwatch").required(false))
            .add_source(Environment::with_prefix("FLOORWATCH"))
            .build()?
            .try_deserialize()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.enrich_retry_delay_ms)
    }
}
