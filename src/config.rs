use std::path::PathBuf;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Process-wide scraping defaults and scheduler settings.
///
/// Loaded once at startup and handed to the scheduler at construction; there
/// is no ambient global. Targets without their own preferences fall back to
/// the defaults here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Suppresses the daily cadence when false. Manual and targeted triggers
    /// keep working either way.
    pub enabled: bool,
    /// Local time of day for the scheduled run, "HH:MM".
    pub schedule_time: String,
    /// How often the cadence loop wakes up to check the clock.
    pub tick_seconds: u64,
    /// A target becomes due again this many hours after its last scrape.
    pub staleness_hours: i64,
    pub default_sites: Vec<String>,
    pub default_search_terms: Vec<String>,
    pub default_locations: Vec<String>,
    /// Result cap handed to the scrape source per query.
    pub results_per_target: usize,
    /// Freshness window passed to the scrape source.
    pub hours_old: i64,
    /// Endpoint of the HTTP scraper service.
    pub scrape_endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule_time: "02:00".to_string(),
            tick_seconds: 60,
            staleness_hours: 23,
            default_sites: vec!["indeed".to_string(), "linkedin".to_string()],
            default_search_terms: vec![
                "software engineer".to_string(),
                "developer".to_string(),
                "data scientist".to_string(),
                "product manager".to_string(),
                "analyst".to_string(),
                "designer".to_string(),
            ],
            default_locations: vec!["USA".to_string()],
            results_per_target: 100,
            hours_old: 72,
            scrape_endpoint: "http://localhost:8090/scrape".to_string(),
        }
    }
}

impl Config {
    /// Load from the platform config dir, falling back to defaults when no
    /// file exists.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
                let config: Config = serde_json::from_str(&raw)
                    .map_err(|e| Error::Config(format!("bad config {}: {}", path.display(), e)))?;
                config.schedule_time()?; // fail fast on an unparsable time
                Ok(config)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "jobhound")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    pub fn schedule_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.schedule_time, "%H:%M")
            .map_err(|e| Error::Config(format!("bad schedule_time '{}': {}", self.schedule_time, e)))
    }
}
