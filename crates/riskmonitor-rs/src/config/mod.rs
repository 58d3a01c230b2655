use std::{env, fs, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub scan_timeout_secs: u64,
    pub max_concurrent_scans: usize,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("RM_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("failed to parse config.json")?;

        let mut cfg = file_cfg.unwrap_or_else(Self::default);

        if let Ok(v) = env::var("RM_DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Ok(v) = env::var("RM_SCAN_TIMEOUT_SECS") {
            cfg.scan_timeout_secs = v.parse().unwrap_or(cfg.scan_timeout_secs);
        }
        if let Ok(v) = env::var("RM_MAX_CONCURRENT_SCANS") {
            cfg.max_concurrent_scans = v.parse().unwrap_or(cfg.max_concurrent_scans);
        }

        Ok(cfg)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://riskmonitor.db".to_string(),
            scan_timeout_secs: 300,
            max_concurrent_scans: 8,
        }
    }
}
