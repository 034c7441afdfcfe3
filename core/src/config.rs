//! Configuration for the Heimdall sync engine
//!
//! Everything tunable lives here with a sensible default, so the daemon can
//! run without a config file. Loading is plain TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::HeimdallResult;

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Directory holding `shared.db` and the per-account stores
    pub data_dir: PathBuf,
    /// Seconds between full sync passes for an account
    pub sync_interval_secs: u64,
    /// Bounded timeout for any single remote protocol call, in seconds
    pub operation_timeout_secs: u64,
    /// How many trailing UIDs the flag/removal reconciliation scan covers
    pub attribute_scan_window: u32,
    /// Delta stream tuning
    pub delta: DeltaSettings,
    /// Maximum syncback requests drained per worker round
    pub syncback_batch_limit: usize,
}

/// Delta stream tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaSettings {
    /// Milliseconds between heartbeat events on an idle stream
    pub heartbeat_interval_ms: u64,
    /// Seconds a stream may live before consumers are asked to resume
    pub max_stream_lifetime_secs: u64,
    /// Rows per catch-up query page
    pub catchup_page_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("heimdall-data"),
            sync_interval_secs: 120,
            operation_timeout_secs: 60,
            attribute_scan_window: 1000,
            delta: DeltaSettings::default(),
            syncback_batch_limit: 100,
        }
    }
}

impl Default for DeltaSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            max_stream_lifetime_secs: 900,
            catchup_page_size: 200,
        }
    }
}

impl SyncSettings {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> HeimdallResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Bounded timeout for a single remote protocol call
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Interval between sync passes
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

impl DeltaSettings {
    /// Interval between heartbeats
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Maximum stream lifetime
    pub fn max_stream_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_stream_lifetime_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_complete() {
        let settings = SyncSettings::default();
        assert_eq!(settings.attribute_scan_window, 1000);
        assert_eq!(settings.delta.heartbeat_interval(), Duration::from_secs(1));
        assert!(settings.delta.max_stream_lifetime() > Duration::from_secs(60));
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let parsed: SyncSettings =
            toml::from_str("sync_interval_secs = 30\n[delta]\nheartbeat_interval_ms = 500\n")
                .unwrap();
        assert_eq!(parsed.sync_interval_secs, 30);
        assert_eq!(parsed.delta.heartbeat_interval_ms, 500);
        assert_eq!(parsed.delta.catchup_page_size, 200);
        assert_eq!(parsed.attribute_scan_window, 1000);
    }
}
