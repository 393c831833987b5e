use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string() }
    }
}

/// Tuning for the completion correlator.
///
/// The grace window bounds how long an unmatched queue entry (or a completed
/// entry waiting for the second completion path) may stay in the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Create correlation state on queue events. When off, state is only
    /// created lazily by the first completion signal.
    pub track_queue_events: bool,
    pub grace_window_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self { track_queue_events: true, grace_window_secs: 30, sweep_interval_secs: 5 }
    }
}

impl CorrelationConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_general_config_default() {
        let config = GeneralConfig::default();
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_correlation_config_default() {
        let config = CorrelationConfig::default();
        assert!(config.track_queue_events);
        assert_eq!(config.grace_window(), Duration::from_secs(30));
        assert!(config.sweep_interval() < config.grace_window());
    }

    #[test]
    fn test_correlation_config_from_toml() {
        let config: CorrelationConfig = toml::from_str(
            "track_queue_events = false\ngrace_window_secs = 60\nsweep_interval_secs = 10\n",
        )
        .unwrap();
        assert!(!config.track_queue_events);
        assert_eq!(config.grace_window_secs, 60);
    }
}
