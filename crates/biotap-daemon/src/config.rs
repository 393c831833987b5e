use anyhow::{bail, Context, Result};
use biotap_common::config::{CorrelationConfig, GeneralConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub correlation: CorrelationConfig,

    #[serde(default)]
    pub bpf: BpfConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BpfConfig {
    /// Compiled `block-trace` object. Falls back to the build-time copy,
    /// then to `BPF_BLOCK_TRACE_PATH`.
    pub object_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Records buffered between the event path and the writer.
    pub channel_capacity: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { channel_capacity: 4096 }
    }
}

impl DaemonConfig {
    /// Default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir().unwrap_or_else(|| PathBuf::from("/etc")).join("biotap").join("daemon.toml")
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(config_path: &Path) -> Result<Self> {
        debug!("Loading daemon configuration from {:?}", config_path);

        if !config_path.exists() {
            info!(
                "Configuration file not found at {:?}, creating default configuration",
                config_path
            );
            let default_config = Self::default();
            default_config.save_to_path(config_path)?;
            return Ok(default_config);
        }

        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config: DaemonConfig = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        info!("Loaded daemon configuration from {:?}", config_path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        debug!("Saving daemon configuration to {:?}", config_path);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let config_content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(config_path, config_content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        info!("Saved daemon configuration to {:?}", config_path);
        Ok(())
    }

    /// Validate the configuration settings
    pub fn validate(&self) -> Result<()> {
        let correlation = &self.correlation;
        if correlation.grace_window_secs == 0 {
            bail!("correlation.grace_window_secs must be greater than zero");
        }
        if correlation.sweep_interval_secs == 0 {
            bail!("correlation.sweep_interval_secs must be greater than zero");
        }
        if correlation.sweep_interval_secs > correlation.grace_window_secs {
            bail!(
                "correlation.sweep_interval_secs ({}) exceeds grace_window_secs ({})",
                correlation.sweep_interval_secs,
                correlation.grace_window_secs
            );
        }
        if self.output.channel_capacity == 0 {
            bail!("output.channel_capacity must be greater than zero");
        }

        debug!("Configuration validation passed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("biotap").join("daemon.toml");

        let config = DaemonConfig::load_from_path(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.output.channel_capacity, 4096);
        assert_eq!(config.correlation.grace_window_secs, 30);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(
            &path,
            "[correlation]\ntrack_queue_events = false\ngrace_window_secs = 10\nsweep_interval_secs = 2\n\n\
             [bpf]\nobject_path = \"/usr/lib/biotap/block-trace\"\n",
        )
        .unwrap();

        let config = DaemonConfig::load_from_path(&path).unwrap();
        assert!(!config.correlation.track_queue_events);
        assert_eq!(config.correlation.grace_window_secs, 10);
        assert_eq!(config.bpf.object_path, Some(PathBuf::from("/usr/lib/biotap/block-trace")));
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");

        let mut config = DaemonConfig::default();
        config.general.log_level = "debug".to_string();
        config.output.channel_capacity = 128;
        config.save_to_path(&path).unwrap();

        let reloaded = DaemonConfig::load_from_path(&path).unwrap();
        assert_eq!(reloaded.general.log_level, "debug");
        assert_eq!(reloaded.output.channel_capacity, 128);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(&path, "[output]\nchannel_capacity = \"lots\"\n").unwrap();
        assert!(DaemonConfig::load_from_path(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_windows() {
        let mut config = DaemonConfig::default();
        config.correlation.grace_window_secs = 0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.correlation.sweep_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.correlation.sweep_interval_secs = 60;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.output.channel_capacity = 0;
        assert!(config.validate().is_err());
    }
}
