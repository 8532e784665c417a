//! Configuration loading and parsing
//!
//! Every section of `config.toml` is optional. Command-line arguments take
//! precedence over file values.

use anyhow::{Context, Result};
use can_bus_sim::SimulatorConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// SocketCAN interface name, or `virtual`
    pub interface: Option<String>,
    #[serde(default = "default_rx_poll_interval")]
    pub rx_poll_interval_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            interface: None,
            rx_poll_interval_ms: default_rx_poll_interval(),
        }
    }
}

fn default_rx_poll_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub dbc_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Line formats of the classic decoder/sender scripts
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    if config.bus.rx_poll_interval_ms == 0 {
        anyhow::bail!("bus.rx_poll_interval_ms must be greater than 0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_bus_sim::MissedDeadlinePolicy;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [bus]
            interface = "vcan0"

            [catalog]
            dbc_files = ["powertrain.dbc", "body.dbc"]

            [simulator]
            max_step = 2.5
            missed_deadline_policy = "catch_up"
            message_filter = [0x123, 0x200]

            [output]
            format = "json"
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.bus.interface.as_deref(), Some("vcan0"));
        assert_eq!(config.bus.rx_poll_interval_ms, 5);
        assert_eq!(config.catalog.dbc_files.len(), 2);
        assert_eq!(config.simulator.max_step, 2.5);
        assert_eq!(
            config.simulator.missed_deadline_policy,
            MissedDeadlinePolicy::CatchUp
        );
        assert_eq!(config.simulator.message_filter, Some(vec![0x123, 0x200]));
        assert_eq!(config.output.format, OutputFormat::Json);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.bus.interface.is_none());
        assert!(config.catalog.dbc_files.is_empty());
        assert_eq!(config.simulator, SimulatorConfig::default());
        assert_eq!(config.output.format, OutputFormat::Text);
    }

    #[test]
    fn test_load_config_rejects_zero_poll_interval() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[bus]\nrx_poll_interval_ms = 0").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
