//! Probe configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "ProbeSettings::default_log_level")]
    pub log_level: String,
    /// Timeout for descriptor reads on endpoint 0
    #[serde(default = "ProbeSettings::default_control_timeout")]
    pub control_timeout_ms: u64,
    /// Fetch and print BOS capabilities of USB 2.01+ devices
    #[serde(default = "ProbeSettings::default_show_capabilities")]
    pub show_capabilities: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            control_timeout_ms: Self::default_control_timeout(),
            show_capabilities: Self::default_show_capabilities(),
        }
    }
}

impl ProbeSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_control_timeout() -> u64 {
        1000
    }

    fn default_show_capabilities() -> bool {
        true
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Devices to report, as `VID:PID` patterns; empty reports everything
    #[serde(default)]
    pub filters: Vec<String>,
}

/// A parsed `VID:PID` pattern; `None` matches any id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn parse(filter: &str) -> Result<Self> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        Ok(Self {
            vendor_id: parse_id(parts[0], "VID")?,
            product_id: parse_id(parts[1], "PID")?,
        })
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|vid| vid == vendor_id)
            && self.product_id.is_none_or(|pid| pid == product_id)
    }
}

/// Parse one side of a filter: `*` or a `0x`-prefixed hex id of 1-4 digits
fn parse_id(id: &str, name: &str) -> Result<Option<u16>> {
    if id == "*" {
        return Ok(None);
    }

    let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
            name,
            id
        ));
    };

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map(Some)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

impl ProbeConfig {
    /// Load configuration from `path`, or from the default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand(&p),
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ProbeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-probe").join("probe.toml")
        } else {
            PathBuf::from(".config/usb-probe/probe.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.probe.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.probe.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.probe.control_timeout_ms == 0 {
            return Err(anyhow!("control_timeout_ms must be greater than 0"));
        }

        for filter in &self.usb.filters {
            DeviceFilter::parse(filter)?;
        }

        Ok(())
    }

    /// Parsed device filters
    pub fn device_filters(&self) -> Result<Vec<DeviceFilter>> {
        self.usb
            .filters
            .iter()
            .map(|filter| DeviceFilter::parse(filter))
            .collect()
    }
}

/// Whether a device passes `filters`; an empty list admits every device
pub fn check_filters(filters: &[DeviceFilter], vendor_id: u16, product_id: u16) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
}

fn expand(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ProbeConfig::default();
        assert_eq!(config.probe.log_level, "info");
        assert_eq!(config.probe.control_timeout_ms, 1000);
        assert!(config.probe.show_capabilities);
        assert!(config.usb.filters.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_filter_valid() {
        assert_eq!(
            DeviceFilter::parse("0x1234:0x5678").unwrap(),
            DeviceFilter {
                vendor_id: Some(0x1234),
                product_id: Some(0x5678)
            }
        );
        assert!(DeviceFilter::parse("0x1234:*").is_ok());
        assert!(DeviceFilter::parse("*:0x5678").is_ok());
        assert!(DeviceFilter::parse("*:*").is_ok());
        assert!(DeviceFilter::parse("0XABCD:0xef01").is_ok());
    }

    #[test]
    fn test_parse_filter_invalid() {
        assert!(DeviceFilter::parse("1234:5678").is_err());
        assert!(DeviceFilter::parse("0x1234").is_err());
        assert!(DeviceFilter::parse("0x1234:0x5678:0x9abc").is_err());
        assert!(DeviceFilter::parse("0xGHIJ:0x5678").is_err());
        assert!(DeviceFilter::parse("0x12345:0x5678").is_err());
        assert!(DeviceFilter::parse("0x:0x5678").is_err());
    }

    #[test]
    fn test_check_filters() {
        let filters = vec![
            DeviceFilter::parse("0x04f9:*").unwrap(),
            DeviceFilter::parse("0x1234:0x5678").unwrap(),
        ];
        assert!(check_filters(&filters, 0x04f9, 0x0001));
        assert!(check_filters(&filters, 0x1234, 0x5678));
        assert!(!check_filters(&filters, 0x1234, 0x0001));
        assert!(check_filters(&[], 0xdead, 0xbeef));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ProbeConfig::default();
        config.probe.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = ProbeConfig::default();
        config.probe.control_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ProbeConfig::default();
        config.usb.filters.push("1234:5678".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("probe.toml");

        let mut config = ProbeConfig::default();
        config.probe.log_level = "debug".to_string();
        config.probe.control_timeout_ms = 250;
        config.usb.filters = vec!["0x1234:*".to_string()];
        config.save(&path).unwrap();

        let loaded = ProbeConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.probe.log_level, "debug");
        assert_eq!(loaded.probe.control_timeout(), Duration::from_millis(250));
        assert_eq!(loaded.usb.filters, vec!["0x1234:*".to_string()]);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe.toml");
        fs::write(&path, "[usb]\nfilters = [\"*:0x0001\"]\n").unwrap();

        let loaded = ProbeConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.probe.log_level, "info");
        assert!(loaded.probe.show_capabilities);
        assert_eq!(loaded.device_filters().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe.toml");

        fs::write(&path, "[probe]\ncontrol_timeout_ms = 0\n").unwrap();
        assert!(ProbeConfig::load(Some(path.clone())).is_err());

        fs::write(&path, "this is not toml").unwrap();
        assert!(ProbeConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(ProbeConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }
}
