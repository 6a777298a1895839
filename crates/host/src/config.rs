//! Host configuration management

use crate::driver::DriverSettings;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub host: HostSettings,
    #[serde(default)]
    pub midi: MidiSettings,
    #[serde(default)]
    pub usb: UsbSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSettings {
    pub log_level: String,
    /// Wait per library event call, in milliseconds
    #[serde(default = "HostSettings::default_event_timeout")]
    pub host_event_timeout_ms: u64,
    /// Wait per client event call, in milliseconds
    #[serde(default = "HostSettings::default_event_timeout")]
    pub client_event_timeout_ms: u64,
}

impl HostSettings {
    fn default_event_timeout() -> u64 {
        10
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiSettings {
    /// Events held before new ones are dropped
    #[serde(default = "MidiSettings::default_queue_capacity")]
    pub queue_capacity: usize,
    /// IN transfers kept in flight
    #[serde(default = "MidiSettings::default_in_transfers")]
    pub in_transfers: usize,
    #[serde(default = "MidiSettings::default_max_client_events")]
    pub max_client_events: usize,
}

impl Default for MidiSettings {
    fn default() -> Self {
        Self {
            queue_capacity: Self::default_queue_capacity(),
            in_transfers: Self::default_in_transfers(),
            max_client_events: Self::default_max_client_events(),
        }
    }
}

impl MidiSettings {
    fn default_queue_capacity() -> usize {
        common::DEFAULT_QUEUE_CAPACITY
    }

    fn default_in_transfers() -> usize {
        1
    }

    fn default_max_client_events() -> usize {
        5
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbSettings {
    /// "VID:PID" filters; empty accepts every MIDI device
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: HostSettings {
                log_level: "info".to_string(),
                host_event_timeout_ms: HostSettings::default_event_timeout(),
                client_event_timeout_ms: HostSettings::default_event_timeout(),
            },
            midi: MidiSettings::default(),
            usb: UsbSettings::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-midi-host/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
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
                tracing::warn!("Failed to load config: {}, using defaults", e);
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
            config_dir.join("usb-midi-host").join("host.toml")
        } else {
            PathBuf::from(".config/usb-midi-host/host.toml")
        }
    }

    /// Settings for [`MidiDriver::install`](crate::driver::MidiDriver::install)
    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            queue_capacity: self.midi.queue_capacity,
            in_transfers: self.midi.in_transfers,
            max_client_events: self.midi.max_client_events,
            host_event_timeout: Duration::from_millis(self.host.host_event_timeout_ms),
            client_event_timeout: Duration::from_millis(self.host.client_event_timeout_ms),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.midi.queue_capacity == 0 {
            return Err(anyhow!("midi.queue_capacity must be at least 1"));
        }
        if self.midi.in_transfers == 0 {
            return Err(anyhow!("midi.in_transfers must be at least 1"));
        }
        if self.midi.max_client_events == 0 {
            return Err(anyhow!("midi.max_client_events must be at least 1"));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Load from a user-supplied path, expanding `~`
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}
