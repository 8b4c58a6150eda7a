//! Device manager configuration

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub manager: ManagerSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    pub log_level: String,
    /// Maximum number of OS events folded into one reconciliation batch
    #[serde(default = "ManagerSettings::default_batch_limit")]
    pub event_batch_limit: usize,
}

impl ManagerSettings {
    fn default_batch_limit() -> usize {
        64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Register OS attach/detach notifications
    #[serde(default = "default_true")]
    pub hotplug: bool,
    /// VID:PID allow-list; empty allows every device
    #[serde(default = "UsbSettings::default_filters")]
    pub filters: Vec<String>,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            hotplug: true,
            filters: Self::default_filters(),
        }
    }
}

impl UsbSettings {
    fn default_filters() -> Vec<String> {
        [
            "0x2c97:*",      // Ledger
            "0x10c4:0xea60", // Jade (CP210x)
            "0x1a86:0x55d4", // Jade (CH9102)
            "0x534c:0x0001", // Trezor One
            "0x1209:0x53c1", // Trezor Model T
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Allow-list of advertised service UUIDs
    #[serde(default = "BleSettings::default_services")]
    pub supported_services: Vec<String>,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            supported_services: Self::default_services(),
        }
    }
}

impl BleSettings {
    fn default_services() -> Vec<String> {
        vec![
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string(), // Jade
            "13d63400-2c97-0004-0000-4c6564676572".to_string(), // Ledger Nano X
        ]
    }

    /// Parsed service allow-list; invalid entries are rejected by `validate`
    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.supported_services
            .iter()
            .filter_map(|s| Uuid::parse_str(s.trim()).ok())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "TimeoutSettings::default_autonomous")]
    pub autonomous_ms: u64,
    #[serde(default = "TimeoutSettings::default_autonomous_long")]
    pub autonomous_long_ms: u64,
    #[serde(default = "TimeoutSettings::default_user_interaction")]
    pub user_interaction_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            autonomous_ms: Self::default_autonomous(),
            autonomous_long_ms: Self::default_autonomous_long(),
            user_interaction_ms: Self::default_user_interaction(),
        }
    }
}

impl TimeoutSettings {
    fn default_autonomous() -> u64 {
        protocol::TIMEOUT_AUTONOMOUS.as_millis() as u64
    }

    fn default_autonomous_long() -> u64 {
        protocol::TIMEOUT_AUTONOMOUS_LONG.as_millis() as u64
    }

    fn default_user_interaction() -> u64 {
        protocol::TIMEOUT_USER_INTERACTION.as_millis() as u64
    }

    pub fn autonomous(&self) -> Duration {
        Duration::from_millis(self.autonomous_ms)
    }

    pub fn autonomous_long(&self) -> Duration {
        Duration::from_millis(self.autonomous_long_ms)
    }

    pub fn user_interaction(&self) -> Duration {
        Duration::from_millis(self.user_interaction_ms)
    }
}

fn default_true() -> bool {
    true
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            manager: ManagerSettings {
                log_level: "info".to_string(),
                event_batch_limit: ManagerSettings::default_batch_limit(),
            },
            usb: UsbSettings::default(),
            ble: BleSettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/hw-devmgr/manager.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: ManagerConfig = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
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
            config_dir.join("hw-devmgr").join("manager.toml")
        } else {
            PathBuf::from(".config/hw-devmgr/manager.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.manager.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.manager.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.manager.event_batch_limit == 0 {
            return Err(anyhow!("event_batch_limit must be greater than 0"));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        for service in &self.ble.supported_services {
            Uuid::parse_str(service.trim())
                .map_err(|e| anyhow!("Invalid BLE service UUID '{}': {}", service, e))?;
        }

        let timeouts = &self.timeouts;
        if timeouts.autonomous_ms == 0
            || timeouts.autonomous_long_ms == 0
            || timeouts.user_interaction_ms == 0
        {
            return Err(anyhow!("Timeouts must be greater than 0"));
        }
        if timeouts.autonomous_ms > timeouts.autonomous_long_ms {
            return Err(anyhow!(
                "autonomous_ms ({}) must not exceed autonomous_long_ms ({})",
                timeouts.autonomous_ms,
                timeouts.autonomous_long_ms
            ));
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x2c97:0x4011' or '0x2c97:*')",
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
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x2c97')",
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
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

/// Load a configuration file, expanding `~`
pub fn load_config(path: &str) -> Result<ManagerConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    ManagerConfig::load(Some(path_buf))
}
