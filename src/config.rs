//! Configuration for fan wall boards
//!
//! Board parameters load from YAML wall-config files and validate before
//! any controller is built. A generator produces sequential-IP configs
//! for walls addressed as one board per host on a common subnet.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::frame::MAX_WRITE_REGISTERS;

/// Configuration of a single controller board.
///
/// Immutable after construction; fan index `i` maps to register
/// `start_register + i`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Board IP address
    #[serde(default = "default_device_ip")]
    pub device_ip: String,

    /// TCP port the board's Modbus bridge listens on
    #[serde(default = "default_device_port")]
    pub device_port: u16,

    /// Modbus slave address (one address per TCP connection here)
    #[serde(default = "default_slave_addr")]
    pub slave_addr: u8,

    /// Number of fans (registers) on this board
    #[serde(default = "default_fan_count")]
    pub fan_count: u16,

    /// Base register address
    #[serde(default)]
    pub start_register: u16,

    /// Minimum PWM duty value
    #[serde(default)]
    pub pwm_min: u16,

    /// Maximum PWM duty value (100% speed)
    #[serde(default = "default_pwm_max")]
    pub pwm_max: u16,

    /// Socket connect/receive timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,

    /// Total connect attempts for `connect_with_retry`
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Delay between reconnect attempts in seconds
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: f64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            device_ip: default_device_ip(),
            device_port: default_device_port(),
            slave_addr: default_slave_addr(),
            fan_count: default_fan_count(),
            start_register: 0,
            pwm_min: 0,
            pwm_max: default_pwm_max(),
            timeout_secs: default_timeout_secs(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

impl BoardConfig {
    /// `ip:port` endpoint string for socket connects and log lines
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.device_ip, self.device_port)
    }

    /// Socket timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }

    /// Reconnect delay as a `Duration`
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_delay_secs.max(0.0))
    }

    /// Register address of the given fan
    pub fn register_address(&self, fan_index: u16) -> u16 {
        self.start_register + fan_index
    }

    /// Whether `fan_index` addresses a fan on this board
    pub fn validate_fan_index(&self, fan_index: u16) -> bool {
        fan_index < self.fan_count
    }

    /// Validate configuration values.
    ///
    /// Enforces the register-map invariant
    /// `start_register + fan_count - 1 <= 0xFFFF` and the protocol limit
    /// on registers per bulk write.
    pub fn validate(&self) -> Result<()> {
        if self.device_ip.trim().is_empty() {
            anyhow::bail!("device_ip cannot be empty");
        }
        if self.device_port == 0 {
            anyhow::bail!("device_port cannot be 0");
        }

        // Modbus slave addresses are 1-247; 0 is broadcast.
        if self.slave_addr == 0 || self.slave_addr > 247 {
            anyhow::bail!(
                "invalid slave_addr {} for {}: must be 1-247",
                self.slave_addr,
                self.device_ip
            );
        }

        if self.fan_count == 0 {
            anyhow::bail!("fan_count cannot be 0 for {}", self.device_ip);
        }
        if usize::from(self.fan_count) > MAX_WRITE_REGISTERS {
            anyhow::bail!(
                "fan_count {} for {} exceeds the {} registers a bulk write can carry",
                self.fan_count,
                self.device_ip,
                MAX_WRITE_REGISTERS
            );
        }

        let last_register = u32::from(self.start_register) + u32::from(self.fan_count) - 1;
        if last_register > 0xFFFF {
            anyhow::bail!(
                "register map for {} overflows the 16-bit address space \
                 (start 0x{:04X}, {} fans)",
                self.device_ip,
                self.start_register,
                self.fan_count
            );
        }

        if self.pwm_min > self.pwm_max {
            anyhow::bail!(
                "pwm_min {} exceeds pwm_max {} for {}",
                self.pwm_min,
                self.pwm_max,
                self.device_ip
            );
        }
        if self.timeout_secs <= 0.0 {
            anyhow::bail!("timeout_secs must be positive for {}", self.device_ip);
        }

        Ok(())
    }
}

/// Sequential-IP range of boards, e.g. `192.168.2.1` .. `192.168.2.100`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardRange {
    /// IP prefix the board number is appended to (e.g. `"192.168.2."`)
    #[serde(default = "default_base_ip")]
    pub base_ip: String,

    /// First host number in the range
    #[serde(default = "default_start_ip")]
    pub start_ip: u32,

    /// Number of boards
    #[serde(default = "default_board_count")]
    pub board_count: usize,

    /// Fans on each board
    #[serde(default = "default_fan_count")]
    pub fans_per_board: u16,
}

impl Default for BoardRange {
    fn default() -> Self {
        Self {
            base_ip: default_base_ip(),
            start_ip: default_start_ip(),
            board_count: default_board_count(),
            fans_per_board: default_fan_count(),
        }
    }
}

/// Generate `board_count` configs with sequential IPs
/// (`base_ip + (start_ip + i)`), sharing the default port, register map
/// and timing parameters.
pub fn generate_board_configs(
    base_ip: &str,
    start_ip: u32,
    board_count: usize,
    fans_per_board: u16,
) -> Vec<BoardConfig> {
    (0..board_count)
        .map(|i| BoardConfig {
            device_ip: format!("{}{}", base_ip, start_ip + i as u32),
            fan_count: fans_per_board,
            ..BoardConfig::default()
        })
        .collect()
}

/// Top-level wall configuration file.
///
/// Boards may be listed explicitly, produced from a [`BoardRange`], or
/// both (explicit boards first, then the generated range).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WallConfig {
    /// Explicitly configured boards
    #[serde(default)]
    pub boards: Vec<BoardConfig>,

    /// Generated sequential-IP range
    #[serde(default)]
    pub range: Option<BoardRange>,

    /// Concurrent workers for batch fan-out operations
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for WallConfig {
    fn default() -> Self {
        Self {
            boards: Vec::new(),
            range: None,
            max_workers: default_max_workers(),
        }
    }
}

impl WallConfig {
    /// Load and validate a wall configuration from a YAML file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: WallConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;

        info!(
            boards = config.board_configs().len(),
            "wall configuration loaded from {}",
            path.display()
        );
        Ok(config)
    }

    /// Validate every resolved board config
    pub fn validate(&self) -> Result<()> {
        let boards = self.board_configs();
        if boards.is_empty() {
            anyhow::bail!("configuration describes no boards");
        }
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }
        for board in &boards {
            board.validate()?;
        }
        debug!("configuration validation passed");
        Ok(())
    }

    /// Resolve the full ordered board list (explicit boards, then range)
    pub fn board_configs(&self) -> Vec<BoardConfig> {
        let mut boards = self.boards.clone();
        if let Some(range) = &self.range {
            boards.extend(generate_board_configs(
                &range.base_ip,
                range.start_ip,
                range.board_count,
                range.fans_per_board,
            ));
        }
        boards
    }
}

// Default value functions
fn default_device_ip() -> String {
    "192.168.2.1".to_string()
}
fn default_device_port() -> u16 {
    8234
}
fn default_slave_addr() -> u8 {
    1
}
fn default_fan_count() -> u16 {
    16
}
fn default_pwm_max() -> u16 {
    1000
}
fn default_timeout_secs() -> f64 {
    5.0
}
fn default_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_delay_secs() -> f64 {
    2.0
}
fn default_base_ip() -> String {
    "192.168.2.".to_string()
}
fn default_start_ip() -> u32 {
    1
}
fn default_board_count() -> usize {
    100
}
fn default_max_workers() -> usize {
    10
}
