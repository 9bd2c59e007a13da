use anyhow::{anyhow, Result};
use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::protocol::registration::HttpMethod;

/// UART connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Path to the TTY device
    pub port: String,
    pub baud_rate: u32,
    /// Bounded read timeout; also the interval at which a stop request is observed
    pub read_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/tmp/ttyMBT01".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 200,
        }
    }
}

impl SerialSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Shape of the registration call against `server_endpoint`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationSettings {
    pub method: HttpMethod,
    pub path: String,
    pub timeout_secs: u64,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            method: HttpMethod::Get,
            path: "getserial".to_string(),
            timeout_secs: 10,
        }
    }
}

impl RegistrationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Optional steps and boot prompt handling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Ask for the label serial number before the data matrix codes
    pub scan_serial_number: bool,
    /// Wait for the operator to connect the remaining cables (first UART line)
    pub connect_cables: bool,
    pub boot_prompt: String,
    /// Sent to the board as soon as the boot prompt shows up
    pub boot_interrupt: String,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            scan_serial_number: false,
            connect_cables: true,
            boot_prompt: "stop autoboot".to_string(),
            boot_interrupt: "STOP\r\n".to_string(),
        }
    }
}

/// External programmer invocation for the flash step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Output that confirms a successful flash; without it a zero exit code is required
    #[serde(default)]
    pub success_pattern: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl FirmwareSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Root station configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Base URL of the provisioning backend
    pub server_endpoint: String,
    /// Directory for per-run log files; `None` disables them
    pub log_dir: Option<PathBuf>,
    pub serial: SerialSettings,
    pub registration: RegistrationSettings,
    pub workflow: WorkflowSettings,
    pub firmware: Option<FirmwareSettings>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            server_endpoint: "http://localhost:8000".to_string(),
            log_dir: Some(PathBuf::from("/tmp")),
            serial: SerialSettings::default(),
            registration: RegistrationSettings::default(),
            workflow: WorkflowSettings::default(),
            firmware: None,
        }
    }
}

impl StationConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|err| anyhow!("Invalid station config: {err}"))
    }

    /// Read configuration from a file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| anyhow!("Failed to read config '{path}': {err}"))?;
        Self::from_toml(&content)
    }

    /// Build the effective config: file (if given) overridden by command line values.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_matches(matches);
        Ok(config)
    }

    pub fn apply_matches(&mut self, matches: &ArgMatches) {
        if let Some(endpoint) = matches.get_one::<String>("server-endpoint") {
            self.server_endpoint = endpoint.clone();
        }
        if let Some(port) = matches.get_one::<String>("serial-port") {
            self.serial.port = port.clone();
        }
        if let Some(baud) = matches.get_one::<u32>("baud-rate") {
            self.serial.baud_rate = *baud;
        }
        if let Some(dir) = matches.get_one::<String>("log-dir") {
            self.log_dir = Some(PathBuf::from(dir));
        }
    }
}
