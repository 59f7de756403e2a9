//! Daemon configuration, read once at startup from a `KEY = value` file:
//!
//! ```text
//! DEFAULT_ROUTE_URI = "fe80::1"
//! DNS_SERVER = "8.8.8.8"
//! PORT = 49300
//! ```
//!
//! `DEFAULT_ROUTE_URI` and `DNS_SERVER` are required; everything else
//! falls back to a default.

use serde_derive::Deserialize;
use std::fmt;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/config/provisiond";

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug)]
pub enum ConfigError {
    Load(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Load(reason) => write!(f, "cannot load configuration: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(rename = "BOOTSTRAP_URI", default = "default_bootstrap_uri")]
    pub bootstrap_uri: String,
    #[serde(rename = "DEFAULT_ROUTE_URI")]
    pub default_route_uri: String,
    #[serde(rename = "DNS_SERVER")]
    pub dns_server: String,
    #[serde(rename = "ENDPOINT_NAME_PATTERN", default = "default_name_pattern")]
    pub endpoint_name_pattern: String,
    #[serde(rename = "LOG_LEVEL", default = "default_log_level")]
    pub log_level: u8,
    #[serde(rename = "PORT", default = "default_port")]
    pub port: u16,
    #[serde(rename = "LOCAL_PROVISION_CTRL", default = "default_local_ctrl")]
    pub local_provision_ctrl: bool,
    #[serde(rename = "REMOTE_PROVISION_CTRL", default)]
    pub remote_provision_ctrl: bool,
    #[serde(rename = "BUS_SOCKET", default = "default_bus_socket")]
    pub bus_socket: String,
}

fn default_bootstrap_uri() -> String {
    "coaps://deviceserver.creatordev.io:15684".to_string()
}

fn default_name_pattern() -> String {
    "cd_{t}_{i}".to_string()
}

fn default_log_level() -> u8 {
    2
}

fn default_port() -> u16 {
    49300
}

fn default_local_ctrl() -> bool {
    true
}

fn default_bus_socket() -> String {
    "/var/run/provd-bus.sock".to_string()
}

impl DaemonConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<DaemonConfig> {
        let mut config: DaemonConfig = serdeconv::from_toml_file(path.as_ref())
            .map_err(|err| ConfigError::Load(err.to_string()))?;
        config.clamp_log_level();
        Ok(config)
    }

    pub fn from_str(raw: &str) -> ConfigResult<DaemonConfig> {
        let mut config: DaemonConfig =
            serdeconv::from_toml_str(raw).map_err(|err| ConfigError::Load(err.to_string()))?;
        config.clamp_log_level();
        Ok(config)
    }

    /// Out-of-range levels fall back to the default, as if unset.
    fn clamp_log_level(&mut self) {
        if self.log_level < 1 || self.log_level > 5 {
            self.log_level = default_log_level();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
DEFAULT_ROUTE_URI = "fe80::1"
DNS_SERVER = "8.8.8.8"
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = DaemonConfig::from_str(MINIMAL).unwrap();

        assert_eq!(config.default_route_uri, "fe80::1");
        assert_eq!(config.dns_server, "8.8.8.8");
        assert_eq!(config.bootstrap_uri, "coaps://deviceserver.creatordev.io:15684");
        assert_eq!(config.endpoint_name_pattern, "cd_{t}_{i}");
        assert_eq!(config.log_level, 2);
        assert_eq!(config.port, 49300);
        assert!(config.local_provision_ctrl);
        assert!(!config.remote_provision_ctrl);
        assert_eq!(config.bus_socket, "/var/run/provd-bus.sock");
    }

    #[test]
    fn test_missing_required_key_fails() {
        let result = DaemonConfig::from_str("DNS_SERVER = \"8.8.8.8\"\n");

        assert!(result.is_err());
    }

    #[test]
    fn test_all_keys_override_defaults() {
        let config = DaemonConfig::from_str(
            r#"
BOOTSTRAP_URI = "coaps://bootstrap.example:5684"
DEFAULT_ROUTE_URI = "fe80::1"
DNS_SERVER = "1.1.1.1"
ENDPOINT_NAME_PATTERN = "gw_{i}"
LOG_LEVEL = 5
PORT = 50000
LOCAL_PROVISION_CTRL = false
REMOTE_PROVISION_CTRL = true
BUS_SOCKET = "/tmp/bus.sock"
"#,
        )
        .unwrap();

        assert_eq!(config.bootstrap_uri, "coaps://bootstrap.example:5684");
        assert_eq!(config.endpoint_name_pattern, "gw_{i}");
        assert_eq!(config.log_level, 5);
        assert_eq!(config.port, 50000);
        assert!(!config.local_provision_ctrl);
        assert!(config.remote_provision_ctrl);
        assert_eq!(config.bus_socket, "/tmp/bus.sock");
    }

    #[test]
    fn test_illegal_log_level_falls_back() {
        let config = DaemonConfig::from_str(&format!("{}LOG_LEVEL = 9\n", MINIMAL)).unwrap();

        assert_eq!(config.log_level, 2);
    }
}
