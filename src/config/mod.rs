use serde::{Deserialize, Serialize};
use serde_yml;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::obis_utils;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("Unable to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_yml::Error },
}

fn serial_device_default() -> String { return "/dev/ttyUSB0".to_string() }
fn serial_baud_rate_default() -> u32 { return 115200 }
fn serial_xonxoff_default() -> bool { return true }
fn serial_max_read_errors_default() -> u32 { return 10 }
fn serial_read_retry_delay_ms_default() -> u64 { return 500 }
fn serial_max_reopen_attempts_default() -> u32 { return 5 }
fn serial_reopen_delay_secs_default() -> u64 { return 5 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SerialConfig {
    #[serde(default="serial_device_default")]
    pub device: String,
    #[serde(default="serial_baud_rate_default")]
    pub baud_rate: u32,
    #[serde(default="serial_xonxoff_default")]
    pub xonxoff: bool,
    /* consecutive read errors before the device is reopened */
    #[serde(default="serial_max_read_errors_default")]
    pub max_read_errors: u32,
    #[serde(default="serial_read_retry_delay_ms_default")]
    pub read_retry_delay_ms: u64,
    /* failed reopens before we give up */
    #[serde(default="serial_max_reopen_attempts_default")]
    pub max_reopen_attempts: u32,
    #[serde(default="serial_reopen_delay_secs_default")]
    pub reopen_delay_secs: u64,
}

fn httpd_bind_default() -> String { return "0.0.0.0".to_string() }
fn httpd_port_default() -> u16 { return 7592 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HttpdConfig {
    #[serde(default="httpd_bind_default")]
    pub bind: String,
    #[serde(default="httpd_port_default")]
    pub port: u16,
}

fn storage_data_dir_default() -> String { return "data".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct StorageConfig {
    #[serde(default="storage_data_dir_default")]
    pub data_dir: String,
}

fn serial_default() -> SerialConfig {
    return SerialConfig {
        device: serial_device_default(),
        baud_rate: serial_baud_rate_default(),
        xonxoff: serial_xonxoff_default(),
        max_read_errors: serial_max_read_errors_default(),
        read_retry_delay_ms: serial_read_retry_delay_ms_default(),
        max_reopen_attempts: serial_max_reopen_attempts_default(),
        reopen_delay_secs: serial_reopen_delay_secs_default(),
    }
}
fn httpd_default() -> HttpdConfig { return HttpdConfig { bind: httpd_bind_default(), port: httpd_port_default() } }
fn storage_default() -> StorageConfig { return StorageConfig { data_dir: storage_data_dir_default() } }
fn debug_default() -> bool { return false }
fn obis_codes_default() -> HashMap<String, String> { return obis_utils::get_default_obis_codes() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default="serial_default")]
    pub serial: SerialConfig,
    #[serde(default="httpd_default")]
    pub httpd: HttpdConfig,
    #[serde(default="storage_default")]
    pub storage: StorageConfig,
    #[serde(default="debug_default")]
    pub debug: bool,
    /* code -> description, replaces the built-in table when given */
    #[serde(default="obis_codes_default")]
    pub obis_codes: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            serial: serial_default(),
            httpd: httpd_default(),
            storage: storage_default(),
            debug: debug_default(),
            obis_codes: obis_codes_default(),
        }
    }
}

pub const CONFIG_ENV: &str = "P1_CONFIG";
const CONFIG_PATHS: [&str; 2] = ["config/p1.yaml", "p1.yaml"];

impl Config {
    /// Load from `$P1_CONFIG`, `config/p1.yaml` or `p1.yaml`, falling back
    /// to the defaults when none exists.
    pub fn load() -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            return Ok((Config::from_file(&path)?, Some(path)));
        }

        for candidate in CONFIG_PATHS {
            let path = Path::new(candidate);
            if path.is_file() {
                return Ok((Config::from_file(path)?, Some(path.to_path_buf())));
            }
        }

        Ok((Config::default(), None))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: Config = serde_yml::from_str(&contents)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        Ok(config)
    }

    /// Log filter to use when `P1_LOG_LEVEL` is not set.
    pub fn default_log_filter(&self) -> &'static str {
        if self.debug { "debug" } else { "info" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: Config = serde_yml::from_str("{}").unwrap();
        assert_eq!(config.serial.device, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.httpd.port, 7592);
        assert_eq!(config.storage.data_dir, "data");
        assert!(!config.debug);
        assert_eq!(config.obis_codes.get("1-0:1.8.1").map(String::as_str), Some("Rate 1 (day) - total consumption"));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "
serial:
  device: /dev/ttyAMA0
  baud_rate: 9600
httpd:
  port: 8080
debug: true
obis_codes:
  \"0-0:1.0.0\": Timestamp
  \"0-0:96.1.1\": Meter serial electricity
").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.serial.device, "/dev/ttyAMA0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert!(config.serial.xonxoff);
        assert_eq!(config.httpd.port, 8080);
        assert_eq!(config.httpd.bind, "0.0.0.0");
        assert_eq!(config.default_log_filter(), "debug");
        assert_eq!(config.obis_codes.len(), 2);
    }

    #[test]
    fn test_broken_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "httpd: [").unwrap();
        assert!(matches!(Config::from_file(file.path()), Err(ConfigError::Parse { .. })));
        assert!(matches!(Config::from_file(Path::new("/nonexistent/p1.yaml")), Err(ConfigError::Read { .. })));
    }
}
