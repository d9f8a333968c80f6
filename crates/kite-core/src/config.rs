//! Boot-time configuration parsed from the loader command line.

use alloc::string::{String, ToString};

use log::{warn, LevelFilter};

pub const DEFAULT_HZ: u32 = 1000;
pub const DEFAULT_QUANTUM_MS: u32 = 10;
pub const DEFAULT_INIT: &str = "/disk/HELLO.ELF";

const MIN_HZ: u32 = 19;
const MAX_HZ: u32 = 10_000;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RootDevice {
    Ata0,
    None,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    InvalidNumber { key: &'static str, value: String },
    OutOfRange { key: &'static str, value: u32 },
    InvalidLevel(String),
    InvalidRoot(String),
    EmptyValue(&'static str),
    UnknownKey(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KernelConfig {
    pub hz: u32,
    pub quantum_ms: u32,
    pub log_level: LevelFilter,
    pub init_path: String,
    pub root: RootDevice,
    pub test_filter: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            hz: DEFAULT_HZ,
            quantum_ms: DEFAULT_QUANTUM_MS,
            log_level: LevelFilter::Info,
            init_path: DEFAULT_INIT.to_string(),
            root: RootDevice::Ata0,
            test_filter: None,
        }
    }
}

impl KernelConfig {
    /// Parses whitespace-separated `key=value` tokens. A bad token is logged
    /// and leaves the default in place.
    pub fn parse(cmdline: &str) -> Self {
        let mut config = Self::default();
        for part in cmdline.split_ascii_whitespace() {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            if let Err(err) = config.apply(key, value) {
                warn!("[config] ignoring '{}': {:?}", part, err);
            }
        }
        config
    }

    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "hz" => {
                let hz = parse_number("hz", value)?;
                if !(MIN_HZ..=MAX_HZ).contains(&hz) {
                    return Err(ConfigError::OutOfRange { key: "hz", value: hz });
                }
                self.hz = hz;
            }
            "quantum" => {
                let ms = parse_number("quantum", value)?;
                if ms == 0 {
                    return Err(ConfigError::OutOfRange { key: "quantum", value: ms });
                }
                self.quantum_ms = ms;
            }
            "log" => {
                self.log_level = match value {
                    "off" => LevelFilter::Off,
                    "error" => LevelFilter::Error,
                    "warn" => LevelFilter::Warn,
                    "info" => LevelFilter::Info,
                    "debug" => LevelFilter::Debug,
                    "trace" => LevelFilter::Trace,
                    other => return Err(ConfigError::InvalidLevel(other.to_string())),
                };
            }
            "init" => {
                if value.is_empty() {
                    return Err(ConfigError::EmptyValue("init"));
                }
                self.init_path = value.to_string();
            }
            "root" => {
                self.root = match value {
                    "ata0" => RootDevice::Ata0,
                    "none" => RootDevice::None,
                    other => return Err(ConfigError::InvalidRoot(other.to_string())),
                };
            }
            "test" => {
                if value.is_empty() {
                    return Err(ConfigError::EmptyValue("test"));
                }
                self.test_filter = Some(value.to_string());
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// Scheduler quantum in timer ticks, never zero.
    pub fn quantum_ticks(&self) -> u32 {
        ((self.quantum_ms as u64 * self.hz as u64) / 1000).max(1) as u32
    }

    /// Converts milliseconds to ticks, rounding up.
    pub fn ms_to_ticks(&self, ms: u32) -> u64 {
        (ms as u64 * self.hz as u64).div_ceil(1000)
    }
}

fn parse_number(key: &'static str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidNumber {
        key,
        value: value.to_string(),
    })
}
