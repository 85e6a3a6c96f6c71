use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

/// Top-level gpuexec configuration, loaded from gpuexec.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuexecConfig {
    #[serde(default)]
    pub driver: DriverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Force driver initialization to fail (for testing error paths)
    #[serde(default)]
    pub inject_init_error: bool,
    /// Synchronize the device before and after every context activation
    #[serde(default)]
    pub sync_around_driver_calls: bool,
    /// Report at most one device
    #[serde(default)]
    pub device_0_only: bool,
    /// Which driver backend to use
    #[serde(default)]
    pub backend: BackendKind,
    /// Number of devices exposed by the emulated backend
    #[serde(default = "default_emulated_devices")]
    pub emulated_devices: u32,
    /// Device memory per emulated device, in bytes
    #[serde(default = "default_emulated_memory_bytes")]
    pub emulated_memory_bytes: u64,
}

/// Driver backend selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendKind {
    /// Vendor driver if it can be loaded, emulated otherwise (default)
    #[default]
    #[serde(rename = "auto")]
    Auto,
    /// Vendor driver only
    #[serde(rename = "cuda")]
    Cuda,
    /// Host-memory emulation of the driver
    #[serde(rename = "emulated")]
    Emulated,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(BackendKind::Auto),
            "cuda" => Ok(BackendKind::Cuda),
            "emulated" => Ok(BackendKind::Emulated),
            other => Err(format!("unknown backend `{}` (expected auto, cuda or emulated)", other)),
        }
    }
}

/// Process-wide driver toggles, copied out of [`DriverConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverFlags {
    pub inject_init_error: bool,
    pub sync_around_driver_calls: bool,
    pub device_0_only: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            inject_init_error: false,
            sync_around_driver_calls: false,
            device_0_only: false,
            backend: BackendKind::default(),
            emulated_devices: default_emulated_devices(),
            emulated_memory_bytes: default_emulated_memory_bytes(),
        }
    }
}

impl DriverConfig {
    pub fn flags(&self) -> DriverFlags {
        DriverFlags {
            inject_init_error: self.inject_init_error,
            sync_around_driver_calls: self.sync_around_driver_calls,
            device_0_only: self.device_0_only,
        }
    }

    /// Apply `GPUEXEC_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_flag("GPUEXEC_INJECT_INIT_ERROR")? {
            self.inject_init_error = v;
        }
        if let Some(v) = env_flag("GPUEXEC_SYNC_AROUND_DRIVER_CALLS")? {
            self.sync_around_driver_calls = v;
        }
        if let Some(v) = env_flag("GPUEXEC_DEVICE_0_ONLY")? {
            self.device_0_only = v;
        }
        Ok(())
    }
}

impl GpuexecConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    /// Parse configuration text; `origin` only labels errors.
    pub fn parse(origin: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io { .. }) => Self::default(),
            Err(e) => {
                warn!("{}; using defaults", e);
                Self::default()
            }
        }
    }
}

/// Returns the default config file path based on platform conventions.
/// Search order:
/// 1. System-wide config: `%PROGRAMDATA%\gpuexec\gpuexec.toml` (Windows) or `/etc/gpuexec/gpuexec.toml`
/// 2. Local fallback: `./gpuexec.toml`
pub fn default_config_path() -> String {
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = format!(r"{}\gpuexec\gpuexec.toml", programdata);
        if std::path::Path::new(&system_path).exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/gpuexec/gpuexec.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "gpuexec.toml".to_string()
}

fn env_flag(name: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
        },
        Err(_) => Ok(None),
    }
}

fn default_emulated_devices() -> u32 {
    2
}

fn default_emulated_memory_bytes() -> u64 {
    256 * 1024 * 1024
}
