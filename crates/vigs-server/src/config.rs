//! Device configuration.
//!
//! Environment variables:
//! - `VIGS_BACKEND`: `sw` (default) or `gl`.
//! - `VIGS_VRAM_SIZE`: VRAM-mirror size in bytes, decimal or `0x` hex. Default 32 MiB.
//! - `VIGS_RAM_SIZE`: command RAM size in bytes. Default 1 MiB.

use std::env;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

pub const VIGS_VRAM_SIZE_MIN: u32 = 16 * 1024 * 1024;
pub const VIGS_VRAM_SIZE_DEFAULT: u32 = 32 * 1024 * 1024;
pub const VIGS_RAM_SIZE_MIN: u32 = 1024 * 1024;
pub const VIGS_RAM_SIZE_DEFAULT: u32 = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown backend {0:?} (expected \"sw\" or \"gl\")")]
    UnknownBackend(String),
    #[error("invalid {var} value {value:?}")]
    InvalidSize { var: &'static str, value: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Software,
    Gl,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "sw" => Ok(Self::Software),
            "gl" => Ok(Self::Gl),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Software => "sw",
            Self::Gl => "gl",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VigsConfig {
    pub backend: BackendKind,
    pub vram_size: u32,
    pub ram_size: u32,
}

impl Default for VigsConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Software,
            vram_size: VIGS_VRAM_SIZE_DEFAULT,
            ram_size: VIGS_RAM_SIZE_DEFAULT,
        }
    }
}

fn parse_size(var: &'static str, value: &str) -> Result<u32, ConfigError> {
    let v = value.trim();
    let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => v.parse(),
    };
    parsed.map_err(|_| ConfigError::InvalidSize {
        var,
        value: value.to_string(),
    })
}

impl VigsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds a config from an arbitrary variable source; unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(backend) = lookup("VIGS_BACKEND") {
            cfg.backend = backend.parse()?;
        }
        if let Some(size) = lookup("VIGS_VRAM_SIZE") {
            cfg.vram_size = parse_size("VIGS_VRAM_SIZE", &size)?;
        }
        if let Some(size) = lookup("VIGS_RAM_SIZE") {
            cfg.ram_size = parse_size("VIGS_RAM_SIZE", &size)?;
        }
        Ok(cfg)
    }

    /// Raises sizes below the device minimums.
    pub fn normalized(mut self) -> Self {
        if self.vram_size < VIGS_VRAM_SIZE_MIN {
            warn!(
                vram_size = self.vram_size,
                min = VIGS_VRAM_SIZE_MIN,
                "VRAM size too small, using minimum"
            );
            self.vram_size = VIGS_VRAM_SIZE_MIN;
        }
        if self.ram_size < VIGS_RAM_SIZE_MIN {
            warn!(
                ram_size = self.ram_size,
                min = VIGS_RAM_SIZE_MIN,
                "RAM size too small, using minimum"
            );
            self.ram_size = VIGS_RAM_SIZE_MIN;
        }
        self
    }
}
