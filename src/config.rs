//! Link configuration for the trailer-lights controller

use crate::connection::{RetryPolicy, SessionConfig};
use anyhow::{bail, Context, Result};
use std::str::FromStr;
use std::time::Duration;
use trailer_shared::{link, PeripheralAddress};

/// Which device backend to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceMode {
    /// BlueZ over D-Bus (needs the `bluez` feature)
    Bluez,
    /// In-memory peripheral for development
    #[default]
    Simulated,
}

impl FromStr for DeviceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bluez" => Ok(DeviceMode::Bluez),
            "simulated" | "sim" => Ok(DeviceMode::Simulated),
            other => bail!("Unknown device mode '{}' (expected bluez or simulated)", other),
        }
    }
}

/// Link configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Trailer controller address
    pub address: PeripheralAddress,
    /// Device backend
    pub mode: DeviceMode,
    /// Let the radio stack wait for the peripheral instead of failing fast
    pub auto_retry: bool,
    /// Reconnection policy
    pub retry: RetryPolicy,
    /// Bound on a single dispatcher operation, including the wait for a link
    pub operation_timeout: Option<Duration>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: link::DEFAULT_ADDRESS,
            mode: DeviceMode::default(),
            auto_retry: false,
            retry: RetryPolicy::default(),
            operation_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl LinkConfig {
    /// Defaults overridden by `TRAILER_ADDRESS` and `TRAILER_MODE`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(address) = lookup("TRAILER_ADDRESS") {
            config.address = address
                .parse()
                .with_context(|| format!("Invalid TRAILER_ADDRESS '{}'", address))?;
        }
        if let Some(mode) = lookup("TRAILER_MODE") {
            config.mode = mode.parse()?;
        }

        Ok(config)
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            auto_retry: self.auto_retry,
            retry: self.retry,
        }
    }
}
