// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ipcsd contributors

//! Broker configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use ipcsd::UnicastAddress;

/// Broker configuration, loadable from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Directory the broker socket is created in.
    #[serde(default = "default_address_root")]
    pub address_root: PathBuf,

    /// Domain part of the broker endpoint.
    #[serde(default)]
    pub domain: u32,

    /// Port part of the broker endpoint.
    #[serde(default = "default_port")]
    pub port: u32,
}

fn default_address_root() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_port() -> u32 {
    ipcsd::config::DEFAULT_BROKER_ADDRESS.port
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address_root: default_address_root(),
            domain: ipcsd::config::DEFAULT_BROKER_ADDRESS.domain,
            port: default_port(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.into(), e))?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(path.into(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.address_root.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "address root {:?} is not a directory",
                self.address_root
            )));
        }
        Ok(())
    }

    pub fn broker_address(&self) -> UnicastAddress {
        UnicastAddress::new(self.domain, self.port)
    }

    /// Filesystem path of the listening socket.
    pub fn socket_path(&self) -> PathBuf {
        self.broker_address().socket_path(&self.address_root)
    }
}

/// Configuration error types.
#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(path, e) => write!(f, "cannot read {path:?}: {e}"),
            Self::Parse(path, e) => write!(f, "cannot parse {path:?}: {e}"),
            Self::Invalid(reason) => write!(f, "invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
