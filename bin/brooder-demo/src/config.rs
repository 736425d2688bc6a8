// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use brooder::error::ConfigError;
use serde::{Deserialize, Serialize};

use crate::cli::ClArgs;

fn default_arbiter_addr() -> SocketAddr {
    "127.0.0.1:9000".parse().unwrap()
}

fn default_bind_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn default_loglevel() -> String {
    "info".into()
}

fn default_cancel_deadline() -> Duration {
    Duration::from_secs(3)
}

fn default_drain_deadline() -> Duration {
    Duration::from_secs(1)
}

/// Configuration for a `brooder-demo` process (§4.8), loaded from an
/// optional TOML file and overridden field-by-field by CLI flags/env vars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub arbiter_addr: SocketAddr,
    pub bind_addr: SocketAddr,
    /// Informational outside of a running actor's own dispatcher: actual
    /// dispatch is the compile-time `Dispatcher` table (§4.6).
    pub rpc_modules: Vec<String>,
    pub loglevel: String,
    #[serde(with = "humantime_serde")]
    pub cancel_deadline: Duration,
    #[serde(with = "humantime_serde")]
    pub drain_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arbiter_addr: default_arbiter_addr(),
            bind_addr: default_bind_addr(),
            rpc_modules: Vec::new(),
            loglevel: default_loglevel(),
            cancel_deadline: default_cancel_deadline(),
            drain_deadline: default_drain_deadline(),
        }
    }
}

impl Config {
    /// Reads a configuration file in `.toml` format.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        fs::read_to_string(&path)
            .map_err(ConfigError::FileRead)
            .and_then(|contents| toml::from_str::<Self>(&contents).map_err(ConfigError::TomlDeserialization))
    }

    /// Loads the config file named by `--config`/`CONFIG_PATH` if present,
    /// falling back to defaults, then layers CLI/env overrides on top.
    pub fn load(args: &ClArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_cli_args(args);
        Ok(config)
    }

    /// Applies the command-line/env overrides on top of whatever was loaded
    /// from the config file.
    fn apply_cli_args(&mut self, args: &ClArgs) {
        if let Some(addr) = args.arbiter_addr {
            self.arbiter_addr = addr;
        }
        if let Some(addr) = args.bind_addr {
            self.bind_addr = addr;
        }
        if let Some(modules) = &args.rpc_modules {
            self.rpc_modules = modules.split(',').filter(|s| !s.is_empty()).map(str::to_owned).collect();
        }
        if let Some(level) = &args.loglevel {
            self.loglevel = level.clone();
        }
    }

    pub fn tracing_level(&self) -> tracing::Level {
        self.loglevel.parse().unwrap_or(tracing::Level::INFO)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_file_conformity() -> Result<(), ConfigError> {
        let config = Config::from_file(concat!(env!("CARGO_MANIFEST_DIR"), "/bin/brooder-demo/config.example.toml"))?;
        assert_eq!(config.loglevel, "debug");
        Ok(())
    }

    #[test]
    fn defaults_parse_without_a_file() {
        let config = Config::default();
        assert_eq!(config.cancel_deadline, Duration::from_secs(3));
        assert_eq!(config.drain_deadline, Duration::from_secs(1));
    }
}
