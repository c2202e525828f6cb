// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine configuration.
//!
//! Sources, weakest first: built-in defaults, a YAML file, environment
//! variables. The file path comes from the caller or `GS_CONFIG`; a
//! missing file at the default location is not an error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file consulted when nothing else is given.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ingester: IngesterConfig,
    pub monitoring: MonitoringConfig,
    pub control: ControlConfig,
    pub vault: VaultConfig,
    pub web: WebConfig,
}

/// Ingest endpoint and queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngesterConfig {
    /// Queue capacity. Powers of two keep channel scheduling friendly.
    pub buffer_size: usize,
    /// Bind address for the export RPC.
    pub addr: String,
    pub tls: TlsConfig,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        IngesterConfig {
            buffer_size: 8192,
            addr: ":4317".to_string(),
            tls: TlsConfig::default(),
        }
    }
}

/// TLS material. Certificate plus key enables TLS; a CA file in addition
/// requires and verifies client certificates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
}

impl TlsConfig {
    pub fn enabled(&self) -> bool {
        !self.cert_file.is_empty() || !self.key_file.is_empty()
    }

    pub fn mutual(&self) -> bool {
        self.enabled() && !self.ca_file.is_empty()
    }
}

/// Resource budgets for the sensing monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Host RAM budget in bytes.
    pub max_ram: u64,
    /// Fraction of a budget at which a signal turns Yellow.
    pub yellow_threshold: f64,
    /// Fraction of a budget at which a signal turns Red.
    pub red_threshold: f64,
    /// Ingester byte budget.
    pub ingester_budget: u64,
    /// Vault byte budget.
    pub vault_budget: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            max_ram: 512 * 1024 * 1024,
            yellow_threshold: 0.80,
            red_threshold: 0.95,
            ingester_budget: 64 * 1024 * 1024,
            vault_budget: 64 * 1024 * 1024,
        }
    }
}

/// Management plane listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// TCP bind address for the mTLS management endpoint.
    pub addr: String,
    /// Unix socket path. Deliberately has no platform default; empty
    /// disables the local listener.
    pub socket_path: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            addr: ":9092".to_string(),
            socket_path: String::new(),
        }
    }
}

/// Durable spill settings. An empty directory disables the vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub dir: String,
    pub segment_size: u64,
    /// Replay rate limit in items per second; zero means no base rate.
    pub replay_rate: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        VaultConfig {
            dir: String::new(),
            segment_size: 64 * 1024 * 1024,
            replay_rate: 0,
        }
    }
}

/// Dashboard and metrics listener. Empty address disables it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub addr: String,
}

impl Config {
    /// Load from `path`, `GS_CONFIG`, or the default location, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut cfg = Self::load_file(path)?;
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    fn load_file(path: Option<&Path>) -> Result<Config, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var("GS_CONFIG") {
                Ok(p) if !p.is_empty() => (PathBuf::from(p), true),
                _ => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
            },
        };

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !explicit => {
                return Ok(Config::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Apply environment overrides through a lookup function, so tests
    /// can inject values without touching the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut set = |key: &str, slot: &mut String| {
            if let Some(value) = lookup(key) {
                if !value.is_empty() {
                    *slot = value;
                }
            }
        };
        set("GS_INGEST_ADDR", &mut self.ingester.addr);
        set("GS_INGEST_CERT", &mut self.ingester.tls.cert_file);
        set("GS_INGEST_KEY", &mut self.ingester.tls.key_file);
        set("GS_INGEST_CA", &mut self.ingester.tls.ca_file);
        set("GS_CONTROL_ADDR", &mut self.control.addr);
        set("GS_CONTROL_SOCKET", &mut self.control.socket_path);
        set("GS_VAULT_DIR", &mut self.vault.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.ingester.buffer_size, 8192);
        assert_eq!(cfg.ingester.addr, ":4317");
        assert_eq!(cfg.control.addr, ":9092");
        assert!(cfg.control.socket_path.is_empty());
        assert!(cfg.vault.dir.is_empty());
        assert!((cfg.monitoring.yellow_threshold - 0.80).abs() < f64::EPSILON);
        assert!((cfg.monitoring.red_threshold - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "ingester:\n  buffer_size: 256\n  addr: \":5317\"\nvault:\n  dir: /var/lib/gship\n  segment_size: 1048576\nmonitoring:\n  ingester_budget: 1000"
        )
        .expect("write");

        let cfg = Config::load(Some(file.path())).expect("load");
        assert_eq!(cfg.ingester.buffer_size, 256);
        assert_eq!(cfg.ingester.addr, ":5317");
        assert_eq!(cfg.vault.dir, "/var/lib/gship");
        assert_eq!(cfg.vault.segment_size, 1024 * 1024);
        assert_eq!(cfg.monitoring.ingester_budget, 1000);
        // Untouched sections keep defaults.
        assert_eq!(cfg.control.addr, ":9092");
        assert_eq!(cfg.monitoring.vault_budget, 64 * 1024 * 1024);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = Config::default();
        cfg.ingester.addr = ":5317".to_string();

        let env: HashMap<&str, &str> = [
            ("GS_INGEST_ADDR", ":6317"),
            ("GS_INGEST_CERT", "/etc/gship/tls.crt"),
            ("GS_INGEST_KEY", "/etc/gship/tls.key"),
            ("GS_CONTROL_SOCKET", "/run/gship/control.sock"),
        ]
        .into_iter()
        .collect();
        cfg.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(cfg.ingester.addr, ":6317");
        assert_eq!(cfg.ingester.tls.cert_file, "/etc/gship/tls.crt");
        assert_eq!(cfg.ingester.tls.key_file, "/etc/gship/tls.key");
        assert_eq!(cfg.control.socket_path, "/run/gship/control.sock");
        assert!(cfg.ingester.tls.enabled());
        assert!(!cfg.ingester.tls.mutual());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/gship.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn tls_mutual_requires_all_three_files() {
        let mut tls = TlsConfig::default();
        assert!(!tls.enabled());
        tls.cert_file = "cert".into();
        tls.key_file = "key".into();
        assert!(tls.enabled());
        assert!(!tls.mutual());
        tls.ca_file = "ca".into();
        assert!(tls.mutual());
    }
}
