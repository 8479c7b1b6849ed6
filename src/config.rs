//! Configuration management for stagehand.
//!
//! This module defines the structure of the `stagehand.toml` configuration file,
//! loads it, and turns it into validated `ServiceConfig` values.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::orchestrator::DEFAULT_STOP_ALL_TIMEOUT_MS;
use crate::service::{ServiceConfig, DEFAULT_READY_DELAY_MS};
use crate::supervisor::{ShutdownConfig, SIGKILL_TIMEOUT_MS, SIGTERM_TIMEOUT_MS};

/// File looked up in the current directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "stagehand.toml";

/// Top-level configuration structure corresponding to `stagehand.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Time allowed after SIGINT / the stop command, and after SIGTERM (ms).
    pub sigterm_timeout_ms: Option<u64>,
    /// Time allowed after SIGKILL before giving up (ms).
    pub sigkill_timeout_ms: Option<u64>,
    /// Overall timeout of a full shutdown before leftovers are killed (ms).
    pub stop_timeout_ms: Option<u64>,
    /// Services to manage.
    #[serde(rename = "service", default)]
    pub services: Vec<ServiceEntry>,
}

/// Configuration for a single service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    pub id: String,
    /// Shell command that runs the service.
    pub cmd: String,
    /// Shell command that asks the service to stop.
    pub stop_cmd: Option<String>,
    /// Working directory, relative to the config file.
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub depends_on: Option<Vec<String>>,
    /// Regex matched against stdout lines to detect readiness.
    pub ready_pattern: Option<String>,
    pub ready_delay_ms: Option<u64>,
    pub autostart: Option<bool>,
    pub keep_running: Option<bool>,
}

/// Reasons a parsed configuration is rejected.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no services defined")]
    NoServices,
    #[error("service id must not be empty")]
    EmptyId,
    #[error("duplicate service id: {0}")]
    DuplicateId(String),
    #[error("service `{0}` has an empty cmd")]
    EmptyCommand(String),
    #[error("service `{0}` depends on itself")]
    SelfDependency(String),
    #[error("service `{service}` depends on unknown service `{dependency}`")]
    UnknownDependency { service: String, dependency: String },
    #[error("invalid ready_pattern for `{service}`")]
    InvalidPattern {
        service: String,
        #[source]
        source: regex::Error,
    },
}

/// A validated configuration, ready to hand to the orchestrator.
#[derive(Debug, Clone)]
pub struct Settings {
    pub services: Vec<ServiceConfig>,
    pub shutdown: ShutdownConfig,
    pub stop_timeout_ms: u64,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Loads, parses and validates the configuration at `path`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let config = load_config(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    let settings = config
        .into_settings(base_dir)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(settings)
}

impl Config {
    /// Validates the entries and converts them. Relative `cwd`s are resolved
    /// against `base_dir`.
    pub fn into_settings(self, base_dir: &Path) -> Result<Settings, ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }
        let mut ids = HashSet::new();
        for entry in &self.services {
            if entry.id.trim().is_empty() {
                return Err(ConfigError::EmptyId);
            }
            if !ids.insert(entry.id.as_str()) {
                return Err(ConfigError::DuplicateId(entry.id.clone()));
            }
        }
        for entry in &self.services {
            for dep in entry.depends_on.iter().flatten() {
                if dep == &entry.id {
                    return Err(ConfigError::SelfDependency(entry.id.clone()));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        service: entry.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let services = self
            .services
            .into_iter()
            .map(|entry| service_from_entry(entry, base_dir))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Settings {
            services,
            shutdown: ShutdownConfig::new(
                self.sigterm_timeout_ms.unwrap_or(SIGTERM_TIMEOUT_MS),
                self.sigkill_timeout_ms.unwrap_or(SIGKILL_TIMEOUT_MS),
            ),
            stop_timeout_ms: self.stop_timeout_ms.unwrap_or(DEFAULT_STOP_ALL_TIMEOUT_MS),
        })
    }
}

fn service_from_entry(entry: ServiceEntry, base_dir: &Path) -> Result<ServiceConfig, ConfigError> {
    if entry.cmd.trim().is_empty() {
        return Err(ConfigError::EmptyCommand(entry.id));
    }
    let ready_pattern = match entry.ready_pattern.as_deref() {
        Some(pattern) => Some(Regex::new(pattern).map_err(|source| {
            ConfigError::InvalidPattern {
                service: entry.id.clone(),
                source,
            }
        })?),
        None => None,
    };
    let cwd = entry.cwd.map(|cwd| {
        if cwd.is_absolute() {
            cwd
        } else {
            base_dir.join(cwd)
        }
    });
    Ok(ServiceConfig {
        id: entry.id,
        command: entry.cmd,
        stop_command: entry.stop_cmd,
        cwd,
        env: entry.env.unwrap_or_default(),
        depends_on: entry.depends_on.unwrap_or_default(),
        ready_pattern,
        ready_delay_ms: entry.ready_delay_ms.unwrap_or(DEFAULT_READY_DELAY_MS),
        autostart: entry.autostart.unwrap_or(true),
        keep_running: entry.keep_running.unwrap_or(false),
    })
}
