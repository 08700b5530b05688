//! Configuration for postdrop.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (POSTDROP_DATABASE, POSTDROP_WATCH_DIR,
//!    POSTDROP_CHECK_CYCLE)
//! 2. Config file (`--config`, else ./postdrop.yaml, else
//!    ~/.postdrop/postdrop.yaml)
//! 3. Defaults under `$APP_HOME`
//!
//! `$APP_HOME` is the directory holding the config file, or ~/.postdrop when
//! there is none. Relative paths resolve against the same directory.
//!
//! The resolved [`AppConfig`] is built once at startup and passed to the
//! components that need it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::ingest::{Archiver, DispatchConfig, WatchTarget, DEFAULT_EXTENSION};

pub const CONFIG_FILE_NAME: &str = "postdrop.yaml";
const APP_HOME_VAR: &str = "$APP_HOME";

const DEFAULT_DATABASE: &str = "$APP_HOME/blog.db";
const DEFAULT_BASE_LOCATION: &str = "$APP_HOME/templates";
const DEFAULT_PROCESSED_OK: &str = "$APP_HOME/templates/ok";
const DEFAULT_PROCESSED_ERROR: &str = "$APP_HOME/templates/error";
const DEFAULT_CHECK_CYCLE_SECS: u64 = 30;
const DEFAULT_MAX_CONCURRENT: usize = 4;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub template: TemplateConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateConfig {
    /// Directory watched for new templates
    pub base_location: Option<String>,
    /// Where templates go once stored
    pub processed_ok: Option<String>,
    /// Where rejected templates go
    pub processed_error: Option<String>,
    /// Poll interval in seconds
    pub check_cycle: Option<u64>,
    pub extension: Option<String>,
    pub max_concurrent: Option<usize>,
    pub dedupe_in_flight: Option<bool>,
    /// Seconds to wait for in-flight files on shutdown
    pub shutdown_timeout: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// `version` from the config file, if any
    pub version: Option<String>,
    pub database: PathBuf,
    pub watch_dir: PathBuf,
    pub processed_ok: PathBuf,
    pub processed_error: PathBuf,
    pub check_cycle: Duration,
    pub extension: String,
    pub max_concurrent: usize,
    pub dedupe_in_flight: bool,
    pub shutdown_timeout: Duration,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from all sources
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_file = match explicit {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file '{}' not found", path.display());
                }
                Some(path.to_path_buf())
            }
            None => find_config_file(),
        };

        let (file, app_home) = match config_file.as_ref() {
            Some(path) => {
                let file = load_config_file(path)?;
                let base = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                (file, absolute(base))
            }
            None => (ConfigFile::default(), default_app_home()?),
        };

        let mut config = Self::resolve(file, &app_home, config_file);
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply defaults and path expansion to a parsed config file
    pub fn resolve(file: ConfigFile, app_home: &Path, config_file: Option<PathBuf>) -> Self {
        let template = file.template;
        let path = |value: Option<String>, default: &str| {
            expand_path(app_home, value.as_deref().unwrap_or(default))
        };

        Self {
            version: file.version,
            database: path(file.database.filename, DEFAULT_DATABASE),
            watch_dir: path(template.base_location, DEFAULT_BASE_LOCATION),
            processed_ok: path(template.processed_ok, DEFAULT_PROCESSED_OK),
            processed_error: path(template.processed_error, DEFAULT_PROCESSED_ERROR),
            check_cycle: Duration::from_secs(non_zero(
                template.check_cycle,
                DEFAULT_CHECK_CYCLE_SECS,
            )),
            extension: normalize_extension(template.extension.as_deref()),
            max_concurrent: non_zero(template.max_concurrent, DEFAULT_MAX_CONCURRENT),
            dedupe_in_flight: template.dedupe_in_flight.unwrap_or(false),
            shutdown_timeout: Duration::from_secs(
                template
                    .shutdown_timeout
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            ),
            config_file,
        }
    }

    /// Override from environment. `lookup` is `std::env::var` outside tests.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(db) = lookup("POSTDROP_DATABASE") {
            self.database = PathBuf::from(db);
        }
        if let Some(dir) = lookup("POSTDROP_WATCH_DIR") {
            self.watch_dir = PathBuf::from(dir);
        }
        if let Some(secs) = lookup("POSTDROP_CHECK_CYCLE") {
            match secs.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.check_cycle = Duration::from_secs(secs),
                _ => tracing::warn!(value = %secs, "Ignoring invalid POSTDROP_CHECK_CYCLE"),
            }
        }
    }

    pub fn watch_target(&self) -> WatchTarget {
        WatchTarget::new(&self.watch_dir, &self.extension, self.check_cycle)
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_concurrent: self.max_concurrent,
            dedupe_in_flight: self.dedupe_in_flight,
        }
    }

    pub fn archiver(&self) -> Archiver {
        Archiver::new(&self.processed_ok, &self.processed_error)
    }
}

/// ./postdrop.yaml, then ~/.postdrop/postdrop.yaml
fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }

    let home = dirs::home_dir()?.join(".postdrop").join(CONFIG_FILE_NAME);
    home.exists().then_some(home)
}

fn default_app_home() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to determine home directory")?;
    Ok(home.join(".postdrop"))
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn absolute(path: PathBuf) -> PathBuf {
    path.canonicalize().unwrap_or(path)
}

/// Replace `$APP_HOME` and resolve relative paths against `app_home`
fn expand_path(app_home: &Path, raw: &str) -> PathBuf {
    let expanded = raw.replace(APP_HOME_VAR, &app_home.to_string_lossy());
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        path
    } else {
        app_home.join(path)
    }
}

fn normalize_extension(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        None | Some("") | Some(".") => DEFAULT_EXTENSION.to_string(),
        Some(ext) if ext.starts_with('.') => ext.to_string(),
        Some(ext) => format!(".{}", ext),
    }
}

fn non_zero<T: Default + PartialEq>(value: Option<T>, default: T) -> T {
    match value {
        Some(v) if v != T::default() => v,
        _ => default,
    }
}
