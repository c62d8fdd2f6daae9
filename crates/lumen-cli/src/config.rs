//! Configuration file management for lumen.
//!
//! Provides a TOML-based config file at `~/.config/lumen/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use lumen_core::launch::WorkerLaunchDescriptor;
use lumen_db::config::DbConfig;

pub const PYTHON_ENV_VAR: &str = "LUMEN_PYTHON";
pub const SCRIPT_DIR_ENV_VAR: &str = "LUMEN_SCRIPT_DIR";
pub const DATA_DIR_ENV_VAR: &str = "LUMEN_DATA_DIR";

pub const DEFAULT_INTERPRETER: &str = "python3";
pub const DEFAULT_SCRIPT_DIR: &str = "./python";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: DbConfig::DEFAULT_URL.to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Interpreter used to run the worker scripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<PathBuf>,
    /// Directory holding the worker scripts; also the workers' cwd.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_dir: Option<PathBuf>,
    /// Extra directories prepended to the workers' `PATH`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_path: Vec<PathBuf>,
    /// Where collected samples are written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the lumen config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/lumen` or `~/.config/lumen`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("lumen");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("lumen")
}

/// Return the path to the lumen config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default location for collected samples: `<data dir>/lumen`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lumen")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&config_path())
}

pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // The database URL may carry a password.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line; each wins over env and file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub database_url: Option<String>,
    pub interpreter: Option<PathBuf>,
    pub script_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct LumenConfig {
    pub db_config: DbConfig,
    pub worker: WorkerLaunchDescriptor,
    pub data_dir: PathBuf,
}

impl LumenConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// A missing config file is not an error; an unreadable one is.
    pub fn resolve(overrides: &Overrides) -> Result<Self> {
        let path = config_path();
        let file = if path.exists() {
            Some(load_config_from(&path)?)
        } else {
            None
        };
        Self::resolve_with(overrides, file)
    }

    pub fn resolve_with(overrides: &Overrides, file: Option<ConfigFile>) -> Result<Self> {
        let file = file.unwrap_or_default();

        let db_url = pick(
            overrides.database_url.clone(),
            DbConfig::ENV_VAR,
            Some(file.database.url),
            DbConfig::DEFAULT_URL.to_string(),
        );

        let interpreter = pick(
            overrides.interpreter.clone(),
            PYTHON_ENV_VAR,
            file.worker.interpreter,
            PathBuf::from(DEFAULT_INTERPRETER),
        );
        let script_dir = pick(
            overrides.script_dir.clone(),
            SCRIPT_DIR_ENV_VAR,
            file.worker.script_dir,
            PathBuf::from(DEFAULT_SCRIPT_DIR),
        );
        let data_dir = pick(
            overrides.data_dir.clone(),
            DATA_DIR_ENV_VAR,
            file.worker.data_dir,
            default_data_dir(),
        );

        // Script paths are joined onto the worker's cwd, so it must be absolute.
        let script_dir = absolutize(&script_dir)?;

        let mut worker = WorkerLaunchDescriptor::new(interpreter, script_dir)
            .with_search_path(file.worker.search_path);
        for (key, value) in file.worker.env {
            worker = worker.with_env(key, value);
        }

        Ok(Self {
            db_config: DbConfig::new(db_url),
            worker,
            data_dir: absolutize(&data_dir)?,
        })
    }
}

fn pick<T: From<String>>(flag: Option<T>, env_var: &str, file: Option<T>, default: T) -> T {
    if let Some(value) = flag {
        return value;
    }
    match std::env::var(env_var) {
        Ok(value) if !value.is_empty() => T::from(value),
        _ => file.unwrap_or(default),
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to determine current directory")?;
    Ok(cwd.join(path))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
