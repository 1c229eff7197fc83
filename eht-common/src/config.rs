//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`EHT_ROOT_FOLDER`)
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing TOML file is never fatal: the service logs a warning and
//! starts with compiled defaults.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "EHT_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "eht.db";

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Compiled-in defaults for the current platform
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        Self {
            root_folder: default_root_folder(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

/// OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/eht (or /var/lib/eht for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("eht"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/eht"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("eht"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/eht"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("eht"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\eht"))
    } else {
        PathBuf::from("./eht_data")
    }
}

/// Locate the TOML config file for a module, if one exists
///
/// Checks `~/.config/eht/<module>.toml` first, then `/etc/eht/<module>.toml`
/// on Linux.
pub fn find_config_file(module_name: &str) -> Option<PathBuf> {
    let file_name = format!("{}.toml", module_name);

    let user_config = dirs::config_dir().map(|d| d.join("eht").join(&file_name));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/eht").join(&file_name);
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Load a TOML config file, falling back to defaults when it is absent
///
/// A file that exists but fails to parse is a configuration error.
pub fn load_toml_config<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        warn!("No config file found, using compiled defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        warn!("Config file {} not found, using compiled defaults", path.display());
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    info!("Loaded config file: {}", path.display());
    Ok(config)
}

/// Resolves the root folder from CLI, environment, TOML and defaults
#[derive(Debug, Clone)]
pub struct RootFolderResolver {
    module_name: String,
}

impl RootFolderResolver {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
        }
    }

    /// Resolve following the priority order documented at module level
    pub fn resolve_with(&self, cli_arg: Option<&Path>, toml_value: Option<&Path>) -> PathBuf {
        if let Some(path) = cli_arg {
            info!("[{}] Root folder from command line: {}", self.module_name, path.display());
            return path.to_path_buf();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                info!("[{}] Root folder from {}: {}", self.module_name, ROOT_FOLDER_ENV, path);
                return PathBuf::from(path);
            }
        }

        if let Some(path) = toml_value {
            info!("[{}] Root folder from config file: {}", self.module_name, path.display());
            return path.to_path_buf();
        }

        let root = CompiledDefaults::for_current_platform().root_folder;
        info!("[{}] Root folder from compiled default: {}", self.module_name, root.display());
        root
    }
}

/// Creates the root folder and derives paths inside it
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    /// Create the root folder if it does not exist yet
    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
            info!("Created root folder: {}", self.root_folder.display());
        }
        Ok(())
    }

    /// Path of the SQLite database inside the root folder
    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE_NAME)
    }
}
