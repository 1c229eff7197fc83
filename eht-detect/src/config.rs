//! eht-detect configuration
//!
//! Resolution order per setting: command line, then environment (root folder
//! only, via `EHT_ROOT_FOLDER`), then `eht-detect.toml`, then compiled
//! defaults.

use std::path::PathBuf;

use clap::Parser;
use eht_common::config::{
    find_config_file, load_toml_config, LoggingConfig, RootFolderInitializer, RootFolderResolver,
};
use eht_common::{Error, Result};
use serde::Deserialize;

/// Module name used for config file lookup and log prefixes
pub const MODULE_NAME: &str = "eht-detect";

pub const DEFAULT_PORT: u16 = 5810;
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_UPLOADS_DIR: &str = "uploads";

/// Command-line arguments for eht-detect
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "eht-detect")]
#[command(about = "Volumetric layer review service")]
#[command(version)]
pub struct Args {
    /// Port to listen on
    #[arg(short, long, env = "EHT_DETECT_PORT")]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(long, env = "EHT_DETECT_BIND")]
    pub bind_address: Option<String>,

    /// Root folder holding the database
    #[arg(short, long)]
    pub root_folder: Option<PathBuf>,

    /// Explicit TOML config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Rendering and paging defaults
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    /// Apply CLAHE when a page request does not say
    pub enhance_by_default: bool,
    pub clahe_clip_limit: f64,
    pub clahe_tiles: usize,
    pub default_page_size: i64,
    pub max_page_size: i64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            enhance_by_default: true,
            clahe_clip_limit: 2.0,
            clahe_tiles: 8,
            default_page_size: 12,
            max_page_size: 200,
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.clahe_tiles == 0 {
            return Err(Error::Config("render.clahe_tiles must be at least 1".to_string()));
        }
        if self.max_page_size < 1 {
            return Err(Error::Config("render.max_page_size must be at least 1".to_string()));
        }
        if self.default_page_size < 1 || self.default_page_size > self.max_page_size {
            return Err(Error::Config(format!(
                "render.default_page_size must be between 1 and {}",
                self.max_page_size
            )));
        }
        Ok(())
    }
}

/// Contents of `eht-detect.toml`
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub root_folder: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub bind_address: Option<String>,
    /// Overrides `<root_folder>/eht.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub uploads_dir: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

/// Resolved service configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub root_folder: PathBuf,
    pub database_path: PathBuf,
    pub bind_address: String,
    pub port: u16,
    pub uploads_dir: PathBuf,
    pub logging: LoggingConfig,
    pub render: RenderConfig,
}

impl Config {
    /// Resolve from arguments, locating the TOML file if none was given
    pub fn load(args: &Args) -> Result<Self> {
        let toml_path = args.config.clone().or_else(|| find_config_file(MODULE_NAME));
        let toml: TomlConfig = load_toml_config(toml_path.as_deref())?;
        Self::resolve(args, toml)
    }

    /// Merge arguments over an already-parsed TOML config
    pub fn resolve(args: &Args, toml: TomlConfig) -> Result<Self> {
        toml.render.validate()?;

        let root_folder = RootFolderResolver::new(MODULE_NAME)
            .resolve_with(args.root_folder.as_deref(), toml.root_folder.as_deref());
        let database_path = toml
            .database_path
            .unwrap_or_else(|| RootFolderInitializer::new(root_folder.clone()).database_path());

        Ok(Self {
            root_folder,
            database_path,
            bind_address: args
                .bind_address
                .clone()
                .or(toml.bind_address)
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            port: args.port.or(toml.port).unwrap_or(DEFAULT_PORT),
            uploads_dir: toml
                .uploads_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOADS_DIR)),
            logging: toml.logging,
            render: toml.render,
        })
    }

    /// `host:port` to bind the listener to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
