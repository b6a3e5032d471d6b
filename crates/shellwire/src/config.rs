//! Layered configuration: defaults, TOML file, then `SHELLWIRE__*` environment.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::info;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::debugger::DebuggerConfig;
use crate::scheduler::{
    ConnectTarget, DEFAULT_CASE_EXCEPTIONS, DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_MAX_MS,
    SchedulerConfig,
};
use crate::endpoint::DEVELOPMENT_PORT;

pub const APP_NAME: &str = "shellwire";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub profile: String,
    pub logging: LoggingConfig,
    pub connection: ConnectionConfig,
    pub debugger: DebuggerSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            logging: LoggingConfig::default(),
            connection: ConnectionConfig::default(),
            debugger: DebuggerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// HTTP(S) base URL of the backend.
    pub url: String,
    /// Backend configuration folder, handed to the transport.
    pub shell_config_dir: Option<String>,
    /// Connect to the development port instead of the URL's port.
    pub development_mode: bool,
    pub development_port: u16,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Keys whose values are not case-converted.
    pub case_exceptions: Vec<String>,
    /// Mirror all traffic on the `debugger` bus signal.
    pub trace: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            shell_config_dir: None,
            development_mode: false,
            development_port: DEVELOPMENT_PORT,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
            case_exceptions: DEFAULT_CASE_EXCEPTIONS.iter().map(|s| s.to_string()).collect(),
            trace: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerSettings {
    pub response_timeout_ms: u64,
    pub validate_poll_ms: u64,
    pub validate_attempts: u32,
}

impl Default for DebuggerSettings {
    fn default() -> Self {
        Self {
            response_timeout_ms: 3_000,
            validate_poll_ms: 300,
            validate_attempts: 10,
        }
    }
}

impl AppConfig {
    pub fn with_profile_override(mut self, profile: Option<String>) -> Self {
        if let Some(profile) = profile {
            self.profile = profile;
        }
        self
    }

    pub fn with_url_override(mut self, url: Option<String>) -> Self {
        if let Some(url) = url {
            self.connection.url = url;
        }
        self
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let connection = &self.connection;
        SchedulerConfig {
            development_mode: connection.development_mode,
            development_port: connection.development_port,
            reconnect_base: Duration::from_millis(connection.reconnect_base_ms),
            reconnect_max: Duration::from_millis(connection.reconnect_max_ms.max(connection.reconnect_base_ms)),
            case_exceptions: connection.case_exceptions.clone(),
            trace: connection.trace,
        }
    }

    pub fn debugger_config(&self) -> DebuggerConfig {
        DebuggerConfig {
            response_timeout: Duration::from_millis(self.debugger.response_timeout_ms),
            validate_poll: Duration::from_millis(self.debugger.validate_poll_ms),
            validate_attempts: self.debugger.validate_attempts,
        }
    }

    pub fn connect_target(&self) -> Result<ConnectTarget> {
        let url = Url::parse(&self.connection.url)
            .with_context(|| format!("parsing backend url {}", self.connection.url))?;
        let shell_config_dir = self
            .connection
            .shell_config_dir
            .as_deref()
            .map(expand_str_path)
            .transpose()?;
        Ok(ConnectTarget { url, shell_config_dir })
    }
}

/// Resolves the config file path, honouring an explicit override.
///
/// A directory override means `config.toml` inside it.
pub fn resolve_config_file(override_path: Option<PathBuf>) -> Result<PathBuf> {
    let config_file = match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                expanded.join("config.toml")
            } else {
                expanded
            }
        }
        None => default_config_dir()?.join("config.toml"),
    };

    if config_file.parent().is_none() {
        return Err(anyhow!("invalid config file path: {config_file:?}"));
    }
    Ok(config_file)
}

/// Loads the configuration, writing a default file first if none exists.
pub fn load_or_init_config(config_file: &Path) -> Result<AppConfig> {
    if !config_file.exists() {
        info!("creating default config at {}", config_file.display());
        write_default_config(config_file)?;
    }
    load_config(config_file, &env_prefix())
}

/// Loads `config_file` (optional) overlaid with `{env_prefix}__*` variables.
pub fn load_config(config_file: &Path, env_prefix: &str) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("profile", "default")?
        .set_default("logging.level", "info")?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("connection.case_exceptions")
                .try_parsing(true),
        )
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!("# Configuration for {APP_NAME}\n# File: {}\n\n", path.display())
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
