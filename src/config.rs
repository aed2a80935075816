//! Configuration loading from INI files.
//!
//! Search order when no explicit file is given:
//! - /etc/casbridge.ini
//! - /etc/casbridgerc
//! - ~/.casbridge.ini
//! - ~/.casbridgerc
//!
//! Later files overlay earlier ones, missing files are skipped, and defaults
//! fill whatever no file sets.
//!
//! ```ini
//! [general]
//! log_level = debug
//!
//! [server]
//! port = 9666
//!
//! [engine]
//! executable = /usr/bin/maxima
//! threads = 8
//! timeout = 10
//! sanitizers = strip_line_breaks trim
//! replace = \\bquit\\(\\) =>
//! ```
//!
//! rust-ini treats a backslash as an escape, so backslashes in patterns are
//! doubled.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::{Ini, Properties};
use thiserror::Error;

use crate::engine::sanitizer::{ReplacePattern, REPLACE_PREFIX};
use crate::engine::{EngineCommand, RequestSanitizer};
use crate::pool::{PoolConfig, DEFAULT_POOL_SIZE};

/// System-wide configuration file
pub const SYSTEM_CONFIG_PATH: &str = "/etc/casbridge.ini";

/// System-wide rc-style configuration file, read after the `.ini` one
pub const SYSTEM_RC_PATH: &str = "/etc/casbridgerc";

/// Per-user configuration file name, relative to the home directory
pub const USER_CONFIG_NAME: &str = ".casbridge.ini";

/// Per-user rc-style file name, read after the `.ini` one
pub const USER_RC_NAME: &str = ".casbridgerc";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] ini::ParseError),

    #[error("configuration file {0} does not exist")]
    Missing(PathBuf),

    #[error("invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

/// `[general]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralConfig {
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            pid_file: None,
        }
    }
}

/// `[server]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    /// Max bytes accepted for one request
    pub max_request: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 9666,
            max_request: 64 * 1024,
        }
    }
}

/// `[engine]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub executable: String,
    pub args: Vec<String>,
    pub nice: Option<i32>,
    pub threads: usize,
    pub timeout: Duration,
    pub init: String,
    pub reset: String,
    pub poll_interval: Duration,
    pub watchdog: bool,
    /// Named transforms, in order
    pub sanitizers: Vec<String>,
    /// `PATTERN => REPLACEMENT` rules applied after the named transforms
    pub replacements: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            executable: pool.engine.path,
            args: pool.engine.args,
            nice: pool.engine.nice,
            threads: DEFAULT_POOL_SIZE,
            timeout: pool.timeout,
            init: pool.init_script,
            reset: pool.reset_command,
            poll_interval: pool.poll_interval,
            watchdog: pool.watchdog,
            sanitizers: pool.sanitizers,
            replacements: Vec::new(),
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub general: GeneralConfig,
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

impl Config {
    /// Load from the default search path.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::search_paths())
    }

    /// Default search path, lowest precedence first.
    pub fn search_paths() -> Vec<PathBuf> {
        Self::search_paths_in(dirs::home_dir().as_deref())
    }

    fn search_paths_in(home: Option<&Path>) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(SYSTEM_CONFIG_PATH), PathBuf::from(SYSTEM_RC_PATH)];
        if let Some(home) = home {
            paths.push(home.join(USER_CONFIG_NAME));
            paths.push(home.join(USER_RC_NAME));
        }
        paths
    }

    /// Overlay every existing file in `paths`, in order, onto the defaults.
    pub fn load_from(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        for path in paths.iter().filter(|p| p.exists()) {
            config.overlay_file(path)?;
        }
        Ok(config)
    }

    /// Load one explicitly named file; unlike the search path it must exist.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let mut config = Config::default();
        config.overlay_file(path)?;
        Ok(config)
    }

    /// Parse configuration text on top of the defaults.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.overlay(&Ini::load_from_str(content)?)?;
        Ok(config)
    }

    fn overlay_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.overlay(&ini)
    }

    /// Apply the keys present in `ini`; absent keys keep their value.
    pub fn overlay(&mut self, ini: &Ini) -> Result<(), ConfigError> {
        if let Some(section) = ini.section(Some("general")) {
            if let Some(v) = non_empty(section, "log_level") {
                self.general.log_level = v.to_string();
            }
            if let Some(v) = non_empty(section, "log_file") {
                self.general.log_file = Some(PathBuf::from(v));
            }
            if let Some(v) = non_empty(section, "pid_file") {
                self.general.pid_file = Some(PathBuf::from(v));
            }
        }

        if let Some(section) = ini.section(Some("server")) {
            if let Some(v) = non_empty(section, "address") {
                self.server.address = v.to_string();
            }
            if let Some(v) = section.get("port") {
                self.server.port = parse_number("server", "port", v, "must be a port number")?;
            }
            if let Some(v) = section.get("max_request") {
                self.server.max_request = positive("server", "max_request", v)?;
            }
        }

        if let Some(section) = ini.section(Some("engine")) {
            if let Some(v) = non_empty(section, "executable") {
                self.engine.executable = v.to_string();
            }
            if let Some(v) = section.get("args") {
                self.engine.args = v.split_whitespace().map(str::to_string).collect();
            }
            if let Some(v) = section.get("nice") {
                let v = v.trim();
                self.engine.nice = if v.is_empty() {
                    None
                } else {
                    Some(parse_number("engine", "nice", v, "must be an integer")?)
                };
            }
            if let Some(v) = section.get("threads") {
                self.engine.threads = positive("engine", "threads", v)?;
            }
            if let Some(v) = section.get("timeout") {
                self.engine.timeout = Duration::from_secs(positive("engine", "timeout", v)? as u64);
            }
            if let Some(v) = section.get("init") {
                self.engine.init = v.to_string();
            }
            if let Some(v) = section.get("reset") {
                self.engine.reset = v.to_string();
            }
            if let Some(v) = section.get("poll_ms") {
                self.engine.poll_interval =
                    Duration::from_millis(positive("engine", "poll_ms", v)? as u64);
            }
            if let Some(v) = section.get("watchdog") {
                self.engine.watchdog = parse_bool("engine", "watchdog", v)?;
            }
            if let Some(v) = section.get("sanitizers") {
                let names: Vec<String> = v.split_whitespace().map(str::to_string).collect();
                RequestSanitizer::from_entries(&names)
                    .map_err(|e| invalid("engine", "sanitizers", v, &e.to_string()))?;
                self.engine.sanitizers = names;
            }
            let rules: Vec<&str> = section.get_all("replace").collect();
            if !rules.is_empty() {
                for rule in &rules {
                    ReplacePattern::parse(rule)
                        .map_err(|e| invalid("engine", "replace", rule, &e.to_string()))?;
                }
                self.engine.replacements = rules.iter().map(|r| r.to_string()).collect();
            }
        }

        Ok(())
    }

    /// Address the listener binds to.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.address, self.server.port)
    }

    /// The part of the configuration the worker pool consumes.
    pub fn pool_config(&self) -> PoolConfig {
        let mut engine = EngineCommand::new(&self.engine.executable);
        for arg in &self.engine.args {
            engine = engine.arg(arg);
        }
        if let Some(nice) = self.engine.nice {
            engine = engine.nice(nice);
        }

        PoolConfig {
            engine,
            pool_size: self.engine.threads,
            timeout: self.engine.timeout,
            init_script: self.engine.init.clone(),
            reset_command: self.engine.reset.clone(),
            poll_interval: self.engine.poll_interval,
            watchdog: self.engine.watchdog,
            sanitizers: self
                .engine
                .sanitizers
                .iter()
                .cloned()
                .chain(
                    self.engine
                        .replacements
                        .iter()
                        .map(|rule| format!("{}{}", REPLACE_PREFIX, rule)),
                )
                .collect(),
        }
    }
}

fn non_empty<'a>(section: &'a Properties, key: &str) -> Option<&'a str> {
    section.get(key).map(str::trim).filter(|v| !v.is_empty())
}

fn invalid(section: &str, key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(
    section: &str,
    key: &str,
    value: &str,
    reason: &str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(section, key, value, reason))
}

fn positive(section: &str, key: &str, value: &str) -> Result<usize, ConfigError> {
    match parse_number::<usize>(section, key, value, "must be a positive integer")? {
        0 => Err(invalid(section, key, value, "must be a positive integer")),
        n => Ok(n),
    }
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(section, key, value, "must be true or false")),
    }
}
