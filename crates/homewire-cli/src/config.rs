//! Daemon configuration – reads `~/.homewire/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use homewire_server::{ServeMode, ServerConfig};
use homewire_types::{DEFAULT_AUTH_TOKEN, HubError};
use serde::{Deserialize, Serialize};

/// Persisted daemon configuration.  Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Interface to listen on.
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Serve the device routing hub instead of launching processes.
    #[serde(default)]
    pub hub: bool,

    /// Program launched for every connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Directory of scripts selected by request path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_dir: Option<PathBuf>,

    /// Concurrent child processes allowed (`0` = unlimited).
    #[serde(default)]
    pub max_forks: usize,

    /// Variables copied from the daemon's environment into every child.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pass_env: Vec<String>,

    /// Milliseconds a child may take to exit after its stdin closes.
    #[serde(default = "default_close_ms")]
    pub close_ms: u64,

    /// Token returned to `auth` requests in hub mode.
    #[serde(default = "default_auth_token")]
    pub auth_token: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    homewire_server::DEFAULT_PORT
}
fn default_close_ms() -> u64 {
    100
}
fn default_auth_token() -> String {
    DEFAULT_AUTH_TOKEN.to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            hub: false,
            command: None,
            args: Vec::new(),
            script_dir: None,
            max_forks: 0,
            pass_env: Vec::new(),
            close_ms: default_close_ms(),
            auth_token: default_auth_token(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Check the serving mode and build the server's settings.
    ///
    /// # Errors
    ///
    /// [`HubError::Config`] unless exactly one of `hub`, `command` and
    /// `script_dir` is set, or when the script directory is not a directory.
    pub fn server_config(&self) -> Result<ServerConfig, HubError> {
        let selected = [self.hub, self.command.is_some(), self.script_dir.is_some()]
            .iter()
            .filter(|&&on| on)
            .count();
        if selected != 1 {
            return Err(HubError::Config(
                "select exactly one of --hub, --dir DIR or COMMAND".to_string(),
            ));
        }

        let mode = if self.hub {
            ServeMode::Hub {
                auth_token: self.auth_token.clone(),
            }
        } else if let Some(program) = &self.command {
            ServeMode::Command {
                program: program.clone(),
                args: self.args.clone(),
            }
        } else if let Some(dir) = &self.script_dir {
            if !dir.is_dir() {
                return Err(HubError::Config(format!("{} is not a directory", dir.display())));
            }
            ServeMode::ScriptDir {
                dir: dir.clone(),
                args: self.args.clone(),
            }
        } else {
            return Err(HubError::Config("no serving mode selected".to_string()));
        };

        Ok(ServerConfig {
            address: self.address.clone(),
            port: self.port,
            mode,
            max_forks: self.max_forks,
            pass_env: self.pass_env.clone(),
            close_grace: Duration::from_millis(self.close_ms),
        })
    }
}

/// Return the path to `~/.homewire/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".homewire").join("config.toml")
}

/// Load `path` (defaults when absent) and apply `HOMEWIRE_*` overrides.
pub fn load(path: &Path) -> Result<Config, HubError> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, HubError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| HubError::Config(format!("cannot read config at {}: {e}", path.display())))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| HubError::Config(format!("cannot parse config at {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `HOMEWIRE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `HOMEWIRE_ADDRESS` | `address` |
/// | `HOMEWIRE_PORT` | `port` |
/// | `HOMEWIRE_HUB` | `hub` (`1` / `true`) |
/// | `HOMEWIRE_SCRIPT_DIR` | `script_dir` |
/// | `HOMEWIRE_MAX_FORKS` | `max_forks` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |name| std::env::var(name).ok());
}

pub(crate) fn apply_overrides_from(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("HOMEWIRE_ADDRESS") {
        cfg.address = v;
    }
    if let Some(v) = var("HOMEWIRE_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.port = port;
    }
    if let Some(v) = var("HOMEWIRE_HUB") {
        cfg.hub = matches!(v.as_str(), "1" | "true");
    }
    if let Some(v) = var("HOMEWIRE_SCRIPT_DIR") {
        cfg.script_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = var("HOMEWIRE_MAX_FORKS")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.max_forks = n;
    }
}
