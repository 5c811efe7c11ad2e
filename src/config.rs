use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::mapping::{MappingError, MappingRule, PathMapper};

/// Port used by both sides when none is configured.
pub const DEFAULT_PORT: u16 = 7070;

/// Environment variable whose first field names the connecting host
/// (set by sshd for the login session).
pub const HOST_ENV_VAR: &str = "SSH_CLIENT";

/// Top-level config, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Executor host. Falls back to the `SSH_CLIENT` peer.
    pub host: Option<String>,
    /// Executor port.
    pub port: Option<u16>,
    /// Ordered prefix rules, client path → executor path.
    #[serde(default)]
    pub mapping: Vec<MappingRule>,
    /// Executor-side settings.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Executor section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: Option<SocketAddr>,
    /// Peers allowed to run commands without a token round trip.
    #[serde(default)]
    pub trusted: Vec<IpAddr>,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT))
    }
}

impl Config {
    /// Load config from a TOML file path. A missing file yields the defaults.
    ///
    /// Checks file permissions and warns if world-writable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Build the validated path mapper for this config.
    pub fn path_mapper(&self) -> Result<PathMapper, ConfigError> {
        PathMapper::new(self.mapping.clone()).map_err(ConfigError::InvalidMapping)
    }
}

/// Everything the client needs to reach the executor, resolved once at
/// startup.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub host: String,
    pub port: u16,
    pub mapper: Arc<PathMapper>,
}

impl ClientSettings {
    /// Combine file config, command-line overrides and the value of
    /// [`HOST_ENV_VAR`]. The caller reads the environment.
    pub fn resolve(
        config: &Config,
        host: Option<String>,
        port: Option<u16>,
        ssh_client: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let host = match host.or_else(|| config.host.clone()) {
            Some(host) => host,
            None => host_from_ssh_client(ssh_client)?,
        };
        Ok(Self {
            host,
            port: port.or(config.port).unwrap_or(DEFAULT_PORT),
            mapper: Arc::new(config.path_mapper()?),
        })
    }

    /// WebSocket URL of the executor's exec endpoint.
    pub fn endpoint_url(&self) -> String {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("ws://{}:{}/exec", host, self.port)
    }
}

/// Take the peer address from an `SSH_CLIENT` value (`"<ip> <port> <port>"`).
pub fn host_from_ssh_client(value: Option<&str>) -> Result<String, ConfigError> {
    value
        .and_then(|v| v.split_whitespace().next())
        .map(str::to_string)
        .ok_or(ConfigError::MissingHost)
}

/// Default config location: `$XDG_CONFIG_HOME/rexec/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("rexec").join("config.toml"))
}

/// Errors that can occur when loading or resolving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    InvalidMapping(MappingError),
    MissingHost,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::InvalidMapping(e) => write!(f, "Invalid path mapping: {}", e),
            Self::MissingHost => write!(
                f,
                "No host configured and environment variable \"{}\" is not set",
                HOST_ENV_VAR
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check file permissions on a config file and warn if world-writable.
///
/// The `trusted` list decides who may skip the token round trip, so anyone
/// able to edit the file controls who can run commands here.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_writable(mode) {
        tracing::warn!(
            "Config file {} is world-writable (mode {:o}). \
             Anyone can change its trusted peers -- consider restricting permissions to 644.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-writable bit set.
pub fn is_world_writable(mode: u32) -> bool {
    mode & 0o002 != 0
}
