//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::Timeouts;

/// Daemon configuration. File: `--config PATH`, else ~/.config/meshcall/config.toml, else
/// /etc/meshcall/config.toml.
/// Env overrides: MESHCALL_PORT, MESHCALL_DATABASE, MESHCALL_PROBE_INTERVAL, MESHCALL_LOG.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Signaling TCP port (default 10001). Also the port assumed for contact addresses.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Database file (default ~/.local/share/meshcall/db).
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Seconds between presence sweeps; 0 disables the prober.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Concurrent inbound connections; excess connections are closed on accept.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// tracing filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    mesh_core::SIGNALING_PORT
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_database_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/meshcall/db"),
        None => PathBuf::from("meshcall.db"),
    }
}
fn default_probe_interval() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    3000
}
fn default_read_timeout() -> u64 {
    10_000
}
fn default_write_timeout() -> u64 {
    3000
}
fn default_max_connections() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            database_path: default_database_path(),
            probe_interval_secs: default_probe_interval(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
            max_connections: default_max_connections(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            read: Duration::from_millis(self.read_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
        }
    }

    /// Listen address, `bind_address:port`.
    pub fn listen_addr(&self) -> String {
        if self.bind_address.contains(':') && !self.bind_address.starts_with('[') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        }
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        (self.probe_interval_secs > 0).then(|| Duration::from_secs(self.probe_interval_secs))
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(p) = get("MESHCALL_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.port = p;
        }
        if let Some(path) = get("MESHCALL_DATABASE").filter(|s| !s.is_empty()) {
            self.database_path = PathBuf::from(path);
        }
        if let Some(secs) = get("MESHCALL_PROBE_INTERVAL").and_then(|s| s.parse::<u64>().ok()) {
            self.probe_interval_secs = secs;
        }
        if let Some(level) = get("MESHCALL_LOG").filter(|s| !s.is_empty()) {
            self.log_level = level;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
/// An explicit path must exist; the default locations are optional.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshcall/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshcall/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c, Config::default());
        assert_eq!(c.port, 10001);
        assert_eq!(c.probe_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn partial_file() {
        let c: Config = toml::from_str("port = 20002\nprobe_interval_secs = 0\n").unwrap();
        assert_eq!(c.port, 20002);
        assert_eq!(c.probe_interval(), None);
        assert_eq!(c.max_connections, 64);
    }

    #[test]
    fn env_overrides() {
        let mut c = Config::default();
        c.apply_env(|k| match k {
            "MESHCALL_PORT" => Some("12000".into()),
            "MESHCALL_PROBE_INTERVAL" => Some("bogus".into()),
            "MESHCALL_DATABASE" => Some("/tmp/x.db".into()),
            _ => None,
        });
        assert_eq!(c.port, 12000);
        assert_eq!(c.probe_interval_secs, 30);
        assert_eq!(c.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(c.log_level, "info");
    }

    #[test]
    fn listen_addr_brackets_ipv6() {
        let mut c = Config::default();
        assert_eq!(c.listen_addr(), "0.0.0.0:10001");
        c.bind_address = "::".into();
        assert_eq!(c.listen_addr(), "[::]:10001");
    }

    #[test]
    fn explicit_missing_file_is_error() {
        let err = load(Some(Path::new("/nonexistent/meshcall.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
