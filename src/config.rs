use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::ini::Ini;

/// Configuration for the HTTP server.
///
/// All options come from an INI document (by convention `./config.ini`).
/// Only `server.port` and `server.address` are required reading for the
/// server; every other key falls back to its default when absent.
///
/// Recognized keys:
///
/// | key | default | meaning |
/// |-----|---------|---------|
/// | `server.port` | `8080` | listen port, must be >= 1024 |
/// | `server.address` | empty | IPv4 literal; empty binds 0.0.0.0 |
/// | `server.backlog` | `6` | listen backlog |
/// | `server.workers` | CPU count | worker pool size |
/// | `server.idle_timeout_ms` | `60000` | idle connection expiry |
/// | `log.path` | empty | log file; empty logs to stderr |
/// | `log.level` | `info` | trace/debug/info/warn/error |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen port. Must be >= 1024; the server refuses privileged ports.
    pub port: u16,
    /// Listen address. `0.0.0.0` accepts on every interface.
    pub address: Ipv4Addr,
    /// Listen backlog handed to `listen(2)`.
    pub backlog: i32,
    /// Number of worker threads. Defaults to the hardware thread count.
    pub workers: usize,
    /// Idle timeout in milliseconds after which a silent connection is
    /// expired.
    pub idle_timeout_ms: u64,
    /// Log file path; empty means stderr.
    pub log_path: String,
    /// Log level filter.
    pub log_level: log::LevelFilter,
}

impl ServerConfig {
    /// Builds a configuration from a parsed INI document.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when `server.port` is not an integer or is
    /// below 1024, when `server.address` is not an IPv4 literal, or when a
    /// numeric key holds a value that does not parse.
    pub fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = ini.get("server", "port") {
            let port: u16 = raw
                .parse()
                .map_err(|_| ConfigError::InvalidPort(raw.to_owned()))?;
            if port < 1024 {
                return Err(ConfigError::PrivilegedPort(port));
            }
            config.port = port;
        }

        match ini.get("server", "address") {
            None | Some("") => {}
            Some(raw) => {
                config.address = raw
                    .parse()
                    .map_err(|_| ConfigError::InvalidAddress(raw.to_owned()))?;
            }
        }

        if let Some(raw) = ini.get("server", "backlog") {
            config.backlog = parse_key("server.backlog", raw)?;
        }
        if let Some(raw) = ini.get("server", "workers") {
            config.workers = parse_key("server.workers", raw)?;
        }
        if let Some(raw) = ini.get("server", "idle_timeout_ms") {
            config.idle_timeout_ms = parse_key("server.idle_timeout_ms", raw)?;
        }

        if let Some(raw) = ini.get("log", "path") {
            config.log_path = raw.to_owned();
        }
        if let Some(raw) = ini.get("log", "level") {
            config.log_level = match raw {
                "trace" => log::LevelFilter::Trace,
                "debug" => log::LevelFilter::Debug,
                "info" => log::LevelFilter::Info,
                "warn" => log::LevelFilter::Warn,
                "error" => log::LevelFilter::Error,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "log.level",
                        value: other.to_owned(),
                    })
                }
            };
        }

        Ok(config)
    }

    /// Loads and validates `path` in one step.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::from_ini(&Ini::from_file(path)?)
    }

    /// The idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

fn parse_key<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_owned(),
    })
}

/// Default number of worker threads: the hardware thread count, floor 1.
fn default_workers() -> usize {
    num_cpus::get().max(1)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            address: Ipv4Addr::UNSPECIFIED,
            backlog: 6,
            workers: default_workers(),
            idle_timeout_ms: 60_000,
            log_path: String::new(),
            log_level: log::LevelFilter::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that the default configuration values are set correctly.
    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.address, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.backlog, 6);
        assert_eq!(config.workers, num_cpus::get().max(1));
        assert_eq!(config.idle_timeout(), Duration::from_millis(60_000));
    }

    /// Tests configuration loading from a full INI document.
    #[test]
    fn test_config_from_ini() {
        let ini = Ini::parse(
            "[server]\nport = 9000\naddress = 127.0.0.1\nbacklog = 16\n\
             workers = 4\nidle_timeout_ms = 250\n[log]\nlevel = debug\n",
        )
        .unwrap();
        let config = ServerConfig::from_ini(&ini).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.address, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(config.backlog, 16);
        assert_eq!(config.workers, 4);
        assert_eq!(config.idle_timeout_ms, 250);
        assert_eq!(config.log_level, log::LevelFilter::Debug);
    }

    /// Tests that an empty address means "bind every interface".
    #[test]
    fn test_empty_address_is_any() {
        let ini = Ini::parse("[server]\naddress =\n").unwrap();
        let config = ServerConfig::from_ini(&ini).unwrap();
        assert_eq!(config.address, Ipv4Addr::UNSPECIFIED);
    }

    /// Tests rejection of privileged and malformed values.
    #[test]
    fn test_config_rejections() {
        let ini = Ini::parse("[server]\nport = 80\n").unwrap();
        assert!(matches!(
            ServerConfig::from_ini(&ini),
            Err(ConfigError::PrivilegedPort(80))
        ));

        let ini = Ini::parse("[server]\nport = webscale\n").unwrap();
        assert!(matches!(
            ServerConfig::from_ini(&ini),
            Err(ConfigError::InvalidPort(_))
        ));

        let ini = Ini::parse("[server]\naddress = localhost\n").unwrap();
        assert!(matches!(
            ServerConfig::from_ini(&ini),
            Err(ConfigError::InvalidAddress(_))
        ));

        let ini = Ini::parse("[log]\nlevel = loud\n").unwrap();
        assert!(matches!(
            ServerConfig::from_ini(&ini),
            Err(ConfigError::InvalidValue { key: "log.level", .. })
        ));
    }
}
