//! Session configuration: a typed struct carrying the engine's knobs with
//! their defaults, plus the string-keyed `set`/`get` coercion surface used
//! by configuration files and the gateway CLI.

use crate::error::ConfigError;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendMode {
    Full,
    GapFill,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sender_comp_id: String,
    pub target_comp_id: String,
    pub heartbeat_interval: u64,
    pub login_wait_time: u64,
    pub connect_timeout: u64,
    pub reconnect_interval: u64,
    pub resend_mode: ResendMode,
    pub reset_seqno: bool,
    pub fix_version: String,
    pub message_store: Option<String>,
    pub store_sync: bool,
    pub state_path: Option<PathBuf>,
    pub watchdog_interval: u64,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            sender_comp_id: String::new(),
            target_comp_id: String::new(),
            heartbeat_interval: 30,
            login_wait_time: 30,
            connect_timeout: 30,
            reconnect_interval: 5,
            resend_mode: ResendMode::GapFill,
            reset_seqno: false,
            fix_version: "4.4".to_string(),
            message_store: None,
            store_sync: false,
            state_path: None,
            watchdog_interval: 0,
        }
    }
}

impl SessionConfig {
    /// Sets a configuration key from its string form, coercing to the typed
    /// field. Unknown keys are rejected.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "sender_comp_id" => self.sender_comp_id = value.to_string(),
            "target_comp_id" => self.target_comp_id = value.to_string(),
            "heartbeat_interval" => self.heartbeat_interval = value.parse().map_err(|_| invalid())?,
            "login_wait_time" => self.login_wait_time = value.parse().map_err(|_| invalid())?,
            "connect_timeout" => self.connect_timeout = value.parse().map_err(|_| invalid())?,
            "reconnect_interval" => {
                self.reconnect_interval = value.parse().map_err(|_| invalid())?
            }
            "watchdog_interval" => self.watchdog_interval = value.parse().map_err(|_| invalid())?,
            "resend_mode" => {
                self.resend_mode = match value {
                    "FULL" => ResendMode::Full,
                    "GAPFILL" => ResendMode::GapFill,
                    _ => return Err(invalid()),
                }
            }
            "reset_seqno" => {
                self.reset_seqno = match value {
                    "true" | "yes" | "1" | "Y" => true,
                    "false" | "no" | "0" | "N" => false,
                    _ => return Err(invalid()),
                }
            }
            "fixversion" => self.fix_version = value.to_string(),
            "message_store" => self.message_store = Some(value.to_string()),
            "store_sync" => {
                self.store_sync = match value {
                    "true" | "yes" | "1" | "Y" => true,
                    "false" | "no" | "0" | "N" => false,
                    _ => return Err(invalid()),
                }
            }
            "state_path" => self.state_path = Some(PathBuf::from(value)),
            _ => return Err(invalid()),
        }

        Ok(())
    }

    /// String form of a configuration key, `None` for unknown or unset.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "sender_comp_id" => Some(self.sender_comp_id.clone()),
            "target_comp_id" => Some(self.target_comp_id.clone()),
            "heartbeat_interval" => Some(self.heartbeat_interval.to_string()),
            "login_wait_time" => Some(self.login_wait_time.to_string()),
            "connect_timeout" => Some(self.connect_timeout.to_string()),
            "reconnect_interval" => Some(self.reconnect_interval.to_string()),
            "watchdog_interval" => Some(self.watchdog_secs().to_string()),
            "resend_mode" => Some(
                match self.resend_mode {
                    ResendMode::Full => "FULL",
                    ResendMode::GapFill => "GAPFILL",
                }
                .to_string(),
            ),
            "reset_seqno" => Some(self.reset_seqno.to_string()),
            "fixversion" => Some(self.fix_version.clone()),
            "message_store" => self.message_store.clone(),
            "store_sync" => Some(self.store_sync.to_string()),
            "state_path" => self
                .state_path
                .as_ref()
                .map(|path| path.display().to_string()),
            _ => None,
        }
    }

    /// The effective watchdog tick: explicit setting, or half the heartbeat
    /// interval with a one second floor.
    #[inline]
    pub fn watchdog_secs(&self) -> u64 {
        if self.watchdog_interval > 0 {
            self.watchdog_interval
        } else {
            (self.heartbeat_interval / 2).max(1)
        }
    }

    /// Checks the settings a session cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender_comp_id.is_empty() {
            return Err(ConfigError::Missing("sender_comp_id"));
        }
        if self.target_comp_id.is_empty() {
            return Err(ConfigError::Missing("target_comp_id"));
        }
        if self.heartbeat_interval == 0 {
            return Err(ConfigError::Missing("heartbeat_interval"));
        }
        Ok(())
    }
}

/// A parsed `[tls:]//<host>:<port>` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetUrl {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl NetUrl {
    /// Resolves the host/port pair to a socket address.
    pub fn resolve(&self) -> Result<SocketAddr, ConfigError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::BadUrl(format!("//{}:{}", self.host, self.port)))
    }
}

/// Parses `//host:port` (plain TCP) or `tls://host:port`.
pub fn parse_net_url(url: &str) -> Result<NetUrl, ConfigError> {
    let bad = || ConfigError::BadUrl(url.to_string());

    let (tls, rest) = if let Some(rest) = url.strip_prefix("tls://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("//") {
        (false, rest)
    } else {
        return Err(bad());
    };

    let colon = rest.rfind(':').ok_or_else(bad)?;
    let host = &rest[..colon];
    let port: u16 = rest[colon + 1..].parse().map_err(|_| bad())?;
    if host.is_empty() {
        return Err(bad());
    }

    Ok(NetUrl {
        host: host.to_string(),
        port,
        tls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();

        assert_eq!(config.login_wait_time, 30);
        assert_eq!(config.connect_timeout, 30);
        assert_eq!(config.reconnect_interval, 5);
        assert_eq!(config.resend_mode, ResendMode::GapFill);
        assert_eq!(config.fix_version, "4.4");
        assert!(!config.reset_seqno);
    }

    #[test]
    fn test_set_and_get_roundtrip() {
        let mut config = SessionConfig::default();

        config.set("sender_comp_id", "ASIDE").unwrap();
        config.set("target_comp_id", "BSIDE").unwrap();
        config.set("heartbeat_interval", "60").unwrap();
        config.set("resend_mode", "FULL").unwrap();
        config.set("reset_seqno", "true").unwrap();

        assert_eq!(config.get("sender_comp_id").unwrap(), "ASIDE");
        assert_eq!(config.heartbeat_interval, 60);
        assert_eq!(config.resend_mode, ResendMode::Full);
        assert!(config.reset_seqno);
        assert_eq!(config.get("nonsense"), None);
    }

    #[test]
    fn test_bad_values_rejected() {
        let mut config = SessionConfig::default();

        assert!(config.set("heartbeat_interval", "soon").is_err());
        assert!(config.set("resend_mode", "SOMETIMES").is_err());
        assert!(config.set("unknown_key", "x").is_err());
    }

    #[test]
    fn test_watchdog_derivation() {
        let mut config = SessionConfig::default();
        config.heartbeat_interval = 30;
        assert_eq!(config.watchdog_secs(), 15);

        config.heartbeat_interval = 1;
        assert_eq!(config.watchdog_secs(), 1);

        config.watchdog_interval = 7;
        assert_eq!(config.watchdog_secs(), 7);
    }

    #[test]
    fn test_validate_requires_identity() {
        let mut config = SessionConfig::default();
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::Missing("sender_comp_id")
        );

        config.sender_comp_id = "ASIDE".to_string();
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::Missing("target_comp_id")
        );

        config.target_comp_id = "BSIDE".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_net_url() {
        let url = parse_net_url("//localhost:2000").unwrap();
        assert_eq!(url.host, "localhost");
        assert_eq!(url.port, 2000);
        assert!(!url.tls);

        let url = parse_net_url("tls://fix.example.com:9443").unwrap();
        assert!(url.tls);
        assert_eq!(url.port, 9443);

        assert!(parse_net_url("localhost:2000").is_err());
        assert!(parse_net_url("//:2000").is_err());
        assert!(parse_net_url("//localhost").is_err());
        assert!(parse_net_url("//localhost:notaport").is_err());
    }

    #[test]
    fn test_resolve_loopback() {
        let url = parse_net_url("//127.0.0.1:2000").unwrap();
        let addr = url.resolve().unwrap();
        assert_eq!(addr.port(), 2000);
        assert!(addr.ip().is_loopback());
    }
}
