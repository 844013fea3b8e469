//! Tunnel configuration.
//!
//! A [`TunnelConfig`] is built once per process (from a builder, a TOML
//! file, or the environment) and handed to every connection as an
//! `Arc<TunnelConfig>`. Nothing below the listeners looks configuration up
//! ambiently.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::constants::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_IDLE_TIMEOUT};
use super::error::ConfigError;
use crate::crypto::Secret;

/// Which end of the tunnel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Local SOCKS5 endpoint that tunnels to a server.
    Client,
    /// Remote endpoint that terminates the tunnel.
    Server,
}

impl std::str::FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "server" => Ok(Role::Server),
            other => Err(ConfigError::Invalid(format!("unknown role {other:?}"))),
        }
    }
}

/// Immutable process-wide configuration.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Client or server.
    pub role: Role,

    /// Local listen address (SOCKS5 for clients, tunnel for servers).
    pub bind_addr: SocketAddr,

    /// Tunnel peer (client only). Always the first hop.
    pub server_addr: Option<SocketAddr>,

    /// Configured hop chain after the implicit tunnel peer.
    pub hops: Vec<SocketAddr>,

    /// Shared secret.
    pub secret: Secret,

    /// Bootstrap a per-connection IV on the first payload.
    pub use_iv: bool,

    /// Bound on the SOCKS5 handshake phase.
    pub handshake_timeout: Duration,

    /// Bound on inactivity once streaming.
    pub idle_timeout: Duration,

    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl TunnelConfig {
    /// Start a builder for the given role.
    pub fn builder(role: Role) -> TunnelConfigBuilder {
        TunnelConfigBuilder::new(role)
    }

    /// Whether this process terminates the tunnel.
    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// Hop chain with the implicit tunnel peer prepended (client role).
    pub fn effective_hops(&self) -> Vec<SocketAddr> {
        match (self.role, self.server_addr) {
            (Role::Client, Some(server)) => {
                let mut hops = Vec::with_capacity(self.hops.len() + 1);
                hops.push(server);
                hops.extend_from_slice(&self.hops);
                hops
            }
            _ => self.hops.clone(),
        }
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::Invalid("secret must not be empty".into()));
        }
        if self.role == Role::Client && self.server_addr.is_none() {
            return Err(ConfigError::Invalid(
                "client role requires a server address".into(),
            ));
        }
        if self.handshake_timeout.is_zero() || self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(input)?;
        file.into_config()
    }

    /// Load and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load from `SOCKSTUN_*` environment variables.
    ///
    /// - `SOCKSTUN_MODE`: `client` or `server`
    /// - `SOCKSTUN_BIND`: listen address
    /// - `SOCKSTUN_SERVER`: tunnel peer (client only)
    /// - `SOCKSTUN_SECRET`: shared secret
    /// - `SOCKSTUN_USE_IV`: `true`/`false` (default `true`)
    /// - `SOCKSTUN_HOPS`: comma-separated extra hops
    /// - `SOCKSTUN_LOG`: default log filter
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let role: Role = lookup("SOCKSTUN_MODE")
            .ok_or_else(|| ConfigError::Invalid("SOCKSTUN_MODE is not set".into()))?
            .parse()?;

        let file = ConfigFile {
            role,
            bind: lookup("SOCKSTUN_BIND"),
            server: lookup("SOCKSTUN_SERVER"),
            hops: lookup("SOCKSTUN_HOPS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            secret: lookup("SOCKSTUN_SECRET").unwrap_or_default(),
            use_iv: lookup("SOCKSTUN_USE_IV")
                .map(|raw| parse_bool(&raw))
                .transpose()?,
            handshake_timeout_secs: None,
            idle_timeout_secs: None,
            log_level: lookup("SOCKSTUN_LOG"),
        };
        file.into_config()
    }
}

fn parse_bool(raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid(format!("expected a boolean, got {other:?}"))),
    }
}

fn parse_addr(value: &str) -> Result<SocketAddr, ConfigError> {
    value.trim().parse().map_err(|e: std::net::AddrParseError| ConfigError::Address {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// On-disk (TOML) representation of [`TunnelConfig`].
#[derive(Debug, Deserialize)]
struct ConfigFile {
    role: Role,
    bind: Option<String>,
    server: Option<String>,
    #[serde(default)]
    hops: Vec<String>,
    secret: String,
    use_iv: Option<bool>,
    handshake_timeout_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    log_level: Option<String>,
}

impl ConfigFile {
    fn into_config(self) -> Result<TunnelConfig, ConfigError> {
        let mut builder = TunnelConfigBuilder::new(self.role).secret(self.secret.into_bytes());

        if let Some(bind) = self.bind {
            builder = builder.bind_addr(parse_addr(&bind)?);
        }
        if let Some(server) = self.server {
            builder = builder.server_addr(parse_addr(&server)?);
        }
        for hop in &self.hops {
            builder = builder.hop(parse_addr(hop)?);
        }
        if let Some(use_iv) = self.use_iv {
            builder = builder.use_iv(use_iv);
        }
        if let Some(secs) = self.handshake_timeout_secs {
            builder = builder.handshake_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.idle_timeout_secs {
            builder = builder.idle_timeout(Duration::from_secs(secs));
        }
        if let Some(level) = self.log_level {
            builder = builder.log_level(level);
        }

        builder.build()
    }
}

/// Builder for [`TunnelConfig`].
#[derive(Debug)]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
}

impl TunnelConfigBuilder {
    /// Create a builder with defaults for the role.
    pub fn new(role: Role) -> Self {
        let bind_addr = match role {
            Role::Client => SocketAddr::from(([127, 0, 0, 1], 1080)),
            Role::Server => SocketAddr::from(([0, 0, 0, 0], 1081)),
        };
        Self {
            config: TunnelConfig {
                role,
                bind_addr,
                server_addr: None,
                hops: Vec::new(),
                secret: Secret::new(Vec::new()),
                use_iv: true,
                handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
                idle_timeout: DEFAULT_IDLE_TIMEOUT,
                log_level: "info".into(),
            },
        }
    }

    /// Set the listen address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the tunnel peer.
    pub fn server_addr(mut self, addr: SocketAddr) -> Self {
        self.config.server_addr = Some(addr);
        self
    }

    /// Append a hop to the chain.
    pub fn hop(mut self, addr: SocketAddr) -> Self {
        self.config.hops.push(addr);
        self
    }

    /// Set the shared secret.
    pub fn secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.config.secret = Secret::new(secret.into());
        self
    }

    /// Enable or disable IV bootstrap.
    pub fn use_iv(mut self, enabled: bool) -> Self {
        self.config.use_iv = enabled;
        self
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the default log filter.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<TunnelConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_client_prepends_tunnel_peer() {
        let config = TunnelConfig::builder(Role::Client)
            .server_addr("10.0.0.1:1081".parse().unwrap())
            .hop("10.0.0.2:1081".parse().unwrap())
            .secret("k")
            .build()
            .unwrap();

        let hops = config.effective_hops();
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0], "10.0.0.1:1081".parse().unwrap());
        assert_eq!(hops[1], "10.0.0.2:1081".parse().unwrap());
        assert!(!config.is_server());
    }

    #[test]
    fn test_server_hops_unchanged() {
        let config = TunnelConfig::builder(Role::Server)
            .secret("k")
            .build()
            .unwrap();
        assert!(config.effective_hops().is_empty());
        assert!(config.is_server());
        assert!(config.use_iv);
    }

    #[test]
    fn test_validation() {
        assert!(TunnelConfig::builder(Role::Server).build().is_err());
        assert!(TunnelConfig::builder(Role::Client).secret("k").build().is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = TunnelConfig::from_toml_str(
            r#"
            role = "client"
            bind = "127.0.0.1:2080"
            server = "192.0.2.1:1081"
            secret = "K"
            use_iv = false
            idle_timeout_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.role, Role::Client);
        assert_eq!(config.bind_addr, "127.0.0.1:2080".parse().unwrap());
        assert!(!config.use_iv);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.secret.as_bytes(), b"K");
    }

    #[test]
    fn test_from_toml_bad_address() {
        let err = TunnelConfig::from_toml_str(
            r#"
            role = "server"
            bind = "not-an-address"
            secret = "K"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Address { .. }));
    }

    #[test]
    fn test_from_env_lookup() {
        let vars: HashMap<&str, &str> = [
            ("SOCKSTUN_MODE", "server"),
            ("SOCKSTUN_BIND", "0.0.0.0:9000"),
            ("SOCKSTUN_SECRET", "secret"),
            ("SOCKSTUN_USE_IV", "off"),
        ]
        .into_iter()
        .collect();

        let config = TunnelConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert!(config.is_server());
        assert_eq!(config.bind_addr.port(), 9000);
        assert!(!config.use_iv);
    }

    #[test]
    fn test_secret_redacted_in_debug() {
        let config = TunnelConfig::builder(Role::Server)
            .secret("hunter2")
            .build()
            .unwrap();
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
