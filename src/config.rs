use crate::auth::UserPass;
use crate::error::{Error, Result};
use crate::protocol::AuthMethod;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

/// Default time allowed for opening an outbound connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle time after which the reaper evicts a session
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default period between reaper sweeps
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// TargetId names a routing target: an upstream route or a listener. Sessions
/// are created against a target, which supplies their endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target-{}", self.0)
    }
}

/// ProxyProtocol is the protocol an endpoint speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyProtocol {
    #[default]
    Socks5,
    Http,
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProtocol::Socks5 => f.write_str("socks5"),
            ProxyProtocol::Http => f.write_str("http"),
        }
    }
}

/// Endpoint is an upstream proxy or a listener. Sessions share it through an
/// Arc and never mutate it
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub addr: SocketAddrV4,
    pub protocol: ProxyProtocol,
    pub auth: Option<UserPass>,
    pub connect_timeout: Duration,
    /// 0 means unlimited
    pub max_connections: u32,
}

/// Endpoint implementation block
impl Endpoint {
    /// new is a constructor for a SOCKS5 endpoint without authentication
    pub fn new(addr: SocketAddrV4) -> Self {
        Self {
            addr,
            protocol: ProxyProtocol::Socks5,
            auth: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_connections: 0,
        }
    }

    /// with_auth applies the desired authentication
    pub fn with_auth(mut self, auth: Option<UserPass>) -> Self {
        self.auth = auth;
        self
    }

    /// with_protocol sets the protocol variant
    pub fn with_protocol(mut self, protocol: ProxyProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// with_max_connections caps concurrent sessions on a target using this endpoint
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// with_connect_timeout sets the outbound connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// auth_method is username/password when credentials are configured
    pub fn auth_method(&self) -> AuthMethod {
        match self.auth {
            Some(_) => AuthMethod::UserPass,
            None => AuthMethod::NoAuth,
        }
    }

    /// requires_auth tells a listener to insist on username/password
    pub fn requires_auth(&self) -> bool {
        self.auth.is_some()
    }

    /// validate rejects endpoints that cannot be used
    pub fn validate(&self) -> Result<()> {
        if self.addr.port() == 0 {
            return Err(Error::config(format!("endpoint {} has no port", self.addr)));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config(format!("endpoint {} has no connect timeout", self.addr)));
        }
        if let Some(auth) = &self.auth {
            auth.validate()?;
        }
        Ok(())
    }
}

/// RelayConfig holds settings shared by every session in a table
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Idle timeout; Duration::ZERO disables reaping
    pub session_timeout: Duration,
    pub reap_interval: Duration,
    pub enable_pooling: bool,
    /// Used by targets enabled without an explicit endpoint
    pub default_endpoint: Option<Arc<Endpoint>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            enable_pooling: true,
            default_endpoint: None,
        }
    }
}

/// RelayConfig implementation block
impl RelayConfig {
    /// validate checks the reaper period and the default endpoint
    pub fn validate(&self) -> Result<()> {
        if self.reap_interval.is_zero() {
            return Err(Error::config("reap interval must be non-zero"));
        }
        if let Some(endpoint) = &self.default_endpoint {
            endpoint.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults() {
        let endpoint = Endpoint::new("10.0.0.1:1080".parse().unwrap());
        assert_eq!(endpoint.protocol, ProxyProtocol::Socks5);
        assert_eq!(endpoint.auth_method(), AuthMethod::NoAuth);
        assert_eq!(endpoint.max_connections, 0);
        assert!(endpoint.validate().is_ok());
    }

    #[test]
    fn endpoint_with_credentials_requires_auth() {
        let endpoint = Endpoint::new("10.0.0.1:1080".parse().unwrap())
            .with_auth(Some(UserPass::new("alice", "wonder")));
        assert!(endpoint.requires_auth());
        assert_eq!(endpoint.auth_method(), AuthMethod::UserPass);
    }

    #[test]
    fn endpoint_without_port_is_invalid() {
        let endpoint = Endpoint::new("10.0.0.1:0".parse().unwrap());
        assert!(matches!(endpoint.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn endpoint_connect_timeout() {
        let endpoint = Endpoint::new("10.0.0.1:1080".parse().unwrap());
        assert_eq!(endpoint.connect_timeout, DEFAULT_CONNECT_TIMEOUT);

        let endpoint = endpoint.with_connect_timeout(Duration::from_secs(3));
        assert_eq!(endpoint.connect_timeout, Duration::from_secs(3));
        assert!(endpoint.validate().is_ok());

        let endpoint = endpoint.with_connect_timeout(Duration::ZERO);
        assert!(matches!(endpoint.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn relay_config_rejects_zero_interval() {
        let config = RelayConfig {
            reap_interval: Duration::ZERO,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(RelayConfig::default().validate().is_ok());
    }
}
