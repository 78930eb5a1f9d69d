use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::ClientConfig;

use crate::error::{DriverError, DriverResult};

pub const DEFAULT_PORT: u16 = 28015;

/// A server address, `name:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub port: u16,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.contains(':') {
            write!(f, "[{}]:{}", self.name, self.port)
        } else {
            write!(f, "{}:{}", self.name, self.port)
        }
    }
}

impl FromStr for Host {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DriverError::InvalidConfig("empty address".to_string()));
        }

        // [v6]:port
        if let Some(rest) = s.strip_prefix('[') {
            let (name, tail) = rest
                .split_once(']')
                .ok_or_else(|| DriverError::InvalidConfig(format!("invalid address {}", s)))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(s, port)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(DriverError::InvalidConfig(format!("invalid address {}", s))),
            };
            return Ok(Host::new(name, port));
        }

        match s.rsplit_once(':') {
            // bare v6 address without brackets
            Some((name, _)) if name.contains(':') => Ok(Host::new(s, DEFAULT_PORT)),
            Some((name, port)) => Ok(Host::new(name, parse_port(s, port)?)),
            None => Ok(Host::new(s, DEFAULT_PORT)),
        }
    }
}

fn parse_port(addr: &str, port: &str) -> DriverResult<u16> {
    port.parse()
        .map_err(|_| DriverError::InvalidConfig(format!("invalid port in address {}", addr)))
}

/// Handshake flavour used when opening a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HandshakeVersion {
    /// Auth key prelude
    #[serde(rename = "0.4")]
    V0_4,
    /// SCRAM-SHA-256
    #[default]
    #[serde(rename = "1")]
    V1_0,
}

/// Options for establishing a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOpts {
    /// Single seed address
    pub address: Option<String>,
    /// Additional seed addresses
    pub addresses: Vec<String>,
    /// Default database for queries that do not name one
    pub database: Option<String>,

    pub username: String,
    pub password: String,
    /// Used by the legacy handshake only
    pub auth_key: String,
    pub handshake_version: HandshakeVersion,

    /// Dial timeout
    pub timeout: Option<Duration>,
    /// Deadline for a reply when the caller's context has none
    pub read_timeout: Option<Duration>,
    /// Bound on each socket write
    pub write_timeout: Option<Duration>,
    pub keep_alive_period: Duration,

    #[serde(skip)]
    pub tls_config: Option<Arc<ClientConfig>>,

    pub initial_cap: usize,
    /// Connections per node
    pub max_open: usize,
    /// Attempts per query across nodes on connection errors
    pub num_retries: usize,

    /// Follow the server status changefeed to learn about other nodes
    pub discover_hosts: bool,
    /// Window after which host pool observations stop counting
    pub host_decay_duration: Duration,
    /// Probability of picking a random host instead of the best one
    pub host_pool_epsilon: f64,

    /// Hand numbers to callers with every digit the server sent
    pub use_json_number: bool,
    /// Run every query inside a tracing span
    pub use_opentracing: bool,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            address: None,
            addresses: Vec::new(),
            database: None,
            username: "admin".to_string(),
            password: String::new(),
            auth_key: String::new(),
            handshake_version: HandshakeVersion::default(),
            timeout: None,
            read_timeout: None,
            write_timeout: None,
            keep_alive_period: Duration::from_secs(30),
            tls_config: None,
            initial_cap: 0,
            max_open: 1,
            num_retries: 3,
            discover_hosts: false,
            host_decay_duration: Duration::from_secs(5 * 60),
            host_pool_epsilon: 0.1,
            use_json_number: false,
            use_opentracing: false,
        }
    }
}

impl ConnectOpts {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }

    /// Seed hosts from `address` and `addresses`, duplicates removed
    pub fn seeds(&self) -> DriverResult<Vec<Host>> {
        let mut hosts: Vec<Host> = Vec::new();
        for addr in self.address.iter().chain(self.addresses.iter()) {
            let host: Host = addr.parse()?;
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }

        if hosts.is_empty() {
            return Err(DriverError::InvalidConfig(
                "at least one address is required".to_string(),
            ));
        }
        Ok(hosts)
    }

    /// Connections opened per node
    pub fn pool_size(&self) -> usize {
        if self.max_open > 0 {
            self.max_open
        } else {
            self.initial_cap.max(1)
        }
    }

    pub fn validate(&self) -> DriverResult<()> {
        self.seeds()?;
        if !(0.0..=1.0).contains(&self.host_pool_epsilon) {
            return Err(DriverError::InvalidConfig(format!(
                "host_pool_epsilon must be within [0, 1], got {}",
                self.host_pool_epsilon
            )));
        }
        if self.host_decay_duration.is_zero() {
            return Err(DriverError::InvalidConfig(
                "host_decay_duration must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
