use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::VeilError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub bind_addr: IpAddr,
    /// When set, port allocation starts here and walks forward on bind
    /// failure; when unset the OS assigns an ephemeral port.
    pub preferred_port: Option<u16>,
    pub bind_attempts: u32,
    /// Root CA material lives here, shared by every session in the
    /// process and across restarts.
    pub data_dir: PathBuf,
    pub upstream: UpstreamConfig,
    pub matcher: MatcherConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub verify_upstream_tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatcherConfig {
    /// How long a pending page request may wait for a socket-level
    /// resource before it is retired as "not observed" (cache hit).
    pub pending_window: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([127, 0, 0, 1]),
            preferred_port: None,
            bind_attempts: 3,
            data_dir: PathBuf::from("./veil-data"),
            upstream: UpstreamConfig::default(),
            matcher: MatcherConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            verify_upstream_tls: true,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            pending_window: Duration::from_secs(5),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), VeilError> {
        if self.bind_attempts == 0 {
            return Err(VeilError::InvalidConfig(
                "bind_attempts must be greater than zero".to_string(),
            ));
        }
        if self.upstream.connect_timeout.is_zero() {
            return Err(VeilError::InvalidConfig(
                "upstream.connect_timeout must be greater than zero".to_string(),
            ));
        }
        if self.upstream.idle_timeout.is_zero() {
            return Err(VeilError::InvalidConfig(
                "upstream.idle_timeout must be greater than zero".to_string(),
            ));
        }
        if self.matcher.pending_window.is_zero() {
            return Err(VeilError::InvalidConfig(
                "matcher.pending_window must be greater than zero".to_string(),
            ));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(VeilError::InvalidConfig(
                "data_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
