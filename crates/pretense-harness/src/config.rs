use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use pretense_tls::FallbackAuthorityConfig;

use crate::destination::Destination;
use crate::errors::HarnessError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub bind: SocketAddr,
    pub destination: Destination,
    pub authority: FallbackAuthorityConfig,
    pub source: SourceConfig,
    pub timeouts: TimeoutConfig,
}

/// How the engine derives its default certificate for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Mint,
    Resign,
}

impl FromStr for SourceKind {
    type Err = HarnessError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mint" => Ok(Self::Mint),
            "resign" => Ok(Self::Resign),
            other => Err(HarnessError::InvalidConfig(format!(
                "source.kind must be mint or resign, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// `host:port` to fetch genuine certificates from instead of the
    /// destination itself.
    pub upstream: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub upstream_connect_timeout_ms: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8443)),
            destination: Destination::new("localhost", 443),
            authority: FallbackAuthorityConfig::default(),
            source: SourceConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Mint,
            upstream: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
            upstream_connect_timeout_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_connect_timeout_ms)
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.destination.host.trim().is_empty() {
            return Err(HarnessError::InvalidConfig(
                "destination.host must not be empty".to_string(),
            ));
        }
        if self.destination.port == 0 {
            return Err(HarnessError::InvalidConfig(
                "destination.port must be greater than zero".to_string(),
            ));
        }
        self.authority
            .validate()
            .map_err(|error| HarnessError::InvalidConfig(format!("authority: {error}")))?;
        if let Some(upstream) = &self.source.upstream {
            if self.source.kind != SourceKind::Resign {
                return Err(HarnessError::InvalidConfig(
                    "source.upstream is only used when source.kind is resign".to_string(),
                ));
            }
            Destination::parse(upstream)?;
        }
        if self.timeouts.handshake_timeout_ms == 0 {
            return Err(HarnessError::InvalidConfig(
                "timeouts.handshake_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.timeouts.idle_timeout_ms == 0 {
            return Err(HarnessError::InvalidConfig(
                "timeouts.idle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.timeouts.upstream_connect_timeout_ms == 0 {
            return Err(HarnessError::InvalidConfig(
                "timeouts.upstream_connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
