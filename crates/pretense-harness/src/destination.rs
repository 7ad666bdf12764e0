use std::fmt;

use crate::errors::HarnessError;

const DEFAULT_TLS_PORT: u16 = 443;

/// Original destination of an intercepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host`, `host:port`, `[v6]` or `[v6]:port`. The port defaults
    /// to 443.
    pub fn parse(raw: &str) -> Result<Self, HarnessError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(HarnessError::InvalidConfig(
                "destination must not be empty".to_string(),
            ));
        }

        if let Some(rest) = trimmed.strip_prefix('[') {
            let Some(closing_bracket) = rest.find(']') else {
                return Err(HarnessError::InvalidConfig(format!(
                    "invalid IPv6 destination format: '{raw}'"
                )));
            };
            let host = &rest[..closing_bracket];
            if host.is_empty() {
                return Err(HarnessError::InvalidConfig(format!(
                    "destination host must not be empty: '{raw}'"
                )));
            }
            let suffix = &rest[closing_bracket + 1..];
            let port = match suffix {
                "" => DEFAULT_TLS_PORT,
                _ => match suffix.strip_prefix(':') {
                    Some(port_raw) => parse_port(port_raw, raw)?,
                    None => {
                        return Err(HarnessError::InvalidConfig(format!(
                            "unexpected text after IPv6 destination: '{raw}'"
                        )));
                    }
                },
            };
            return Ok(Self::new(host, port));
        }

        let (host, port) = match trimmed.rsplit_once(':') {
            Some((host, _)) if host.contains(':') => {
                return Err(HarnessError::InvalidConfig(format!(
                    "IPv6 destinations must use bracket form [::1]:443, got '{raw}'"
                )));
            }
            Some((host, port_raw)) => (host, parse_port(port_raw, raw)?),
            None => (trimmed, DEFAULT_TLS_PORT),
        };
        if host.is_empty() {
            return Err(HarnessError::InvalidConfig(format!(
                "destination host must not be empty: '{raw}'"
            )));
        }
        Ok(Self::new(host, port))
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn socket_target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_target())
    }
}

fn parse_port(raw: &str, destination: &str) -> Result<u16, HarnessError> {
    let port = raw.parse::<u16>().map_err(|error| {
        HarnessError::InvalidConfig(format!(
            "invalid destination port in '{destination}': {error}"
        ))
    })?;
    if port == 0 {
        return Err(HarnessError::InvalidConfig(format!(
            "destination port must be greater than zero: '{destination}'"
        )));
    }
    Ok(port)
}
