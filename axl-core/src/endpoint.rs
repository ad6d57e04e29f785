//! Node addressing.
//!
//! Discovery endpoints are configured as `"host"` or `"host:port"`. A missing
//! port falls back to [`DEFAULT_PORT`]. IPv6 literals must be bracketed when a
//! port is given (`"[::1]:8111"`); a bare IPv6 literal is taken as a host.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AxlError, Result};

/// Port used when a discovery endpoint omits one
pub const DEFAULT_PORT: u16 = 8111;

/// A `(host, port)` pair identifying one node or seed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `"host"` or `"host:port"`
    ///
    /// # Errors
    /// Returns [`AxlError::InvalidEndpoint`] for an empty host or a port that is
    /// not a valid non-zero `u16`.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid(input, "empty endpoint"));
        }

        // Bracketed IPv6, with or without port
        if let Some(rest) = trimmed.strip_prefix('[') {
            let Some((host, tail)) = rest.split_once(']') else {
                return Err(invalid(input, "unterminated '['"));
            };
            if host.is_empty() {
                return Err(invalid(input, "empty host"));
            }
            return match tail {
                "" => Ok(Self::new(host, DEFAULT_PORT)),
                _ => match tail.strip_prefix(':') {
                    Some(port) => Ok(Self::new(host, parse_port(input, port)?)),
                    None => Err(invalid(input, "unexpected characters after ']'")),
                },
            };
        }

        match trimmed.matches(':').count() {
            0 => Ok(Self::new(trimmed, DEFAULT_PORT)),
            1 => {
                let (host, port) = trimmed
                    .split_once(':')
                    .ok_or_else(|| invalid(input, "malformed host:port"))?;
                if host.is_empty() {
                    return Err(invalid(input, "empty host"));
                }
                Ok(Self::new(host, parse_port(input, port)?))
            },
            // Bare IPv6 literal
            _ => Ok(Self::new(trimmed, DEFAULT_PORT)),
        }
    }
}

fn parse_port(input: &str, port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) => Err(invalid(input, "port must be non-zero")),
        Ok(p) => Ok(p),
        Err(e) => Err(invalid(input, &format!("invalid port '{}': {}", port, e))),
    }
}

fn invalid(input: &str, reason: &str) -> AxlError {
    AxlError::InvalidEndpoint {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

impl FromStr for Endpoint {
    type Err = AxlError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse a list of discovery endpoints, failing on the first invalid entry
///
/// # Errors
/// Returns the first [`AxlError::InvalidEndpoint`] encountered.
pub fn parse_endpoints<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<Endpoint>> {
    inputs.iter().map(|s| Endpoint::parse(s.as_ref())).collect()
}
