//! Server identity and role

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Default Redis port when an endpoint string omits one
pub const DEFAULT_PORT: u16 = 6379;

/// Default Sentinel port
pub const DEFAULT_SENTINEL_PORT: u16 = 26379;

/// Server identity (`host:port`), the key used to match a server across
/// discovery rounds
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// The "unknown" endpoint
    pub const EMPTY: Endpoint = Endpoint {
        host: String::new(),
        port: 0,
    };

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = if host.eq_ignore_ascii_case("localhost") {
            "127.0.0.1".to_string()
        } else {
            host
        };
        Self { host, port }
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.host.is_empty() && self.port == 0
    }

    /// Build from separate ip / port tokens as they appear in sentinel
    /// messages and INFO output
    pub fn from_parts(host: &str, port: &str) -> Option<Self> {
        let host = host.trim();
        if host.is_empty() {
            return None;
        }
        let port = port.trim().parse::<u16>().ok()?;
        Some(Self::new(host, port))
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::EMPTY
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

impl FromStr for Endpoint {
    type Err = Error;

    /// Parses `host`, `host:port` or `[ipv6]:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidEndpoint(s.to_string()));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::InvalidEndpoint(s.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .map_err(|_| Error::InvalidEndpoint(s.to_string()))?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(Error::InvalidEndpoint(s.to_string())),
            };
            return Ok(Self::new(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                if host.is_empty() {
                    return Err(Error::InvalidEndpoint(s.to_string()));
                }
                let port = port
                    .parse()
                    .map_err(|_| Error::InvalidEndpoint(s.to_string()))?;
                Ok(Self::new(host, port))
            }
            // bare IPv6 address without brackets
            Some(_) => Ok(Self::new(s, DEFAULT_PORT)),
            None => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

/// Role a server plays in the deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Role {
    #[default]
    Undefined = 0,
    Master = 1,
    Slave = 2,
    Sentinel = 3,
    Any = 4,
}

impl Role {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Master,
            2 => Self::Slave,
            3 => Self::Sentinel,
            4 => Self::Any,
            _ => Self::Undefined,
        }
    }

    /// Parse the role names used by ROLE / INFO replies
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Self::Master,
            "slave" | "replica" => Self::Slave,
            "sentinel" => Self::Sentinel,
            _ => Self::Undefined,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Master => "master",
            Self::Slave => "slave",
            Self::Sentinel => "sentinel",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let ep: Endpoint = "10.0.0.1:6380".parse().unwrap();
        assert_eq!(ep.host(), "10.0.0.1");
        assert_eq!(ep.port(), 6380);

        let ep: Endpoint = "redis-a".parse().unwrap();
        assert_eq!(ep, Endpoint::new("redis-a", DEFAULT_PORT));

        let ep: Endpoint = "[::1]:26379".parse().unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.to_string(), "[::1]:26379");

        assert!("host:notaport".parse::<Endpoint>().is_err());
        assert!("".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_localhost_normalized() {
        assert_eq!(
            Endpoint::new("localhost", 6379),
            Endpoint::new("127.0.0.1", 6379)
        );
    }

    #[test]
    fn test_empty_endpoint() {
        assert!(Endpoint::EMPTY.is_empty());
        assert!(Endpoint::default().is_empty());
        assert!(!Endpoint::new("127.0.0.1", 6379).is_empty());
        assert_eq!(Endpoint::from_parts("", "6379"), None);
        assert_eq!(
            Endpoint::from_parts("127.0.0.1", "6380"),
            Some(Endpoint::new("127.0.0.1", 6380))
        );
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("master"), Role::Master);
        assert_eq!(Role::parse("Replica"), Role::Slave);
        assert_eq!(Role::parse("sentinel"), Role::Sentinel);
        assert_eq!(Role::parse("leader"), Role::Undefined);
        assert_eq!(Role::from_u8(Role::Slave as u8), Role::Slave);
    }
}
