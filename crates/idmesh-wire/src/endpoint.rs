//! Daemon endpoint addresses.
//!
//! The peer-routing daemon listens on either a TCP socket or a local unix
//! socket; both are written as a single string for configuration purposes:
//! `tcp:127.0.0.1:8585` or `unix:/run/idmesh/daemon.sock`. A bare
//! `host:port` is accepted as TCP shorthand.

use std::path::PathBuf;
use std::str::FromStr;

use crate::error::WireError;

/// Where to reach the peer-routing daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP `host:port`
    Tcp(String),
    /// Unix domain socket path
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(WireError::Invalid("unix socket path"));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        let addr = s.strip_prefix("tcp:").unwrap_or(s);
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or(WireError::Invalid("tcp address"))?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(WireError::Invalid("tcp address"));
        }
        Ok(Endpoint::Tcp(addr.to_string()))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let ep: Endpoint = "tcp:127.0.0.1:8585".parse().unwrap();
        assert_eq!(ep, Endpoint::Tcp("127.0.0.1:8585".to_string()));
    }

    #[test]
    fn test_parse_bare_host_port_as_tcp() {
        let ep: Endpoint = "localhost:4455".parse().unwrap();
        assert_eq!(ep, Endpoint::Tcp("localhost:4455".to_string()));
    }

    #[test]
    fn test_parse_unix() {
        let ep: Endpoint = "unix:/tmp/daemon.sock".parse().unwrap();
        assert_eq!(ep, Endpoint::Unix(PathBuf::from("/tmp/daemon.sock")));
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert!("tcp:127.0.0.1:notaport".parse::<Endpoint>().is_err());
        assert!("tcp:127.0.0.1".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_parse_rejects_empty_unix_path() {
        assert!("unix:".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for s in ["tcp:10.0.0.1:9000", "unix:/run/idmesh.sock"] {
            let ep: Endpoint = s.parse().unwrap();
            assert_eq!(ep.to_string(), s);
        }
    }
}
