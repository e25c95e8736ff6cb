//! Default transport resolution for daemon/client rendezvous.
//!
//! On non-Windows platforms the daemon listens on a filesystem socket
//! at `/tmp/reee_<port>.sock`; on Windows it falls back to loopback TCP
//! on the same port token so defaults stay aligned across families.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Port token shared between the Unix socket name and the TCP fallback.
pub const DEFAULT_PORT: &str = "6823";

/// Transport family for daemon/client communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// Local filesystem socket.
    Unix,
    /// Loopback TCP.
    Tcp,
}

impl Network {
    /// The name used by `--net` and `REEE_NET`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unix => "unix",
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for an unknown transport family name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid network {0:?} (expected \"unix\" or \"tcp\")")]
pub struct ParseNetworkError(pub String);

impl FromStr for Network {
    type Err = ParseNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix" => Ok(Self::Unix),
            "tcp" => Ok(Self::Tcp),
            other => Err(ParseNetworkError(other.to_string())),
        }
    }
}

/// The default transport family and address for this platform.
#[cfg(not(windows))]
#[must_use]
pub fn default_net_addr() -> (Network, String) {
    (Network::Unix, format!("/tmp/reee_{DEFAULT_PORT}.sock"))
}

/// The default transport family and address for this platform.
#[cfg(windows)]
#[must_use]
pub fn default_net_addr() -> (Network, String) {
    (Network::Tcp, format!("127.0.0.1:{DEFAULT_PORT}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_round_trips_through_text() {
        for net in [Network::Unix, Network::Tcp] {
            assert_eq!(net.as_str().parse::<Network>().unwrap(), net);
        }
        assert!("udp".parse::<Network>().is_err());
    }

    #[cfg(not(windows))]
    #[test]
    fn default_is_a_unix_socket_carrying_the_port_token() {
        let (net, addr) = default_net_addr();
        assert_eq!(net, Network::Unix);
        assert_eq!(addr, format!("/tmp/reee_{DEFAULT_PORT}.sock"));
    }
}
