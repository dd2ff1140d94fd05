use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum NetworkParseError {
    #[error("invalid IPv4 address in {0:?}")]
    Address(String),
    #[error("invalid prefix length in {0:?}")]
    PrefixLength(String),
}

/// One IPv4 prefix allowed to reach the server. Loopback is always allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedNetwork {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl AllowedNetwork {
    fn mask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len)),
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(addr) & mask == u32::from(self.network) & mask
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        if ip.is_loopback() {
            return true;
        }
        match ip {
            IpAddr::V4(v4) => self.contains(v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4.is_loopback() || self.contains(v4),
                None => false,
            },
        }
    }
}

impl FromStr for AllowedNetwork {
    type Err = NetworkParseError;

    /// Accepts `a.b.c.d/len`, or a bare address meaning a single host.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => {
                let len: u8 = len
                    .parse()
                    .map_err(|_| NetworkParseError::PrefixLength(s.to_string()))?;
                if len > 32 {
                    return Err(NetworkParseError::PrefixLength(s.to_string()));
                }
                (addr, len)
            }
            None => (s, 32),
        };
        let network: Ipv4Addr = addr
            .parse()
            .map_err(|_| NetworkParseError::Address(s.to_string()))?;
        Ok(Self {
            network,
            prefix_len: len,
        })
    }
}

impl std::fmt::Display for AllowedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Reject clients outside the allowed network before any handler runs.
pub async fn restrict_remote_addr(
    State(allowed): State<Arc<AllowedNetwork>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if allowed.allows(peer.ip()) {
        next.run(request).await
    } else {
        warn!(client = %peer.ip(), path = request.uri().path(), "access denied");
        StatusCode::FORBIDDEN.into_response()
    }
}
