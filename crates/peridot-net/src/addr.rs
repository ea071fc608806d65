//! IPv4 endpoint value type.

use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{NetError, NetResult};

/// An IPv4 socket address.
///
/// Thin value wrapper used at every point the framework names an endpoint:
/// bind targets, accepted peers, connection identity in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    inner: SocketAddrV4,
}

impl Address {
    /// Parses a dotted IPv4 string (`"0.0.0.0"` binds all interfaces).
    pub fn new(ip: &str, port: u16) -> NetResult<Self> {
        let ip: Ipv4Addr = ip.parse().map_err(|source| NetError::InvalidAddress {
            addr: ip.to_string(),
            source,
        })?;
        Ok(Self {
            inner: SocketAddrV4::new(ip, port),
        })
    }

    /// The wildcard address `0.0.0.0:port`.
    pub const fn any(port: u16) -> Self {
        Self {
            inner: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
        }
    }

    /// The loopback address `127.0.0.1:port`.
    pub const fn localhost(port: u16) -> Self {
        Self {
            inner: SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
        }
    }

    /// The IP half of the endpoint.
    pub const fn ip(&self) -> Ipv4Addr {
        *self.inner.ip()
    }

    /// The port half of the endpoint.
    pub const fn port(&self) -> u16 {
        self.inner.port()
    }

    /// The address as a standard-library socket address.
    pub const fn socket_addr(&self) -> SocketAddrV4 {
        self.inner
    }

    pub(crate) fn to_sockaddr_in(self) -> libc::sockaddr_in {
        libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: self.inner.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(*self.inner.ip()).to_be(),
            },
            sin_zero: [0; 8],
        }
    }

    pub(crate) fn from_sockaddr_in(sa: &libc::sockaddr_in) -> Self {
        Self {
            inner: SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
                u16::from_be(sa.sin_port),
            ),
        }
    }

    pub(crate) fn sockaddr_len() -> libc::socklen_t {
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
    }
}

impl From<SocketAddrV4> for Address {
    fn from(inner: SocketAddrV4) -> Self {
        Self { inner }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}
