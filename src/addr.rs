//! Address and tuple types.
//!
//! `Addr` intentionally does not reuse the IPv6 scope id to carry interface
//! information: `interface_index` is its own field, populated from PKTINFO on
//! receive and fed back into PKTINFO on a source-addressed send. Aliasing the
//! two made sense in C where `sin6_scope_id` and "the PKTINFO ifindex" are
//! both just a `u32` sitting in a struct; in Rust we can just say what we mean.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// An IPv4-or-IPv6 address plus the interface it arrived on (or should be
/// sent from).
///
/// Families are never mixed: an `Addr` constructed from an IPv4 PKTINFO stays
/// `V4` for its whole lifetime. There is no implicit IPv4-in-IPv6 mapping
/// anywhere in this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Addr {
    V4 {
        ip: Ipv4Addr,
        port: u16,
        interface_index: u32,
    },
    V6 {
        ip: Ipv6Addr,
        port: u16,
        interface_index: u32,
    },
}

impl Addr {
    pub fn new_v4(ip: Ipv4Addr, port: u16, interface_index: u32) -> Self {
        Addr::V4 {
            ip,
            port,
            interface_index,
        }
    }

    pub fn new_v6(ip: Ipv6Addr, port: u16, interface_index: u32) -> Self {
        Addr::V6 {
            ip,
            port,
            interface_index,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Addr::V4 { port, .. } => *port,
            Addr::V6 { port, .. } => *port,
        }
    }

    pub fn interface_index(&self) -> u32 {
        match self {
            Addr::V4 {
                interface_index, ..
            } => *interface_index,
            Addr::V6 {
                interface_index, ..
            } => *interface_index,
        }
    }

    pub fn is_v4(&self) -> bool {
        matches!(self, Addr::V4 { .. })
    }

    pub fn is_v6(&self) -> bool {
        matches!(self, Addr::V6 { .. })
    }

    /// Address/port without the interface index, for use with plain
    /// `std`/`socket2` socket APIs that only understand `SocketAddr`.
    pub fn to_socket_addr(&self) -> SocketAddr {
        match *self {
            Addr::V4 { ip, port, .. } => SocketAddr::new(ip.into(), port),
            Addr::V6 { ip, port, .. } => SocketAddr::new(ip.into(), port),
        }
    }

    /// Builds an `Addr` from a `SocketAddr` with no known interface (e.g. a
    /// caller-supplied bind address before the kernel has told us anything).
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Addr::new_v4(*v4.ip(), v4.port(), 0),
            SocketAddr::V6(v6) => Addr::new_v6(*v6.ip(), v6.port(), 0),
        }
    }

    pub fn with_port(&self, port: u16) -> Self {
        match *self {
            Addr::V4 {
                ip,
                interface_index,
                ..
            } => Addr::V4 {
                ip,
                port,
                interface_index,
            },
            Addr::V6 {
                ip,
                interface_index,
                ..
            } => Addr::V6 {
                ip,
                port,
                interface_index,
            },
        }
    }
}

/// The `{local, remote}` pair associated with a received or sent datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tuple {
    pub local: Addr,
    pub remote: Addr,
}
