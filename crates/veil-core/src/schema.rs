//! Control protocol schema — field ids, flags and decode policies.
//!
//! Field ids are part of the protocol and never get renumbered. New fields
//! are only ever appended; decoders skip ids they do not know.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::attr::{AttrKind, Policy};

/// Generic family name the protocol is registered under.
pub const FAMILY_NAME: &str = "wireguard";
/// Family id carried in `MsgHeader::kind`.
pub const FAMILY_ID: u16 = 0x20;
pub const FAMILY_VERSION: u8 = 1;

/// The only peer protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u32 = 1;

pub const KEY_LEN: usize = 32;
/// Interface names are at most 15 bytes plus NUL.
pub const IFNAMSIZ: usize = 16;

pub const AF_INET: u16 = libc::AF_INET as u16;
pub const AF_INET6: u16 = libc::AF_INET6 as u16;

/// Device-level field ids.
pub mod device {
    pub const IFINDEX: u16 = 1;
    pub const IFNAME: u16 = 2;
    pub const PRIVATE_KEY: u16 = 3;
    pub const PUBLIC_KEY: u16 = 4;
    pub const FLAGS: u16 = 5;
    pub const LISTEN_PORT: u16 = 6;
    pub const FWMARK: u16 = 7;
    pub const PEERS: u16 = 8;
    pub const DEV_NETNS_PID: u16 = 9;
    pub const DEV_NETNS_FD: u16 = 10;
    pub const TRANSIT_NETNS_PID: u16 = 11;
    pub const TRANSIT_NETNS_FD: u16 = 12;

    /// Remove every existing peer before applying the peer list.
    pub const F_REPLACE_PEERS: u32 = 1 << 0;
}

/// Peer-level field ids.
pub mod peer {
    pub const PUBLIC_KEY: u16 = 1;
    pub const PRESHARED_KEY: u16 = 2;
    pub const FLAGS: u16 = 3;
    pub const ENDPOINT: u16 = 4;
    pub const PERSISTENT_KEEPALIVE_INTERVAL: u16 = 5;
    pub const LAST_HANDSHAKE_TIME: u16 = 6;
    pub const RX_BYTES: u16 = 7;
    pub const TX_BYTES: u16 = 8;
    pub const ALLOWEDIPS: u16 = 9;
    pub const PROTOCOL_VERSION: u16 = 10;

    pub const F_REMOVE_ME: u32 = 1 << 0;
    pub const F_REPLACE_ALLOWEDIPS: u32 = 1 << 1;
}

/// Allowed-prefix field ids.
pub mod allowedip {
    pub const FAMILY: u16 = 1;
    pub const IPADDR: u16 = 2;
    pub const CIDR_MASK: u16 = 3;
}

// ── Policies ──────────────────────────────────────────────────────────────────

pub static DEVICE_POLICY: Policy = Policy {
    name: "device",
    rules: &[
        AttrKind::Ignored,
        AttrKind::U32,
        AttrKind::NulString { max: IFNAMSIZ - 1 },
        AttrKind::MinLen(KEY_LEN),
        AttrKind::MinLen(KEY_LEN),
        AttrKind::U32,
        AttrKind::U16,
        AttrKind::U32,
        AttrKind::Nested,
        AttrKind::U32,
        AttrKind::U32,
        AttrKind::U32,
        AttrKind::U32,
    ],
};

pub static PEER_POLICY: Policy = Policy {
    name: "peer",
    rules: &[
        AttrKind::Ignored,
        AttrKind::MinLen(KEY_LEN),
        AttrKind::MinLen(KEY_LEN),
        AttrKind::U32,
        AttrKind::MinLen(SOCKADDR_IN_LEN),
        AttrKind::U16,
        AttrKind::MinLen(TIMESPEC_LEN),
        AttrKind::U64,
        AttrKind::U64,
        AttrKind::Nested,
        AttrKind::U32,
    ],
};

pub static ALLOWEDIP_POLICY: Policy = Policy {
    name: "allowedip",
    rules: &[
        AttrKind::Ignored,
        AttrKind::U16,
        AttrKind::MinLen(4),
        AttrKind::U8,
    ],
};

// ── Socket addresses ──────────────────────────────────────────────────────────

/// `struct sockaddr_in`. Port and address are network order.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct SockaddrIn {
    family: u16,
    port: [u8; 2],
    addr: [u8; 4],
    zero: [u8; 8],
}

assert_eq_size!(SockaddrIn, [u8; 16]);

/// `struct sockaddr_in6`. Port, flow info and address are network order.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct SockaddrIn6 {
    family: u16,
    port: [u8; 2],
    flowinfo: [u8; 4],
    addr: [u8; 16],
    scope_id: u32,
}

assert_eq_size!(SockaddrIn6, [u8; 28]);

pub const SOCKADDR_IN_LEN: usize = 16;
pub const SOCKADDR_IN6_LEN: usize = 28;

/// Encode an endpoint as the matching sockaddr structure.
pub fn encode_sockaddr(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => SockaddrIn {
            family: AF_INET,
            port: v4.port().to_be_bytes(),
            addr: v4.ip().octets(),
            zero: [0; 8],
        }
        .as_bytes()
        .to_vec(),
        SocketAddr::V6(v6) => SockaddrIn6 {
            family: AF_INET6,
            port: v6.port().to_be_bytes(),
            flowinfo: v6.flowinfo().to_be_bytes(),
            addr: v6.ip().octets(),
            scope_id: v6.scope_id(),
        }
        .as_bytes()
        .to_vec(),
    }
}

/// Decode a sockaddr payload. Only an exact-length `sockaddr_in` or
/// `sockaddr_in6` with the matching family is accepted.
pub fn decode_sockaddr(raw: &[u8]) -> Option<SocketAddr> {
    let family = u16::from_ne_bytes(raw.get(..2)?.try_into().ok()?);
    match (family, raw.len()) {
        (AF_INET, SOCKADDR_IN_LEN) => {
            let sa = SockaddrIn::read_from(raw)?;
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sa.addr),
                u16::from_be_bytes(sa.port),
            )))
        }
        (AF_INET6, SOCKADDR_IN6_LEN) => {
            let sa = SockaddrIn6::read_from(raw)?;
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sa.addr),
                u16::from_be_bytes(sa.port),
                u32::from_be_bytes(sa.flowinfo),
                sa.scope_id,
            )))
        }
        _ => None,
    }
}

/// Address family code of an IP address.
pub fn ip_family(ip: &IpAddr) -> u16 {
    match ip {
        IpAddr::V4(_) => AF_INET,
        IpAddr::V6(_) => AF_INET6,
    }
}

// ── Timestamps ────────────────────────────────────────────────────────────────

pub const TIMESPEC_LEN: usize = 16;

/// `struct __kernel_timespec`: seconds and nanoseconds since the epoch.
/// `None` encodes as all zeros, meaning "never".
pub fn encode_timespec(time: Option<SystemTime>) -> [u8; TIMESPEC_LEN] {
    let since = time
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .unwrap_or(Duration::ZERO);
    let mut out = [0u8; TIMESPEC_LEN];
    out[..8].copy_from_slice(&(since.as_secs() as i64).to_ne_bytes());
    out[8..].copy_from_slice(&(since.subsec_nanos() as i64).to_ne_bytes());
    out
}

pub fn decode_timespec(raw: &[u8]) -> Option<SystemTime> {
    let secs = i64::from_ne_bytes(raw.get(..8)?.try_into().ok()?);
    let nanos = i64::from_ne_bytes(raw.get(8..16)?.try_into().ok()?);
    if secs <= 0 && nanos <= 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::new(secs.max(0) as u64, nanos.clamp(0, 999_999_999) as u32))
}
