//! Typed views of decoded control requests.
//!
//! Decoding copies everything a request handler needs out of the request
//! buffer, so the buffer can be scrubbed of key material before any device
//! lock is taken. Key copies live in `Zeroizing` wrappers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use zeroize::{Zeroize, Zeroizing};

use veil_core::attr::{AttrIter, AttrSet};
use veil_core::crypto::Key;
use veil_core::schema::{
    self, allowedip, decode_sockaddr, device, peer, ALLOWEDIP_POLICY, DEVICE_POLICY, KEY_LEN,
    PEER_POLICY,
};

use crate::allowedips::Prefix;
use crate::error::ControlError;

/// Namespace given by process id or by open descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetnsSelector {
    Pid(u32),
    Fd(u32),
}

impl NetnsSelector {
    fn decode(attrs: &AttrSet<'_>, pid: u16, fd: u16) -> Result<Option<Self>, ControlError> {
        match (attrs.u32(pid), attrs.u32(fd)) {
            (Some(_), Some(_)) => Err(ControlError::AmbiguousNamespace),
            (Some(pid), None) => Ok(Some(NetnsSelector::Pid(pid))),
            (None, Some(fd)) => Ok(Some(NetnsSelector::Fd(fd))),
            (None, None) => Ok(None),
        }
    }
}

/// Which device a request is about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub ifindex: Option<u32>,
    pub ifname: Option<String>,
    /// Namespace to look the device up in; the caller's own if absent.
    pub netns: Option<NetnsSelector>,
}

impl Target {
    pub fn decode(attrs: &AttrSet<'_>) -> Result<Self, ControlError> {
        Ok(Self {
            ifindex: attrs.u32(device::IFINDEX),
            ifname: attrs.string(device::IFNAME).map(str::to_string),
            netns: NetnsSelector::decode(attrs, device::DEV_NETNS_PID, device::DEV_NETNS_FD)?,
        })
    }

    /// Decode the target of a GET_DEVICE request payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ControlError> {
        Self::decode(&AttrSet::parse(payload, &DEVICE_POLICY)?)
    }
}

/// A decoded SET_DEVICE request.
#[derive(Debug)]
pub struct DeviceChange {
    pub target: Target,
    pub flags: u32,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    /// Only a key of exactly 32 bytes counts; longer payloads are ignored.
    pub private_key: Option<Zeroizing<Key>>,
    pub transit_netns: Option<NetnsSelector>,
    pub peers: Vec<PeerChange>,
}

impl DeviceChange {
    pub fn parse(payload: &[u8]) -> Result<Self, ControlError> {
        let attrs = AttrSet::parse(payload, &DEVICE_POLICY)?;
        Ok(Self {
            target: Target::decode(&attrs)?,
            flags: attrs.u32(device::FLAGS).unwrap_or(0),
            listen_port: attrs.u16(device::LISTEN_PORT),
            fwmark: attrs.u32(device::FWMARK),
            private_key: exact_key(attrs.bytes(device::PRIVATE_KEY)),
            transit_netns: NetnsSelector::decode(
                &attrs,
                device::TRANSIT_NETNS_PID,
                device::TRANSIT_NETNS_FD,
            )?,
            peers: attrs
                .parse_list(device::PEERS, &PEER_POLICY)?
                .iter()
                .map(PeerChange::decode)
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn replace_peers(&self) -> bool {
        self.flags & device::F_REPLACE_PEERS != 0
    }
}

/// One peer block of a SET_DEVICE request.
#[derive(Debug)]
pub struct PeerChange {
    /// `None` if the field was absent or not exactly 32 bytes.
    pub public_key: Option<Key>,
    pub preshared_key: Option<Zeroizing<Key>>,
    pub flags: u32,
    /// `None` also for endpoints that are not a well-formed socket address.
    pub endpoint: Option<SocketAddr>,
    pub keepalive: Option<u16>,
    pub protocol_version: Option<u32>,
    pub allowed_ips: Vec<PrefixChange>,
}

impl PeerChange {
    fn decode(attrs: &AttrSet<'_>) -> Result<Self, ControlError> {
        Ok(Self {
            public_key: attrs
                .bytes(peer::PUBLIC_KEY)
                .and_then(|raw| Key::try_from(raw).ok()),
            preshared_key: exact_key(attrs.bytes(peer::PRESHARED_KEY)),
            flags: attrs.u32(peer::FLAGS).unwrap_or(0),
            endpoint: attrs.bytes(peer::ENDPOINT).and_then(decode_sockaddr),
            keepalive: attrs.u16(peer::PERSISTENT_KEEPALIVE_INTERVAL),
            protocol_version: attrs.u32(peer::PROTOCOL_VERSION),
            allowed_ips: attrs
                .parse_list(peer::ALLOWEDIPS, &ALLOWEDIP_POLICY)?
                .iter()
                .map(PrefixChange::decode)
                .collect(),
        })
    }

    pub fn remove(&self) -> bool {
        self.flags & peer::F_REMOVE_ME != 0
    }

    pub fn replace_allowed_ips(&self) -> bool {
        self.flags & peer::F_REPLACE_ALLOWEDIPS != 0
    }
}

/// One allowed-prefix block, checked only when applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixChange {
    pub family: Option<u16>,
    pub addr: Option<Vec<u8>>,
    pub cidr: Option<u8>,
}

impl PrefixChange {
    fn decode(attrs: &AttrSet<'_>) -> Self {
        Self {
            family: attrs.u16(allowedip::FAMILY),
            addr: attrs.bytes(allowedip::IPADDR).map(<[u8]>::to_vec),
            cidr: attrs.u8(allowedip::CIDR_MASK),
        }
    }

    /// The prefix this block describes. All three fields must be present and
    /// the address length must match the family.
    pub fn prefix(&self) -> Result<Prefix, ControlError> {
        let (Some(family), Some(addr), Some(cidr)) = (self.family, &self.addr, self.cidr) else {
            return Err(ControlError::InvalidPrefix);
        };
        let ip = match family {
            schema::AF_INET => <[u8; 4]>::try_from(addr.as_slice())
                .map(|octets| IpAddr::V4(Ipv4Addr::from(octets))),
            schema::AF_INET6 => <[u8; 16]>::try_from(addr.as_slice())
                .map(|octets| IpAddr::V6(Ipv6Addr::from(octets))),
            _ => return Err(ControlError::InvalidPrefix),
        }
        .map_err(|_| ControlError::InvalidPrefix)?;
        Prefix::new(ip, cidr).ok_or(ControlError::InvalidPrefix)
    }
}

fn exact_key(raw: Option<&[u8]>) -> Option<Zeroizing<Key>> {
    let raw = raw.filter(|raw| raw.len() == KEY_LEN)?;
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(raw);
    Some(key)
}

/// Overwrite the private key and every preshared key in a SET_DEVICE
/// payload with zeros. Malformed regions are skipped.
pub fn scrub_secrets(payload: &mut [u8]) {
    let mut secrets = Vec::new();
    for attr in AttrIter::new(payload).flatten() {
        match attr.kind {
            device::PRIVATE_KEY => secrets.push(attr.offset..attr.offset + attr.payload.len()),
            device::PEERS => {
                for block in attr.iter_nested().flatten() {
                    let base = attr.offset + block.offset;
                    for field in block.iter_nested().flatten() {
                        if field.kind == peer::PRESHARED_KEY {
                            let start = base + field.offset;
                            secrets.push(start..start + field.payload.len());
                        }
                    }
                }
            }
            _ => {}
        }
    }
    for range in secrets {
        payload[range].zeroize();
    }
}
