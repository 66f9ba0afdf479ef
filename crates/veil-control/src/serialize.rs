//! Rendering device and peer state into dump attributes.

use std::net::IpAddr;

use veil_core::attr::AttrWriter;
use veil_core::schema::{self, allowedip, device, encode_sockaddr, encode_timespec, peer};
use veil_core::MessageFull;

use crate::allowedips::{AllowedIps, Prefix, PrefixCursor};
use crate::device::{Device, DeviceState};
use crate::namespace::Caller;
use crate::peer::Peer;

/// Device-level fields, sent once at the start of a dump. The listening
/// port is only shown to callers allowed to use sockets in the transit
/// namespace.
pub fn write_device_fields(
    w: &mut AttrWriter<'_>,
    dev: &Device,
    state: &DeviceState,
    caller: &Caller,
) -> Result<(), MessageFull> {
    if caller.socket_capable(state.transit_net) {
        w.put_u16(device::LISTEN_PORT, state.listen_port)?;
    }
    w.put_u32(device::FWMARK, state.fwmark)?;
    w.put_u32(device::IFINDEX, dev.ifindex())?;
    w.put_str(device::IFNAME, dev.name())?;

    let identity = dev.identity();
    if let Some(keypair) = identity.keypair() {
        w.put(device::PRIVATE_KEY, &*keypair.private_bytes())?;
        w.put(device::PUBLIC_KEY, &keypair.public)?;
    }
    Ok(())
}

/// Write `peer` as container `index`.
///
/// The first time a peer is written in a dump (its prefix cursor is fresh)
/// its state fields are included; a resumed peer repeats only its public
/// key. Prefixes continue from `cursor`.
///
/// `Ok` means the peer is complete and `cursor` has been reset. `Err` means
/// it is not: either nothing was written, or the peer was written with only
/// part of its prefix list and `cursor` records where to pick up.
pub fn write_peer(
    w: &mut AttrWriter<'_>,
    index: u16,
    peer: &Peer,
    allowed_ips: &AllowedIps,
    cursor: &mut PrefixCursor,
) -> Result<(), MessageFull> {
    let nest = w.nest_start(index)?;
    let header = write_peer_fields(w, peer, cursor.is_fresh_for(peer.id()))
        .and_then(|()| w.nest_start(peer::ALLOWEDIPS));
    let prefixes = match header {
        Ok(prefixes) => prefixes,
        Err(full) => {
            w.nest_cancel(nest);
            return Err(full);
        }
    };

    let mut i = 0u16;
    let walked = allowed_ips.walk_by_peer(peer.id(), cursor, |prefix| {
        let result = write_prefix(w, i, prefix);
        i += 1;
        result
    });
    w.nest_end(prefixes);
    w.nest_end(nest);
    walked?;
    cursor.reset();
    Ok(())
}

fn write_peer_fields(w: &mut AttrWriter<'_>, p: &Peer, first_page: bool) -> Result<(), MessageFull> {
    w.put(peer::PUBLIC_KEY, p.public_key())?;
    if !first_page {
        return Ok(());
    }
    w.put(peer::PRESHARED_KEY, &*p.preshared_key())?;
    w.put(peer::LAST_HANDSHAKE_TIME, &encode_timespec(p.last_handshake()))?;
    w.put_u16(peer::PERSISTENT_KEEPALIVE_INTERVAL, p.keepalive_interval())?;
    w.put_u64(peer::TX_BYTES, p.tx_bytes())?;
    w.put_u64(peer::RX_BYTES, p.rx_bytes())?;
    w.put_u32(peer::PROTOCOL_VERSION, schema::PROTOCOL_VERSION)?;
    if let Some(addr) = p.endpoint().addr {
        w.put(peer::ENDPOINT, &encode_sockaddr(&addr))?;
    }
    Ok(())
}

fn write_prefix(w: &mut AttrWriter<'_>, index: u16, prefix: &Prefix) -> Result<(), MessageFull> {
    let nest = w.nest_start(index)?;
    let ip = prefix.addr();
    let written = w
        .put_u8(allowedip::CIDR_MASK, prefix.cidr())
        .and_then(|()| w.put_u16(allowedip::FAMILY, schema::ip_family(&ip)))
        .and_then(|()| match ip {
            IpAddr::V4(v4) => w.put(allowedip::IPADDR, &v4.octets()),
            IpAddr::V6(v6) => w.put(allowedip::IPADDR, &v6.octets()),
        });
    match written {
        Ok(()) => {
            w.nest_end(nest);
            Ok(())
        }
        Err(full) => {
            w.nest_cancel(nest);
            Err(full)
        }
    }
}
