//! Applying a SET_DEVICE request to a device.
//!
//! The whole request runs under the device update lock, in a fixed order:
//! firewall mark, transport socket, peer replacement, private key, then the
//! peer blocks in request order. The first failing step ends the request.
//! Steps already applied stay applied; clients re-read the device to learn
//! what took effect.

use std::sync::Arc;

use veil_core::crypto::{public_from_private, Key};
use veil_core::schema::PROTOCOL_VERSION;

use crate::device::{Device, DeviceState};
use crate::error::ControlError;
use crate::namespace::{Caller, Namespaces};
use crate::peer::Peer;
use crate::request::{DeviceChange, PeerChange};
use crate::resolve::resolve_netns;

/// Apply `change` to `device`.
pub fn apply(
    namespaces: &Namespaces,
    caller: &Caller,
    device: &Device,
    change: &DeviceChange,
) -> Result<(), ControlError> {
    let mut state = device.lock();
    let generation = state.bump_generation();
    tracing::debug!(device = %device.name(), generation, peers = change.peers.len(), "applying configuration");

    if let Some(fwmark) = change.fwmark {
        state.fwmark = fwmark;
        for peer in state.peers() {
            peer.clear_endpoint_src();
        }
    }

    set_socket(namespaces, caller, device, &mut state, change)?;

    if change.replace_peers() {
        device.remove_all_peers(&mut state);
    }

    if let Some(private) = &change.private_key {
        set_private_key(device, &mut state, private);
    }

    for (index, peer) in change.peers.iter().enumerate() {
        if let Err(err) = set_peer(device, &mut state, peer) {
            tracing::warn!(
                device = %device.name(),
                index,
                error = %err,
                "peer block rejected, remaining blocks skipped"
            );
            return Err(err);
        }
    }
    Ok(())
}

/// Move the transport to a new port and/or transit namespace. Nothing
/// happens if neither actually changes. A link that is down only records
/// the new values.
fn set_socket(
    namespaces: &Namespaces,
    caller: &Caller,
    device: &Device,
    state: &mut DeviceState,
    change: &DeviceChange,
) -> Result<(), ControlError> {
    let netns = resolve_netns(namespaces, caller, change.transit_netns)?
        .map(|ns| ns.handle())
        .unwrap_or(state.transit_net);
    let port = change.listen_port.unwrap_or(state.listen_port);

    if !caller.socket_capable(netns) {
        return Err(ControlError::PermissionDenied(netns.id));
    }
    if port == state.listen_port && netns == state.transit_net {
        return Ok(());
    }

    for peer in state.peers() {
        peer.clear_endpoint_src();
    }
    if !device.is_up() {
        state.listen_port = port;
        state.transit_net = netns;
        return Ok(());
    }
    device.rebind(state, netns, port)
}

/// Install a new identity. A peer carrying the new public key is removed
/// first, since a device cannot be its own peer.
fn set_private_key(device: &Device, state: &mut DeviceState, private: &Key) {
    if let Some(public) = public_from_private(private) {
        if let Some(peer) = state.peer(&public).cloned() {
            tracing::info!(device = %device.name(), peer = %hex::encode(public), "peer collides with new identity");
            device.remove_peer(state, &peer);
        }
    }
    device.install_identity(state, private);
}

fn set_peer(device: &Device, state: &mut DeviceState, change: &PeerChange) -> Result<(), ControlError> {
    let public_key = change.public_key.ok_or(ControlError::MissingPublicKey)?;
    if let Some(version) = change.protocol_version {
        if version != PROTOCOL_VERSION {
            return Err(ControlError::ProtocolMismatch(version));
        }
    }

    let peer: Arc<Peer> = match state.peer(&public_key).cloned() {
        Some(peer) => peer,
        None if change.remove() => {
            return Err(ControlError::NoSuchPeer(hex::encode(public_key)));
        }
        None if device.public_key() == Some(public_key) => {
            tracing::debug!(device = %device.name(), "ignoring peer with the device's own key");
            return Ok(());
        }
        None => device.create_peer(state, public_key, change.preshared_key.as_deref())?,
    };

    if change.remove() {
        device.remove_peer(state, &peer);
        return Ok(());
    }

    if let Some(psk) = &change.preshared_key {
        peer.set_preshared_key(psk);
    }
    if let Some(endpoint) = change.endpoint {
        peer.set_endpoint(endpoint);
    }

    let allowed_ips = device.allowed_ips();
    if change.replace_allowed_ips() {
        allowed_ips.remove_by_peer(peer.id());
    }
    for block in &change.allowed_ips {
        allowed_ips.insert(block.prefix()?, &peer);
    }

    if let Some(interval) = change.keepalive {
        let previous = peer.set_keepalive_interval(interval);
        if previous == 0 && interval != 0 && device.is_up() {
            device.data_plane().send_keepalive(&peer);
        }
    }
    if device.is_up() {
        device.data_plane().send_staged(&peer);
    }
    Ok(())
}
