//! A veil device: identity, transport parameters and peer roster.
//!
//! All configuration lives in [`DeviceState`] behind the device update lock.
//! Functions that change the roster take `&mut DeviceState`, so they can
//! only be called by someone holding that lock. The static identity has its
//! own reader/writer lock because the handshake path reads it without the
//! update lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, Weak};

use veil_core::crypto::{CookieKeys, Key, Keypair};

use crate::allowedips::AllowedIps;
use crate::dataplane::DataPlane;
use crate::error::ControlError;
use crate::namespace::NetnsRef;
use crate::peer::Peer;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

pub struct StaticIdentity {
    keypair: Option<Keypair>,
    cookie: CookieKeys,
}

impl StaticIdentity {
    fn none() -> Self {
        Self {
            keypair: None,
            cookie: CookieKeys::empty(),
        }
    }

    pub fn keypair(&self) -> Option<&Keypair> {
        self.keypair.as_ref()
    }

    pub fn public_key(&self) -> Option<Key> {
        self.keypair.as_ref().map(|k| k.public)
    }

    pub fn cookie_keys(&self) -> &CookieKeys {
        &self.cookie
    }
}

/// Everything guarded by the device update lock.
pub struct DeviceState {
    pub listen_port: u16,
    pub fwmark: u32,
    /// Namespace the device itself lives in.
    pub dev_net: NetnsRef,
    /// Namespace the transport socket is bound in.
    pub transit_net: NetnsRef,
    generation: u32,
    peers: Vec<Arc<Peer>>,
    by_key: HashMap<Key, Arc<Peer>>,
}

impl DeviceState {
    /// Bumped once per accepted mutation request.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn bump_generation(&mut self) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    /// Peers in creation order.
    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    pub fn peer(&self, public_key: &Key) -> Option<&Arc<Peer>> {
        self.by_key.get(public_key)
    }
}

pub struct Device {
    name: String,
    ifindex: u32,
    this: Weak<Device>,
    up: AtomicBool,
    state: Mutex<DeviceState>,
    identity: RwLock<StaticIdentity>,
    allowed_ips: AllowedIps,
    data_plane: Arc<dyn DataPlane>,
}

impl Device {
    /// A device that is down, has no identity and no peers, with both its
    /// namespaces set to `netns`.
    pub fn new(name: &str, ifindex: u32, netns: NetnsRef, data_plane: Arc<dyn DataPlane>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            ifindex,
            this: this.clone(),
            up: AtomicBool::new(false),
            state: Mutex::new(DeviceState {
                listen_port: 0,
                fwmark: 0,
                dev_net: netns,
                transit_net: netns,
                generation: 0,
                peers: Vec::new(),
                by_key: HashMap::new(),
            }),
            identity: RwLock::new(StaticIdentity::none()),
            allowed_ips: AllowedIps::new(),
            data_plane,
        })
    }

    /// Take the device update lock.
    pub fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Administratively up.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Bind the transport socket and bring the link up.
    pub fn open(&self) -> Result<(), ControlError> {
        let mut state = self.lock();
        let (netns, port) = (state.transit_net, state.listen_port);
        self.rebind(&mut state, netns, port)?;
        self.up.store(true, Ordering::Release);
        tracing::info!(device = %self.name, port = state.listen_port, "link up");
        Ok(())
    }

    pub fn close(&self) {
        let _state = self.lock();
        self.up.store(false, Ordering::Release);
        tracing::info!(device = %self.name, "link down");
    }

    /// Rebind the transport socket in `netns` on `port` and record what was
    /// actually bound.
    pub(crate) fn rebind(&self, state: &mut DeviceState, netns: NetnsRef, port: u16) -> Result<(), ControlError> {
        let bound = self.data_plane.rebind(self, netns, port).map_err(|err| {
            tracing::warn!(device = %self.name, port, netns = netns.id, error = %err, "rebind failed");
            ControlError::Rebind(err)
        })?;
        state.listen_port = bound;
        state.transit_net = netns;
        tracing::info!(device = %self.name, port = bound, netns = netns.id, "transport bound");
        Ok(())
    }

    pub fn generation(&self) -> u32 {
        self.lock().generation
    }

    pub fn listen_port(&self) -> u16 {
        self.lock().listen_port
    }

    pub fn fwmark(&self) -> u32 {
        self.lock().fwmark
    }

    /// Snapshot of the roster.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.lock().peers.clone()
    }

    pub fn peer(&self, public_key: &Key) -> Option<Arc<Peer>> {
        self.lock().by_key.get(public_key).cloned()
    }

    pub fn identity(&self) -> RwLockReadGuard<'_, StaticIdentity> {
        self.identity
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn public_key(&self) -> Option<Key> {
        self.identity().public_key()
    }

    pub fn allowed_ips(&self) -> &AllowedIps {
        &self.allowed_ips
    }

    pub fn data_plane(&self) -> &dyn DataPlane {
        self.data_plane.as_ref()
    }

    /// Add a peer to the roster. Fails without side effects if the key
    /// cannot be used with the current identity.
    pub(crate) fn create_peer(
        &self,
        state: &mut DeviceState,
        public_key: Key,
        preshared: Option<&Key>,
    ) -> Result<Arc<Peer>, ControlError> {
        let peer = Peer::new(
            NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            public_key,
            self.this.clone(),
        );
        if let Some(psk) = preshared {
            peer.set_preshared_key(psk);
        }
        if !peer.precompute_static_static(self.identity().keypair()) {
            return Err(ControlError::PeerKeyRejected(hex::encode(public_key)));
        }
        state.peers.push(peer.clone());
        state.by_key.insert(public_key, peer.clone());
        tracing::info!(device = %self.name, peer = %hex::encode(public_key), "peer created");
        Ok(peer)
    }

    /// Unlink `peer` from the roster and drop its prefixes. Anyone still
    /// holding the peer sees it as unlinked.
    pub(crate) fn remove_peer(&self, state: &mut DeviceState, peer: &Arc<Peer>) {
        state.peers.retain(|p| !Arc::ptr_eq(p, peer));
        state.by_key.remove(peer.public_key());
        self.allowed_ips.remove_by_peer(peer.id());
        peer.unlink();
        tracing::info!(device = %self.name, peer = %hex::encode(peer.public_key()), "peer removed");
    }

    pub(crate) fn remove_all_peers(&self, state: &mut DeviceState) {
        for peer in std::mem::take(&mut state.peers) {
            state.by_key.remove(peer.public_key());
            self.allowed_ips.remove_by_peer(peer.id());
            peer.unlink();
        }
        tracing::info!(device = %self.name, "all peers removed");
    }

    /// Install `private` as the device identity, refresh every peer against
    /// it and drop the peers it cannot be used with. An all-zero key clears
    /// the identity.
    pub(crate) fn install_identity(&self, state: &mut DeviceState, private: &Key) {
        let mut identity = self
            .identity
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        identity.keypair = Keypair::from_private(private);

        let rejected: Vec<Arc<Peer>> = state
            .peers
            .iter()
            .filter(|peer| !peer.precompute_static_static(identity.keypair.as_ref()))
            .cloned()
            .collect();
        for peer in &rejected {
            self.remove_peer(state, peer);
        }

        identity.cookie = match &identity.keypair {
            Some(keypair) => CookieKeys::derive(&keypair.public),
            None => CookieKeys::empty(),
        };
        match identity.public_key() {
            Some(public) => {
                tracing::info!(device = %self.name, public_key = %hex::encode(public), "identity changed")
            }
            None => tracing::info!(device = %self.name, "identity cleared"),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("ifindex", &self.ifindex)
            .field("up", &self.is_up())
            .finish_non_exhaustive()
    }
}
