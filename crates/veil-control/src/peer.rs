//! Remote peers of a device.
//!
//! A peer's public key never changes after creation; everything else is
//! individually synchronized so the data plane can update counters and
//! endpoints without the device update lock.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::SystemTime;

use zeroize::Zeroizing;

use veil_core::crypto::{Key, Keypair};

use crate::device::Device;

/// Where a peer was last reached, and from which local address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: Option<SocketAddr>,
    /// Cached local source address used to reach `addr`.
    pub src: Option<IpAddr>,
}

struct HandshakeKeys {
    preshared: Zeroizing<Key>,
    static_static: Option<Zeroizing<Key>>,
}

pub struct Peer {
    id: u64,
    public_key: Key,
    device: Weak<Device>,
    handshake: RwLock<HandshakeKeys>,
    endpoint: RwLock<Endpoint>,
    last_handshake: Mutex<Option<SystemTime>>,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    keepalive_interval: AtomicU16,
    linked: AtomicBool,
}

impl Peer {
    pub(crate) fn new(id: u64, public_key: Key, device: Weak<Device>) -> Arc<Self> {
        Arc::new(Self {
            id,
            public_key,
            device,
            handshake: RwLock::new(HandshakeKeys {
                preshared: Zeroizing::new([0u8; 32]),
                static_static: None,
            }),
            endpoint: RwLock::new(Endpoint::default()),
            last_handshake: Mutex::new(None),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            keepalive_interval: AtomicU16::new(0),
            linked: AtomicBool::new(true),
        })
    }

    /// A peer belonging to no device.
    #[cfg(test)]
    pub(crate) fn detached(id: u64, public_key: Key) -> Arc<Self> {
        Self::new(id, public_key, Weak::new())
    }

    /// Unique among all peers ever created by this process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn public_key(&self) -> &Key {
        &self.public_key
    }

    /// Owning device, if it still exists.
    pub fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    /// False once the peer has been removed from its device. An unlinked
    /// peer stays valid for anyone still holding it but is never relinked.
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    pub(crate) fn unlink(&self) {
        self.linked.store(false, Ordering::Release);
    }

    pub fn preshared_key(&self) -> Zeroizing<Key> {
        Zeroizing::new(*read(&self.handshake).preshared)
    }

    pub fn set_preshared_key(&self, key: &Key) {
        *write(&self.handshake).preshared = *key;
    }

    /// Recompute the static-static secret against `identity`. Returns false
    /// if `identity` is present but this peer's key is unusable with it.
    pub fn precompute_static_static(&self, identity: Option<&Keypair>) -> bool {
        let mut keys = write(&self.handshake);
        match identity {
            None => {
                keys.static_static = None;
                true
            }
            Some(keypair) => {
                keys.static_static = keypair.precompute_static_static(&self.public_key);
                keys.static_static.is_some()
            }
        }
    }

    pub fn has_static_static(&self) -> bool {
        read(&self.handshake).static_static.is_some()
    }

    pub fn endpoint(&self) -> Endpoint {
        *read(&self.endpoint)
    }

    /// Point the peer at `addr`, forgetting the cached source address.
    pub fn set_endpoint(&self, addr: SocketAddr) {
        *write(&self.endpoint) = Endpoint {
            addr: Some(addr),
            src: None,
        };
    }

    pub fn set_endpoint_src(&self, src: IpAddr) {
        write(&self.endpoint).src = Some(src);
    }

    pub fn clear_endpoint_src(&self) {
        write(&self.endpoint).src = None;
    }

    /// Completion time of the most recent handshake, if any.
    pub fn last_handshake(&self) -> Option<SystemTime> {
        *self
            .last_handshake
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn record_handshake(&self, at: SystemTime) {
        *self
            .last_handshake
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(at);
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn add_rx(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tx(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Seconds between keepalives; 0 means disabled.
    pub fn keepalive_interval(&self) -> u16 {
        self.keepalive_interval.load(Ordering::Relaxed)
    }

    /// Returns the previous interval.
    pub fn set_keepalive_interval(&self, secs: u16) -> u16 {
        self.keepalive_interval.swap(secs, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("public_key", &hex::encode(self.public_key))
            .field("linked", &self.is_linked())
            .finish_non_exhaustive()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}
