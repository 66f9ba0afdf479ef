//! Allowed-prefix table: which peer owns which address range.
//!
//! Each prefix belongs to exactly one peer; inserting a prefix another peer
//! owns moves it. Lookups pick the longest matching prefix. Per-peer walks
//! are ordered and resumable through a [`PrefixCursor`], so one peer's list
//! can be spread over several dump messages.
//!
//! The table is internally synchronized. Bulk operations (replace a peer's
//! prefixes, walk a peer) are only consistent when the caller also holds the
//! device update lock.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::peer::Peer;

/// An address range, stored with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Prefix {
    addr: IpAddr,
    cidr: u8,
}

impl Prefix {
    /// Returns `None` if `cidr` exceeds the family's address width.
    pub fn new(addr: IpAddr, cidr: u8) -> Option<Self> {
        let addr = match addr {
            IpAddr::V4(v4) if cidr <= 32 => {
                let mask = u32::MAX.checked_shl(32 - cidr as u32).unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask))
            }
            IpAddr::V6(v6) if cidr <= 128 => {
                let mask = u128::MAX.checked_shl(128 - cidr as u32).unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask))
            }
            _ => return None,
        };
        Some(Self { addr, cidr })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn cidr(&self) -> u8 {
        self.cidr
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        Prefix::new(ip, self.cidr).is_some_and(|p| p.addr == self.addr)
    }
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.cidr)
    }
}

/// Resume point of a per-peer walk.
///
/// Records which peer was being walked and the last prefix handed out, so a
/// resumed walk continues right after it even if prefixes were added or
/// removed in between.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefixCursor {
    peer: Option<u64>,
    last: Option<Prefix>,
}

impl PrefixCursor {
    /// True if no walk of `peer_id` is in progress.
    pub fn is_fresh_for(&self, peer_id: u64) -> bool {
        self.peer != Some(peer_id)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Default)]
struct Table {
    by_peer: HashMap<u64, BTreeSet<Prefix>>,
    owners: HashMap<Prefix, Arc<Peer>>,
}

#[derive(Default)]
pub struct AllowedIps {
    inner: RwLock<Table>,
}

impl AllowedIps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `prefix` to `peer`, taking it away from any previous owner.
    pub fn insert(&self, prefix: Prefix, peer: &Arc<Peer>) {
        let mut table = self.write();
        if let Some(previous) = table.owners.insert(prefix, peer.clone()) {
            if let Some(set) = table.by_peer.get_mut(&previous.id()) {
                set.remove(&prefix);
            }
        }
        table.by_peer.entry(peer.id()).or_default().insert(prefix);
    }

    /// Drop every prefix owned by `peer_id`.
    pub fn remove_by_peer(&self, peer_id: u64) {
        let mut table = self.write();
        if let Some(set) = table.by_peer.remove(&peer_id) {
            for prefix in set {
                table.owners.remove(&prefix);
            }
        }
    }

    /// Peer owning the longest prefix that contains `ip`.
    pub fn lookup(&self, ip: IpAddr) -> Option<Arc<Peer>> {
        self.read()
            .owners
            .iter()
            .filter(|(prefix, _)| prefix.contains(ip))
            .max_by_key(|(prefix, _)| prefix.cidr)
            .map(|(_, peer)| peer.clone())
    }

    /// All prefixes of `peer_id`, in walk order.
    pub fn prefixes_of(&self, peer_id: u64) -> Vec<Prefix> {
        self.read()
            .by_peer
            .get(&peer_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.read().owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand `peer_id`'s prefixes to `emit` in order, starting after the
    /// cursor's position. Stops at the first `Err`, leaving the cursor on the
    /// last prefix that was accepted.
    pub fn walk_by_peer<E>(
        &self,
        peer_id: u64,
        cursor: &mut PrefixCursor,
        mut emit: impl FnMut(&Prefix) -> Result<(), E>,
    ) -> Result<(), E> {
        if cursor.is_fresh_for(peer_id) {
            *cursor = PrefixCursor {
                peer: Some(peer_id),
                last: None,
            };
        }
        let table = self.read();
        let Some(set) = table.by_peer.get(&peer_id) else {
            return Ok(());
        };
        let start = match cursor.last {
            Some(last) => Bound::Excluded(last),
            None => Bound::Unbounded,
        };
        for prefix in set.range((start, Bound::Unbounded)) {
            emit(prefix)?;
            cursor.last = Some(*prefix);
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
