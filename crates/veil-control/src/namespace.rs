//! Network namespaces, their link tables, and request callers.
//!
//! A namespace owns a table of links keyed by interface index and by name.
//! Only some links are veil devices; the rest are "foreign" and can be
//! looked up but never configured. Capability checks are made against the
//! user namespace that owns a network namespace.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::dataplane::DataPlane;
use crate::device::Device;
use crate::error::ControlError;

/// The initial user namespace. Holding the capability here means holding it
/// in every descendant user namespace too.
pub const INIT_USER_NS: u32 = 0;

/// Identity of a network namespace, cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetnsRef {
    pub id: u64,
    /// User namespace owning this network namespace.
    pub user_ns: u32,
}

/// One entry of a namespace's link table.
#[derive(Clone)]
pub enum Link {
    Veil(Arc<Device>),
    Foreign { name: String },
}

impl Link {
    pub fn name(&self) -> &str {
        match self {
            Link::Veil(device) => device.name(),
            Link::Foreign { name } => name,
        }
    }
}

pub struct NetNamespace {
    handle: NetnsRef,
    links: DashMap<u32, Link>,
    names: DashMap<String, u32>,
    next_index: AtomicU32,
}

impl NetNamespace {
    pub fn new(id: u64, user_ns: u32) -> Arc<Self> {
        Arc::new(Self {
            handle: NetnsRef { id, user_ns },
            links: DashMap::new(),
            names: DashMap::new(),
            next_index: AtomicU32::new(1),
        })
    }

    pub fn handle(&self) -> NetnsRef {
        self.handle
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    /// Create a veil device in this namespace. Its transit namespace starts
    /// out as this namespace too.
    pub fn create_device(
        &self,
        name: &str,
        data_plane: Arc<dyn DataPlane>,
    ) -> Result<Arc<Device>, ControlError> {
        let ifindex = self.reserve_name(name)?;
        let device = Device::new(name, ifindex, self.handle, data_plane);
        self.links.insert(ifindex, Link::Veil(device.clone()));
        tracing::info!(device = name, ifindex, netns = self.handle.id, "device created");
        Ok(device)
    }

    /// Register a link that veil does not manage.
    pub fn add_foreign(&self, name: &str) -> Result<u32, ControlError> {
        let ifindex = self.reserve_name(name)?;
        self.links.insert(
            ifindex,
            Link::Foreign {
                name: name.to_string(),
            },
        );
        Ok(ifindex)
    }

    pub fn remove_link(&self, ifindex: u32) -> Option<Link> {
        let (_, link) = self.links.remove(&ifindex)?;
        self.names.remove(link.name());
        Some(link)
    }

    pub fn link_by_index(&self, ifindex: u32) -> Option<Link> {
        self.links.get(&ifindex).map(|l| l.value().clone())
    }

    pub fn link_by_name(&self, name: &str) -> Option<Link> {
        let ifindex = *self.names.get(name)?.value();
        self.link_by_index(ifindex)
    }

    fn reserve_name(&self, name: &str) -> Result<u32, ControlError> {
        match self.names.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ControlError::NameInUse(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let ifindex = self.next_index.fetch_add(1, Ordering::Relaxed);
                slot.insert(ifindex);
                Ok(ifindex)
            }
        }
    }
}

/// Registry of every network namespace, plus which process lives where.
pub struct Namespaces {
    by_id: DashMap<u64, Arc<NetNamespace>>,
    by_pid: DashMap<u32, u64>,
    next_id: AtomicU64,
    init: Arc<NetNamespace>,
}

impl Namespaces {
    /// A registry holding only the initial namespace (id 1).
    pub fn new() -> Self {
        let init = NetNamespace::new(1, INIT_USER_NS);
        let by_id = DashMap::new();
        by_id.insert(init.id(), init.clone());
        Self {
            by_id,
            by_pid: DashMap::new(),
            next_id: AtomicU64::new(2),
            init,
        }
    }

    pub fn init(&self) -> Arc<NetNamespace> {
        self.init.clone()
    }

    /// Create a namespace owned by `user_ns`.
    pub fn create(&self, user_ns: u32) -> Arc<NetNamespace> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ns = NetNamespace::new(id, user_ns);
        self.by_id.insert(id, ns.clone());
        ns
    }

    pub fn get(&self, id: u64) -> Option<Arc<NetNamespace>> {
        self.by_id.get(&id).map(|n| n.value().clone())
    }

    /// Record that process `pid` lives in `ns`.
    pub fn attach_pid(&self, pid: u32, ns: &NetNamespace) {
        self.by_pid.insert(pid, ns.id());
    }

    pub fn by_pid(&self, pid: u32) -> Option<Arc<NetNamespace>> {
        let id = *self.by_pid.get(&pid)?.value();
        self.get(id)
    }
}

impl Default for Namespaces {
    fn default() -> Self {
        Self::new()
    }
}

/// Whoever issued a request: their namespace, capabilities and open
/// namespace descriptors.
#[derive(Clone)]
pub struct Caller {
    pub pid: u32,
    netns: Arc<NetNamespace>,
    capable_in: HashSet<u32>,
    netns_fds: HashMap<u32, Arc<NetNamespace>>,
}

impl Caller {
    /// An unprivileged caller in `netns`.
    pub fn new(pid: u32, netns: Arc<NetNamespace>) -> Self {
        Self {
            pid,
            netns,
            capable_in: HashSet::new(),
            netns_fds: HashMap::new(),
        }
    }

    /// Grant the administrative capability in user namespace `user_ns`.
    pub fn with_capability(mut self, user_ns: u32) -> Self {
        self.capable_in.insert(user_ns);
        self
    }

    /// Give the caller an open descriptor `fd` referring to `ns`.
    pub fn with_netns_fd(mut self, fd: u32, ns: Arc<NetNamespace>) -> Self {
        self.netns_fds.insert(fd, ns);
        self
    }

    pub fn netns(&self) -> &Arc<NetNamespace> {
        &self.netns
    }

    pub fn netns_by_fd(&self, fd: u32) -> Option<Arc<NetNamespace>> {
        self.netns_fds.get(&fd).cloned()
    }

    /// Holds the administrative capability over `ns`.
    pub fn ns_capable(&self, ns: NetnsRef) -> bool {
        self.capable_in.contains(&INIT_USER_NS) || self.capable_in.contains(&ns.user_ns)
    }

    /// May bind or inspect sockets in `ns`: always in its own namespace,
    /// elsewhere only with the capability.
    pub fn socket_capable(&self, ns: NetnsRef) -> bool {
        ns == self.netns.handle() || self.ns_capable(ns)
    }
}
