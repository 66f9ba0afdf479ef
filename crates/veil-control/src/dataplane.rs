//! The seam between the control plane and packet forwarding.
//!
//! The control plane never touches sockets or packet queues itself; it asks
//! the data plane to rebind, send a keepalive, or flush staged packets.

use std::io;
use std::sync::Mutex;

use crate::device::Device;
use crate::namespace::NetnsRef;
use crate::peer::Peer;

pub trait DataPlane: Send + Sync {
    /// (Re)bind the device's transport socket in `netns` on `port`, where 0
    /// picks an ephemeral port. Returns the port actually bound.
    fn rebind(&self, device: &Device, netns: NetnsRef, port: u16) -> io::Result<u16>;

    /// Send one keepalive to `peer` now.
    fn send_keepalive(&self, peer: &Peer);

    /// Flush packets queued for `peer` while it had no usable session.
    fn send_staged(&self, peer: &Peer);
}

/// What a [`RecordingDataPlane`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPlaneEvent {
    Rebind { netns: u64, port: u16 },
    Keepalive([u8; 32]),
    Staged([u8; 32]),
}

/// Data plane that binds nothing and records every call. Ports requested as
/// 0 are assigned from 40000 upwards.
pub struct RecordingDataPlane {
    events: Mutex<Vec<DataPlaneEvent>>,
    next_port: Mutex<u16>,
    fail_rebind: Mutex<Option<i32>>,
}

impl RecordingDataPlane {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            next_port: Mutex::new(40000),
            fail_rebind: Mutex::new(None),
        }
    }

    /// Make every following rebind fail with `errno`.
    pub fn fail_rebinds(&self, errno: i32) {
        *lock(&self.fail_rebind) = Some(errno);
    }

    pub fn events(&self) -> Vec<DataPlaneEvent> {
        lock(&self.events).clone()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl Default for RecordingDataPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl DataPlane for RecordingDataPlane {
    fn rebind(&self, _device: &Device, netns: NetnsRef, port: u16) -> io::Result<u16> {
        if let Some(errno) = *lock(&self.fail_rebind) {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let port = if port == 0 {
            let mut next = lock(&self.next_port);
            *next += 1;
            *next
        } else {
            port
        };
        lock(&self.events).push(DataPlaneEvent::Rebind {
            netns: netns.id,
            port,
        });
        Ok(port)
    }

    fn send_keepalive(&self, peer: &Peer) {
        lock(&self.events).push(DataPlaneEvent::Keepalive(*peer.public_key()));
    }

    fn send_staged(&self, peer: &Peer) {
        lock(&self.events).push(DataPlaneEvent::Staged(*peer.public_key()));
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
