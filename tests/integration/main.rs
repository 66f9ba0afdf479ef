//! Veil control protocol integration tests.
//!
//! Every test talks to `veil_control::Control` the way a client on the
//! control socket would: requests are encoded to bytes, replies are decoded
//! from bytes. Nothing here reaches into device internals except to set up
//! state a client cannot (namespaces, foreign links).

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use zerocopy::FromBytes;

use veil_control::{
    Caller, Control, DataPlaneEvent, Device, Namespaces, RecordingDataPlane, Reply, INIT_USER_NS,
};
use veil_core::attr::{AttrSet, AttrWriter};
use veil_core::schema::{
    self, allowedip, device, peer, ALLOWEDIP_POLICY, DEVICE_POLICY, PEER_POLICY,
};
use veil_core::wire::{
    begin_message, finish_message, parse_error, MsgHeader, FLAG_DUMP, FLAG_REQUEST, MSG_ERROR,
    PAYLOAD_OFFSET,
};
use veil_core::Command;

mod access;
mod mutation;

pub type Key = [u8; 32];

// ── Harness ───────────────────────────────────────────────────────────────────

/// One namespace with one veil device, and a root caller.
pub struct Harness {
    pub namespaces: Arc<Namespaces>,
    pub control: Control,
    pub plane: Arc<RecordingDataPlane>,
    pub device: Arc<Device>,
    pub root: Caller,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_page_size(8192)
    }

    pub fn with_page_size(max_message_size: usize) -> Self {
        let namespaces = Arc::new(Namespaces::new());
        let init = namespaces.init();
        let plane = Arc::new(RecordingDataPlane::new());
        let device = init
            .create_device("wg0", plane.clone())
            .expect("create wg0");
        let root = Caller::new(1, init).with_capability(INIT_USER_NS);
        Self {
            control: Control::new(namespaces.clone(), max_message_size),
            namespaces,
            plane,
            device,
            root,
        }
    }

    /// Same namespaces and device, different dump page size.
    pub fn control_with_page_size(&self, max_message_size: usize) -> Control {
        Control::new(self.namespaces.clone(), max_message_size)
    }

    /// Send a SET_DEVICE for wg0 and return the errno (0 on success).
    pub fn set(&self, build: impl FnOnce(&mut AttrWriter<'_>)) -> i32 {
        let mut req = set_request(|w| {
            w.put_str(device::IFNAME, "wg0").unwrap();
            build(w);
        });
        self.send(&self.root, &mut req)
    }

    pub fn send(&self, caller: &Caller, request: &mut [u8]) -> i32 {
        match self.control.handle(caller, request) {
            Reply::Message(msg) => parse_error(&msg).expect("error reply"),
            Reply::Dump(_) => panic!("unexpected dump reply"),
        }
    }

    /// Dump wg0 by name.
    pub fn dump(&self) -> Result<Dump> {
        dump_with(&self.control, &self.root, |w| {
            w.put_str(device::IFNAME, "wg0").unwrap();
        })
    }
}

// ── Request builders ─────────────────────────────────────────────────────────

pub fn request(cmd: Command, flags: u16, build: impl FnOnce(&mut AttrWriter<'_>)) -> BytesMut {
    let mut buf = BytesMut::new();
    let start = begin_message(&mut buf, cmd, FLAG_REQUEST | flags, 1);
    build(&mut AttrWriter::new(&mut buf, 1 << 20));
    finish_message(&mut buf, start);
    buf
}

pub fn set_request(build: impl FnOnce(&mut AttrWriter<'_>)) -> BytesMut {
    request(Command::SetDevice, 0, build)
}

/// Peer block settings used by [`put_peers`].
#[derive(Default, Clone)]
pub struct PeerBlock {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub flags: u32,
    pub endpoint: Option<SocketAddr>,
    pub keepalive: Option<u16>,
    pub prefixes: Vec<(IpAddr, u8)>,
}

impl PeerBlock {
    pub fn new(public_key: Key) -> Self {
        Self {
            public_key,
            ..Self::default()
        }
    }

    pub fn prefix(mut self, addr: &str, cidr: u8) -> Self {
        self.prefixes.push((addr.parse().unwrap(), cidr));
        self
    }
}

pub fn put_peers(w: &mut AttrWriter<'_>, peers: &[PeerBlock]) {
    let list = w.nest_start(device::PEERS).unwrap();
    for (i, p) in peers.iter().enumerate() {
        let block = w.nest_start(i as u16).unwrap();
        w.put(peer::PUBLIC_KEY, &p.public_key).unwrap();
        if let Some(psk) = &p.preshared_key {
            w.put(peer::PRESHARED_KEY, psk).unwrap();
        }
        if p.flags != 0 {
            w.put_u32(peer::FLAGS, p.flags).unwrap();
        }
        if let Some(addr) = &p.endpoint {
            w.put(peer::ENDPOINT, &schema::encode_sockaddr(addr)).unwrap();
        }
        if let Some(secs) = p.keepalive {
            w.put_u16(peer::PERSISTENT_KEEPALIVE_INTERVAL, secs).unwrap();
        }
        let ips = w.nest_start(peer::ALLOWEDIPS).unwrap();
        for (j, (addr, cidr)) in p.prefixes.iter().enumerate() {
            let entry = w.nest_start(j as u16).unwrap();
            w.put_u16(allowedip::FAMILY, schema::ip_family(addr)).unwrap();
            match addr {
                IpAddr::V4(v4) => w.put(allowedip::IPADDR, &v4.octets()).unwrap(),
                IpAddr::V6(v6) => w.put(allowedip::IPADDR, &v6.octets()).unwrap(),
            }
            w.put_u8(allowedip::CIDR_MASK, *cidr).unwrap();
            w.nest_end(entry);
        }
        w.nest_end(ips);
        w.nest_end(block);
    }
    w.nest_end(list);
}

/// A key derived from a small integer, distinct per `n`.
pub fn key(n: u8) -> Key {
    let mut k = [0u8; 32];
    k[0] = n;
    k[31] = 0x40;
    k
}

// ── Dump decoding ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerView {
    pub preshared_key: Option<Key>,
    pub endpoint: Option<SocketAddr>,
    pub keepalive: Option<u16>,
    pub prefixes: BTreeSet<String>,
}

/// A dump reassembled from all its messages.
#[derive(Debug, Default)]
pub struct Dump {
    pub generations: Vec<u32>,
    pub ifindex: Option<u32>,
    pub ifname: Option<String>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub private_key: Option<Key>,
    pub public_key: Option<Key>,
    pub peers: BTreeMap<Key, PeerView>,
    /// Peer keys in the order they first appeared.
    pub order: Vec<Key>,
}

pub fn dump_with(
    control: &Control,
    caller: &Caller,
    build: impl FnOnce(&mut AttrWriter<'_>),
) -> Result<Dump> {
    let mut req = request(Command::GetDevice, FLAG_DUMP, build);
    let session = match control.handle(caller, &mut req) {
        Reply::Dump(session) => session,
        Reply::Message(msg) => bail!("dump refused: errno {}", parse_error(&msg)?),
    };
    let mut dump = Dump::default();
    for msg in session {
        dump.absorb(&msg?)?;
    }
    Ok(dump)
}

/// Errno of a refused dump request.
pub fn dump_errno(control: &Control, caller: &Caller, build: impl FnOnce(&mut AttrWriter<'_>)) -> i32 {
    let mut req = request(Command::GetDevice, FLAG_DUMP, build);
    match control.handle(caller, &mut req) {
        Reply::Message(msg) => parse_error(&msg).unwrap(),
        Reply::Dump(_) => 0,
    }
}

fn key_of(raw: Option<&[u8]>) -> Option<Key> {
    raw.and_then(|r| Key::try_from(r).ok())
}

impl Dump {
    pub fn absorb(&mut self, msg: &[u8]) -> Result<()> {
        let header = MsgHeader::read_from_prefix(msg).context("header")?;
        if header.kind == MSG_ERROR {
            bail!("error reply: {}", parse_error(msg)?);
        }
        assert_eq!(header.len as usize, msg.len());
        self.generations.push(header.seq);

        let attrs = AttrSet::parse(&msg[PAYLOAD_OFFSET..], &DEVICE_POLICY)?;
        if let Some(ifindex) = attrs.u32(device::IFINDEX) {
            self.ifindex = Some(ifindex);
        }
        if let Some(name) = attrs.string(device::IFNAME) {
            self.ifname = Some(name.to_string());
        }
        self.listen_port = self.listen_port.or(attrs.u16(device::LISTEN_PORT));
        self.fwmark = self.fwmark.or(attrs.u32(device::FWMARK));
        self.private_key = self.private_key.or(key_of(attrs.bytes(device::PRIVATE_KEY)));
        self.public_key = self.public_key.or(key_of(attrs.bytes(device::PUBLIC_KEY)));

        for block in attrs.parse_list(device::PEERS, &PEER_POLICY)? {
            let public_key = key_of(block.bytes(peer::PUBLIC_KEY)).context("peer without key")?;
            if !self.peers.contains_key(&public_key) {
                self.order.push(public_key);
            }
            let view = self.peers.entry(public_key).or_default();
            view.preshared_key = view.preshared_key.or(key_of(block.bytes(peer::PRESHARED_KEY)));
            view.endpoint = view
                .endpoint
                .or(block.bytes(peer::ENDPOINT).and_then(schema::decode_sockaddr));
            view.keepalive = view.keepalive.or(block.u16(peer::PERSISTENT_KEEPALIVE_INTERVAL));
            for entry in block.parse_list(peer::ALLOWEDIPS, &ALLOWEDIP_POLICY)? {
                let raw = entry.bytes(allowedip::IPADDR).context("prefix address")?;
                let ip = match raw.len() {
                    4 => IpAddr::from(<[u8; 4]>::try_from(raw)?),
                    16 => IpAddr::from(<[u8; 16]>::try_from(raw)?),
                    n => bail!("bad address length {n}"),
                };
                let cidr = entry.u8(allowedip::CIDR_MASK).context("prefix length")?;
                view.prefixes.insert(format!("{ip}/{cidr}"));
            }
        }
        Ok(())
    }

    pub fn prefix_count(&self) -> usize {
        self.peers.values().map(|p| p.prefixes.len()).sum()
    }
}

/// Events the data plane recorded, for assertions.
pub fn events(h: &Harness) -> Vec<DataPlaneEvent> {
    h.plane.events()
}
