use crate::*;

use veil_core::crypto::Keypair;

// ══════════════════════════════════════════════════════════════════════════════
//  Mutation: ordering, partial application, key handling
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_partial_application() {
    let h = Harness::new();
    let mut first = PeerBlock::new(key(1)).prefix("10.0.0.0", 8).prefix("10.1.0.0", 33);
    first.endpoint = Some("198.51.100.4:4000".parse().unwrap());
    let second = PeerBlock::new(key(2)).prefix("10.2.0.0", 16);

    assert_eq!(h.set(|w| put_peers(w, &[first, second])), libc::EINVAL);

    let dump = h.dump().unwrap();
    let applied = &dump.peers[&key(1)];
    assert_eq!(applied.endpoint, Some("198.51.100.4:4000".parse().unwrap()));
    assert_eq!(applied.prefixes, BTreeSet::from(["10.0.0.0/8".to_string()]));
    assert!(!dump.peers.contains_key(&key(2)), "later blocks are not applied");
}

#[test]
fn test_device_fields_survive_failed_peer_block() {
    let h = Harness::new();
    let mut bad = PeerBlock::new(key(1));
    bad.flags = peer::F_REMOVE_ME;
    assert_eq!(
        h.set(|w| {
            w.put_u32(device::FWMARK, 0x10).unwrap();
            put_peers(w, &[bad]);
        }),
        libc::ENODEV
    );
    assert_eq!(h.dump().unwrap().fwmark, Some(0x10));
}

#[test]
fn test_private_key_collision_removes_peer() {
    let h = Harness::new();
    let identity = Keypair::generate();
    let other = Keypair::generate().public;
    let peers = [
        PeerBlock::new(identity.public).prefix("10.9.0.0", 16),
        PeerBlock::new(other),
    ];
    assert_eq!(h.set(|w| put_peers(w, &peers)), 0);
    assert_eq!(h.dump().unwrap().peers.len(), 2);

    assert_eq!(
        h.set(|w| w.put(device::PRIVATE_KEY, &*identity.private_bytes()).unwrap()),
        0
    );
    let dump = h.dump().unwrap();
    assert_eq!(dump.public_key, Some(identity.public));
    assert!(!dump.peers.contains_key(&identity.public));
    assert!(dump.peers.contains_key(&other));
    assert_eq!(dump.prefix_count(), 0, "the removed peer's prefixes go with it");
}

#[test]
fn test_own_public_key_is_ignored() {
    let h = Harness::new();
    let identity = Keypair::generate();
    assert_eq!(
        h.set(|w| {
            w.put(device::PRIVATE_KEY, &*identity.private_bytes()).unwrap();
            put_peers(w, &[PeerBlock::new(identity.public).prefix("10.0.0.0", 8)]);
        }),
        0
    );
    assert!(h.dump().unwrap().peers.is_empty());
}

#[test]
fn test_zero_private_key_clears_identity() {
    let h = Harness::new();
    let identity = Keypair::generate();
    assert_eq!(
        h.set(|w| w.put(device::PRIVATE_KEY, &*identity.private_bytes()).unwrap()),
        0
    );
    assert!(h.dump().unwrap().public_key.is_some());
    assert_eq!(h.set(|w| w.put(device::PRIVATE_KEY, &[0; 32]).unwrap()), 0);
    let dump = h.dump().unwrap();
    assert_eq!(dump.public_key, None);
    assert_eq!(dump.private_key, None);
}

#[test]
fn test_replace_prefixes_then_insert() {
    let h = Harness::new();
    let start = PeerBlock::new(key(1))
        .prefix("192.168.0.0", 16)
        .prefix("fd00::", 8)
        .prefix("10.0.0.0", 8);
    assert_eq!(h.set(|w| put_peers(w, &[start])), 0);

    let mut replace = PeerBlock::new(key(1)).prefix("10.0.0.0", 24);
    replace.flags = peer::F_REPLACE_ALLOWEDIPS;
    assert_eq!(h.set(|w| put_peers(w, &[replace.clone()])), 0);
    assert_eq!(
        h.dump().unwrap().peers[&key(1)].prefixes,
        BTreeSet::from(["10.0.0.0/24".to_string()])
    );

    // Same request against a peer with no prefixes at all.
    replace.public_key = key(2);
    assert_eq!(h.set(|w| put_peers(w, &[replace])), 0);
    assert_eq!(h.dump().unwrap().peers[&key(2)].prefixes.len(), 1);
}

#[test]
fn test_prefix_moves_between_peers() {
    let h = Harness::new();
    assert_eq!(
        h.set(|w| put_peers(w, &[PeerBlock::new(key(1)).prefix("10.5.0.0", 16)])),
        0
    );
    assert_eq!(
        h.set(|w| put_peers(w, &[PeerBlock::new(key(2)).prefix("10.5.7.7", 16)])),
        0
    );
    let dump = h.dump().unwrap();
    assert!(dump.peers[&key(1)].prefixes.is_empty());
    assert!(dump.peers[&key(2)].prefixes.contains("10.5.0.0/16"));
}

fn has_run(buf: &[u8], needle: &[u8]) -> bool {
    buf.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn test_secrets_scrubbed_from_request() {
    let h = Harness::new();
    let identity = Keypair::generate();
    let private = *identity.private_bytes();
    let psk = [0x5A; 32];

    let mut block = PeerBlock::new(Keypair::generate().public);
    block.preshared_key = Some(psk);
    let mut ok = set_request(|w| {
        w.put_str(device::IFNAME, "wg0").unwrap();
        w.put(device::PRIVATE_KEY, &private).unwrap();
        put_peers(w, &[block.clone()]);
    });
    assert!(has_run(&ok, &psk) && has_run(&ok, &private));
    assert_eq!(h.send(&h.root, &mut ok), 0);
    assert!(!has_run(&ok, &psk[..8]));
    assert!(!has_run(&ok, &private[..8]));
    assert_eq!(h.dump().unwrap().peers[&block.public_key].preshared_key, Some(psk));

    // Failure paths scrub too: unknown device, and a rejected peer block.
    let mut missing = set_request(|w| {
        w.put_str(device::IFNAME, "wg9").unwrap();
        put_peers(w, &[block.clone()]);
    });
    assert_eq!(h.send(&h.root, &mut missing), libc::ENODEV);
    assert!(!has_run(&missing, &psk[..8]));

    let mut bad = block.clone();
    bad.prefixes.push(("10.0.0.0".parse().unwrap(), 40));
    let mut rejected = set_request(|w| {
        w.put_str(device::IFNAME, "wg0").unwrap();
        put_peers(w, &[bad]);
    });
    assert_eq!(h.send(&h.root, &mut rejected), libc::EINVAL);
    assert!(!has_run(&rejected, &psk[..8]));

    let nobody = Caller::new(99, h.namespaces.init());
    let mut denied = set_request(|w| {
        w.put_str(device::IFNAME, "wg0").unwrap();
        put_peers(w, &[block.clone()]);
    });
    assert_eq!(h.send(&nobody, &mut denied), libc::EPERM);
    assert!(!has_run(&denied, &psk[..8]));
}

#[test]
fn test_remove_unknown_peer_is_enodev() {
    let h = Harness::new();
    let mut block = PeerBlock::new(key(7));
    block.flags = peer::F_REMOVE_ME;
    assert_eq!(h.set(|w| put_peers(w, &[block])), libc::ENODEV);
}

#[test]
fn test_replace_peers() {
    let h = Harness::new();
    let old: Vec<PeerBlock> = (1..=3)
        .map(|n| PeerBlock::new(key(n)).prefix(&format!("10.{n}.0.0"), 16))
        .collect();
    assert_eq!(h.set(|w| put_peers(w, &old)), 0);
    assert_eq!(
        h.set(|w| {
            w.put_u32(device::FLAGS, device::F_REPLACE_PEERS).unwrap();
            put_peers(w, &[PeerBlock::new(key(9))]);
        }),
        0
    );
    let dump = h.dump().unwrap();
    assert_eq!(dump.order, vec![key(9)]);
    assert_eq!(dump.prefix_count(), 0);
}

#[test]
fn test_peer_block_validation() {
    let h = Harness::new();

    // Public key of the wrong length.
    let mut req = set_request(|w| {
        w.put_str(device::IFNAME, "wg0").unwrap();
        let list = w.nest_start(device::PEERS).unwrap();
        let block = w.nest_start(0).unwrap();
        w.put(peer::PUBLIC_KEY, &[1; 33]).unwrap();
        w.nest_end(block);
        w.nest_end(list);
    });
    assert_eq!(h.send(&h.root, &mut req), libc::EINVAL);

    // Unsupported protocol version.
    let mut req = set_request(|w| {
        w.put_str(device::IFNAME, "wg0").unwrap();
        let list = w.nest_start(device::PEERS).unwrap();
        let block = w.nest_start(0).unwrap();
        w.put(peer::PUBLIC_KEY, &key(1)).unwrap();
        w.put_u32(peer::PROTOCOL_VERSION, 2).unwrap();
        w.nest_end(block);
        w.nest_end(list);
    });
    assert_eq!(h.send(&h.root, &mut req), libc::EPFNOSUPPORT);

    // A malformed endpoint is ignored, not rejected.
    let mut req = set_request(|w| {
        w.put_str(device::IFNAME, "wg0").unwrap();
        let list = w.nest_start(device::PEERS).unwrap();
        let block = w.nest_start(0).unwrap();
        w.put(peer::PUBLIC_KEY, &key(1)).unwrap();
        w.put(peer::ENDPOINT, &[0xFF; 20]).unwrap();
        w.nest_end(block);
        w.nest_end(list);
    });
    assert_eq!(h.send(&h.root, &mut req), 0);
    assert_eq!(h.dump().unwrap().peers[&key(1)].endpoint, None);
}

#[test]
fn test_live_link_side_effects() {
    let h = Harness::new();
    h.device.open().unwrap();
    let bound = h.device.listen_port();
    h.plane.clear();

    let mut block = PeerBlock::new(key(1));
    block.keepalive = Some(25);
    assert_eq!(h.set(|w| put_peers(w, &[block.clone()])), 0);
    assert_eq!(
        events(&h),
        vec![DataPlaneEvent::Keepalive(key(1)), DataPlaneEvent::Staged(key(1))]
    );

    h.plane.clear();
    assert_eq!(h.set(|w| w.put_u16(device::LISTEN_PORT, bound).unwrap()), 0);
    assert!(events(&h).is_empty(), "unchanged port does not rebind");

    assert_eq!(h.set(|w| w.put_u16(device::LISTEN_PORT, 0).unwrap()), 0);
    assert!(matches!(
        events(&h).as_slice(),
        [DataPlaneEvent::Rebind { netns: 1, .. }]
    ));
    assert_eq!(h.dump().unwrap().listen_port, Some(h.device.listen_port()));
    assert_eq!(h.dump().unwrap().peers[&key(1)].keepalive, Some(25));
}

#[test]
fn test_every_request_advances_generation() {
    let h = Harness::new();
    let before = h.dump().unwrap().generations[0];
    assert_eq!(h.set(|_| {}), 0);
    let mut bad = PeerBlock::new(key(1));
    bad.flags = peer::F_REMOVE_ME;
    assert_eq!(h.set(|w| put_peers(w, &[bad])), libc::ENODEV);
    assert_eq!(h.dump().unwrap().generations[0], before + 2);
}
