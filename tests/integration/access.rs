use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Access: callers, namespaces, device selection
// ══════════════════════════════════════════════════════════════════════════════

fn by_name(name: &str) -> impl FnOnce(&mut AttrWriter<'_>) + '_ {
    move |w| w.put_str(device::IFNAME, name).unwrap()
}

#[test]
fn test_unprivileged_caller_is_refused() {
    let h = Harness::new();
    let nobody = Caller::new(50, h.namespaces.init());
    assert_eq!(dump_errno(&h.control, &nobody, by_name("wg0")), libc::EPERM);

    let mut req = set_request(|w| {
        w.put_str(device::IFNAME, "wg0").unwrap();
        w.put_u32(device::FWMARK, 1).unwrap();
    });
    assert_eq!(h.send(&nobody, &mut req), libc::EPERM);
    assert_eq!(h.dump().unwrap().fwmark, Some(0));
}

#[test]
fn test_unknown_and_foreign_links() {
    let h = Harness::new();
    let init = h.namespaces.init();
    let eth0 = init.add_foreign("eth0").unwrap();

    assert_eq!(dump_errno(&h.control, &h.root, by_name("wg7")), libc::ENODEV);
    assert_eq!(dump_errno(&h.control, &h.root, by_name("eth0")), libc::EOPNOTSUPP);
    assert_eq!(
        dump_errno(&h.control, &h.root, |w| w.put_u32(device::IFINDEX, eth0).unwrap()),
        libc::EOPNOTSUPP
    );

    let mut req = set_request(|w| w.put_str(device::IFNAME, "eth0").unwrap());
    assert_eq!(h.send(&h.root, &mut req), libc::EOPNOTSUPP);
}

#[test]
fn test_namespace_override() {
    let h = Harness::new();
    let other = h.namespaces.create(INIT_USER_NS);
    other
        .create_device("wg2", Arc::new(RecordingDataPlane::new()))
        .unwrap();
    h.namespaces.attach_pid(4242, &other);
    let root = h.root.clone().with_netns_fd(7, other.clone());

    // Without an override the name resolves in the caller's own namespace.
    assert_eq!(dump_errno(&h.control, &root, by_name("wg2")), libc::ENODEV);

    let by_pid = dump_with(&h.control, &root, |w| {
        w.put_u32(device::DEV_NETNS_PID, 4242).unwrap();
        w.put_str(device::IFNAME, "wg2").unwrap();
    })
    .unwrap();
    assert_eq!(by_pid.ifname.as_deref(), Some("wg2"));

    let by_fd = dump_with(&h.control, &root, |w| {
        w.put_u32(device::DEV_NETNS_FD, 7).unwrap();
        w.put_str(device::IFNAME, "wg2").unwrap();
    })
    .unwrap();
    assert_eq!(by_fd.ifname.as_deref(), Some("wg2"));

    let both = |w: &mut AttrWriter<'_>| {
        w.put_u32(device::DEV_NETNS_PID, 4242).unwrap();
        w.put_u32(device::DEV_NETNS_FD, 7).unwrap();
        w.put_str(device::IFNAME, "wg2").unwrap();
    };
    assert_eq!(dump_errno(&h.control, &root, both), libc::EINVAL);

    assert_eq!(
        dump_errno(&h.control, &root, |w| {
            w.put_u32(device::DEV_NETNS_PID, 9999).unwrap();
            w.put_str(device::IFNAME, "wg2").unwrap();
        }),
        libc::ESRCH
    );
    assert_eq!(
        dump_errno(&h.control, &root, |w| {
            w.put_u32(device::DEV_NETNS_FD, 8).unwrap();
            w.put_str(device::IFNAME, "wg2").unwrap();
        }),
        libc::EBADF
    );
}

#[test]
fn test_capability_is_per_user_namespace() {
    let h = Harness::new();
    let child = h.namespaces.create(5);
    child
        .create_device("wg1", Arc::new(RecordingDataPlane::new()))
        .unwrap();
    h.namespaces.attach_pid(1, &h.namespaces.init());
    let admin = Caller::new(300, child).with_capability(5);

    assert!(dump_with(&h.control, &admin, by_name("wg1")).is_ok());
    assert_eq!(
        dump_errno(&h.control, &admin, |w| {
            w.put_u32(device::DEV_NETNS_PID, 1).unwrap();
            w.put_str(device::IFNAME, "wg0").unwrap();
        }),
        libc::EPERM
    );
}

#[test]
fn test_listen_port_hidden_without_socket_capability() {
    let h = Harness::new();
    let child = h.namespaces.create(5);
    let transit = h.namespaces.create(9);
    child
        .create_device("wg1", Arc::new(RecordingDataPlane::new()))
        .unwrap();
    h.namespaces.attach_pid(500, &child);
    h.namespaces.attach_pid(900, &transit);

    // Root moves wg1's transport into a namespace the child admin cannot see.
    let mut req = set_request(|w| {
        w.put_u32(device::DEV_NETNS_PID, 500).unwrap();
        w.put_str(device::IFNAME, "wg1").unwrap();
        w.put_u32(device::TRANSIT_NETNS_PID, 900).unwrap();
        w.put_u16(device::LISTEN_PORT, 51820).unwrap();
    });
    assert_eq!(h.send(&h.root, &mut req), 0);

    let seen_by_root = dump_with(&h.control, &h.root, |w| {
        w.put_u32(device::DEV_NETNS_PID, 500).unwrap();
        w.put_str(device::IFNAME, "wg1").unwrap();
    })
    .unwrap();
    assert_eq!(seen_by_root.listen_port, Some(51820));

    let admin = Caller::new(501, child).with_capability(5);
    let seen_by_admin = dump_with(&h.control, &admin, by_name("wg1")).unwrap();
    assert_eq!(seen_by_admin.listen_port, None);
    assert_eq!(seen_by_admin.ifname.as_deref(), Some("wg1"));

    // Nor may the child admin move the transport there itself.
    let mut req = set_request(|w| {
        w.put_str(device::IFNAME, "wg1").unwrap();
        w.put_u16(device::LISTEN_PORT, 51821).unwrap();
    });
    assert_eq!(h.send(&admin, &mut req), libc::EPERM);
}

#[test]
fn test_unknown_attributes_are_ignored() {
    let h = Harness::new();
    assert_eq!(
        h.set(|w| {
            w.put_u32(0x7F, 5).unwrap();
            w.put_u32(device::FWMARK, 3).unwrap();
        }),
        0
    );
    let dump = dump_with(&h.control, &h.root, |w| {
        w.put(0x7E, b"junk").unwrap();
        w.put_str(device::IFNAME, "wg0").unwrap();
    })
    .unwrap();
    assert_eq!(dump.fwmark, Some(3));
}

#[test]
fn test_get_without_dump_flag_is_unsupported() {
    let h = Harness::new();
    let mut req = request(Command::GetDevice, 0, by_name("wg0"));
    assert_eq!(h.send(&h.root, &mut req), libc::EOPNOTSUPP);
}

#[test]
fn test_truncated_request_is_rejected() {
    let h = Harness::new();
    let mut req = set_request(by_name("wg0"));
    let short = req.len() - 3;
    assert_eq!(h.send(&h.root, &mut req[..short]), libc::EINVAL);
}
