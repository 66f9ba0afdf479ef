//! Mapping a request's device selector to a live device.

use std::sync::Arc;

use crate::device::Device;
use crate::error::ControlError;
use crate::namespace::{Caller, Link, NetNamespace, Namespaces};
use crate::request::{NetnsSelector, Target};

/// Look up the namespace named by `selector`. `None` means "not given".
pub fn resolve_netns(
    namespaces: &Namespaces,
    caller: &Caller,
    selector: Option<NetnsSelector>,
) -> Result<Option<Arc<NetNamespace>>, ControlError> {
    match selector {
        None => Ok(None),
        Some(NetnsSelector::Pid(pid)) => namespaces
            .by_pid(pid)
            .map(Some)
            .ok_or(ControlError::NoSuchProcess(pid)),
        Some(NetnsSelector::Fd(fd)) => caller
            .netns_by_fd(fd)
            .map(Some)
            .ok_or(ControlError::BadNamespaceFd(fd)),
    }
}

/// Resolve the namespace, check the caller's capability there, then find
/// the device by exactly one of index and name.
pub fn resolve_device(
    namespaces: &Namespaces,
    caller: &Caller,
    target: &Target,
) -> Result<Arc<Device>, ControlError> {
    let netns = resolve_netns(namespaces, caller, target.netns)?
        .unwrap_or_else(|| caller.netns().clone());
    if !caller.ns_capable(netns.handle()) {
        return Err(ControlError::PermissionDenied(netns.id()));
    }
    let link = match (target.ifindex, target.ifname.as_deref()) {
        (Some(ifindex), None) => netns.link_by_index(ifindex),
        (None, Some(name)) => netns.link_by_name(name),
        _ => return Err(ControlError::AmbiguousDevice),
    };
    match link {
        Some(Link::Veil(device)) => Ok(device),
        Some(Link::Foreign { name }) => Err(ControlError::NotOurs(name)),
        None => Err(ControlError::NoSuchDevice),
    }
}
