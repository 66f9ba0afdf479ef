//! veil-control — the configuration control plane for veil devices.
//!
//! A request is decoded (`request`), resolved to a device (`resolve`), then
//! handed to either the dump engine (`dump`, multi-message read path) or the
//! mutation engine (`configure`, single-message write path). `Control` ties
//! the three together for a transport.

pub mod allowedips;
pub mod configure;
pub mod control;
pub mod dataplane;
pub mod device;
pub mod dump;
pub mod error;
pub mod namespace;
pub mod peer;
pub mod request;
pub mod resolve;
pub mod serialize;

pub use allowedips::{AllowedIps, Prefix, PrefixCursor};
pub use control::{Control, Reply};
pub use dataplane::{DataPlane, DataPlaneEvent, RecordingDataPlane};
pub use device::{Device, DeviceState, StaticIdentity};
pub use dump::{DumpCursor, DumpSession};
pub use error::{ControlError, ErrorKind};
pub use namespace::{Caller, Link, NetNamespace, Namespaces, NetnsRef, INIT_USER_NS};
pub use peer::{Endpoint, Peer};
pub use request::{DeviceChange, NetnsSelector, PeerChange, PrefixChange, Target};
