//! Errors surfaced by control requests.
//!
//! Every failure maps onto a small taxonomy (`ErrorKind`) and onto the POSIX
//! errno a client sees in the ERROR reply.

use thiserror::Error;

use veil_core::{CodecError, WireError};

/// Broad class of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    PermissionDenied,
    NotFound,
    ResourceExhausted,
    ProtocolMismatch,
    /// The transport socket could not be rebound.
    Transport,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("malformed attributes: {0}")]
    Codec(#[from] CodecError),

    #[error("malformed message: {0}")]
    Wire(#[from] WireError),

    #[error("operation not supported in this form")]
    Unsupported,

    #[error("exactly one of interface index and interface name must be given")]
    AmbiguousDevice,

    #[error("namespace given both by pid and by descriptor")]
    AmbiguousNamespace,

    #[error("no process with pid {0}")]
    NoSuchProcess(u32),

    #[error("descriptor {0} does not refer to a network namespace")]
    BadNamespaceFd(u32),

    #[error("caller lacks the administrative capability in namespace {0}")]
    PermissionDenied(u64),

    #[error("no such device")]
    NoSuchDevice,

    #[error("link {0} was not created by veil")]
    NotOurs(String),

    #[error("link name {0} already in use")]
    NameInUse(String),

    #[error("peer block without a valid public key")]
    MissingPublicKey,

    #[error("no peer {0} to remove")]
    NoSuchPeer(String),

    #[error("public key {0} cannot be used with the device identity")]
    PeerKeyRejected(String),

    #[error("allowed prefix is missing fields or malformed")]
    InvalidPrefix,

    #[error("unsupported peer protocol version {0}")]
    ProtocolMismatch(u32),

    #[error("reply buffer cannot hold a single record")]
    MessageTooLarge,

    #[error("failed to bind transport socket: {0}")]
    Rebind(#[source] std::io::Error),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        use ControlError::*;
        match self {
            Codec(_) | Wire(_) | Unsupported | AmbiguousDevice | AmbiguousNamespace
            | BadNamespaceFd(_) | NotOurs(_) | NameInUse(_) | MissingPublicKey
            | PeerKeyRejected(_) | InvalidPrefix => ErrorKind::InvalidArgument,
            PermissionDenied(_) => ErrorKind::PermissionDenied,
            NoSuchProcess(_) | NoSuchDevice | NoSuchPeer(_) => ErrorKind::NotFound,
            MessageTooLarge => ErrorKind::ResourceExhausted,
            ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            Rebind(_) => ErrorKind::Transport,
        }
    }

    /// Positive errno carried in the ERROR reply.
    pub fn errno(&self) -> i32 {
        use ControlError::*;
        match self {
            Codec(_) | Wire(_) | AmbiguousDevice | AmbiguousNamespace | MissingPublicKey
            | PeerKeyRejected(_) | InvalidPrefix => libc::EINVAL,
            Unsupported | NotOurs(_) => libc::EOPNOTSUPP,
            NameInUse(_) => libc::EEXIST,
            NoSuchProcess(_) => libc::ESRCH,
            BadNamespaceFd(_) => libc::EBADF,
            PermissionDenied(_) => libc::EPERM,
            NoSuchDevice | NoSuchPeer(_) => libc::ENODEV,
            MessageTooLarge => libc::EMSGSIZE,
            ProtocolMismatch(_) => libc::EPFNOSUPPORT,
            Rebind(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
