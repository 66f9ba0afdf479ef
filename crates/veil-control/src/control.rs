//! Request dispatch for a control transport.
//!
//! A transport hands each inbound message to [`Control::handle`] together
//! with the identity of whoever sent it, and gets back either a single reply
//! message or a [`DumpSession`] to drain.

use std::sync::Arc;

use bytes::BytesMut;
use zerocopy::{FromBytes, FromZeroes};

use veil_core::wire::{error_message, Frame, MsgHeader, PAYLOAD_OFFSET};
use veil_core::Command;

use crate::configure;
use crate::dump::DumpSession;
use crate::error::ControlError;
use crate::namespace::{Caller, Namespaces};
use crate::request::{scrub_secrets, DeviceChange, Target};
use crate::resolve::resolve_device;

pub enum Reply {
    /// A single ERROR message; errno 0 acknowledges success.
    Message(BytesMut),
    /// Dump replies to stream, followed by DONE.
    Dump(DumpSession),
}

pub struct Control {
    namespaces: Arc<Namespaces>,
    max_message_size: usize,
}

impl Control {
    pub fn new(namespaces: Arc<Namespaces>, max_message_size: usize) -> Self {
        Self {
            namespaces,
            max_message_size,
        }
    }

    pub fn namespaces(&self) -> &Arc<Namespaces> {
        &self.namespaces
    }

    /// Handle one request message. SET_DEVICE requests have their key
    /// material overwritten in `request` before this returns.
    pub fn handle(&self, caller: &Caller, request: &mut [u8]) -> Reply {
        let header = MsgHeader::read_from_prefix(request).unwrap_or_else(MsgHeader::new_zeroed);
        match self.dispatch(caller, request) {
            Ok(Some(session)) => Reply::Dump(session),
            Ok(None) => Reply::Message(error_message(&header, 0)),
            Err(err) => {
                tracing::warn!(pid = caller.pid, seq = header.seq, error = %err, "request failed");
                Reply::Message(error_message(&header, err.errno()))
            }
        }
    }

    fn dispatch(&self, caller: &Caller, request: &mut [u8]) -> Result<Option<DumpSession>, ControlError> {
        let framed = Frame::parse(request)
            .and_then(|(frame, _)| Ok((frame.command()?, frame.is_dump(), frame.header.len as usize)));
        let (command, dump, end) = match framed {
            Ok(framed) => framed,
            Err(err) => {
                // Nothing in an unframed request can be told apart from key
                // material, so all of it is wiped.
                if let Some(rest) = request.get_mut(PAYLOAD_OFFSET..) {
                    rest.fill(0);
                }
                return Err(err.into());
            }
        };
        match command {
            Command::GetDevice if dump => self
                .start_dump(caller, &request[PAYLOAD_OFFSET..end])
                .map(Some),
            Command::GetDevice => Err(ControlError::Unsupported),
            Command::SetDevice => self
                .set_device(caller, &mut request[PAYLOAD_OFFSET..end])
                .map(|()| None),
        }
    }

    /// Resolve the device named in a GET_DEVICE payload and open a dump.
    pub fn start_dump(&self, caller: &Caller, payload: &[u8]) -> Result<DumpSession, ControlError> {
        let target = Target::parse(payload)?;
        let device = resolve_device(&self.namespaces, caller, &target)?;
        Ok(DumpSession::start(device, caller.clone(), self.max_message_size))
    }

    /// Decode, scrub, resolve and apply a SET_DEVICE payload.
    pub fn set_device(&self, caller: &Caller, payload: &mut [u8]) -> Result<(), ControlError> {
        let decoded = DeviceChange::parse(payload);
        scrub_secrets(payload);
        let change = decoded?;
        let device = resolve_device(&self.namespaces, caller, &change.target)?;
        configure::apply(&self.namespaces, caller, &device, &change)
    }
}
