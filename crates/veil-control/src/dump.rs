//! The resumable multi-message device dump.
//!
//! A [`DumpSession`] produces one reply message per call to
//! [`next_message`](DumpSession::next_message), taking the device update
//! lock only while that message is built. Between messages the position is
//! kept in a [`DumpCursor`]: the last peer fully written (held alive so it
//! can still be recognised after being removed) and the prefix position
//! inside the peer being written.
//!
//! Every message carries the device generation in its sequence field. Two
//! messages with different generations did not come from one consistent
//! snapshot; nothing stronger is promised.

use std::sync::Arc;

use bytes::BytesMut;

use veil_core::attr::AttrWriter;
use veil_core::config::MAX_MESSAGE_SIZE;
use veil_core::schema::device;
use veil_core::wire::{begin_message, finish_message, FLAG_MULTI};
use veil_core::Command;

use crate::allowedips::PrefixCursor;
use crate::device::{Device, DeviceState};
use crate::error::ControlError;
use crate::namespace::Caller;
use crate::peer::Peer;
use crate::serialize::{write_device_fields, write_peer};

/// Position of a dump between messages.
#[derive(Debug, Default)]
pub struct DumpCursor {
    last_peer: Option<Arc<Peer>>,
    prefixes: PrefixCursor,
    device_sent: bool,
}

impl DumpCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last peer written in full, if any.
    pub fn last_peer(&self) -> Option<&Arc<Peer>> {
        self.last_peer.as_ref()
    }

    pub fn prefixes(&self) -> PrefixCursor {
        self.prefixes
    }

    fn position(&self) -> (Option<u64>, PrefixCursor, bool) {
        (
            self.last_peer.as_ref().map(|p| p.id()),
            self.prefixes,
            self.device_sent,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Streaming,
    Done,
}

pub struct DumpSession {
    device: Arc<Device>,
    caller: Caller,
    max_message_size: usize,
    cursor: DumpCursor,
    state: State,
    messages: usize,
}

impl DumpSession {
    /// Begin dumping `device` on behalf of `caller`. Each message is at most
    /// `max_message_size` bytes, and never more than the 16-bit attribute
    /// lengths can describe.
    pub fn start(device: Arc<Device>, caller: Caller, max_message_size: usize) -> Self {
        let max_message_size = max_message_size.min(MAX_MESSAGE_SIZE);
        tracing::debug!(device = %device.name(), max_message_size, "dump started");
        Self {
            device,
            caller,
            max_message_size,
            cursor: DumpCursor::new(),
            state: State::Streaming,
            messages: 0,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn cursor(&self) -> &DumpCursor {
        &self.cursor
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Build the next reply message, or `None` once the dump is complete.
    ///
    /// Fails with [`ControlError::MessageTooLarge`] if the message budget
    /// cannot hold even one more record; the session is finished after any
    /// error.
    pub fn next_message(&mut self) -> Result<Option<BytesMut>, ControlError> {
        if self.state == State::Done {
            return Ok(None);
        }
        let device = self.device.clone();
        let state = device.lock();
        let generation = state.generation();

        let mut buf = BytesMut::with_capacity(self.max_message_size);
        let start = begin_message(&mut buf, Command::GetDevice, FLAG_MULTI, generation);
        let before = self.cursor.position();
        let step = {
            let mut w = AttrWriter::new(&mut buf, self.max_message_size);
            self.write_step(&mut w, &device, &state)
        };
        drop(state);

        let done = match step {
            Ok(done) => done,
            Err(err) => {
                self.finish();
                return Err(err);
            }
        };
        if !done && self.cursor.position() == before {
            tracing::warn!(device = %device.name(), budget = self.max_message_size, "dump cannot make progress");
            self.finish();
            return Err(ControlError::MessageTooLarge);
        }
        finish_message(&mut buf, start);
        self.messages += 1;
        tracing::debug!(
            device = %device.name(),
            generation,
            message = self.messages,
            len = buf.len(),
            done,
            "dump message"
        );
        if done {
            self.finish();
        }
        Ok(Some(buf))
    }

    /// Write device fields if still owed, then as many peers as fit.
    /// Returns whether the peer list was exhausted.
    fn write_step(
        &mut self,
        w: &mut AttrWriter<'_>,
        dev: &Device,
        state: &DeviceState,
    ) -> Result<bool, ControlError> {
        if !self.cursor.device_sent {
            write_device_fields(w, dev, state, &self.caller)
                .map_err(|_| ControlError::MessageTooLarge)?;
            self.cursor.device_sent = true;
        }

        let peers = state.peers();
        let resume_at = match &self.cursor.last_peer {
            None => 0,
            // A removed cursor peer ends the dump; the generation stamp
            // tells the reader the snapshot was not consistent.
            Some(last) if !last.is_linked() => return Ok(true),
            Some(last) => match peers.iter().position(|p| Arc::ptr_eq(p, last)) {
                Some(i) => i + 1,
                None => return Ok(true),
            },
        };
        if resume_at >= peers.len() {
            return Ok(true);
        }

        let Ok(nest) = w.nest_start(device::PEERS) else {
            return Ok(false);
        };
        let mut done = true;
        for (index, peer) in peers[resume_at..].iter().enumerate() {
            let index = u16::try_from(index).unwrap_or(u16::MAX);
            if write_peer(w, index, peer, dev.allowed_ips(), &mut self.cursor.prefixes).is_err() {
                done = false;
                break;
            }
            self.cursor.last_peer = Some(peer.clone());
        }
        w.nest_end(nest);
        Ok(done)
    }

    fn finish(&mut self) {
        self.state = State::Done;
        self.cursor.last_peer = None;
        self.cursor.prefixes.reset();
    }
}

impl Iterator for DumpSession {
    type Item = Result<BytesMut, ControlError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_message().transpose()
    }
}

impl Drop for DumpSession {
    fn drop(&mut self) {
        if self.state == State::Streaming {
            tracing::debug!(device = %self.device.name(), messages = self.messages, "dump aborted");
        }
    }
}
