//! C12: RAW comm point (spec §4.8).
//!
//! The escape hatch for callers that want readiness notification without any
//! of the framing, buffering, or batching the other roles do: the fd is
//! registered for exactly the interest the caller asked for (`READABLE |
//! PERSIST` or `WRITABLE | PERSIST`) and every event — including a timeout —
//! goes straight to the callback. The callback does its own I/O against the
//! fd via [`CommPointOps::fd`].

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::buffer::Buffer;
use crate::comm::{self, Callback, CommPointOps, CommRole, NetEvent, ReplyInfo};
use crate::interest::Interest;

pub struct RawPoint {
    fd: RawFd,
    interest: Interest,
    /// Unused for I/O (raw points do their own read/write against `fd`
    /// directly); kept only so `comm::invoke`'s `CallbackCtx` has somewhere
    /// to point.
    scratch: Buffer,
    /// One-shot deadline (spec §3 "timeout, optional, role-dependent"; §4.8
    /// "delivers every event, including timeout"). Cleared once it fires;
    /// the callback re-arms it by recreating the point if it wants another.
    deadline: Option<Instant>,
    callback: Callback,
    exit_requested: bool,
}

impl RawPoint {
    pub fn new(fd: RawFd, interest: Interest, timeout: Option<Duration>, now: Instant, callback: Callback) -> RawPoint {
        RawPoint {
            fd,
            interest,
            scratch: Buffer::with_capacity(0),
            deadline: timeout.map(|t| now + t),
            callback,
            exit_requested: false,
        }
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Delivers any event kind (including [`NetEvent::Timeout`]) straight to
    /// the callback. Returns `true` if the dispatcher should close and
    /// reclaim this point.
    pub(crate) fn handle_event(&mut self, kind: NetEvent) -> bool {
        let reply = ReplyInfo::empty();
        let (_send, close, exit) = comm::invoke(&mut self.callback, &mut self.scratch, &reply, kind);
        if exit {
            self.exit_requested = true;
        }
        close
    }

    /// Fires the deadline: clears it (one-shot) and delivers
    /// [`NetEvent::Timeout`] to the callback.
    pub(crate) fn handle_timeout(&mut self) -> bool {
        self.deadline = None;
        self.handle_event(NetEvent::Timeout)
    }

    /// Clears and returns whether the callback invoked on the last event
    /// asked to stop the owning base's dispatch loop (spec §4.1 `exit`).
    pub(crate) fn take_exit_requested(&mut self) -> bool {
        std::mem::take(&mut self.exit_requested)
    }
}

impl CommPointOps for RawPoint {
    fn role(&self) -> CommRole {
        CommRole::Raw
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<RawPoint>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_the_configured_interest() {
        let point = RawPoint::new(-1, Interest::WRITABLE, None, Instant::now(), Box::new(|_| false));
        assert!(point.interest().is_writable());
        assert!(!point.interest().is_readable());
    }

    #[test]
    fn timeout_reaches_the_callback_kind_unchanged() {
        let mut point = RawPoint::new(-1, Interest::READABLE, None, Instant::now(), Box::new(|ctx| {
            assert_eq!(ctx.kind(), NetEvent::Timeout);
            false
        }));
        assert!(!point.handle_event(NetEvent::Timeout));
    }

    #[test]
    fn deadline_is_cleared_once_it_fires() {
        let now = Instant::now();
        let mut point = RawPoint::new(-1, Interest::READABLE, Some(Duration::from_secs(5)), now, Box::new(|_| false));
        assert!(point.deadline().is_some());
        point.handle_timeout();
        assert!(point.deadline().is_none());
    }
}
