//! C3/C8/C9/C10: TCP-ACCEPT, TCP-HANDLER and TCP-OUTBOUND (spec §4.4-§4.6).
//!
//! The length-prefixed DNS-over-TCP framing state machine (`Framing`) is
//! shared by all three roles: `TcpAccept` drives a preallocated pool of
//! handlers through it, `Outbound` drives exactly one. Only `Outbound` ever
//! sets `check_nb_connect` (spec §4.6 "Nonblocking connect").

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::buffer::Buffer;
use crate::comm::{self, Callback, CommPointOps, CommRole, NetEvent, ReplyInfo};
use crate::interest::Interest;
use crate::sys::unix::socket;
use crate::{MINIMUM_DNS_MESSAGE_LEN, TCP_QUERY_TIMEOUT};

/// What happened on one `read`/`write` attempt against the framing state
/// machine. Carries the raw error so the caller (which knows whether it's
/// driving an inbound handler or an outbound connection) can apply its own
/// logging-verbosity policy (spec §4.5's per-errno table).
pub(crate) enum FramingEvent {
    /// Not enough bytes moved yet; stay registered for the same direction.
    Pending,
    WouldBlock,
    /// The length prefix and full body have been read; `buffer` is flipped
    /// to `[0, len)` and ready for the callback.
    MessageReady,
    /// The reply (prefix and body) has gone out in full.
    WriteComplete,
    /// Peer closed mid-message (`read` returned `0`).
    PeerClosed,
    Error(std::io::Error),
}

fn is_retryable(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted)
}

/// The length-prefixed read/write cursor shared by TCP-HANDLER, TCP-OUTBOUND
/// and (minus the write half) LOCAL-STREAM (spec §4.5, §4.7).
///
/// Deliberately does not keep its own `byte_count` field: `prefix_len` plus
/// `buffer.position()` already say exactly how far the current message has
/// progressed, and deriving `byte_count()` from them means there's only one
/// place state can get out of sync with the bytes actually moved.
pub(crate) struct Framing {
    pub(crate) fd: RawFd,
    pub(crate) buffer: Buffer,
    prefix: [u8; 2],
    prefix_len: usize,
    pub(crate) is_reading: bool,
    /// Spec §4.6: the first writable event on a freshly `connect`ed socket
    /// must consult `SO_ERROR` instead of attempting to write.
    pub(crate) check_nb_connect: bool,
    /// LOCAL-STREAM (spec §4.7) accepts messages shorter than
    /// `MINIMUM_DNS_MESSAGE_LEN`; everything else rejects them.
    short_ok: bool,
}

impl Framing {
    pub(crate) fn new(fd: RawFd, bufsize: usize, short_ok: bool) -> Framing {
        Framing {
            fd,
            buffer: Buffer::with_capacity(bufsize),
            prefix: [0; 2],
            prefix_len: 0,
            is_reading: true,
            check_nb_connect: false,
            short_ok,
        }
    }

    /// Spec invariant 3: `byte_count < 2` while the length prefix is still
    /// incomplete, `byte_count >= 2` (and `buffer.limit() == prefix_value`)
    /// once it's known.
    pub(crate) fn byte_count(&self) -> usize {
        if self.prefix_len < 2 {
            self.prefix_len
        } else {
            2 + self.buffer.position()
        }
    }

    /// Rearms the handler to read a fresh message (spec §4.4 step 6, and
    /// reused whenever a handler is returned to the free list).
    pub(crate) fn reset_for_read(&mut self, fd: RawFd) {
        self.fd = fd;
        self.prefix = [0; 2];
        self.prefix_len = 0;
        self.buffer.clear();
        self.is_reading = true;
        self.check_nb_connect = false;
    }

    /// Switches from "just finished reading a request" to "about to write
    /// whatever's now in `buffer`" (spec §4.5 "READ_BODY -> WRITE_LEN").
    /// The caller is responsible for having already placed the reply bytes
    /// in `buffer` via [`Buffer::fill`](crate::buffer::Buffer::fill) (or left
    /// the original request there, for an echo-style callback).
    pub(crate) fn start_write(&mut self) {
        self.prefix_len = 0;
        self.is_reading = false;
    }

    /// One `read(2)` worth of progress on the length prefix, then the body.
    pub(crate) fn on_readable(&mut self) -> FramingEvent {
        if self.prefix_len < 2 {
            match socket::read(self.fd, &mut self.prefix[self.prefix_len..]) {
                Ok(0) => return FramingEvent::PeerClosed,
                Ok(n) => self.prefix_len += n,
                Err(e) if is_retryable(&e) => return FramingEvent::WouldBlock,
                Err(e) => return FramingEvent::Error(e),
            }
            if self.prefix_len < 2 {
                return FramingEvent::Pending;
            }
            let msg_len = u16::from_be_bytes(self.prefix) as usize;
            if msg_len > self.buffer.capacity() {
                return FramingEvent::Error(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("tcp message length {msg_len} exceeds buffer capacity {}", self.buffer.capacity()),
                ));
            }
            if msg_len < MINIMUM_DNS_MESSAGE_LEN && !self.short_ok {
                return FramingEvent::Error(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("tcp message length {msg_len} below minimum {MINIMUM_DNS_MESSAGE_LEN}"),
                ));
            }
            self.buffer.clear();
            self.buffer.set_limit(msg_len);
            if msg_len == 0 {
                return FramingEvent::MessageReady;
            }
        }

        debug_assert!(self.buffer.remaining() > 0, "a zero-length body returns above");
        let remaining = self.buffer.remaining();
        let dst = &mut self.buffer.writable_slice()[..remaining];
        match socket::read(self.fd, dst) {
            Ok(0) => FramingEvent::PeerClosed,
            Ok(n) => {
                self.buffer.advance(n);
                if self.buffer.remaining() == 0 {
                    self.buffer.set_position(0);
                    FramingEvent::MessageReady
                } else {
                    FramingEvent::Pending
                }
            }
            Err(e) if is_retryable(&e) => FramingEvent::WouldBlock,
            Err(e) => FramingEvent::Error(e),
        }
    }

    /// One `write(2)` (or, for the very first call, `writev(2)`) worth of
    /// progress writing the length-prefixed reply back out.
    pub(crate) fn on_writable(&mut self) -> FramingEvent {
        if self.prefix_len < 2 {
            if self.prefix_len == 0 && self.buffer.position() == 0 {
                let len = self.buffer.limit() as u16;
                self.prefix = len.to_be_bytes();
                match socket::writev_prefixed(self.fd, &self.prefix, self.buffer.readable_slice()) {
                    Ok(n) if n >= 2 => {
                        self.prefix_len = 2;
                        self.buffer.advance(n - 2);
                    }
                    Ok(n) => self.prefix_len = n,
                    Err(e) if is_retryable(&e) => return FramingEvent::WouldBlock,
                    Err(e) => return FramingEvent::Error(e),
                }
            } else {
                match socket::write(self.fd, &self.prefix[self.prefix_len..]) {
                    Ok(n) => self.prefix_len += n,
                    Err(e) if is_retryable(&e) => return FramingEvent::WouldBlock,
                    Err(e) => return FramingEvent::Error(e),
                }
            }
            if self.prefix_len < 2 {
                return FramingEvent::Pending;
            }
        }

        if self.buffer.remaining() > 0 {
            match socket::write(self.fd, self.buffer.readable_slice()) {
                Ok(n) => self.buffer.advance(n),
                Err(e) if is_retryable(&e) => return FramingEvent::WouldBlock,
                Err(e) => return FramingEvent::Error(e),
            }
        }

        if self.buffer.remaining() > 0 {
            FramingEvent::Pending
        } else {
            FramingEvent::WriteComplete
        }
    }
}

/// Logs a framing error at the verbosity spec §4.5's error-policy table asks
/// for: `ECONNRESET` is ordinary and gets a `debug!`, everything else a `warn!`.
fn log_tcp_error(fd: RawFd, e: &std::io::Error) {
    if e.raw_os_error() == Some(libc::ECONNRESET) {
        debug!("tcp fd {fd} reset by peer: {e}");
    } else {
        warn!("tcp fd {fd} framing error: {e}");
    }
}

/// One slot in `TcpAccept`'s preallocated handler pool.
struct Handler {
    framing: Framing,
    peer: Option<SocketAddr>,
    deadline: Option<Instant>,
}

impl Handler {
    fn new(bufsize: usize) -> Handler {
        Handler {
            framing: Framing::new(-1, bufsize, false),
            peer: None,
            deadline: None,
        }
    }
}

pub struct TcpAcceptOptions {
    pub num_handlers: usize,
    pub bufsize: usize,
    pub timeout: Duration,
}

impl Default for TcpAcceptOptions {
    fn default() -> TcpAcceptOptions {
        TcpAcceptOptions {
            num_handlers: 10,
            bufsize: 65535,
            timeout: TCP_QUERY_TIMEOUT,
        }
    }
}

/// What `Base` should do with the listening fd after a `handle_acceptable`
/// call (spec §4.4 "Accept-pause/accept-resume").
pub(crate) enum AcceptOutcome {
    /// Nothing accepted (`EAGAIN`, `EINTR`, or a transient accept error).
    None,
    Accepted {
        handler_idx: usize,
        fd: RawFd,
        /// The pool's free list just went from non-empty to empty: `Base`
        /// must deregister the listening fd.
        pause_accept: bool,
    },
}

/// What `Base` should do with a handler's registration after an event
/// (spec §4.4/§4.5).
pub(crate) enum HandlerOutcome {
    /// No state transition; stay registered as-is.
    Pending,
    /// Switch this handler's registration to the given interest.
    Reregister(Interest),
    /// The handler is done (success, error, or timeout): close its fd and
    /// return it to the free list. `resume_accept` is set when the free
    /// list was empty before this reclaim, meaning `Base` must re-register
    /// the listening fd (spec §4.4 "Accept-resume").
    Reclaimed { resume_accept: bool },
}

/// TCP-ACCEPT (spec §4.4): a listening socket plus a preallocated pool of
/// TCP-HANDLER slots, reused via an arena-index free list rather than
/// allocated per connection.
pub struct TcpAccept {
    fd: RawFd,
    handlers: Vec<Handler>,
    free: Vec<usize>,
    bufsize: usize,
    default_timeout: Duration,
    callback: Callback,
    exit_requested: bool,
}

impl TcpAccept {
    pub fn new(fd: RawFd, options: TcpAcceptOptions, callback: Callback) -> TcpAccept {
        let handlers = (0..options.num_handlers).map(|_| Handler::new(options.bufsize)).collect();
        let free = (0..options.num_handlers).rev().collect();
        TcpAccept {
            fd,
            handlers,
            free,
            bufsize: options.bufsize,
            default_timeout: options.timeout,
            callback,
            exit_requested: false,
        }
    }

    /// Clears and returns whether a callback invoked for any handler in this
    /// pool asked to stop the owning base's dispatch loop (spec §4.1 `exit`).
    pub(crate) fn take_exit_requested(&mut self) -> bool {
        std::mem::take(&mut self.exit_requested)
    }

    pub fn num_handlers(&self) -> usize {
        self.handlers.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Spec §4.4 steps 1-5: `accept()` once, claim a handler from the free
    /// list, and arm its deadline. Pool exhaustion (no free handler) is not
    /// an error: the caller is expected to have already deregistered the
    /// listening fd the moment the pool emptied, so this should not be
    /// reachable in practice; it is handled defensively anyway.
    pub(crate) fn handle_acceptable(&mut self, now: Instant) -> AcceptOutcome {
        let (new_fd, peer) = match socket::accept(self.fd) {
            Ok(v) => v,
            Err(e) if is_retryable(&e) => return AcceptOutcome::None,
            Err(e) => {
                warn!("tcp accept on fd {} failed: {e}", self.fd);
                return AcceptOutcome::None;
            }
        };

        let Some(idx) = self.free.pop() else {
            warn!("tcp accept pool exhausted, dropping connection from {peer}");
            let _ = socket::close(new_fd);
            return AcceptOutcome::None;
        };

        let handler = &mut self.handlers[idx];
        handler.framing.reset_for_read(new_fd);
        handler.peer = Some(peer);
        handler.deadline = Some(now + self.default_timeout);
        trace!("tcp accept: fd {new_fd} from {peer} -> handler {idx}");

        AcceptOutcome::Accepted {
            handler_idx: idx,
            fd: new_fd,
            pause_accept: self.free.is_empty(),
        }
    }

    pub(crate) fn handler_deadline(&self, idx: usize) -> Option<Instant> {
        self.handlers[idx].deadline
    }

    /// The handler's raw fd, read before driving its state machine: several
    /// outcomes (`Reclaimed` in particular) null out the handler's internal
    /// fd field as part of the transition, so callers that need the fd for
    /// deregistration must capture it first.
    pub(crate) fn handler_fd(&self, idx: usize) -> RawFd {
        self.handlers[idx].framing.fd
    }

    /// Drives one handler's state machine one step (spec §4.5). Non-goal:
    /// no keep-alive — every path that finishes a reply (`WriteComplete`)
    /// reclaims the handler rather than looping back to read a second query.
    pub(crate) fn handle_handler_event(&mut self, idx: usize, readable: bool, writable: bool, timed_out: bool) -> HandlerOutcome {
        if timed_out {
            self.fire_terminal(idx, NetEvent::Timeout);
            return self.reclaim(idx);
        }

        let is_reading = self.handlers[idx].framing.is_reading;
        if is_reading {
            if !readable {
                return HandlerOutcome::Pending;
            }
            match self.handlers[idx].framing.on_readable() {
                FramingEvent::WouldBlock | FramingEvent::Pending => HandlerOutcome::Pending,
                FramingEvent::PeerClosed => {
                    self.fire_terminal(idx, NetEvent::Closed);
                    self.reclaim(idx)
                }
                FramingEvent::Error(e) => {
                    log_tcp_error(self.handlers[idx].framing.fd, &e);
                    self.fire_terminal(idx, NetEvent::Closed);
                    self.reclaim(idx)
                }
                FramingEvent::MessageReady => self.deliver_request(idx),
                FramingEvent::WriteComplete => unreachable!("on_readable never returns WriteComplete"),
            }
        } else {
            if !writable {
                return HandlerOutcome::Pending;
            }
            match self.handlers[idx].framing.on_writable() {
                FramingEvent::WouldBlock | FramingEvent::Pending => HandlerOutcome::Pending,
                FramingEvent::Error(e) => {
                    log_tcp_error(self.handlers[idx].framing.fd, &e);
                    self.reclaim(idx)
                }
                FramingEvent::WriteComplete => self.reclaim(idx),
                FramingEvent::MessageReady | FramingEvent::PeerClosed => unreachable!("on_writable never returns these"),
            }
        }
    }

    fn deliver_request(&mut self, idx: usize) -> HandlerOutcome {
        let TcpAccept { callback, handlers, exit_requested, .. } = self;
        let handler = &mut handlers[idx];
        let reply = ReplyInfo::for_peer(handler.peer.expect("accepted handler always has a peer"), handler.framing.buffer.limit());
        let (send, close, exit) = comm::invoke(callback, &mut handler.framing.buffer, &reply, NetEvent::NoError);
        if exit {
            *exit_requested = true;
        }
        if close || !send {
            return self.reclaim(idx);
        }
        self.handlers[idx].framing.start_write();
        HandlerOutcome::Reregister(Interest::WRITABLE)
    }

    fn fire_terminal(&mut self, idx: usize, kind: NetEvent) {
        let TcpAccept { callback, handlers, exit_requested, .. } = self;
        let handler = &mut handlers[idx];
        let reply = handler.peer.map(|addr| ReplyInfo::for_peer(addr, 0)).unwrap_or_else(ReplyInfo::empty);
        let (_send, _close, exit) = comm::invoke(callback, &mut handler.framing.buffer, &reply, kind);
        if exit {
            *exit_requested = true;
        }
    }

    /// Closes every handler with a live fd, without invoking any callback:
    /// used when the accept point itself is being closed, so the individual
    /// handler fds don't leak. The handler pool's own slots are left as-is
    /// (the accept point is going away entirely, so nothing reuses them).
    pub(crate) fn close_all_handlers(&mut self) {
        for handler in &mut self.handlers {
            if handler.framing.fd >= 0 {
                if let Err(e) = socket::close(handler.framing.fd) {
                    warn!("error closing tcp handler fd {}: {e}", handler.framing.fd);
                }
                handler.framing.fd = -1;
            }
        }
    }

    pub(crate) fn reclaim(&mut self, idx: usize) -> HandlerOutcome {
        let was_empty = self.free.is_empty();
        let fd = self.handlers[idx].framing.fd;
        if fd >= 0 {
            if let Err(e) = socket::close(fd) {
                warn!("error closing tcp handler fd {fd}: {e}");
            }
        }
        self.handlers[idx].framing.fd = -1;
        self.handlers[idx].peer = None;
        self.handlers[idx].deadline = None;
        self.free.push(idx);
        HandlerOutcome::Reclaimed { resume_accept: was_empty }
    }

    pub fn bufsize(&self) -> usize {
        self.bufsize
    }
}

impl CommPointOps for TcpAccept {
    fn role(&self) -> CommRole {
        CommRole::TcpAccept
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    /// Spec §5 "Accept points additionally sum their whole handler pool".
    fn memory_usage(&self) -> usize {
        std::mem::size_of::<TcpAccept>() + self.handlers.iter().map(|h| h.framing.buffer.capacity()).sum::<usize>()
    }
}

/// TCP-OUTBOUND (spec §4.6): a single nonblocking-`connect`ed socket driven
/// through the same [`Framing`] state machine as a pooled inbound handler,
/// but one-shot end to end rather than reused from a pool.
///
/// Resolves the spec's `do_toggle_rw` open question: write completion
/// reclaims the point rather than toggling it back to read, matching the
/// "no keep-alive" non-goal (see `DESIGN.md`).
pub struct TcpOutbound {
    framing: Framing,
    peer: SocketAddr,
    deadline: Option<Instant>,
    callback: Callback,
    exit_requested: bool,
}

impl TcpOutbound {
    /// `fd` must already be a nonblocking socket with `connect()` called
    /// (and returned `EINPROGRESS`, or succeeded immediately).
    pub fn new(fd: RawFd, peer: SocketAddr, bufsize: usize, timeout: Duration, request: &[u8], now: Instant, callback: Callback) -> TcpOutbound {
        let mut framing = Framing::new(fd, bufsize, false);
        framing.buffer.fill(request);
        framing.check_nb_connect = true;
        framing.is_reading = false; // the query is already in the buffer, ready to write
        TcpOutbound {
            framing,
            peer,
            deadline: Some(now + timeout),
            callback,
            exit_requested: false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Clears and returns whether the callback invoked on the last event
    /// asked to stop the owning base's dispatch loop (spec §4.1 `exit`).
    pub(crate) fn take_exit_requested(&mut self) -> bool {
        std::mem::take(&mut self.exit_requested)
    }

    /// Returns `true` if the point should be reclaimed by the caller.
    pub(crate) fn handle_writable(&mut self) -> bool {
        if self.framing.check_nb_connect {
            match socket::take_socket_error(self.framing.fd) {
                Ok(()) => {
                    self.framing.check_nb_connect = false;
                    false // consume this event purely as the connect-completion check
                }
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => false,
                Err(e) if matches!(e.raw_os_error(), Some(libc::ECONNREFUSED) | Some(libc::EHOSTUNREACH) | Some(libc::EHOSTDOWN)) => {
                    debug!("tcp outbound connect to {} failed: {e}", self.peer);
                    self.fire_terminal(NetEvent::Closed);
                    true
                }
                Err(e) => {
                    warn!("tcp outbound connect to {} failed: {e}", self.peer);
                    self.fire_terminal(NetEvent::Closed);
                    true
                }
            }
        } else {
            match self.framing.on_writable() {
                FramingEvent::WouldBlock | FramingEvent::Pending => false,
                FramingEvent::Error(e) => {
                    log_tcp_error(self.framing.fd, &e);
                    self.fire_terminal(NetEvent::Closed);
                    true
                }
                FramingEvent::WriteComplete => {
                    // Resolved open question (see struct doc comment above):
                    // reclaim here rather than toggling to read a response.
                    self.fire_terminal(NetEvent::NoError);
                    true
                }
                FramingEvent::MessageReady | FramingEvent::PeerClosed => unreachable!(),
            }
        }
    }

    /// Returns `true` if the point should be reclaimed by the caller.
    pub(crate) fn handle_timeout(&mut self) -> bool {
        self.fire_terminal(NetEvent::Timeout);
        true
    }

    fn fire_terminal(&mut self, kind: NetEvent) {
        let reply = ReplyInfo::for_peer(self.peer, 0);
        let (_send, _close, exit) = comm::invoke(&mut self.callback, &mut self.framing.buffer, &reply, kind);
        if exit {
            self.exit_requested = true;
        }
    }
}

impl CommPointOps for TcpOutbound {
    fn role(&self) -> CommRole {
        CommRole::TcpOutbound
    }

    fn fd(&self) -> RawFd {
        self.framing.fd
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<TcpOutbound>() + self.framing.buffer.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_count_tracks_prefix_then_body() {
        let mut framing = Framing::new(-1, 64, false);
        assert_eq!(framing.byte_count(), 0);
        framing.prefix_len = 1;
        assert_eq!(framing.byte_count(), 1);
        framing.prefix_len = 2;
        framing.buffer.set_limit(20);
        framing.buffer.set_position(5);
        assert_eq!(framing.byte_count(), 7);
    }

    #[test]
    fn reset_for_read_clears_prior_message_state() {
        let mut framing = Framing::new(3, 64, false);
        framing.prefix_len = 2;
        framing.buffer.set_limit(10);
        framing.buffer.set_position(10);
        framing.is_reading = false;
        framing.check_nb_connect = true;

        framing.reset_for_read(9);
        assert_eq!(framing.fd, 9);
        assert_eq!(framing.byte_count(), 0);
        assert!(framing.is_reading);
        assert!(!framing.check_nb_connect);
    }

    #[test]
    fn accept_pool_tracks_free_count_and_pauses_when_exhausted() {
        let accept = TcpAccept::new(-1, TcpAcceptOptions { num_handlers: 2, ..Default::default() }, Box::new(|_| false));
        assert_eq!(accept.num_handlers(), 2);
        assert_eq!(accept.free_count(), 2);
    }

    #[test]
    fn reclaim_reports_resume_only_on_empty_to_nonempty_transition() {
        let mut accept = TcpAccept::new(-1, TcpAcceptOptions { num_handlers: 1, ..Default::default() }, Box::new(|_| false));
        let idx = accept.free.pop().unwrap();
        match accept.reclaim(idx) {
            HandlerOutcome::Reclaimed { resume_accept } => assert!(resume_accept),
            _ => panic!("expected Reclaimed"),
        }
        assert_eq!(accept.free_count(), 1);
    }
}
