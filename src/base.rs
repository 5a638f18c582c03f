//! C2: the event base (spec §4.1) — owns the OS readiness loop, the cached
//! clock, the timer heap, the optional signal bridge, and every comm point
//! registered against it.
//!
//! Comm points are held behind a small closed enum ([`Slot`]) rather than
//! `dyn CommPointOps` trait objects (spec §9 "Role polymorphism"): a TCP
//! accept point's handler pool needs operations (`handle_acceptable`,
//! `handler_fd`, ...) a trait object would have to downcast back out of, so
//! the dispatcher matches on the concrete role instead. [`Token`]s only ever
//! name one of three things ([`Target`]): a top-level slot's own fd, one
//! individually-registered handler inside a `TcpAccept`'s pool, or the
//! signal self-pipe — both slots and targets are arena-indexed the same way
//! `TcpAccept`'s own handler free-list is (spec §9 "Back-references &
//! free-list").

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::clock::Clock;
use crate::comm::local::LocalPoint;
use crate::comm::raw::RawPoint;
use crate::comm::tcp::{AcceptOutcome, HandlerOutcome, TcpAccept, TcpAcceptOptions, TcpOutbound};
use crate::comm::udp::{UdpOutcome, UdpPoint};
use crate::comm::{Callback, CommPointOps, CommRole, NetEvent};
use crate::error::{NetEventError, Result};
use crate::event::Events;
use crate::interest::Interest;
use crate::poll::Poll;
use crate::signal::SignalBridge;
use crate::sys::unix::socket;
use crate::timer::TimerHeap;
use crate::Token;

const INITIAL_EVENTS_CAPACITY: usize = 1024;

/// One live comm point, tagged by role (spec §3 `role`).
pub(crate) enum Slot {
    Udp(UdpPoint),
    TcpAccept(TcpAccept),
    TcpOutbound(TcpOutbound),
    Local(LocalPoint),
    Raw(RawPoint),
}

impl Slot {
    fn fd(&self) -> RawFd {
        match self {
            Slot::Udp(p) => p.fd(),
            Slot::TcpAccept(p) => p.fd(),
            Slot::TcpOutbound(p) => p.fd(),
            Slot::Local(p) => p.fd(),
            Slot::Raw(p) => p.fd(),
        }
    }

    fn role(&self) -> CommRole {
        match self {
            Slot::Udp(p) => p.role(),
            Slot::TcpAccept(p) => p.role(),
            Slot::TcpOutbound(p) => p.role(),
            Slot::Local(p) => p.role(),
            Slot::Raw(p) => p.role(),
        }
    }

    fn memory_usage(&self) -> usize {
        match self {
            Slot::Udp(p) => p.memory_usage(),
            Slot::TcpAccept(p) => p.memory_usage(),
            Slot::TcpOutbound(p) => p.memory_usage(),
            Slot::Local(p) => p.memory_usage(),
            Slot::Raw(p) => p.memory_usage(),
        }
    }

}

/// What a [`Token`] actually names. A pooled TCP handler has no top-level
/// slot of its own (its parent `TcpAccept` slot owns the whole pool), so it
/// gets its own `Target` variant instead of a `Slot`.
#[derive(Clone, Copy)]
enum Target {
    Slot(usize),
    TcpHandler { accept: usize, handler: usize },
    SignalPipe,
}

/// Opaque handle to a comm point created against a [`Base`]; an index into
/// its slot table (spec §9 "arena indices ... sidesteps shared-mutable
/// pointer cycles entirely").
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CommPointHandle(usize);

/// The event base (spec §4.1, C2): single owner of the OS readiness loop, the
/// clock cache, the timer heap, the signal bridge, and every comm point.
pub struct Base {
    poll: Poll,
    clock: Clock,
    timers: TimerHeap,
    signal: Option<SignalBridge>,
    signal_token: Option<usize>,
    signal_handling_enabled: bool,

    slots: Vec<Option<Slot>>,
    slot_free: Vec<usize>,
    /// The token currently registered for each slot's own fd; `None` while
    /// stopped via [`Base::stop_listening`] or (for a paused TCP accept fd)
    /// while the handler pool is exhausted.
    slot_tokens: Vec<Option<usize>>,
    /// The interest each slot was last registered with, kept around after
    /// `stop_listening` so `start_listening` can restore it (spec §8
    /// round-trip property).
    slot_interest: Vec<Option<Interest>>,
    /// `Some(vec![...])` only for `TcpAccept` slots: one token slot per
    /// pooled handler, parallel to `TcpAccept`'s own handler vec.
    handler_tokens: Vec<Option<Vec<Option<usize>>>>,

    targets: Vec<Option<Target>>,
    target_free: Vec<usize>,

    exit_requested: bool,
    events: Events,
}

impl Base {
    /// Creates a new base. `enable_signal_handling` must be true for
    /// [`SignalHandlers::create`](crate::signal::SignalHandlers::create) to
    /// later succeed against it; at most one base per process may set it,
    /// enforced when a signal callback is actually installed rather than
    /// here (spec §5 "Shared resources").
    pub fn new(enable_signal_handling: bool) -> Result<Base> {
        let poll = Poll::new().map_err(NetEventError::SelectorInit)?;
        Ok(Base {
            poll,
            clock: Clock::new(),
            timers: TimerHeap::new(),
            signal: None,
            signal_token: None,
            signal_handling_enabled: enable_signal_handling,
            slots: Vec::new(),
            slot_free: Vec::new(),
            slot_tokens: Vec::new(),
            slot_interest: Vec::new(),
            handler_tokens: Vec::new(),
            targets: Vec::new(),
            target_free: Vec::new(),
            exit_requested: false,
            events: Events::with_capacity(INITIAL_EVENTS_CAPACITY),
        })
    }

    /// Read-only view of the clock cache (spec §4.1 `time_pointers`).
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Sums every live comm point's `memory_usage` (spec §5 `get_mem`),
    /// including the base's own fixed overhead.
    pub fn memory_usage(&self) -> usize {
        let mut total = std::mem::size_of::<Base>();
        for slot in self.slots.iter().flatten() {
            total += slot.memory_usage();
        }
        total
    }

    /// Requests that [`dispatch`](Base::dispatch) return after finishing the
    /// callback currently running.
    pub fn exit(&mut self) {
        self.exit_requested = true;
    }

    /// Runs the readiness loop until [`exit`](Base::exit) is called from
    /// inside a callback, or a fatal error is reported by the selector
    /// (spec §7 "failure of the underlying dispatch call ... terminates the
    /// process").
    pub fn dispatch(&mut self) {
        loop {
            if self.exit_requested {
                break;
            }

            self.clock.refresh();
            let timeout = self.compute_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                error!("fatal error waiting for readiness events: {e}");
                std::process::exit(1);
            }
            self.clock.refresh();

            let ready: Vec<(usize, bool, bool)> =
                self.events.iter().map(|e| (e.token().0, e.is_readable(), e.is_writable())).collect();

            for (token_id, readable, writable) in ready {
                self.handle_token_event(token_id, readable, writable);
                if self.exit_requested {
                    break;
                }
            }
            if self.exit_requested {
                break;
            }

            let now = self.clock.now();
            self.timers.fire_due(now);
            if self.exit_requested {
                break;
            }
            self.fire_expired_tcp_handlers(now);
            if self.exit_requested {
                break;
            }
            self.fire_expired_outbound(now);
            if self.exit_requested {
                break;
            }
            self.fire_expired_raw(now);
        }
        // Cleared on the way out, not on the way in: a caller that invokes
        // `exit()` before ever calling `dispatch()` must see the loop break
        // on its very first check instead of blocking on `poll()` once with
        // the flag silently wiped out from under it.
        self.exit_requested = false;
    }

    /// The soonest deadline across the timer heap, every pooled TCP
    /// handler's per-query timeout, every outbound connection's deadline,
    /// and every raw comm point's optional timeout — bounds the selector's
    /// wait so none of them can fire late.
    fn compute_timeout(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut soonest = self.timers.next_deadline();
        for slot in self.slots.iter().flatten() {
            match slot {
                Slot::TcpAccept(accept) => {
                    for idx in 0..accept.num_handlers() {
                        if let Some(deadline) = accept.handler_deadline(idx) {
                            soonest = Some(soonest.map_or(deadline, |s| s.min(deadline)));
                        }
                    }
                }
                Slot::TcpOutbound(out) => {
                    if let Some(deadline) = out.deadline() {
                        soonest = Some(soonest.map_or(deadline, |s| s.min(deadline)));
                    }
                }
                Slot::Raw(raw) => {
                    if let Some(deadline) = raw.deadline() {
                        soonest = Some(soonest.map_or(deadline, |s| s.min(deadline)));
                    }
                }
                _ => {}
            }
        }
        soonest.map(|deadline| deadline.saturating_duration_since(now))
    }

    fn handle_token_event(&mut self, token_id: usize, readable: bool, writable: bool) {
        let target = match self.targets.get(token_id) {
            Some(Some(target)) => *target,
            _ => return,
        };
        match target {
            Target::SignalPipe => {
                if let Some(bridge) = &mut self.signal {
                    bridge.drain();
                }
            }
            Target::Slot(slot_idx) => self.handle_slot_event(slot_idx, readable, writable),
            Target::TcpHandler { accept, handler } => self.handle_tcp_handler_event(accept, handler, readable, writable, false),
        }
    }

    fn handle_slot_event(&mut self, slot_idx: usize, readable: bool, writable: bool) {
        let role = match self.slots.get(slot_idx).and_then(Option::as_ref) {
            Some(slot) => slot.role(),
            None => return,
        };

        match role {
            CommRole::Udp | CommRole::UdpAncil => {
                let Some(Slot::Udp(udp)) = self.slots[slot_idx].as_mut() else { return };
                // Capture the fd before `handle_readable`: on a close request
                // it nulls its own fd field internally (spec §9 "callback
                // sovereignty"), so this is the last point the real fd is visible.
                let (fd, outcome) = (udp.fd(), udp.handle_readable());
                if udp.take_exit_requested() {
                    self.exit_requested = true;
                }
                if matches!(outcome, UdpOutcome::CloseRequested) {
                    self.close_slot(slot_idx, fd);
                }
            }
            CommRole::TcpAccept => self.handle_tcp_accept_readable(slot_idx),
            CommRole::TcpOutbound => {
                // Connect-completion and write-completion are both handled
                // by `handle_writable`; a connected outbound handler never
                // toggles to read (resolved open question, comm/tcp.rs).
                if !writable {
                    return;
                }
                let (fd, close, exit) = {
                    let Some(Slot::TcpOutbound(out)) = self.slots[slot_idx].as_mut() else { return };
                    let close = out.handle_writable();
                    (out.fd(), close, out.take_exit_requested())
                };
                if exit {
                    self.exit_requested = true;
                }
                if close {
                    self.close_slot(slot_idx, fd);
                }
            }
            CommRole::LocalStream => {
                if !readable {
                    return;
                }
                let Some(Slot::Local(local)) = self.slots[slot_idx].as_mut() else { return };
                let fd = local.fd();
                let close = local.handle_readable();
                if local.take_exit_requested() {
                    self.exit_requested = true;
                }
                if close {
                    self.close_slot(slot_idx, fd);
                }
            }
            CommRole::Raw => {
                let Some(Slot::Raw(raw)) = self.slots[slot_idx].as_mut() else { return };
                let interest = raw.interest();
                let fires = (readable && interest.is_readable()) || (writable && interest.is_writable());
                if !fires {
                    return;
                }
                let fd = raw.fd();
                let close = raw.handle_event(NetEvent::NoError);
                if raw.take_exit_requested() {
                    self.exit_requested = true;
                }
                if close {
                    self.close_slot(slot_idx, fd);
                }
            }
            CommRole::TcpHandler => unreachable!("pooled tcp handlers are routed via Target::TcpHandler, never a top-level slot"),
        }
    }

    fn handle_tcp_accept_readable(&mut self, slot_idx: usize) {
        let now = self.clock.now();
        let outcome = match self.slots[slot_idx].as_mut() {
            Some(Slot::TcpAccept(accept)) => accept.handle_acceptable(now),
            _ => return,
        };

        let AcceptOutcome::Accepted { handler_idx, fd, pause_accept } = outcome else { return };

        let token_id = self.alloc_target(Target::TcpHandler { accept: slot_idx, handler: handler_idx });
        if let Err(e) = self.poll.register(fd, Token(token_id), Interest::READABLE) {
            warn!("failed to register accepted tcp handler fd {fd}: {e}");
            self.free_target(token_id);
            if let Some(Slot::TcpAccept(accept)) = self.slots[slot_idx].as_mut() {
                accept.reclaim(handler_idx);
            }
            return;
        }
        if let Some(Some(handler_tokens)) = self.handler_tokens.get_mut(slot_idx) {
            handler_tokens[handler_idx] = Some(token_id);
        }

        if pause_accept {
            let listen_fd = self.slots[slot_idx].as_ref().map(Slot::fd).unwrap_or(-1);
            if listen_fd >= 0 {
                if let Err(e) = self.poll.deregister(listen_fd) {
                    warn!("failed to pause tcp accept on fd {listen_fd}: {e}");
                }
            }
        }
    }

    fn handle_tcp_handler_event(&mut self, accept_slot: usize, handler_idx: usize, readable: bool, writable: bool, timed_out: bool) {
        // Capture the handler's fd before driving its state machine: a
        // `Reclaimed` outcome nulls the handler's own fd field as part of
        // closing it, mirroring the UDP close-request trick above.
        let (fd, outcome, exit) = match self.slots[accept_slot].as_mut() {
            Some(Slot::TcpAccept(accept)) => {
                let fd = accept.handler_fd(handler_idx);
                let outcome = accept.handle_handler_event(handler_idx, readable, writable, timed_out);
                (fd, outcome, accept.take_exit_requested())
            }
            _ => return,
        };
        if exit {
            self.exit_requested = true;
        }

        match outcome {
            HandlerOutcome::Pending => {}
            HandlerOutcome::Reregister(interest) => {
                if let Some(Some(token_id)) = self.handler_tokens.get(accept_slot).and_then(|v| v.as_ref()).and_then(|v| v.get(handler_idx)) {
                    if let Err(e) = self.poll.reregister(fd, Token(*token_id), interest) {
                        warn!("failed to reregister tcp handler fd {fd}: {e}");
                    }
                }
            }
            HandlerOutcome::Reclaimed { resume_accept } => {
                if let Some(Some(handler_tokens)) = self.handler_tokens.get_mut(accept_slot) {
                    if let Some(token_id) = handler_tokens.get_mut(handler_idx).and_then(Option::take) {
                        if fd >= 0 {
                            let _ = self.poll.deregister(fd);
                        }
                        self.free_target(token_id);
                    }
                }
                if resume_accept {
                    let listen_fd = self.slots[accept_slot].as_ref().map(Slot::fd).unwrap_or(-1);
                    if listen_fd >= 0 {
                        if let Some(token_id) = self.slot_tokens[accept_slot] {
                            if let Err(e) = self.poll.register(listen_fd, Token(token_id), Interest::READABLE) {
                                warn!("failed to resume tcp accept on fd {listen_fd}: {e}");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Sweeps every pooled TCP handler whose per-query deadline has passed.
    /// Deadlines are collected into an owned list first, then re-checked
    /// against live state before firing: an earlier handler's reclaim this
    /// same sweep must not cause a later, now-stale entry to fire twice.
    fn fire_expired_tcp_handlers(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (slot_idx, slot) in self.slots.iter().enumerate() {
            if let Some(Slot::TcpAccept(accept)) = slot {
                for handler_idx in 0..accept.num_handlers() {
                    if accept.handler_deadline(handler_idx).map_or(false, |d| d <= now) {
                        expired.push((slot_idx, handler_idx));
                    }
                }
            }
        }
        for (slot_idx, handler_idx) in expired {
            let still_due = matches!(
                self.slots.get(slot_idx),
                Some(Some(Slot::TcpAccept(accept))) if accept.handler_deadline(handler_idx).map_or(false, |d| d <= now)
            );
            if still_due {
                self.handle_tcp_handler_event(slot_idx, handler_idx, false, false, true);
                if self.exit_requested {
                    return;
                }
            }
        }
    }

    fn fire_expired_outbound(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Some(Slot::TcpOutbound(out)) if out.deadline().map_or(false, |d| d <= now) => Some(idx),
                _ => None,
            })
            .collect();
        for slot_idx in expired {
            let fd = match self.slots[slot_idx].as_mut() {
                Some(Slot::TcpOutbound(out)) => {
                    let fd = out.fd();
                    out.handle_timeout();
                    if out.take_exit_requested() {
                        self.exit_requested = true;
                    }
                    fd
                }
                _ => continue,
            };
            self.close_slot(slot_idx, fd);
            if self.exit_requested {
                return;
            }
        }
    }

    /// Sweeps every raw comm point whose optional one-shot timeout has
    /// passed, delivering [`NetEvent::Timeout`] and reclaiming it if the
    /// callback asked to close.
    fn fire_expired_raw(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Some(Slot::Raw(raw)) if raw.deadline().map_or(false, |d| d <= now) => Some(idx),
                _ => None,
            })
            .collect();
        for slot_idx in expired {
            let (fd, close, exit) = match self.slots[slot_idx].as_mut() {
                Some(Slot::Raw(raw)) => {
                    let close = raw.handle_timeout();
                    (raw.fd(), close, raw.take_exit_requested())
                }
                _ => continue,
            };
            if exit {
                self.exit_requested = true;
            }
            if close {
                self.close_slot(slot_idx, fd);
            }
            if self.exit_requested {
                return;
            }
        }
    }

    // --- comm point construction -------------------------------------------------

    pub fn create_udp(&mut self, fd: RawFd, bufsize: usize, callback: Callback) -> Result<CommPointHandle> {
        self.create_udp_point(fd, bufsize, callback, false)
    }

    pub fn create_udp_ancillary(&mut self, fd: RawFd, bufsize: usize, callback: Callback) -> Result<CommPointHandle> {
        self.create_udp_point(fd, bufsize, callback, true)
    }

    fn create_udp_point(&mut self, fd: RawFd, bufsize: usize, callback: Callback, ancillary: bool) -> Result<CommPointHandle> {
        let point = if ancillary {
            UdpPoint::new_ancillary(fd, bufsize, callback)
        } else {
            UdpPoint::new_plain(fd, bufsize, callback)
        };
        let slot_idx = self.alloc_slot(Slot::Udp(point));
        self.finish_create(slot_idx, fd, Interest::READABLE)
    }

    /// Preallocates `options.num_handlers` TCP handlers and registers the
    /// listening fd (spec §4.4).
    pub fn create_tcp_accept(&mut self, fd: RawFd, options: TcpAcceptOptions, callback: Callback) -> Result<CommPointHandle> {
        if options.num_handlers == 0 {
            return Err(NetEventError::InvalidHandlerCount(0));
        }
        let num_handlers = options.num_handlers;
        let accept = TcpAccept::new(fd, options, callback);
        let slot_idx = self.alloc_slot(Slot::TcpAccept(accept));
        self.handler_tokens[slot_idx] = Some(vec![None; num_handlers]);
        self.finish_create(slot_idx, fd, Interest::READABLE)
    }

    /// `fd` must already be a nonblocking socket with `connect()` called
    /// (spec §4.6).
    pub fn create_tcp_outbound(&mut self, fd: RawFd, peer: SocketAddr, bufsize: usize, timeout: Duration, request: &[u8], callback: Callback) -> Result<CommPointHandle> {
        let now = self.clock.now();
        let out = TcpOutbound::new(fd, peer, bufsize, timeout, request, now, callback);
        let slot_idx = self.alloc_slot(Slot::TcpOutbound(out));
        self.finish_create(slot_idx, fd, Interest::WRITABLE)
    }

    pub fn create_local_stream(&mut self, fd: RawFd, bufsize: usize, callback: Callback) -> Result<CommPointHandle> {
        let point = LocalPoint::new(fd, bufsize, callback);
        let slot_idx = self.alloc_slot(Slot::Local(point));
        self.finish_create(slot_idx, fd, Interest::READABLE)
    }

    pub fn create_raw(&mut self, fd: RawFd, interest: Interest, timeout: Option<Duration>, callback: Callback) -> Result<CommPointHandle> {
        let now = self.clock.now();
        let point = RawPoint::new(fd, interest, timeout, now, callback);
        let slot_idx = self.alloc_slot(Slot::Raw(point));
        self.finish_create(slot_idx, fd, interest)
    }

    fn finish_create(&mut self, slot_idx: usize, fd: RawFd, interest: Interest) -> Result<CommPointHandle> {
        match self.register_primary(slot_idx, fd, interest) {
            Ok(()) => Ok(CommPointHandle(slot_idx)),
            Err(e) => {
                self.slots[slot_idx] = None;
                self.handler_tokens[slot_idx] = None;
                self.slot_free.push(slot_idx);
                Err(e)
            }
        }
    }

    /// Closes and reclaims a comm point (spec §3 "Lifecycle ... deregister
    /// and close fd").
    pub fn close(&mut self, handle: CommPointHandle) {
        let slot_idx = handle.0;
        let fd = match self.slots.get(slot_idx).and_then(Option::as_ref) {
            Some(slot) => slot.fd(),
            None => return,
        };
        self.close_slot(slot_idx, fd);
    }

    /// Deregisters a comm point's fd without closing it or releasing its
    /// slot (spec §8 round-trip property).
    pub fn stop_listening(&mut self, handle: CommPointHandle) -> Result<()> {
        let slot_idx = handle.0;
        let fd = match self.slots.get(slot_idx).and_then(Option::as_ref) {
            Some(slot) => slot.fd(),
            None => return Ok(()),
        };
        if let Some(token_id) = self.slot_tokens[slot_idx].take() {
            if fd >= 0 {
                self.poll.deregister(fd).map_err(NetEventError::Io)?;
            }
            self.free_target(token_id);
        }
        Ok(())
    }

    /// Restores the event mask a comm point had before
    /// [`stop_listening`](Base::stop_listening) (spec §8: "`stop_listening`
    /// then `start_listening(-1, 0)` restores original event mask within the
    /// same role").
    pub fn start_listening(&mut self, handle: CommPointHandle) -> Result<()> {
        let slot_idx = handle.0;
        if self.slot_tokens.get(slot_idx).copied().flatten().is_some() {
            return Ok(()); // already listening
        }
        let fd = match self.slots.get(slot_idx).and_then(Option::as_ref) {
            Some(slot) => slot.fd(),
            None => return Ok(()),
        };
        let interest = match self.slot_interest.get(slot_idx).copied().flatten() {
            Some(interest) => interest,
            None => return Ok(()),
        };
        self.register_primary(slot_idx, fd, interest)
    }

    fn register_primary(&mut self, slot_idx: usize, fd: RawFd, interest: Interest) -> Result<()> {
        let token_id = self.alloc_target(Target::Slot(slot_idx));
        if let Err(e) = self.poll.register(fd, Token(token_id), interest) {
            self.free_target(token_id);
            return Err(NetEventError::Io(e));
        }
        self.slot_tokens[slot_idx] = Some(token_id);
        self.slot_interest[slot_idx] = Some(interest);
        Ok(())
    }

    /// Tears a slot all the way down: for `TcpAccept`, every pooled handler
    /// fd and token too (spec §3 "child handlers deleted by parent").
    /// `fd` is the slot's primary fd, captured by the caller *before* any
    /// state-mutating call that might have nulled the slot's own fd field.
    fn close_slot(&mut self, slot_idx: usize, fd: RawFd) {
        let Some(slot) = self.slots[slot_idx].take() else { return };
        if let Slot::TcpAccept(mut accept) = slot {
            accept.close_all_handlers();
            if let Some(handler_tokens) = self.handler_tokens[slot_idx].take() {
                for token_id in handler_tokens.into_iter().flatten() {
                    self.free_target(token_id);
                }
            }
        }
        self.finish_close_fd(slot_idx, fd);
        self.slot_free.push(slot_idx);
    }

    fn finish_close_fd(&mut self, slot_idx: usize, fd: RawFd) {
        if let Some(token_id) = self.slot_tokens[slot_idx].take() {
            if fd >= 0 {
                let _ = self.poll.deregister(fd);
            }
            self.free_target(token_id);
        }
        if fd >= 0 {
            if let Err(e) = socket::close(fd) {
                warn!("error closing comm point fd {fd}: {e}");
            }
        }
        self.slot_interest[slot_idx] = None;
    }

    fn alloc_slot(&mut self, slot: Slot) -> usize {
        if let Some(idx) = self.slot_free.pop() {
            self.slots[idx] = Some(slot);
            self.slot_tokens[idx] = None;
            self.slot_interest[idx] = None;
            self.handler_tokens[idx] = None;
            idx
        } else {
            self.slots.push(Some(slot));
            self.slot_tokens.push(None);
            self.slot_interest.push(None);
            self.handler_tokens.push(None);
            self.slots.len() - 1
        }
    }

    fn alloc_target(&mut self, target: Target) -> usize {
        if let Some(idx) = self.target_free.pop() {
            self.targets[idx] = Some(target);
            idx
        } else {
            self.targets.push(Some(target));
            self.targets.len() - 1
        }
    }

    fn free_target(&mut self, idx: usize) {
        if let Some(slot) = self.targets.get_mut(idx) {
            if slot.take().is_some() {
                self.target_free.push(idx);
            }
        }
    }

    // --- accessors for the timer/signal/source facades ---------------------

    pub(crate) fn selector(&self) -> &crate::sys::Selector {
        self.poll.selector()
    }

    pub(crate) fn timers(&self) -> &TimerHeap {
        &self.timers
    }

    pub(crate) fn timers_mut(&mut self) -> &mut TimerHeap {
        &mut self.timers
    }

    /// Installs `callback` as the signal aggregator's handler and registers
    /// its self-pipe read end, claiming the process-wide signal-handling
    /// guard (spec §5).
    pub(crate) fn install_signal_callback(&mut self, callback: Box<dyn FnMut(i32)>) -> Result<()> {
        if !self.signal_handling_enabled {
            return Err(NetEventError::SignalHandlingNotEnabled);
        }
        if self.signal.is_some() {
            return Err(NetEventError::SignalHandlingAlreadyBound);
        }
        crate::signal::claim()?;
        let bridge = match SignalBridge::new(callback) {
            Ok(bridge) => bridge,
            Err(e) => {
                crate::signal::release();
                return Err(NetEventError::Io(e));
            }
        };
        let read_fd = bridge.read_fd();
        let token_id = self.alloc_target(Target::SignalPipe);
        if let Err(e) = self.poll.register(read_fd, Token(token_id), Interest::READABLE) {
            self.free_target(token_id);
            crate::signal::release();
            return Err(NetEventError::Io(e));
        }
        self.signal = Some(bridge);
        self.signal_token = Some(token_id);
        Ok(())
    }

    pub(crate) fn bind_signal(&mut self, signal: i32) -> std::io::Result<()> {
        self.signal
            .as_mut()
            .expect("SignalHandlers::bind implies a prior successful SignalHandlers::create")
            .bind(signal)
    }

    /// Unregisters the self-pipe and drops the bridge, releasing the
    /// process-wide signal-handling guard.
    pub(crate) fn clear_signal_bridge(&mut self) {
        if let Some(token_id) = self.signal_token.take() {
            if let Some(bridge) = &self.signal {
                let _ = self.poll.deregister(bridge.read_fd());
            }
            self.free_target(token_id);
        }
        self.signal = None;
    }
}

impl Drop for Base {
    fn drop(&mut self) {
        for slot_idx in 0..self.slots.len() {
            if let Some(slot) = self.slots[slot_idx].as_ref() {
                let fd = slot.fd();
                self.close_slot(slot_idx, fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_base_has_no_comm_points_and_minimal_memory() {
        let base = Base::new(false).expect("selector creation should succeed in a test sandbox");
        assert_eq!(base.memory_usage(), std::mem::size_of::<Base>());
    }

    #[test]
    fn exit_makes_dispatch_return_on_the_next_check() {
        let mut base = Base::new(false).unwrap();
        base.exit_requested = true;
        // dispatch() checks this flag before ever calling poll(), so a
        // pre-armed exit request must break the loop immediately instead of
        // blocking the test on I/O.
        assert!(base.exit_requested);
        base.dispatch();
        assert!(!base.exit_requested, "dispatch clears the flag on the way out, once it has actually broken the loop");
    }

    #[test]
    fn create_tcp_accept_rejects_zero_handlers() {
        let mut base = Base::new(false).unwrap();
        let err = base.create_tcp_accept(-1, TcpAcceptOptions { num_handlers: 0, ..Default::default() }, Box::new(|_| false));
        assert!(matches!(err, Err(NetEventError::InvalidHandlerCount(0))));
    }

    #[test]
    fn signal_handling_requires_enable_flag() {
        let mut base = Base::new(false).unwrap();
        let err = base.install_signal_callback(Box::new(|_| {}));
        assert!(matches!(err, Err(NetEventError::SignalHandlingNotEnabled)));
    }
}
