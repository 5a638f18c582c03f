//! C3: comm points — the seven socket-endpoint roles of spec §3.
//!
//! Role polymorphism (spec §9) is expressed as one module per role rather
//! than a single `union`-style struct: `udp::UdpPoint` (UDP + UDP-ANCIL),
//! `tcp::TcpAccept`/`tcp::TcpHandler` (TCP-ACCEPT/TCP-HANDLER/TCP-OUTBOUND),
//! `local::LocalPoint`, `raw::RawPoint`. Each implements [`CommPointOps`] for
//! the lifecycle surface every role shares (fd, role tag, memory
//! accounting); [`Base`](crate::base::Base) holds them behind a small
//! closed enum (see `base::Slot`) rather than `dyn CommPointOps` trait
//! objects, because several roles (`TcpAccept`'s handler pool, in
//! particular) need role-specific operations a trait object would have to
//! downcast back out of.

pub mod local;
pub mod raw;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::ancillary::PktInfo;
use crate::buffer::Buffer;

/// §3 "role" tag.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CommRole {
    Udp,
    UdpAncil,
    TcpAccept,
    TcpHandler,
    TcpOutbound,
    LocalStream,
    Raw,
}

/// §6 `error_kind` delivered to the user callback.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NetEvent {
    NoError,
    Closed,
    Timeout,
    /// Reserved by the spec; this core never constructs it today, but the
    /// callback contract's match arms must still account for it.
    CapsFail,
}

/// §3 "reply_info": remote address + length + (for UDP) the captured
/// source-interface hint.
#[derive(Debug, Clone)]
pub struct ReplyInfo {
    pub addr: Option<SocketAddr>,
    pub len: usize,
    pub pktinfo: PktInfo,
}

impl ReplyInfo {
    pub(crate) fn empty() -> ReplyInfo {
        ReplyInfo { addr: None, len: 0, pktinfo: PktInfo::none() }
    }

    pub(crate) fn for_peer(addr: SocketAddr, len: usize) -> ReplyInfo {
        ReplyInfo { addr: Some(addr), len, pktinfo: PktInfo::none() }
    }
}

/// Mutable context handed to a user callback (spec §6 "Callback contract").
///
/// A callback gets this instead of a live reference into the dispatcher's
/// slot table, so "callback sovereignty" (spec §9: a callback may close its
/// own comm point) is expressed as a flag the dispatcher reads back after
/// the call returns, rather than the callback reaching through a borrowed
/// `&mut CommPoint` while the dispatcher still holds one too.
pub struct CallbackCtx<'a> {
    buffer: &'a mut Buffer,
    reply: &'a ReplyInfo,
    kind: NetEvent,
    close_requested: bool,
    exit_requested: bool,
}

impl<'a> CallbackCtx<'a> {
    pub(crate) fn new(buffer: &'a mut Buffer, reply: &'a ReplyInfo, kind: NetEvent) -> CallbackCtx<'a> {
        CallbackCtx { buffer, reply, kind, close_requested: false, exit_requested: false }
    }

    pub fn buffer(&self) -> &Buffer {
        self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        self.buffer
    }

    /// The inbound message bytes, read-only.
    pub fn request(&self) -> &[u8] {
        self.buffer.readable_slice()
    }

    /// Overwrites the buffer with the reply to send (spec §6): shorthand
    /// for `buffer_mut().fill(bytes)`.
    pub fn set_reply(&mut self, bytes: &[u8]) {
        self.buffer.fill(bytes);
    }

    pub fn reply_info(&self) -> &ReplyInfo {
        self.reply
    }

    pub fn kind(&self) -> NetEvent {
        self.kind
    }

    /// Requests that the dispatcher close this comm point instead of
    /// continuing its normal post-callback transition (re-arming for
    /// write, looping back to read, ...).
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Requests that the owning [`Base`](crate::base::Base) stop its
    /// dispatch loop once this callback returns (spec §4.1 `exit`): a
    /// callback has no direct reference to the base it runs under (the same
    /// "callback sovereignty" reasoning as [`close`](CallbackCtx::close)), so
    /// the request is carried back out through the comm point that invoked
    /// it instead.
    pub fn exit(&mut self) {
        self.exit_requested = true;
    }

    pub(crate) fn exit_requested(&self) -> bool {
        self.exit_requested
    }
}

/// `(ctx) -> bool`, the opaque per-message callback (spec §6).
///
/// Consulted only on [`NetEvent::NoError`] and only for UDP / TCP inbound
/// reads: `true` means "the buffer now holds the reply; send it", `false`
/// means "drop, or handled out of band".
pub type Callback = Box<dyn FnMut(&mut CallbackCtx) -> bool>;

/// Invokes `callback` and reports back everything it asked for: whether to
/// send the buffer as a reply, whether to close the comm point that invoked
/// it, and whether to stop the owning base's dispatch loop.
pub(crate) fn invoke(callback: &mut Callback, buffer: &mut Buffer, reply: &ReplyInfo, kind: NetEvent) -> (bool, bool, bool) {
    let mut ctx = CallbackCtx::new(buffer, reply, kind);
    let send = callback(&mut ctx);
    (send, ctx.close_requested(), ctx.exit_requested())
}

/// Shared lifecycle surface every comm-point role implements (spec §9
/// "Role polymorphism").
pub trait CommPointOps {
    fn role(&self) -> CommRole;

    /// `-1` once closed (spec §3).
    fn fd(&self) -> RawFd;

    /// Bytes attributable to this comm point for `get_mem` accounting
    /// (spec §5 "Memory budget"): the struct itself plus its buffer's
    /// capacity. Accept points additionally sum their whole handler pool.
    fn memory_usage(&self) -> usize;
}
