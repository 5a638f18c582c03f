#![crate_name = "dns_netcore"]
#![cfg(unix)]

//! Single-threaded readiness event core for a recursive DNS resolver.
//!
//! A [`Base`] owns one OS readiness loop, a cached wall clock, a heap of
//! one-shot [`Timer`]s and an optional [`SignalHandlers`] bridge. [`comm`]
//! comm points register with a base and drive the UDP/TCP/local-stream/raw
//! transport state machines, invoking an opaque user callback on every
//! complete message and optionally sending back a synchronously-prepared
//! reply.
//!
//! DNS message parsing, the resolver and validator, trust anchors and the
//! cache are all out of scope: this crate only moves bytes in and out of
//! buffers and tells the caller when a full message has arrived.

pub mod ancillary;
pub mod base;
pub mod buffer;
pub mod clock;
pub mod comm;
pub mod error;
pub mod event;
pub mod interest;
pub(crate) mod poll;
pub mod signal;
pub mod sys;
pub mod timer;
pub mod token;

pub use base::Base;
pub use error::{NetEventError, Result};
pub use event::{Event, Events};
pub use interest::Interest;
pub use signal::SignalHandlers;
pub use timer::Timer;
pub use token::Token;

/// Number of UDP datagrams drained in one readable wakeup.
///
/// Kept at 100 on every platform we support. Older resolvers drop this to 1
/// on select()-only BSDs where non-blocking sockets can report spurious
/// readability; we only target epoll/kqueue, both of which report readiness
/// accurately, so that carve-out has no live platform to apply to.
pub const NUM_UDP_PER_SELECT: usize = 100;

/// Default per-query timeout for an accepted TCP connection.
pub const TCP_QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// Smallest legal DNS message: a bare 12-byte header.
pub const MINIMUM_DNS_MESSAGE_LEN: usize = 12;
