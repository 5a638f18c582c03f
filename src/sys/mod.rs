//! Platform readiness-selector backends.
//!
//! This crate only targets POSIX systems with either `epoll` (Linux,
//! Android) or `kqueue` (the BSDs, macOS): the DNS-specific ancillary-data
//! (`IP_PKTINFO`) and `SO_ERROR` plumbing the spec requires has no portable
//! equivalent outside that family, so unlike upstream `mio` there is no
//! Windows/WASI/Fuchsia backend here (see DESIGN.md).
//!
//! Unlike upstream `mio`, the raw-syscall layer (`unix::socket`) is not an
//! optional, swappable backend: `comm::{udp,tcp}`, `base`, `ancillary` and
//! `signal` all call it unconditionally, so there is no build of this crate
//! that doesn't need it. There is accordingly no `sys::shell` stand-in and
//! no feature flag gating it — `libc` is a plain, always-on dependency.

pub(crate) mod unix;
pub use unix::*;
