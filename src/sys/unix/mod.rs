//! `syscall!` and the epoll/kqueue selector backends.

/// Executes a system call and returns an `io::Result` built from `errno`
/// when the call reports failure. Lifted directly from upstream `mio`'s
/// `sys/unix/mod.rs`, which every `sys/unix/*` file in that crate relies on.
macro_rules! syscall {
    ($fn:ident($($arg:expr),* $(,)*)) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) mod socket;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::{event, Selector, SysEvent, SysEvents};

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use kqueue::{event, Selector, SysEvent, SysEvents};
