//! C6: signal handler set (spec §4.10).
//!
//! Bridges OS signals into the loop thread via the classic self-pipe trick:
//! the actual signal handler (installed through `signal-hook`, itself built
//! on `signal-hook-registry`) does nothing but `write()` the signal number
//! into a pipe — the only thing async-signal-safe code is allowed to do —
//! and the pipe's read end is a perfectly ordinary comm point registered
//! with the same [`Selector`](crate::sys::Selector) every other fd uses.
//! `dispatch` only ever runs the user's callback from the loop thread, after
//! draining the pipe, matching the spec's "not from the async signal
//! context" requirement.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, warn};

use crate::base::Base;
use crate::error::{NetEventError, Result};

/// Guards the one OS signal table a process has (spec §5 "Shared
/// resources"): only one `Base` may request signal handling at a time.
static SIGNAL_HANDLING_CLAIMED: AtomicBool = AtomicBool::new(false);

pub(crate) fn claim() -> Result<()> {
    SIGNAL_HANDLING_CLAIMED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .map(|_| ())
        .map_err(|_| NetEventError::SignalHandlingAlreadyBound)
}

pub(crate) fn release() {
    SIGNAL_HANDLING_CLAIMED.store(false, Ordering::SeqCst);
}

/// Owns the self-pipe and the set of registered `signal-hook` ids. Lives
/// inside `Base`; torn down by `Base::drop`.
pub(crate) struct SignalBridge {
    read_fd: RawFd,
    write_fd: RawFd,
    ids: Vec<signal_hook::SigId>,
    callback: Box<dyn FnMut(i32)>,
}

impl SignalBridge {
    pub(crate) fn new(callback: Box<dyn FnMut(i32)>) -> io::Result<SignalBridge> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: `pipe2` fills both elements of `fds` on success.
        unsafe {
            if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(SignalBridge {
            read_fd: fds[0],
            write_fd: fds[1],
            ids: Vec::new(),
            callback,
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub(crate) fn bind(&mut self, signal: i32) -> io::Result<()> {
        let write_fd = self.write_fd;
        // SAFETY: the action below only performs a single `write(2)` of one
        // already-computed byte to an already-open fd — the one operation
        // POSIX guarantees is safe to call from a signal handler.
        let id = unsafe {
            signal_hook::low_level::register(signal, move || {
                let byte = signal as u8;
                let _ = libc::write(write_fd, &byte as *const u8 as *const libc::c_void, 1);
            })?
        };
        self.ids.push(id);
        Ok(())
    }

    /// Drains every pending signal byte and invokes the callback once per
    /// byte read. Called by `Base::dispatch` when the pipe's read end
    /// reports readable.
    pub(crate) fn drain(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: `buf` is a valid, fully-owned stack buffer.
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                let err = io::Error::last_os_error();
                if n < 0 && err.kind() != io::ErrorKind::WouldBlock && err.kind() != io::ErrorKind::Interrupted {
                    warn!("signal self-pipe read failed: {err}");
                }
                break;
            }
            for &byte in &buf[..n as usize] {
                (self.callback)(byte as i32);
            }
        }
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
        unsafe {
            if libc::close(self.read_fd) != 0 {
                error!("error closing signal pipe read end: {}", io::Error::last_os_error());
            }
            if libc::close(self.write_fd) != 0 {
                error!("error closing signal pipe write end: {}", io::Error::last_os_error());
            }
        }
        release();
    }
}

/// Public handle to the signal aggregator bound to a [`Base`].
///
/// `Base::new(true)` must have been used to construct the base; `create`
/// fails otherwise. All state lives inside the base (see [`SignalBridge`]);
/// this type is a thin marker, consistent with [`Timer`](crate::timer::Timer)
/// being an index into its base rather than an owner of its own state.
#[derive(Debug)]
pub struct SignalHandlers {
    _private: (),
}

impl SignalHandlers {
    /// Installs `callback` as the aggregator's single handler. `base` must
    /// have been created with `enable_signal_handling = true`.
    pub fn create(base: &mut Base, callback: impl FnMut(i32) + 'static) -> Result<SignalHandlers> {
        base.install_signal_callback(Box::new(callback))?;
        Ok(SignalHandlers { _private: () })
    }

    /// Adds one OS signal to the set routed into the aggregator's callback.
    pub fn bind(&self, base: &mut Base, signal: i32) -> Result<()> {
        base.bind_signal(signal).map_err(NetEventError::Io)
    }

    /// Unbinds every signal this aggregator registered. The `SignalHandlers`
    /// value itself does not need to be kept around afterward.
    pub fn delete(self, base: &mut Base) {
        base.clear_signal_bridge();
    }
}
