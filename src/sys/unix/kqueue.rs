//! BSD/macOS selector backend.
//!
//! Grounded on upstream `mio`'s `sys/unix/selector/kqueue.rs`, with the same
//! deliberate deviation as the epoll backend: `register`/`reregister` never
//! pass `EV_CLEAR`, so filters stay level-triggered (see DESIGN.md,
//! deviation 2).

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use log::error;

use crate::{Interest, Token};

#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

macro_rules! kevent {
    ($id:expr, $filter:expr, $flags:expr, $data:expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as _,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: $data as *mut libc::c_void,
        }
    };
}

#[derive(Debug)]
pub struct Selector {
    kq: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    pub fn select(&self, events: &mut SysEvents, timeout: Option<Duration>) -> io::Result<()> {
        let ts = timeout.map(|to| libc::timespec {
            tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let ts_ptr = ts.as_ref().map(|t| t as *const _).unwrap_or(ptr::null());

        events.inner.clear();
        let cap = events.inner.capacity();
        let n = syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            events.inner.as_mut_ptr(),
            cap as Count,
            ts_ptr,
        ))?;
        // SAFETY: `kevent` filled in exactly `n` entries.
        unsafe { events.inner.set_len(n as usize) };
        Ok(())
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let flags = libc::EV_ADD | libc::EV_RECEIPT;
        let mut changes = Vec::with_capacity(2);
        if interests.is_readable() {
            changes.push(kevent!(fd, libc::EVFILT_READ, flags, token.0));
        }
        if interests.is_writable() {
            changes.push(kevent!(fd, libc::EVFILT_WRITE, flags, token.0));
        }
        kevent_register(self.kq, &mut changes, &[libc::EPIPE as libc::intptr_t])
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let flags = libc::EV_RECEIPT;
        let read_flags = if interests.is_readable() { flags | libc::EV_ADD } else { flags | libc::EV_DELETE };
        let write_flags = if interests.is_writable() { flags | libc::EV_ADD } else { flags | libc::EV_DELETE };
        let mut changes = vec![
            kevent!(fd, libc::EVFILT_READ, read_flags, token.0),
            kevent!(fd, libc::EVFILT_WRITE, write_flags, token.0),
        ];
        kevent_register(
            self.kq,
            &mut changes,
            &[libc::ENOENT as libc::intptr_t, libc::EPIPE as libc::intptr_t],
        )
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let flags = libc::EV_DELETE | libc::EV_RECEIPT;
        let mut changes = vec![
            kevent!(fd, libc::EVFILT_READ, flags, 0),
            kevent!(fd, libc::EVFILT_WRITE, flags, 0),
        ];
        kevent_register(self.kq, &mut changes, &[libc::ENOENT as libc::intptr_t])
    }
}

fn kevent_register(kq: RawFd, changes: &mut [libc::kevent], ignored_errors: &[libc::intptr_t]) -> io::Result<()> {
    syscall!(kevent(
        kq,
        changes.as_ptr(),
        changes.len() as Count,
        changes.as_mut_ptr(),
        changes.len() as Count,
        ptr::null(),
    ))
    .map(|_| ())
    .or_else(|err| if err.raw_os_error() == Some(libc::EINTR) { Ok(()) } else { Err(err) })
    .and_then(|()| check_errors(changes, ignored_errors))
}

fn check_errors(events: &[libc::kevent], ignored_errors: &[libc::intptr_t]) -> io::Result<()> {
    for event in events {
        let data = event.data;
        if (event.flags & libc::EV_ERROR != 0) && data != 0 && !ignored_errors.contains(&data) {
            return Err(io::Error::from_raw_os_error(data as i32));
        }
    }
    Ok(())
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        if let Err(err) = syscall!(close(self.kq)) {
            error!("error closing kqueue: {}", err);
        }
    }
}

pub type SysEvent = libc::kevent;

#[derive(Debug)]
pub struct SysEvents {
    pub(crate) inner: Vec<SysEvent>,
}

impl SysEvents {
    pub fn with_capacity(capacity: usize) -> SysEvents {
        SysEvents { inner: Vec::with_capacity(capacity) }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

pub mod event {
    use super::SysEvent;
    use crate::Token;

    pub fn token(event: &SysEvent) -> Token {
        Token(event.udata as usize)
    }

    pub fn is_readable(event: &SysEvent) -> bool {
        event.filter == libc::EVFILT_READ
    }

    pub fn is_writable(event: &SysEvent) -> bool {
        event.filter == libc::EVFILT_WRITE
    }

    pub fn is_error(event: &SysEvent) -> bool {
        (event.flags & libc::EV_ERROR) != 0
    }

    pub fn is_read_closed(event: &SysEvent) -> bool {
        event.filter == libc::EVFILT_READ && (event.flags & libc::EV_EOF) != 0
    }
}
