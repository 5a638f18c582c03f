//! Linux/Android selector backend.
//!
//! Grounded on upstream `mio`'s `sys/unix/selector/epoll.rs`, with one
//! deliberate change: `interests_to_epoll` never sets `EPOLLET`. The spec
//! requires level-triggered readiness (see DESIGN.md, deviation 1) so a
//! comm point that stops draining a socket mid-burst (the UDP
//! `NUM_UDP_PER_SELECT` cap, or a TCP handler that only partially reads)
//! is guaranteed to see the fd reported ready again on the next wait.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::{Interest, Token};

#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1` returns a valid fd or -1.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub fn select(&self, events: &mut SysEvents, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.inner.clear();
        events.inner.reserve(events.inner.capacity());
        let cap = events.inner.capacity();
        // SAFETY: `epoll_wait` only ever writes up to `cap` entries, and we
        // set the length to the number it reports writing.
        let n = unsafe {
            let ptr = events.inner.as_mut_ptr();
            match syscall!(epoll_wait(self.ep.as_raw_fd(), ptr, cap as i32, timeout_ms)) {
                Ok(n) => n,
                Err(e) => return Err(e),
            }
        };
        unsafe { events.inner.set_len(n as usize) };
        Ok(())
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: usize::from(token) as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn interests_to_epoll(interests: Interest) -> u32 {
    let mut kind = 0;
    if interests.is_readable() {
        kind |= EPOLLIN | EPOLLRDHUP | EPOLLPRI;
    }
    if interests.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

pub type SysEvent = libc::epoll_event;

#[derive(Debug)]
pub struct SysEvents {
    pub(crate) inner: Vec<SysEvent>,
}

impl SysEvents {
    pub fn with_capacity(capacity: usize) -> SysEvents {
        SysEvents {
            inner: Vec::with_capacity(capacity),
        }
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
    use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

    pub fn token(event: &SysEvent) -> Token {
        Token(event.u64 as usize)
    }

    pub fn is_readable(event: &SysEvent) -> bool {
        (event.events as libc::c_int & (EPOLLIN | EPOLLPRI)) != 0
    }

    pub fn is_writable(event: &SysEvent) -> bool {
        (event.events as libc::c_int & EPOLLOUT) != 0
    }

    pub fn is_error(event: &SysEvent) -> bool {
        (event.events as libc::c_int & EPOLLERR) != 0
    }

    pub fn is_read_closed(event: &SysEvent) -> bool {
        event.events as libc::c_int & EPOLLHUP != 0
            || (event.events as libc::c_int & EPOLLIN != 0 && event.events as libc::c_int & EPOLLRDHUP != 0)
    }
}
