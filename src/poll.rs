//! Thin wrapper around the platform [`Selector`](crate::sys::Selector) (spec
//! §4.1 "OS readiness loop handle").
//!
//! Grounded on upstream `mio`'s `src/poll.rs`: the `poll2` retry-on-`EINTR`
//! loop that adjusts the remaining timeout and retries is lifted from there
//! almost verbatim. Unlike `mio::Poll`, this crate has exactly one consumer
//! ([`Base`](crate::base::Base)), so there is no `Registry`/`Poll` split and
//! no `Arc` — `Base` owns the one `Poll` for its lifetime (spec §3 invariant
//! 5, "a base is single-threaded").

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::event::Events;
use crate::sys::Selector;
use crate::{Interest, Token};

pub(crate) struct Poll {
    selector: Selector,
}

impl Poll {
    pub(crate) fn new() -> io::Result<Poll> {
        Ok(Poll { selector: Selector::new()? })
    }

    pub(crate) fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        self.selector.register(fd, token, interests)
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        self.selector.reregister(fd, token, interests)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.selector.deregister(fd)
    }

    pub(crate) fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Waits for readiness events, retrying transparently on `EINTR` the way
    /// `mio::Poll::poll2` does: a signal delivered mid-wait is not a caller
    /// error, it's exactly the thing the signal bridge (spec §4.10) exists to
    /// surface through its own fd instead.
    pub(crate) fn poll(&self, events: &mut Events, mut timeout: Option<Duration>) -> io::Result<()> {
        loop {
            let started = Instant::now();
            match self.selector.select(events.sys(), timeout) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if let Some(to) = timeout {
                        let elapsed = started.elapsed();
                        if elapsed >= to {
                            return Ok(());
                        }
                        timeout = Some(to - elapsed);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsRawFd for Poll {
    fn as_raw_fd(&self) -> RawFd {
        self.selector.as_raw_fd()
    }
}
