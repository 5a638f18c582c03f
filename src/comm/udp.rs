//! C3/C7: the UDP and UDP-ANCIL comm point roles (spec §4.2, §4.3).
//!
//! Both roles share one struct; `ancillary` selects between the plain
//! `recvfrom`/`sendto` path and the `recvmsg`/`sendmsg` + `IP_PKTINFO`-family
//! path. A single readable wakeup drains up to [`crate::NUM_UDP_PER_SELECT`]
//! datagrams before returning control to the loop (spec §4.2 step 2).

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use log::{debug, trace, warn};

use crate::ancillary::{self, PktInfo, SrcType};
use crate::buffer::Buffer;
use crate::comm::{self, Callback, CommPointOps, CommRole, NetEvent, ReplyInfo};
use crate::sys::unix::socket;
use crate::NUM_UDP_PER_SELECT;

/// What the dispatcher should do after a UDP readable wakeup.
pub(crate) enum UdpOutcome {
    /// Batch ended normally (drained the queue, or hit the `N` cap).
    Continue,
    /// The callback asked to close this comm point mid-batch (spec §9
    /// "Callback sovereignty"): stop the batch immediately.
    CloseRequested,
}

pub struct UdpPoint {
    fd: RawFd,
    ancillary: bool,
    buffer: Buffer,
    cmsg_buf: Vec<u8>,
    callback: Callback,
    reply: ReplyInfo,
    exit_requested: bool,
}

impl UdpPoint {
    /// Plain UDP comm point (spec §4.2): `recvfrom`/`sendto`, no
    /// source-interface pinning.
    pub fn new_plain(fd: RawFd, bufsize: usize, callback: Callback) -> UdpPoint {
        UdpPoint {
            fd,
            ancillary: false,
            buffer: Buffer::with_capacity(bufsize),
            cmsg_buf: Vec::new(),
            callback,
            reply: ReplyInfo::empty(),
            exit_requested: false,
        }
    }

    /// UDP-ANCIL comm point (spec §4.3): `recvmsg`/`sendmsg` with an
    /// `IP_PKTINFO`-family control message so replies egress via the
    /// interface/source address the query arrived on.
    pub fn new_ancillary(fd: RawFd, bufsize: usize, callback: Callback) -> UdpPoint {
        UdpPoint {
            fd,
            ancillary: true,
            buffer: Buffer::with_capacity(bufsize),
            cmsg_buf: vec![0u8; ancillary::cmsg_space()],
            callback,
            reply: ReplyInfo::empty(),
            exit_requested: false,
        }
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Drains up to `NUM_UDP_PER_SELECT` datagrams (spec §4.2 steps 1-5).
    pub(crate) fn handle_readable(&mut self) -> UdpOutcome {
        trace!("udp fd {} readable", self.fd);
        for _ in 0..NUM_UDP_PER_SELECT {
            self.buffer.clear();
            let received = if self.ancillary { self.recv_ancillary() } else { self.recv_plain() };
            let (n, peer) = match received {
                Some(v) => v,
                None => break,
            };

            self.buffer.advance(n);
            self.buffer.flip();
            self.reply = ReplyInfo::for_peer(peer, n);
            if self.ancillary {
                self.reply.pktinfo = ancillary::decode(&self.cmsg_buf);
            }

            let (send, close, exit) = comm::invoke(&mut self.callback, &mut self.buffer, &self.reply, NetEvent::NoError);
            if exit {
                self.exit_requested = true;
            }
            if close {
                self.fd = -1;
                return UdpOutcome::CloseRequested;
            }
            if send {
                self.send_reply();
            }
            if exit {
                break;
            }
        }
        UdpOutcome::Continue
    }

    /// Clears and returns whether a callback invoked during the last batch
    /// asked to stop the owning base's dispatch loop (spec §4.1 `exit`).
    pub(crate) fn take_exit_requested(&mut self) -> bool {
        std::mem::take(&mut self.exit_requested)
    }

    /// Returns `None` on `EAGAIN`/`EINTR` (stop the batch, spec §4.2 step 3)
    /// or any other receive error (logged and also stopping the batch).
    fn recv_plain(&mut self) -> Option<(usize, SocketAddr)> {
        match socket::recvfrom(self.fd, self.buffer.writable_slice()) {
            Ok(v) => Some(v),
            Err(e) if is_retryable(&e) => None,
            Err(e) => {
                warn!("udp recvfrom on fd {} failed: {e}", self.fd);
                None
            }
        }
    }

    fn recv_ancillary(&mut self) -> Option<(usize, SocketAddr)> {
        let UdpPoint { fd, buffer, cmsg_buf, .. } = self;
        match socket::recvmsg(*fd, buffer.writable_slice(), cmsg_buf) {
            Ok((n, peer, cmsg_len)) => {
                cmsg_buf.truncate(cmsg_len.min(cmsg_buf.len()));
                cmsg_buf.resize(ancillary::cmsg_space(), 0);
                Some((n, peer))
            }
            Err(e) if is_retryable(&e) => None,
            Err(e) => {
                warn!("udp recvmsg on fd {} failed: {e}", self.fd);
                None
            }
        }
    }

    /// Spec §6 "`send_reply`": dispatches to the ancillary or plain send
    /// path based on `srctype` (invariant 4), attaching a zero-filled IPv6
    /// pktinfo when the ancillary role captured nothing at receive (§4.3).
    fn send_reply(&mut self) {
        let Some(peer) = self.reply.addr else { return };
        let buf_len = self.buffer.readable_slice().len();
        let result = if self.ancillary {
            let info = match self.reply.pktinfo.srctype {
                SrcType::None => PktInfo::zero_v6(),
                _ => self.reply.pktinfo,
            };
            let mut cmsg = vec![0u8; ancillary::cmsg_space()];
            let n = ancillary::encode(&info, &mut cmsg);
            socket::sendmsg(self.fd, self.buffer.readable_slice(), peer, &cmsg[..n])
        } else {
            socket::sendto(self.fd, self.buffer.readable_slice(), peer)
        };
        match result {
            Ok(n) if n == buf_len => {}
            Ok(n) => warn!("short udp write to {peer}: sent {n} of {buf_len} bytes; reply dropped"),
            Err(e) if e.raw_os_error() == Some(libc::ENETUNREACH) => {
                debug!("ENETUNREACH replying to {peer} on fd {}: {e}", self.fd)
            }
            Err(e) => warn!("udp reply to {peer} on fd {} failed: {e}", self.fd),
        }
    }

    /// `drop_reply` (spec §6): a no-op for UDP.
    pub(crate) fn drop_reply(&mut self) {}
}

fn is_retryable(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted)
}

impl CommPointOps for UdpPoint {
    fn role(&self) -> CommRole {
        if self.ancillary { CommRole::UdpAncil } else { CommRole::Udp }
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    fn memory_usage(&self) -> usize {
        std::mem::size_of::<UdpPoint>() + self.buffer.capacity() + self.cmsg_buf.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn drop_reply_is_a_no_op() {
        let mut point = UdpPoint::new_plain(-1, 512, Box::new(|_| false));
        point.drop_reply(); // must not panic or touch the fd
    }

    #[test]
    fn role_reflects_ancillary_flag() {
        let plain = UdpPoint::new_plain(-1, 512, Box::new(|_| false));
        let ancil = UdpPoint::new_ancillary(-1, 512, Box::new(|_| false));
        assert_eq!(plain.role(), CommRole::Udp);
        assert_eq!(ancil.role(), CommRole::UdpAncil);
    }

    #[test]
    fn callback_close_request_is_observed() {
        // A callback that asks to close should be reachable through the
        // CallbackCtx plumbing without the dispatcher holding a live `&mut`
        // into the point at the same time.
        let closed = Rc::new(RefCell::new(false));
        let closed2 = closed.clone();
        let mut buffer = Buffer::with_capacity(4);
        let reply = ReplyInfo::empty();
        let mut callback: Callback = Box::new(move |ctx| {
            *closed2.borrow_mut() = true;
            ctx.close();
            false
        });
        let (_send, close, _exit) = comm::invoke(&mut callback, &mut buffer, &reply, NetEvent::NoError);
        assert!(close);
        assert!(*closed.borrow());
    }

    #[test]
    fn callback_exit_request_is_observed() {
        let mut buffer = Buffer::with_capacity(4);
        let reply = ReplyInfo::empty();
        let mut callback: Callback = Box::new(move |ctx| {
            ctx.exit();
            false
        });
        let (_send, _close, exit) = comm::invoke(&mut callback, &mut buffer, &reply, NetEvent::NoError);
        assert!(exit);
    }
}
