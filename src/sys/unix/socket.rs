//! Raw, non-blocking socket creation shared by the UDP and TCP comm points.
//!
//! Grounded on upstream `mio`'s `sys/unix/socket.rs`: create with
//! `SOCK_NONBLOCK | SOCK_CLOEXEC` where the kernel supports it in one call,
//! fall back to `fcntl` on platforms that don't (Darwin).

use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

pub(crate) fn new_socket(domain: libc::c_int, socket_type: libc::c_int) -> io::Result<RawFd> {
    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    let socket_type = socket_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;

    let fd = syscall!(socket(domain, socket_type, 0))?;

    #[cfg(any(target_os = "ios", target_os = "macos"))]
    {
        if let Err(e) = syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))
            .and_then(|_| syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC)))
        {
            let _ = syscall!(close(fd));
            return Err(e);
        }
    }

    Ok(fd)
}

/// Makes an already-created fd (e.g. one returned from `accept()`) non-blocking.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map(|_| ())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC)).map(|_| ())
}

pub(crate) fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &on as *const _ as *const libc::c_void,
        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

/// Reads `SO_ERROR` off a socket, for the nonblocking-connect completion check
/// (spec §4.5 "Nonblocking connect").
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
    ))?;
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

pub(crate) fn bind(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
    let (raw_addr, raw_addr_len) = socket_addr(&addr);
    syscall!(bind(fd, raw_addr.as_ptr() as *const libc::sockaddr, raw_addr_len)).map(|_| ())
}

pub(crate) fn connect(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
    let (raw_addr, raw_addr_len) = socket_addr(&addr);
    match syscall!(connect(fd, raw_addr.as_ptr() as *const libc::sockaddr, raw_addr_len)) {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
        Err(e) => Err(e),
    }
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(fd, storage.as_mut_ptr() as *mut libc::sockaddr, &mut len))?;
    // SAFETY: `getsockname` filled in `len` bytes of `storage`.
    unsafe { from_raw_sockaddr(storage.as_ptr()) }
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(fd, storage.as_mut_ptr() as *mut libc::sockaddr, &mut len))?;
    unsafe { from_raw_sockaddr(storage.as_ptr()) }
}

/// Converts a `std::net::SocketAddr` into a raw `sockaddr_storage` plus its length.
pub(crate) fn socket_addr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: all-zero is a valid `sockaddr_storage`.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match *addr {
        SocketAddr::V4(ref a) => {
            let storage = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            storage.sin_family = libc::AF_INET as libc::sa_family_t;
            storage.sin_port = a.port().to_be();
            storage.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(ref a) => {
            let storage = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            storage.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            storage.sin6_port = a.port().to_be();
            storage.sin6_addr = libc::in6_addr {
                s6_addr: a.ip().octets(),
            };
            storage.sin6_scope_id = a.scope_id();
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// # Safety
/// `storage` must point to a `len`-bytes-initialized `sockaddr_storage` as
/// filled in by `accept`/`recvfrom`/`getsockname`/`getpeername`.
pub(crate) unsafe fn from_raw_sockaddr(storage: *const libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr = &*(storage as *const libc::sockaddr_in);
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Ok(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)))
        }
        libc::AF_INET6 => {
            let addr = &*(storage as *const libc::sockaddr_in6);
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(SocketAddr::new(ip.into(), u16::from_be(addr.sin6_port)))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported address family {family}"),
        )),
    }
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(|_| ())
}

pub(crate) fn close(fd: RawFd) -> io::Result<()> {
    syscall!(close(fd)).map(|_| ())
}

/// `accept4` with `SOCK_NONBLOCK | SOCK_CLOEXEC` where available, falling
/// back to plain `accept` + `fcntl` (spec §4.4 step 5 "make new fd
/// non-blocking").
pub(crate) fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    #[cfg(any(target_os = "android", target_os = "linux"))]
    let new_fd = syscall!(accept4(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;

    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    let new_fd = {
        let new_fd = syscall!(accept(fd, storage.as_mut_ptr() as *mut libc::sockaddr, &mut len))?;
        if let Err(e) = set_nonblocking(new_fd).and_then(|_| set_cloexec(new_fd)) {
            let _ = syscall!(close(new_fd));
            return Err(e);
        }
        new_fd
    };

    // SAFETY: `accept`/`accept4` filled in `len` bytes of `storage`.
    let addr = unsafe { from_raw_sockaddr(storage.as_ptr())? };
    Ok((new_fd, addr))
}

/// `recvfrom` into `buf`, returning the byte count and sender address
/// (spec §4.2 "For each `recvfrom`").
pub(crate) fn recvfrom(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len,
    ))?;
    // SAFETY: `recvfrom` filled in `len` bytes of `storage` on success.
    let addr = unsafe { from_raw_sockaddr(storage.as_ptr())? };
    Ok((n as usize, addr))
}

pub(crate) fn sendto(fd: RawFd, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
    let (raw_addr, raw_addr_len) = socket_addr(&addr);
    let n = syscall!(sendto(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        0,
        &raw_addr as *const _ as *const libc::sockaddr,
        raw_addr_len,
    ))?;
    Ok(n as usize)
}

/// `recvmsg` with an ancillary-data buffer (spec §4.3). Returns the payload
/// length, the sender address, and however many bytes of `cmsg_buf` the
/// kernel filled in.
pub(crate) fn recvmsg(fd: RawFd, buf: &mut [u8], cmsg_buf: &mut [u8]) -> io::Result<(usize, SocketAddr, usize)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_name = storage.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = cmsg_buf.len() as _;

    let n = syscall!(recvmsg(fd, &mut hdr, 0))?;
    // SAFETY: `recvmsg` filled in `hdr.msg_namelen` bytes of `storage`.
    let addr = unsafe { from_raw_sockaddr(storage.as_ptr())? };
    Ok((n as usize, addr, hdr.msg_controllen as usize))
}

/// `sendmsg` with a pre-encoded ancillary buffer (spec §4.3 "The send path
/// emits a matching control message").
pub(crate) fn sendmsg(fd: RawFd, buf: &[u8], addr: SocketAddr, cmsg_buf: &[u8]) -> io::Result<usize> {
    let (mut raw_addr, raw_addr_len) = socket_addr(&addr);
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    hdr.msg_name = &mut raw_addr as *mut _ as *mut libc::c_void;
    hdr.msg_namelen = raw_addr_len;
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    if !cmsg_buf.is_empty() {
        hdr.msg_control = cmsg_buf.as_ptr() as *mut libc::c_void;
        hdr.msg_controllen = cmsg_buf.len() as _;
    }
    let n = syscall!(sendmsg(fd, &hdr, 0))?;
    Ok(n as usize)
}

/// Plain `read`/`write`, used by TCP handlers for both the length prefix and
/// the payload.
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()))?;
    Ok(n as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len()))?;
    Ok(n as usize)
}

/// `writev` of the 2-byte length prefix followed by the payload in one
/// syscall (spec §4.5 "using scatter-gather when available so prefix and
/// payload leave together").
pub(crate) fn writev_prefixed(fd: RawFd, prefix: &[u8; 2], payload: &[u8]) -> io::Result<usize> {
    let iov = [
        libc::iovec { iov_base: prefix.as_ptr() as *mut libc::c_void, iov_len: prefix.len() },
        libc::iovec { iov_base: payload.as_ptr() as *mut libc::c_void, iov_len: payload.len() },
    ];
    let n = syscall!(writev(fd, iov.as_ptr(), iov.len() as libc::c_int))?;
    Ok(n as usize)
}
