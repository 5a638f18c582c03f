//! C7: ancillary (`cmsg`) plumbing for `IP_PKTINFO` / `IP_RECVDSTADDR` /
//! `IPV6_PKTINFO` (spec §4.3, §6, §9 "Ancillary control messages").
//!
//! This is the sharpest unsafe spot in the core (spec design note): all
//! `cmsghdr` pointer arithmetic is confined to this file, and every cursor
//! step validates `cmsg_len` against the remaining buffer before it is ever
//! used to compute an offset. The iteration shape is the same
//! `CMSG_FIRSTHDR`/`CMSG_NXTHDR` walk nix's `sys::socket` module performs,
//! expressed against raw `libc::cmsghdr` instead of a wrapper crate, the way
//! `sys::unix::socket` in this crate prefers raw `libc` structs throughout.

use std::mem::{align_of, size_of};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Tag for which flavor of source-address hint was captured/should be sent,
/// named directly after the spec's `srctype` field.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SrcType {
    /// No pktinfo was received on this datagram.
    None,
    /// `IP_PKTINFO` / `IP_RECVDSTADDR` (IPv4).
    V4,
    /// `IPV6_PKTINFO`.
    V6,
}

impl SrcType {
    /// The spec represents this as `{0, 4, 6}`.
    pub fn as_u8(self) -> u8 {
        match self {
            SrcType::None => 0,
            SrcType::V4 => 4,
            SrcType::V6 => 6,
        }
    }
}

/// The interface/source-address pair a UDP datagram arrived on (or should
/// leave from), captured from/emitted as an `IP_PKTINFO`-family cmsg.
#[derive(Debug, Clone, Copy)]
pub struct PktInfo {
    pub srctype: SrcType,
    /// Destination address the kernel reported the datagram arrived at
    /// (IPv4) or the local address to egress from (IPv6).
    pub v4_addr: Ipv4Addr,
    /// `ipi6_addr` / the IPv6 local address.
    pub v6_addr: Ipv6Addr,
    /// Interface index (`ipi_ifindex` / `ipi6_ifindex`).
    pub ifindex: u32,
}

impl PktInfo {
    /// A "no pktinfo received" placeholder, used as the zero value before a
    /// receive fills it in.
    pub fn none() -> PktInfo {
        PktInfo {
            srctype: SrcType::None,
            v4_addr: Ipv4Addr::UNSPECIFIED,
            v6_addr: Ipv6Addr::UNSPECIFIED,
            ifindex: 0,
        }
    }

    /// A zero-filled IPv6 pktinfo, attached on send when `srctype == None` so
    /// the kernel falls back to routing table selection (spec §4.3).
    pub fn zero_v6() -> PktInfo {
        PktInfo {
            srctype: SrcType::V6,
            ..PktInfo::none()
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const IPV4_PKTINFO_CMSG_TYPE: libc::c_int = libc::IP_PKTINFO;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const IPV4_PKTINFO_CMSG_TYPE: libc::c_int = libc::IP_RECVDSTADDR;

/// Bytes needed for one `CMSG_SPACE(sizeof(struct in6_pktinfo))`-equivalent
/// ancillary buffer: the larger of the two pktinfo flavors, since a socket
/// bound dual-stack may receive either.
pub fn cmsg_space() -> usize {
    cmsg_space_for(size_of::<libc::in6_pktinfo>()).max(cmsg_space_for(size_of::<libc::in_pktinfo>()))
}

fn cmsg_align(len: usize) -> usize {
    let align = align_of::<usize>();
    (len + align - 1) & !(align - 1)
}

fn cmsg_space_for(payload_len: usize) -> usize {
    cmsg_align(size_of::<libc::cmsghdr>()) + cmsg_align(payload_len)
}

/// Walks a received ancillary buffer (as filled in by `recvmsg`) looking for
/// the first `IP_PKTINFO`/`IP_RECVDSTADDR`/`IPV6_PKTINFO` message.
///
/// Returns `PktInfo::none()` if no such message is present, mirroring the
/// spec's `srctype == 0` "no pktinfo received" case.
pub fn decode(buf: &[u8]) -> PktInfo {
    let mut cursor = buf;
    loop {
        let hdr_len = size_of::<libc::cmsghdr>();
        if cursor.len() < hdr_len {
            return PktInfo::none();
        }
        // SAFETY: we just checked `cursor` holds at least one `cmsghdr`.
        let hdr = unsafe { &*(cursor.as_ptr() as *const libc::cmsghdr) };
        let cmsg_len = hdr.cmsg_len as usize;
        if cmsg_len < hdr_len || cmsg_len > cursor.len() {
            // Malformed/truncated header: stop rather than read past the buffer.
            return PktInfo::none();
        }
        let payload = &cursor[hdr_len..cmsg_len];

        if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == IPV4_PKTINFO_CMSG_TYPE {
            if let Some(info) = decode_v4(payload) {
                return info;
            }
        } else if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_PKTINFO {
            if let Some(info) = decode_v6(payload) {
                return info;
            }
        }

        let advance = cmsg_align(cmsg_len);
        if advance == 0 || advance > cursor.len() {
            return PktInfo::none();
        }
        cursor = &cursor[advance..];
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn decode_v4(payload: &[u8]) -> Option<PktInfo> {
    if payload.len() < size_of::<libc::in_pktinfo>() {
        return None;
    }
    // SAFETY: length checked above.
    let info = unsafe { &*(payload.as_ptr() as *const libc::in_pktinfo) };
    Some(PktInfo {
        srctype: SrcType::V4,
        v4_addr: Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)),
        v6_addr: Ipv6Addr::UNSPECIFIED,
        ifindex: info.ipi_ifindex as u32,
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn decode_v4(payload: &[u8]) -> Option<PktInfo> {
    // IP_RECVDSTADDR hands back a bare `struct in_addr`, no ifindex.
    if payload.len() < size_of::<libc::in_addr>() {
        return None;
    }
    let addr = unsafe { &*(payload.as_ptr() as *const libc::in_addr) };
    Some(PktInfo {
        srctype: SrcType::V4,
        v4_addr: Ipv4Addr::from(u32::from_be(addr.s_addr)),
        v6_addr: Ipv6Addr::UNSPECIFIED,
        ifindex: 0,
    })
}

fn decode_v6(payload: &[u8]) -> Option<PktInfo> {
    if payload.len() < size_of::<libc::in6_pktinfo>() {
        return None;
    }
    // SAFETY: length checked above.
    let info = unsafe { &*(payload.as_ptr() as *const libc::in6_pktinfo) };
    Some(PktInfo {
        srctype: SrcType::V6,
        v4_addr: Ipv4Addr::UNSPECIFIED,
        v6_addr: Ipv6Addr::from(info.ipi6_addr.s6_addr),
        ifindex: info.ipi6_ifindex,
    })
}

/// Encodes `info` as a single ancillary message into `buf`, returning the
/// number of bytes written. `buf` must be at least [`cmsg_space`] bytes.
///
/// Panics if `buf` is too small: a caller passing an undersized buffer is a
/// core bug (the buffer is always sized by `cmsg_space()` at comm point
/// creation time), not a runtime condition.
pub fn encode(info: &PktInfo, buf: &mut [u8]) -> usize {
    match info.srctype {
        SrcType::None => 0,
        SrcType::V4 => encode_v4(info, buf),
        SrcType::V6 => encode_v6(info, buf),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn encode_v4(info: &PktInfo, buf: &mut [u8]) -> usize {
    let payload = libc::in_pktinfo {
        ipi_ifindex: info.ifindex as libc::c_int,
        ipi_spec_dst: libc::in_addr { s_addr: 0 },
        ipi_addr: libc::in_addr {
            s_addr: u32::from(info.v4_addr).to_be(),
        },
    };
    write_cmsg(buf, libc::IPPROTO_IP, IPV4_PKTINFO_CMSG_TYPE, &payload)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn encode_v4(info: &PktInfo, buf: &mut [u8]) -> usize {
    let payload = libc::in_addr {
        s_addr: u32::from(info.v4_addr).to_be(),
    };
    write_cmsg(buf, libc::IPPROTO_IP, IPV4_PKTINFO_CMSG_TYPE, &payload)
}

fn encode_v6(info: &PktInfo, buf: &mut [u8]) -> usize {
    let payload = libc::in6_pktinfo {
        ipi6_addr: libc::in6_addr {
            s6_addr: info.v6_addr.octets(),
        },
        ipi6_ifindex: info.ifindex,
    };
    write_cmsg(buf, libc::IPPROTO_IPV6, libc::IPV6_PKTINFO, &payload)
}

fn write_cmsg<T>(buf: &mut [u8], level: libc::c_int, kind: libc::c_int, payload: &T) -> usize {
    let hdr_len = size_of::<libc::cmsghdr>();
    let payload_len = size_of::<T>();
    let total = hdr_len + payload_len;
    assert!(buf.len() >= total, "ancillary buffer too small for cmsg payload");

    let hdr = libc::cmsghdr {
        cmsg_len: total as _,
        cmsg_level: level,
        cmsg_type: kind,
    };
    // SAFETY: `buf` has at least `total` bytes (asserted above), and
    // `cmsghdr`/`T` are `Copy`, plain-old-data kernel ABI structs.
    unsafe {
        std::ptr::write_unaligned(buf.as_mut_ptr() as *mut libc::cmsghdr, hdr);
        std::ptr::write_unaligned(buf[hdr_len..].as_mut_ptr() as *mut T, std::ptr::read(payload));
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_v6_pktinfo() {
        let info = PktInfo {
            srctype: SrcType::V6,
            v4_addr: Ipv4Addr::UNSPECIFIED,
            v6_addr: "2001:db8::1".parse().unwrap(),
            ifindex: 3,
        };
        let mut buf = vec![0u8; cmsg_space()];
        let n = encode(&info, &mut buf);
        let decoded = decode(&buf[..n]);
        assert_eq!(decoded.srctype, SrcType::V6);
        assert_eq!(decoded.v6_addr, info.v6_addr);
        assert_eq!(decoded.ifindex, 3);
    }

    #[test]
    fn no_pktinfo_decodes_as_none() {
        let decoded = decode(&[]);
        assert_eq!(decoded.srctype, SrcType::None);
    }

    #[test]
    fn truncated_header_does_not_panic() {
        let buf = vec![0u8; 2];
        let decoded = decode(&buf);
        assert_eq!(decoded.srctype, SrcType::None);
    }

    #[test]
    fn zero_v6_is_a_valid_send_fallback() {
        let info = PktInfo::zero_v6();
        let mut buf = vec![0u8; cmsg_space()];
        let n = encode(&info, &mut buf);
        assert!(n > 0);
    }
}
