//! `IP_PKTINFO` / `IPV6_PKTINFO` ancillary data encode/decode.
//!
//! This is the one piece of the datapath that genuinely depends on the
//! host's `cmsghdr` ABI. `in_pktinfo`/`in6_pktinfo` share field names
//! (`ipi_ifindex`/`ipi_spec_dst`/`ipi_addr`, `ipi6_addr`/`ipi6_ifindex`)
//! across Darwin and Linux, which keeps the decode/encode logic below
//! portable; only the *socket options* that ask the kernel to deliver this
//! cmsg in the first place differ (`IP_RECVDSTADDR`/`IP_RECVIF` exist only
//! on BSD-derived kernels) and those live in `socket_context`, not here.

use bytemuck::{Pod, Zeroable};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Transparent POD wrappers around the libc cmsg payload types, so the
/// actual byte shuffling below goes through `bytemuck` instead of hand-rolled
/// `read_unaligned`/`write_unaligned` calls. `unsafe impl` rather than
/// `#[derive(Pod)]` because the wrapped libc structs are foreign types the
/// derive can't see through; each one is still a plain run of integers with
/// no padding, so the safety contract holds.
#[repr(transparent)]
#[derive(Clone, Copy)]
struct CmsgHdr(libc::cmsghdr);
unsafe impl Zeroable for CmsgHdr {}
unsafe impl Pod for CmsgHdr {}

#[repr(transparent)]
#[derive(Clone, Copy)]
struct RawInPktInfo(libc::in_pktinfo);
unsafe impl Zeroable for RawInPktInfo {}
unsafe impl Pod for RawInPktInfo {}

#[repr(transparent)]
#[derive(Clone, Copy)]
struct RawIn6PktInfo(libc::in6_pktinfo);
unsafe impl Zeroable for RawIn6PktInfo {}
unsafe impl Pod for RawIn6PktInfo {}

/// Large enough for one `IP_PKTINFO` or `IPV6_PKTINFO` cmsg, whichever is
/// bigger, computed the way `CMSG_SPACE` would at compile time on the
/// target but evaluated at runtime to sidestep `in6_pktinfo`'s alignment
/// not being `const`-friendly on every platform.
pub fn control_buffer_len() -> usize {
    let v4_space = unsafe { libc::CMSG_SPACE(mem::size_of::<libc::in_pktinfo>() as u32) };
    let v6_space = unsafe { libc::CMSG_SPACE(mem::size_of::<libc::in6_pktinfo>() as u32) };
    v4_space.max(v6_space) as usize
}

/// The destination address information recovered from an inbound `PKTINFO`
/// cmsg: the local address the datagram arrived on, and the interface it
/// arrived through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PktInfo {
    V4 { addr: Ipv4Addr, interface_index: u32 },
    V6 { addr: Ipv6Addr, interface_index: u32 },
}

/// Walks the control message chain of a populated `msghdr` looking for the
/// first `IP_PKTINFO`/`IPV6_PKTINFO` entry. Returns `None` if neither was
/// present — callers treat a missing PKTINFO as fatal for that receive
/// since the local address is a hard prerequisite.
///
/// # Safety
/// `msg` must be a `msghdr` that was just populated by a successful
/// `recvmsg` call using a control buffer of at least `control_buffer_len()`
/// bytes.
pub unsafe fn decode_pktinfo(msg: &libc::msghdr) -> Option<PktInfo> {
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        match (hdr.cmsg_level, hdr.cmsg_type) {
            (libc::IPPROTO_IP, libc::IP_PKTINFO) => {
                let len = mem::size_of::<libc::in_pktinfo>();
                let data = unsafe { std::slice::from_raw_parts(libc::CMSG_DATA(cmsg), len) };
                let info: RawInPktInfo = bytemuck::pod_read_unaligned(data);
                let info = info.0;
                return Some(PktInfo::V4 {
                    addr: Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)),
                    interface_index: info.ipi_ifindex as u32,
                });
            }
            (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
                let len = mem::size_of::<libc::in6_pktinfo>();
                let data = unsafe { std::slice::from_raw_parts(libc::CMSG_DATA(cmsg), len) };
                let info: RawIn6PktInfo = bytemuck::pod_read_unaligned(data);
                let info = info.0;
                return Some(PktInfo::V6 {
                    addr: Ipv6Addr::from(info.ipi6_addr.s6_addr),
                    interface_index: info.ipi6_ifindex as u32,
                });
            }
            _ => {}
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    None
}

/// Encodes a single `IP_PKTINFO`/`IPV6_PKTINFO` ancillary message into
/// `buf` describing `addr` as the desired source address for a send.
/// Returns the number of bytes written (suitable for `msg_controllen`).
///
/// `buf` must be at least `control_buffer_len()` bytes; panics otherwise,
/// since a short control buffer here is always a caller bug, not a runtime
/// condition.
pub fn encode_pktinfo(buf: &mut [u8], addr: &PktInfo) -> usize {
    assert!(buf.len() >= control_buffer_len(), "control buffer too small");

    match *addr {
        PktInfo::V4 {
            addr,
            interface_index,
        } => {
            let payload_len = mem::size_of::<libc::in_pktinfo>();
            let cmsg_len = unsafe { libc::CMSG_LEN(payload_len as u32) } as usize;
            write_cmsg_header(buf, libc::IPPROTO_IP, libc::IP_PKTINFO, cmsg_len);

            let info = libc::in_pktinfo {
                ipi_ifindex: interface_index as _,
                ipi_spec_dst: libc::in_addr { s_addr: 0 },
                ipi_addr: libc::in_addr {
                    s_addr: u32::from(addr).to_be(),
                },
            };
            write_cmsg_payload(buf, &RawInPktInfo(info));
            unsafe { libc::CMSG_SPACE(payload_len as u32) as usize }
        }
        PktInfo::V6 {
            addr,
            interface_index,
        } => {
            let payload_len = mem::size_of::<libc::in6_pktinfo>();
            let cmsg_len = unsafe { libc::CMSG_LEN(payload_len as u32) } as usize;
            write_cmsg_header(buf, libc::IPPROTO_IPV6, libc::IPV6_PKTINFO, cmsg_len);

            let info = libc::in6_pktinfo {
                ipi6_addr: libc::in6_addr {
                    s6_addr: addr.octets(),
                },
                ipi6_ifindex: interface_index as _,
            };
            write_cmsg_payload(buf, &RawIn6PktInfo(info));
            unsafe { libc::CMSG_SPACE(payload_len as u32) as usize }
        }
    }
}

fn write_cmsg_header(buf: &mut [u8], level: libc::c_int, ty: libc::c_int, cmsg_len: usize) {
    let hdr = CmsgHdr(libc::cmsghdr {
        cmsg_len: cmsg_len as _,
        cmsg_level: level,
        cmsg_type: ty,
    });
    let bytes = bytemuck::bytes_of(&hdr);
    buf[..bytes.len()].copy_from_slice(bytes);
}

fn write_cmsg_payload<T: Pod>(buf: &mut [u8], payload: &T) {
    let offset = unsafe { libc::CMSG_LEN(0) as usize };
    let bytes = bytemuck::bytes_of(payload);
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_buffer_fits_both_families() {
        let len = control_buffer_len();
        assert!(len >= mem::size_of::<libc::in_pktinfo>());
        assert!(len >= mem::size_of::<libc::in6_pktinfo>());
    }

    #[test]
    fn encodes_v4_pktinfo_with_correct_level_and_type() {
        let mut buf = vec![0u8; control_buffer_len()];
        let written = encode_pktinfo(
            &mut buf,
            &PktInfo::V4 {
                addr: Ipv4Addr::new(192, 168, 1, 1),
                interface_index: 3,
            },
        );
        assert!(written > 0);
        let hdr = unsafe { (buf.as_ptr() as *const libc::cmsghdr).read_unaligned() };
        assert_eq!(hdr.cmsg_level, libc::IPPROTO_IP);
        assert_eq!(hdr.cmsg_type, libc::IP_PKTINFO);
    }

    #[test]
    fn encodes_v6_pktinfo_with_correct_level_and_type() {
        let mut buf = vec![0u8; control_buffer_len()];
        let written = encode_pktinfo(
            &mut buf,
            &PktInfo::V6 {
                addr: Ipv6Addr::LOCALHOST,
                interface_index: 1,
            },
        );
        assert!(written > 0);
        let hdr = unsafe { (buf.as_ptr() as *const libc::cmsghdr).read_unaligned() };
        assert_eq!(hdr.cmsg_level, libc::IPPROTO_IPV6);
        assert_eq!(hdr.cmsg_type, libc::IPV6_PKTINFO);
    }

    #[test]
    fn decode_recovers_what_encode_wrote_for_v4() {
        // Build a minimal msghdr around our own control buffer to exercise
        // decode_pktinfo with the exact bytes encode_pktinfo produced.
        let mut control = vec![0u8; control_buffer_len()];
        let written = encode_pktinfo(
            &mut control,
            &PktInfo::V4 {
                addr: Ipv4Addr::new(10, 0, 0, 5),
                interface_index: 2,
            },
        );

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_control = control.as_mut_ptr() as *mut _;
        msg.msg_controllen = written as _;

        let decoded = unsafe { decode_pktinfo(&msg) }.expect("pktinfo present");
        match decoded {
            PktInfo::V4 {
                addr,
                interface_index,
            } => {
                assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 5));
                assert_eq!(interface_index, 2);
            }
            PktInfo::V6 { .. } => panic!("expected v4"),
        }
    }
}
