//! Low-level socket option helpers underneath [`crate::config::DatapathConfig`].
//!
//! This module provides the platform-specific `setsockopt` calls the config
//! layer needs to tune buffer sizes, TOS/traffic-class marking, and busy
//! polling on a freshly created socket before it is bound. It handles the
//! difference between Unix-like systems (the datapath's actual Darwin/BSD
//! target, plus Linux for test portability) and Windows.
//!
//! # Safety
//!
//! This module contains `unsafe` code for raw `setsockopt` system calls. All
//! `unsafe` operations are encapsulated within safe interfaces.

use std::io;

/// IP protocol domain for sockets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Domain {
    /// IPv4 protocol
    Ipv4,
    /// IPv6 protocol
    Ipv6,
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::RawFd;
        pub type OsSocket = RawFd;

        /// Set socket receive buffer size
        pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_RCVBUF, sz) }
        /// Set socket send buffer size
        pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_SNDBUF, sz) }
        /// Set IPv4 Type of Service for low-latency routing
        pub fn set_tos_v4(os: OsSocket, tos: i32) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IP, libc::IP_TOS, tos) }
        /// Set IPv6 Traffic Class for low-latency routing
        pub fn set_tos_v6(os: OsSocket, tc: i32) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IPV6, libc::IPV6_TCLASS, tc) }
        /// Enable busy polling for minimal latency (Linux only; the caller gates this by `cfg`)
        #[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
        pub fn set_busy_poll(os: OsSocket, usec: u32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, 46, usec as i32) }

        fn setsockopt_int(fd: RawFd, level: i32, opt: i32, val: i32) -> io::Result<()> {
            let v = val as libc::c_int;
            let rc = unsafe { libc::setsockopt(fd, level, opt, &v as *const _ as _, std::mem::size_of::<libc::c_int>() as _) };
            if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }
    } else {
        // Windows
        use windows_sys::Win32::Networking::WinSock::*;
        use std::os::windows::io::RawSocket;
        /// Windows socket handle type
        pub type OsSocket = RawSocket;

        fn setsockopt_int(socket: OsSocket, level: i32, opt: i32, val: i32) -> io::Result<()> {
            unsafe {
                let rc = setsockopt(socket as usize, level, opt, &val as *const _ as _, std::mem::size_of::<i32>() as _);
                if rc != 0 { Err(io::Error::from_raw_os_error(WSAGetLastError())) } else { Ok(()) }
            }
        }
        /// Set socket receive buffer size
        pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, SOL_SOCKET as _, SO_RCVBUF as _, sz) }
        /// Set socket send buffer size
        pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, SOL_SOCKET as _, SO_SNDBUF as _, sz) }
        /// Set IPv4 Type of Service for low-latency routing
        pub fn set_tos_v4(os: OsSocket, tos: i32) -> io::Result<()> { setsockopt_int(os, IPPROTO_IP as _, IP_TOS as _, tos) }
        /// Set IPv6 Traffic Class for low-latency routing
        pub fn set_tos_v6(os: OsSocket, tc: i32) -> io::Result<()> { setsockopt_int(os, IPPROTO_IPV6 as _, IPV6_TCLASS as _, tc) }
        /// Enable busy polling for minimal latency (no-op on Windows)
        pub fn set_busy_poll(_os: OsSocket, _usec: u32) -> io::Result<()> { Ok(()) /* not applicable */ }
    }
}
