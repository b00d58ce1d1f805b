//! `SocketContext`: one UDP socket, its current receive block, and its
//! pending-send queue.
//!
//! This is where the PKTINFO machinery from [`crate::cmsg`] meets the
//! actual `recvmsg`/`sendmsg`/`sendto` syscalls. Socket creation and the
//! generic buffer-size/reuse-address knobs go through `socket2`; the
//! PKTINFO-related socket options and every per-datagram syscall are raw
//! `libc` since `socket2` has no cmsg support.

use crate::addr::{Addr, Tuple};
use crate::cmsg::{self, PktInfo};
use crate::config::DatapathConfig;
use crate::error::{DatapathError, Result};
use crate::pool::Pool;
use crate::recv::{new_recv_pool, RecvBlock};
use crate::send::{SendBuffer, SendContext};
use crossbeam_queue::SegQueue;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};

/// One UDP socket plus the receive/send state layered on top of it.
pub struct SocketContext {
    socket: mio::net::UdpSocket,
    /// Set once at construction if the caller supplied a remote address —
    /// a connected socket's sends must omit the destination.
    connected_remote: Option<Addr>,
    local_port: u16,
    /// The owning `ProcContext`'s index, stamped onto every `RecvBlock` this
    /// socket produces (the spec's `PartitionIndex`) so the upper layer can
    /// route a reply back to the same core without re-running partitioning.
    proc_index: usize,
    recv_pool: Arc<Pool<Box<RecvBlock>>>,
    current_recv: Mutex<Option<Box<RecvBlock>>>,
    pending_sends: SegQueue<Box<SendContext>>,
    /// True once a one-shot writable interest has been registered and not
    /// yet observed; avoids re-registering on every pending send.
    write_interest_armed: AtomicBool,
}

impl SocketContext {
    /// Creates and binds a socket for `local`, optionally connecting it to
    /// `remote`. On return, `local`'s port has been updated in place to
    /// whatever the kernel actually bound (relevant when the caller asked
    /// for an ephemeral port).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: &mut Addr,
        remote: Option<Addr>,
        proc_index: usize,
        client_context_len: usize,
        recv_pool_size: usize,
        config: &DatapathConfig,
    ) -> Result<Self> {
        let domain = if local.is_v4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        let fd = socket.as_raw_fd();
        match domain {
            socket2::Domain::IPV4 => enable_v4_pktinfo(fd)?,
            socket2::Domain::IPV6 => enable_v6_pktinfo(fd)?,
            _ => unreachable!(),
        }

        let raw_domain = if local.is_v4() {
            crate::raw::Domain::Ipv4
        } else {
            crate::raw::Domain::Ipv6
        };
        config.apply_to_socket(fd, raw_domain)?;

        socket.bind(&local.to_socket_addr().into())?;

        if let Some(remote_addr) = remote {
            socket.connect(&remote_addr.to_socket_addr().into())?;
        }

        let bound: SocketAddr = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("bound socket has no local address"))?;
        *local = local.with_port(bound.port());

        let std_socket: std::net::UdpSocket = socket.into();
        let mio_socket = mio::net::UdpSocket::from_std(std_socket);

        Ok(Self {
            socket: mio_socket,
            connected_remote: remote,
            local_port: bound.port(),
            proc_index,
            recv_pool: new_recv_pool(recv_pool_size, client_context_len),
            current_recv: Mutex::new(None),
            pending_sends: SegQueue::new(),
            write_interest_armed: AtomicBool::new(false),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn has_pending_sends(&self) -> bool {
        !self.pending_sends.is_empty()
    }

    pub fn write_interest_armed(&self) -> bool {
        self.write_interest_armed.load(Ordering::Acquire)
    }

    pub fn set_write_interest_armed(&self, armed: bool) {
        self.write_interest_armed.store(armed, Ordering::Release);
    }

    /// Drains every datagram currently queued on the socket, invoking
    /// `deliver` once per datagram with the completed `RecvBlock`. Stops at
    /// the first `EWOULDBLOCK`, per the edge-triggered readiness contract.
    /// `on_unreachable` fires instead of `deliver` when the kernel reports
    /// `ECONNREFUSED` on a connected socket (see §4.10: the BSD signal for a
    /// prior ICMP port-unreachable) with this socket's connected peer.
    pub fn drain_readable(
        &self,
        mut deliver: impl FnMut(Box<RecvBlock>),
        mut on_unreachable: impl FnMut(Addr),
    ) -> Result<()> {
        loop {
            let mut guard = self.current_recv.lock().unwrap();
            if guard.is_none() {
                *guard = Some(self.recv_pool.alloc());
            }
            let mut block = guard.take().unwrap();
            drop(guard);

            match self.recv_once(&mut block) {
                Ok(Some(bytes)) => {
                    block.buffer_length = bytes;
                    deliver(block);
                }
                Ok(None) => {
                    *self.current_recv.lock().unwrap() = Some(block);
                    return Ok(());
                }
                Err(DatapathError::Io(e))
                    if e.raw_os_error() == Some(libc::ECONNREFUSED) && self.connected_remote.is_some() =>
                {
                    *self.current_recv.lock().unwrap() = Some(block);
                    on_unreachable(self.connected_remote.unwrap());
                    return Ok(());
                }
                Err(e) => {
                    *self.current_recv.lock().unwrap() = Some(block);
                    warn!(
                        proc_index = self.proc_index,
                        local_port = self.local_port,
                        error = %e,
                        "recvmsg failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    fn recv_once(&self, block: &mut RecvBlock) -> Result<Option<usize>> {
        let mut control = [0u8; 256];
        debug_assert!(control.len() >= cmsg::control_buffer_len());

        let mut remote_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: block.buffer.as_mut_ptr() as *mut libc::c_void,
            iov_len: block.buffer.len() as _,
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut remote_storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as _;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let n = unsafe { libc::recvmsg(self.as_raw_fd(), &mut msg, 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }

        let pktinfo = unsafe { cmsg::decode_pktinfo(&msg) }
            .ok_or(DatapathError::Internal("recvmsg returned no PKTINFO"))?;
        let local = match pktinfo {
            PktInfo::V4 {
                addr,
                interface_index,
            } => Addr::new_v4(addr, self.local_port, interface_index),
            PktInfo::V6 {
                addr,
                interface_index,
            } => Addr::new_v6(addr, self.local_port, interface_index),
        };
        let remote = sockaddr_storage_to_addr(&remote_storage)?;

        block.tuple = Tuple { local, remote };
        block.partition_index = self.proc_index;
        trace!(proc_index = self.proc_index, bytes = n, remote = ?remote, "received datagram");
        Ok(Some(n as usize))
    }

    /// Sends every not-yet-sent buffer in `ctx` starting at `current_index`.
    /// `local` selects the `sendmsg`+`PKTINFO` path; `None` uses a plain
    /// `sendto`/`send` (the connected-socket path).
    pub fn send(
        &self,
        mut ctx: Box<SendContext>,
        local: Option<Addr>,
        send_buffer_pool: &Pool<SendBuffer>,
    ) -> Result<()> {
        while ctx.current_index < ctx.buffers.len() {
            let buf = &ctx.buffers[ctx.current_index];
            let result = match local {
                Some(local_addr) => self.send_msg_with_pktinfo(&buf.data[..buf.len], local_addr, ctx.remote),
                None => self.send_to_raw(&buf.data[..buf.len], ctx.remote),
            };

            match result {
                Ok(()) => ctx.current_index += 1,
                Err(e) if e.is_would_block() => {
                    ctx.pending = true;
                    self.pending_sends.push(ctx);
                    return Err(DatapathError::Pending);
                }
                Err(e) => {
                    ctx.release_buffers(send_buffer_pool);
                    return Err(e);
                }
            }
        }
        ctx.release_buffers(send_buffer_pool);
        Ok(())
    }

    /// Sends `buf` without `PKTINFO`: `sendto` with `remote` as destination
    /// on an unconnected socket, or a plain `send` on one already connected
    /// to that peer (and to no other — `connect`ed UDP sockets reject a
    /// `sendto` destination that doesn't match).
    fn send_to_raw(&self, buf: &[u8], remote: Addr) -> Result<()> {
        let n = if self.connected_remote.is_some() {
            unsafe { libc::send(self.as_raw_fd(), buf.as_ptr() as *const _, buf.len(), 0) }
        } else {
            let dest_storage = addr_to_sockaddr_storage(remote);
            let dest_len = match remote {
                Addr::V4 { .. } => std::mem::size_of::<libc::sockaddr_in>(),
                Addr::V6 { .. } => std::mem::size_of::<libc::sockaddr_in6>(),
            };
            unsafe {
                libc::sendto(
                    self.as_raw_fd(),
                    buf.as_ptr() as *const _,
                    buf.len(),
                    0,
                    &dest_storage as *const _ as *const libc::sockaddr,
                    dest_len as libc::socklen_t,
                )
            }
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!(proc_index = self.proc_index, remote = ?remote, error = %err, "sendto/send failed");
            }
            return Err(crate::error::from_send_errno(err));
        }
        Ok(())
    }

    fn send_msg_with_pktinfo(&self, buf: &[u8], local: Addr, remote: Addr) -> Result<()> {
        let pktinfo = match local {
            Addr::V4 {
                ip,
                interface_index,
                ..
            } => PktInfo::V4 {
                addr: ip,
                interface_index,
            },
            Addr::V6 {
                ip,
                interface_index,
                ..
            } => PktInfo::V6 {
                addr: ip,
                interface_index,
            },
        };

        let mut control = [0u8; 256];
        let control_len = cmsg::encode_pktinfo(&mut control, &pktinfo);

        let mut dest_storage = addr_to_sockaddr_storage(remote);
        let dest_len = match remote {
            Addr::V4 { .. } => std::mem::size_of::<libc::sockaddr_in>(),
            Addr::V6 { .. } => std::mem::size_of::<libc::sockaddr_in6>(),
        };

        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len() as _,
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut dest_storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = dest_len as _;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control_len as _;

        let n = unsafe { libc::sendmsg(self.as_raw_fd(), &msg, 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!(proc_index = self.proc_index, remote = ?remote, error = %err, "sendmsg failed");
            }
            return Err(crate::error::from_send_errno(err));
        }
        Ok(())
    }

    /// Resumes every send parked on the pending list, stopping (and
    /// re-arming write interest) the moment one reports `Pending` again.
    pub fn drain_pending(&self, send_buffer_pool: &Pool<SendBuffer>) {
        while let Some(ctx) = self.pending_sends.pop() {
            let local = ctx.local;
            if let Err(DatapathError::Pending) = self.send(ctx, local, send_buffer_pool) {
                return;
            }
        }
        self.set_write_interest_armed(false);
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn enable_v4_pktinfo(fd: RawFd) -> io::Result<()> {
    setsockopt_bool(fd, libc::IPPROTO_IP, libc::IP_RECVDSTADDR, true)?;
    setsockopt_bool(fd, libc::IPPROTO_IP, libc::IP_RECVIF, true)?;
    setsockopt_bool(fd, libc::IPPROTO_IP, libc::IP_PKTINFO, true)
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn enable_v4_pktinfo(fd: RawFd) -> io::Result<()> {
    setsockopt_bool(fd, libc::IPPROTO_IP, libc::IP_PKTINFO, true)
}

fn enable_v6_pktinfo(fd: RawFd) -> io::Result<()> {
    setsockopt_bool(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, true)?;
    setsockopt_bool(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, false)
}

fn setsockopt_bool(fd: RawFd, level: libc::c_int, name: libc::c_int, value: bool) -> io::Result<()> {
    let v: libc::c_int = value as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &v as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_storage_to_addr(storage: &libc::sockaddr_storage) -> Result<Addr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            let port = u16::from_be(sin.sin_port);
            Ok(Addr::new_v4(ip, port, 0))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(Addr::new_v6(ip, port, sin6.sin6_scope_id))
        }
        _ => Err(DatapathError::Internal("recvmsg returned unknown address family")),
    }
}

fn addr_to_sockaddr_storage(addr: Addr) -> libc::sockaddr_storage {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        Addr::V4 { ip, port, .. } => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as _,
                sin_port: port.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(ip).to_be(),
                },
                sin_zero: [0; 8],
                #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
                sin_len: std::mem::size_of::<libc::sockaddr_in>() as u8,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
        }
        Addr::V6 {
            ip,
            port,
            interface_index,
        } => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as _,
                sin6_port: port.to_be(),
                sin6_flowinfo: 0,
                sin6_addr: libc::in6_addr { s6_addr: ip.octets() },
                sin6_scope_id: interface_index,
                #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
                sin6_len: std::mem::size_of::<libc::sockaddr_in6>() as u8,
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
        }
    }
    storage
}

/// Resolves a host:port pair the way the datapath's `ResolveAddress`
/// operation is specified to: numeric first, falling back to the system
/// resolver, never blocking indefinitely.
pub fn resolve_address(host: &str, port: u16) -> Result<Addr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(Addr::from_socket_addr(SocketAddr::new(ip, port)));
    }
    use std::net::ToSocketAddrs;
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| DatapathError::DnsResolutionError(host.to_string()))?;
    addrs
        .next()
        .map(Addr::from_socket_addr)
        .ok_or_else(|| DatapathError::DnsResolutionError(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send::new_send_buffer_pool;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    fn loopback(port: u16) -> Addr {
        Addr::new_v4(Ipv4Addr::LOCALHOST, port, 0)
    }

    #[test]
    fn bind_assigns_an_ephemeral_port() {
        let mut local = loopback(0);
        let ctx = SocketContext::new(&mut local, None, 0, 0, 2, &DatapathConfig::default()).unwrap();
        assert_ne!(local.port(), 0);
        assert_eq!(ctx.local_port, local.port());
    }

    #[test]
    fn recv_blocks_are_stamped_with_the_owning_procs_index() {
        let mut recv_local = loopback(0);
        let receiver = SocketContext::new(&mut recv_local, None, 3, 0, 2, &DatapathConfig::default()).unwrap();

        let mut send_local = loopback(0);
        let sender = SocketContext::new(&mut send_local, Some(recv_local), 0, 0, 2, &DatapathConfig::default()).unwrap();

        let send_pool = new_send_buffer_pool(1);
        let mut ctx = Box::new(SendContext::new(recv_local, None));
        ctx.alloc_datagram(&send_pool, 4).unwrap().copy_from_slice(b"ping");
        sender.send(ctx, None, &send_pool).unwrap();

        let mut stamped = None;
        for _ in 0..200 {
            receiver
                .drain_readable(
                    |block| stamped = Some(block.partition_index),
                    |_addr| panic!("unexpected unreachable signal"),
                )
                .unwrap();
            if stamped.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(stamped, Some(3));
    }

    #[test]
    fn resolve_address_accepts_numeric_ip_without_touching_the_resolver() {
        let addr = resolve_address("127.0.0.1", 443).unwrap();
        assert_eq!(addr.to_socket_addr(), "127.0.0.1:443".parse().unwrap());
    }

    #[test]
    fn send_to_and_recv_round_trip_over_loopback_with_pktinfo() {
        let mut recv_local = loopback(0);
        let receiver = SocketContext::new(&mut recv_local, None, 0, 0, 2, &DatapathConfig::default()).unwrap();

        let mut send_local = loopback(0);
        let sender = SocketContext::new(&mut send_local, Some(recv_local), 0, 0, 2, &DatapathConfig::default()).unwrap();

        let send_pool = new_send_buffer_pool(1);
        let mut ctx = Box::new(SendContext::new(recv_local, None));
        {
            let slot = ctx.alloc_datagram(&send_pool, 5).unwrap();
            slot.copy_from_slice(b"hello");
        }
        sender.send(ctx, None, &send_pool).unwrap();

        // Poll for the datagram to land; loopback delivery is effectively
        // immediate but not synchronous with the send() call returning.
        let got = StdAtomicBool::new(false);
        for _ in 0..200 {
            let mut delivered = false;
            receiver
                .drain_readable(
                    |block| {
                        assert_eq!(&block.buffer[..block.buffer_length], b"hello");
                        assert_eq!(block.tuple.local.port(), recv_local.port());
                        delivered = true;
                    },
                    |_addr| panic!("unexpected unreachable signal"),
                )
                .unwrap();
            if delivered {
                got.store(true, Ordering::SeqCst);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(got.load(Ordering::SeqCst), "datagram never arrived");
    }
}
