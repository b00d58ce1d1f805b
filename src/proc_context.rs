//! Per-core event queue, worker thread, and send/recv-context pools.
//!
//! One `ProcContext` exists per logical core the datapath was initialized
//! with. Its worker blocks on `mio::Poll` (kqueue on Darwin/BSD, epoll on
//! Linux, used here purely to let the crate build and test off-Darwin) and
//! dispatches readiness events to the `SocketContext` registered under each
//! `mio::Token`. Each registration carries its own receive callback, already
//! bound to the `Binding` it belongs to — `ProcContext` itself has no idea
//! what a `Binding` is, which keeps the event loop reusable independent of
//! binding lifecycle.

use crate::addr::Addr;
use crate::affinity;
use crate::pool::Pool;
use crate::recv::RecvBlock;
use crate::send::{new_send_buffer_pool, new_send_context_pool, SendBuffer, SendContext};
use crate::socket_context::SocketContext;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Invoked with the proc index and the completed receive, once per
/// delivered datagram, on the worker thread.
pub type RecvHandler = Arc<dyn Fn(usize, Box<RecvBlock>) + Send + Sync>;

/// Invoked with the proc index and the connected peer's address when a
/// socket observes `ECONNREFUSED` (§4.10).
pub type UnreachableHandler = Arc<dyn Fn(usize, Addr) + Send + Sync>;

struct Registration {
    socket: Arc<SocketContext>,
    on_recv: RecvHandler,
    on_unreachable: UnreachableHandler,
}

pub struct ProcContext {
    pub index: usize,
    poll: Mutex<Poll>,
    pub send_buffer_pool: Arc<Pool<SendBuffer>>,
    pub send_context_pool: Arc<Pool<Box<SendContext>>>,
    sockets: RwLock<HashMap<Token, Registration>>,
    next_token: AtomicUsize,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    poll_timeout: Duration,
}

impl ProcContext {
    pub fn new(index: usize, poll_timeout: Duration) -> io::Result<Self> {
        Ok(Self {
            index,
            poll: Mutex::new(Poll::new()?),
            send_buffer_pool: new_send_buffer_pool(4),
            send_context_pool: new_send_context_pool(4),
            sockets: RwLock::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
            worker: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            poll_timeout,
        })
    }

    /// Registers a socket for read-readiness and returns the token it was
    /// assigned along with a shared handle to it (used for sends).
    ///
    /// Registration goes through `SourceFd` on the raw descriptor rather
    /// than `mio`'s owned-source API: the socket is about to be shared
    /// between this map, the owning `Binding`, and transient worker-thread
    /// clones, so no single owner can ever hand back the `&mut impl Source`
    /// `register`/`reregister`/`deregister` would otherwise want — the fd
    /// itself is a stable, `Copy`-able handle that doesn't have that problem.
    pub fn register(
        &self,
        socket_ctx: SocketContext,
        on_recv: RecvHandler,
        on_unreachable: UnreachableHandler,
    ) -> io::Result<(Token, Arc<SocketContext>)> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        let raw_fd = socket_ctx.as_raw_fd();
        self.poll
            .lock()
            .unwrap()
            .registry()
            .register(&mut SourceFd(&raw_fd), token, Interest::READABLE)?;
        let socket = Arc::new(socket_ctx);
        self.sockets.write().unwrap().insert(
            token,
            Registration {
                socket: socket.clone(),
                on_recv,
                on_unreachable,
            },
        );
        Ok((token, socket))
    }

    pub fn deregister(&self, token: Token) -> io::Result<()> {
        if let Some(reg) = self.sockets.write().unwrap().remove(&token) {
            let raw_fd = reg.socket.as_raw_fd();
            self.poll.lock().unwrap().registry().deregister(&mut SourceFd(&raw_fd))?;
        }
        Ok(())
    }

    fn arm_writable(&self, token: Token) {
        let sockets = self.sockets.read().unwrap();
        if let Some(reg) = sockets.get(&token) {
            if reg.socket.write_interest_armed() {
                return;
            }
            reg.socket.set_write_interest_armed(true);
            let raw_fd = reg.socket.as_raw_fd();
            debug!(proc_index = self.index, token = token.0, "arming writable interest");
            if let Err(e) = self.poll.lock().unwrap().registry().reregister(
                &mut SourceFd(&raw_fd),
                token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                warn!(proc_index = self.index, token = token.0, error = %e, "failed to arm writable interest");
            }
        }
    }

    /// Spawns the worker thread, pinning it to this proc's core index on
    /// platforms where that is supported.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();

        let handle = std::thread::Builder::new()
            .name(format!("quic-datapath-proc-{}", this.index))
            .spawn(move || {
                let _ = affinity::pin_to_cpu(this.index);
                let mut events = Events::with_capacity(256);
                while !this.shutdown.load(Ordering::Acquire) {
                    let poll_result = this.poll.lock().unwrap().poll(&mut events, Some(this.poll_timeout));
                    match poll_result {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        // A spurious kevent/epoll return is not a fatal queue
                        // error: keep looping rather than tearing the worker
                        // down.
                        Err(_) => continue,
                    }

                    for event in events.iter() {
                        let token = event.token();
                        let (socket, on_recv, on_unreachable) = {
                            let sockets = this.sockets.read().unwrap();
                            match sockets.get(&token) {
                                Some(reg) => {
                                    (reg.socket.clone(), reg.on_recv.clone(), reg.on_unreachable.clone())
                                }
                                None => continue,
                            }
                        };

                        if event.is_readable() {
                            let index = this.index;
                            if let Err(e) =
                                socket.drain_readable(|block| on_recv(index, block), |addr| on_unreachable(index, addr))
                            {
                                warn!(proc_index = index, error = %e, "worker drain failed");
                            }
                        }
                        if event.is_writable() {
                            socket.drain_pending(&this.send_buffer_pool);
                        }
                    }
                }
            })
            .expect("failed to spawn datapath worker thread");

        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Called by the send path after parking a `SendContext` on a socket's
    /// pending list, to ask this proc's worker to notify it on
    /// write-readiness.
    pub fn request_write_interest(&self, token: Token) {
        self.arm_writable(token);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Addr;
    use crate::config::DatapathConfig;
    use crate::send::SendContext;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    #[test]
    fn worker_delivers_a_datagram_sent_to_a_registered_socket() {
        let proc_ctx = Arc::new(ProcContext::new(0, Duration::from_millis(5)).unwrap());

        let mut recv_local = Addr::new_v4(Ipv4Addr::LOCALHOST, 0, 0);
        let socket_ctx = SocketContext::new(&mut recv_local, None, 0, 0, 2, &DatapathConfig::default()).unwrap();

        let received = Arc::new(StdAtomicUsize::new(0));
        let received_clone = received.clone();
        let (_token, _registered) = proc_ctx
            .register(
                socket_ctx,
                Arc::new(move |_idx, block| {
                    assert_eq!(&block.buffer[..block.buffer_length], b"ping");
                    received_clone.fetch_add(1, Ordering::SeqCst);
                }),
                Arc::new(|_idx, _addr| panic!("unexpected unreachable signal")),
            )
            .unwrap();

        proc_ctx.start();

        let mut send_local = Addr::new_v4(Ipv4Addr::LOCALHOST, 0, 0);
        let sender = SocketContext::new(&mut send_local, Some(recv_local), 0, 0, 2, &DatapathConfig::default()).unwrap();
        let pool = proc_ctx.send_buffer_pool.clone();
        let mut ctx = Box::new(SendContext::new(recv_local, None));
        ctx.alloc_datagram(&pool, 4).unwrap().copy_from_slice(b"ping");
        sender.send(ctx, None, &pool).unwrap();

        for _ in 0..200 {
            if received.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(received.load(Ordering::SeqCst), 1);

        proc_ctx.shutdown();
    }
}
