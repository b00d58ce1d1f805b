//! `Binding`: a logical UDP endpoint, fanned out to one `SocketContext` per
//! core.

use crate::addr::{Addr, Tuple};
use crate::error::{DatapathError, Result};
use crate::partitioner::Partitioner;
use crate::proc_context::ProcContext;
use crate::recv::{RecvBlock, QUIC_MAX_MTU};
use crate::rundown::Rundown;
use crate::send::SendContext;
use crate::socket_context::SocketContext;
use mio::Token;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

struct BindingSocket {
    token: Token,
    proc_index: usize,
    socket: Arc<SocketContext>,
}

/// A single UDP endpoint. `C` is the opaque per-binding context the upper
/// layer gets back on every receive/unreachable callback.
pub struct Binding<C> {
    proc_contexts: Vec<Arc<ProcContext>>,
    partitioner: Arc<dyn Partitioner>,
    pub client_context: C,
    local: std::sync::Mutex<Addr>,
    remote: Option<Addr>,
    mtu: AtomicUsize,
    connected: bool,
    shutdown: AtomicBool,
    /// Tracks outstanding recv/unreachable callbacks for this specific
    /// binding; `delete` waits on this before the caller's `BindingDelete`
    /// is allowed to return, so no callback can still be running (or start)
    /// against a binding the caller believes is gone.
    rundown: Rundown,
    /// Filled in after construction (see `create`): one entry per proc
    /// context, in the same order as `proc_contexts`. `RwLock` rather than
    /// plain `Vec` only because it must be written to once, post-`Arc`, by
    /// `create` — every other access is read-only for the binding's life.
    sockets: RwLock<Vec<BindingSocket>>,
    /// Invoked once, from `delete`, so the owning `Datapath` can release the
    /// `bindings_rundown` reference it acquired in `create_binding`.
    on_delete: Box<dyn Fn() + Send + Sync>,
}

impl<C> Binding<C>
where
    C: Send + Sync + 'static,
{
    /// Creates a binding with one socket per proc context, registering each
    /// with its proc's event loop and wiring `on_recv` to fire only while
    /// the binding is still alive and not shut down.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        proc_contexts: Vec<Arc<ProcContext>>,
        partitioner: Arc<dyn Partitioner>,
        mut local: Addr,
        remote: Option<Addr>,
        client_context: C,
        client_context_tail_len: usize,
        recv_pool_size_per_proc: usize,
        config: &crate::config::DatapathConfig,
        on_recv: impl Fn(&Binding<C>, Box<RecvBlock>) + Send + Sync + 'static,
        on_unreachable: impl Fn(&Binding<C>, Addr) + Send + Sync + 'static,
        on_delete: impl Fn() + Send + Sync + 'static,
    ) -> Result<Arc<Binding<C>>> {
        let binding = Arc::new(Binding {
            proc_contexts: proc_contexts.clone(),
            partitioner,
            client_context,
            local: std::sync::Mutex::new(local),
            remote,
            mtu: AtomicUsize::new(QUIC_MAX_MTU),
            connected: remote.is_some(),
            shutdown: AtomicBool::new(false),
            rundown: Rundown::new(),
            sockets: RwLock::new(Vec::new()),
            on_delete: Box::new(on_delete),
        });

        let on_recv = Arc::new(on_recv);
        let on_unreachable = Arc::new(on_unreachable);
        let mut registered = Vec::with_capacity(proc_contexts.len());
        for (proc_index, proc_ctx) in proc_contexts.iter().enumerate() {
            let mut socket_local = local;
            let socket_ctx = match SocketContext::new(
                &mut socket_local,
                remote,
                proc_index,
                client_context_tail_len,
                recv_pool_size_per_proc,
                config,
            ) {
                Ok(ctx) => ctx,
                Err(e) => {
                    rollback(&proc_contexts, &registered);
                    return Err(e);
                }
            };
            if proc_index == 0 {
                local = socket_local;
                *binding.local.lock().unwrap() = local;
            }

            let weak: Weak<Binding<C>> = Arc::downgrade(&binding);
            let on_recv = on_recv.clone();
            let handler: crate::proc_context::RecvHandler = Arc::new(move |_idx, block| {
                if let Some(binding) = weak.upgrade() {
                    if binding.rundown.acquire() {
                        on_recv(&binding, block);
                        binding.rundown.release();
                    }
                }
            });

            let weak_unreachable: Weak<Binding<C>> = Arc::downgrade(&binding);
            let on_unreachable = on_unreachable.clone();
            let unreachable_handler: crate::proc_context::UnreachableHandler =
                Arc::new(move |_idx, addr| {
                    if let Some(binding) = weak_unreachable.upgrade() {
                        if binding.rundown.acquire() {
                            on_unreachable(&binding, addr);
                            binding.rundown.release();
                        }
                    }
                });

            match proc_ctx.register(socket_ctx, handler, unreachable_handler) {
                Ok((token, socket)) => registered.push(BindingSocket {
                    token,
                    proc_index,
                    socket,
                }),
                Err(e) => {
                    rollback(&proc_contexts, &registered);
                    return Err(DatapathError::Io(e));
                }
            }
        }

        *binding.sockets.write().unwrap() = registered;
        Ok(binding)
    }

    pub fn local_address(&self) -> Addr {
        *self.local.lock().unwrap()
    }

    pub fn remote_address(&self) -> Option<Addr> {
        self.remote
    }

    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Relaxed)
    }

    pub fn set_mtu(&self, mtu: usize) {
        self.mtu.store(mtu, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn with_socket_for<T>(&self, tuple: &Tuple, f: impl FnOnce(&Arc<ProcContext>, Token, &Arc<SocketContext>) -> T) -> T {
        let sockets = self.sockets.read().unwrap();
        let count = sockets.len().max(1);
        let index = self.partitioner.select(tuple, count) % count;
        let entry = &sockets[index];
        f(&self.proc_contexts[entry.proc_index], entry.token, &entry.socket)
    }

    /// `Send`: connected-style send that lets the kernel pick the source
    /// address (no `PKTINFO`).
    pub fn send_to(&self, ctx: Box<SendContext>) -> Result<()> {
        let tuple = Tuple {
            local: self.local_address(),
            remote: ctx.remote,
        };
        self.with_socket_for(&tuple, |proc_ctx, token, socket| {
            match socket.send(ctx, None, &proc_ctx.send_buffer_pool) {
                Err(DatapathError::Pending) => {
                    proc_ctx.request_write_interest(token);
                    Err(DatapathError::Pending)
                }
                other => other,
            }
        })
    }

    /// `SendFromTo`: source-addressed send using `PKTINFO`.
    pub fn send_from_to(&self, local: Addr, ctx: Box<SendContext>) -> Result<()> {
        let tuple = Tuple {
            local,
            remote: ctx.remote,
        };
        self.with_socket_for(&tuple, |proc_ctx, token, socket| {
            match socket.send(ctx, Some(local), &proc_ctx.send_buffer_pool) {
                Err(DatapathError::Pending) => {
                    proc_ctx.request_write_interest(token);
                    Err(DatapathError::Pending)
                }
                other => other,
            }
        })
    }

    /// Marks the binding as shut down, waits for every outstanding
    /// recv callback on it to return (and refuses new ones from starting),
    /// then deregisters each of its sockets.
    pub fn delete(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.rundown.release_and_wait();
        for entry in self.sockets.read().unwrap().iter() {
            let _ = self.proc_contexts[entry.proc_index].deregister(entry.token);
        }
        (self.on_delete)();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// `AllocSendContext`: draws a `SendContext` from this binding's pool,
    /// pre-addressed to `remote`. `max_packet` is accepted for interface
    /// fidelity with the distilled API but is informational only here — the
    /// pool hands back a fixed-capacity buffer set sized to
    /// [`crate::recv::QUIC_MAX_MTU`] regardless, and `alloc_send_datagram`
    /// enforces the real per-datagram cap.
    pub fn alloc_send_context(&self, remote: Addr, local: Option<Addr>, max_packet: usize) -> Box<SendContext> {
        let _ = max_packet;
        let mut ctx = self.proc_contexts[0].send_context_pool.alloc();
        ctx.remote = remote;
        ctx.local = local;
        ctx.current_index = 0;
        ctx.pending = false;
        ctx
    }

    /// `FreeSendContext`: returns an unsent (or already-drained) context and
    /// its buffers to the pool, for a caller that decided not to send it.
    pub fn free_send_context(&self, mut ctx: Box<SendContext>) {
        ctx.release_buffers(&self.proc_contexts[0].send_buffer_pool);
        self.proc_contexts[0].send_context_pool.free(ctx);
    }

    /// `AllocSendDatagram`: appends one datagram slot of `max_len` bytes to
    /// `ctx`, refusing past [`crate::send::MAX_SEND_BATCH_SIZE`].
    pub fn alloc_send_datagram<'a>(&self, ctx: &'a mut SendContext, max_len: usize) -> Option<&'a mut [u8]> {
        ctx.alloc_datagram(&self.proc_contexts[0].send_buffer_pool, max_len)
    }

    /// `FreeSendDatagram`: drops the most recently allocated, not-yet-sent
    /// datagram back to the pool.
    pub fn free_send_datagram(&self, ctx: &mut SendContext) {
        if let Some(buf) = ctx.buffers.pop() {
            self.proc_contexts[0].send_buffer_pool.free(buf);
        }
    }

    /// `IsSendContextFull`: true iff `ctx` already holds
    /// [`crate::send::MAX_SEND_BATCH_SIZE`] datagrams.
    pub fn is_send_context_full(&self, ctx: &SendContext) -> bool {
        ctx.is_full()
    }
}

fn rollback(proc_contexts: &[Arc<ProcContext>], sockets: &[BindingSocket]) {
    for entry in sockets {
        let _ = proc_contexts[entry.proc_index].deregister(entry.token);
    }
}
