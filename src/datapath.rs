//! `Datapath`: the root handle owning every `ProcContext` and tracking every
//! live `Binding`.
//!
//! A caller creates exactly one `Datapath`, then creates/destroys `Binding`s
//! against it for the lifetime of the process. `Datapath::new` sizes
//! `ProcCount` from [`affinity::get_cpu_count`] and spins up one worker per
//! core; `Datapath::drop` drains the bindings rundown, signals every worker
//! to stop, and joins them.

use crate::addr::Addr;
use crate::affinity;
use crate::binding::Binding;
use crate::config::DatapathConfig;
use crate::error::{DatapathError, Result};
use crate::partitioner::{FixedPartitioner, Partitioner};
use crate::proc_context::ProcContext;
use crate::recv::RecvBlock;
use crate::rundown::Rundown;
use crate::socket_context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bitmask returned by [`Datapath::supported_features`]. This core never
/// sets any bit: no GSO/URO, no RSS.
pub const FEATURE_NONE: u32 = 0;

/// Invoked once per completed receive, on the `ProcContext` worker thread
/// that owns the socket the datagram arrived on. `binding` is the same
/// handle the caller got back from `Binding::create`.
pub type RecvCallback<C> = Arc<dyn Fn(&Binding<C>, Box<RecvBlock>) + Send + Sync>;

/// Invoked when a connected socket observes `ECONNREFUSED`, the BSD signal
/// for a prior ICMP port-unreachable. See [`crate::socket_context`] §4.10.
pub type UnreachableCallback<C> = Arc<dyn Fn(&Binding<C>, Addr) + Send + Sync>;

/// The top-level datapath handle. `C` is the opaque per-binding context type
/// threaded through to the receive/unreachable callbacks.
pub struct Datapath<C> {
    config: DatapathConfig,
    proc_contexts: Vec<Arc<ProcContext>>,
    partitioner: Arc<dyn Partitioner>,
    recv_callback: RecvCallback<C>,
    unreachable_callback: UnreachableCallback<C>,
    client_recv_context_len: usize,
    bindings_rundown: Rundown,
    shutdown: AtomicBool,
}

impl<C> Datapath<C>
where
    C: Send + Sync + 'static,
{
    /// Creates a datapath with one `ProcContext`/worker per logical CPU.
    /// `client_recv_context_len` reserves that many bytes per `RecvBlock`
    /// for the upper layer's own per-datagram bookkeeping.
    ///
    /// On any failure partway through spinning up `ProcContext`s, the ones
    /// already created are torn down (their workers stopped) before the
    /// error is returned.
    pub fn new(
        client_recv_context_len: usize,
        recv_callback: RecvCallback<C>,
        unreachable_callback: UnreachableCallback<C>,
        config: DatapathConfig,
    ) -> Result<Arc<Self>> {
        let proc_count = affinity::get_cpu_count().max(1);
        let mut proc_contexts = Vec::with_capacity(proc_count);
        for index in 0..proc_count {
            match ProcContext::new(index, config.poll_timeout) {
                Ok(ctx) => {
                    let ctx = Arc::new(ctx);
                    ctx.start();
                    proc_contexts.push(ctx);
                }
                Err(e) => {
                    for ctx in &proc_contexts {
                        ctx.shutdown();
                    }
                    return Err(DatapathError::Io(e));
                }
            }
        }

        Ok(Arc::new(Self {
            config,
            proc_contexts,
            partitioner: Arc::new(FixedPartitioner),
            recv_callback,
            unreachable_callback,
            client_recv_context_len,
            bindings_rundown: Rundown::new(),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Swaps in a different send-partitioning strategy (default:
    /// [`FixedPartitioner`], matching the distilled design's single-core
    /// history). Must be called before any `Binding` is created.
    pub fn set_partitioner(&mut self, partitioner: Arc<dyn Partitioner>) {
        self.partitioner = partitioner;
    }

    pub fn proc_count(&self) -> usize {
        self.proc_contexts.len()
    }

    /// `GetSupportedFeatures`: this core supports neither GSO/URO nor RSS.
    pub fn supported_features(&self) -> u32 {
        FEATURE_NONE
    }

    /// `IsPaddingPreferred`: this core has no preference.
    pub fn is_padding_preferred(&self) -> bool {
        false
    }

    /// `ResolveAddress`: numeric-first, falling back to the system
    /// resolver.
    pub fn resolve_address(&self, host: &str, port: u16) -> Result<Addr> {
        socket_context::resolve_address(host, port)
    }

    /// Creates a `Binding`: one `SocketContext` per `ProcContext`, all
    /// registered and receiving before this call returns. Fails with
    /// [`DatapathError::InvalidParameter`] once the datapath has started
    /// shutting down.
    pub fn create_binding(
        self: &Arc<Self>,
        local: Addr,
        remote: Option<Addr>,
        client_context: C,
    ) -> Result<Arc<Binding<C>>> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(DatapathError::InvalidParameter("datapath is shutting down"));
        }
        if !self.bindings_rundown.acquire() {
            return Err(DatapathError::InvalidParameter("datapath is shutting down"));
        }

        let recv_callback = self.recv_callback.clone();
        let unreachable_callback = self.unreachable_callback.clone();
        let datapath = self.clone();
        let result = Binding::create(
            self.proc_contexts.clone(),
            self.partitioner.clone(),
            local,
            remote,
            client_context,
            self.client_recv_context_len,
            self.config.recv_pool_size_per_proc,
            &self.config,
            move |binding, block| recv_callback(binding, block),
            move |binding, addr| unreachable_callback(binding, addr),
            move || datapath.release_binding(),
        );

        match result {
            Ok(binding) => Ok(binding),
            Err(e) => {
                self.bindings_rundown.release();
                Err(e)
            }
        }
    }

    /// Called by `Binding::delete` once its own rundown has drained, so the
    /// datapath's bindings rundown can track "no bindings left" for
    /// `Uninitialize`/`Drop` to wait on.
    pub(crate) fn release_binding(&self) {
        self.bindings_rundown.release();
    }

    /// `Uninitialize`: stop accepting new bindings, wait for every existing
    /// one to be deleted by its caller, then join every worker. Safe to
    /// call explicitly; `Drop` calls it again (a no-op the second time)
    /// for callers that just drop the `Arc`.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bindings_rundown.release_and_wait();
        for ctx in &self.proc_contexts {
            ctx.shutdown();
        }
    }
}

impl<C> Drop for Datapath<C> {
    fn drop(&mut self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.bindings_rundown.release_and_wait();
        }
        for ctx in &self.proc_contexts {
            ctx.shutdown();
        }
    }
}
