//! Batched send contexts.
//!
//! A `SendContext` accumulates up to [`MAX_SEND_BATCH_SIZE`] datagrams bound
//! for a single remote (optionally with an explicit source address) and is
//! handed to `SocketContext::send_to`/`send_from_to` as one unit. Partial
//! sends (an `EAGAIN` partway through the batch) resume from `current_index`
//! rather than re-sending already-delivered buffers.

use crate::addr::Addr;
use crate::pool::Pool;
use std::sync::Arc;

/// Hard cap on buffers per `SendContext`, matching the kernel's practical
/// `sendmsg` iovec-count sweet spot for one syscall.
pub const MAX_SEND_BATCH_SIZE: usize = 10;

pub const SEND_BUFFER_CAPACITY: usize = crate::recv::QUIC_MAX_MTU;

/// One outgoing datagram's backing storage, pool-allocated so steady-state
/// sends never touch the global allocator.
pub struct SendBuffer {
    pub data: Box<[u8; SEND_BUFFER_CAPACITY]>,
    pub len: usize,
}

impl SendBuffer {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; SEND_BUFFER_CAPACITY]),
            len: 0,
        }
    }
}

pub fn new_send_buffer_pool(initial_count: usize) -> Arc<Pool<SendBuffer>> {
    Arc::new(Pool::new(initial_count, SendBuffer::new))
}

/// A batch of up to [`MAX_SEND_BATCH_SIZE`] buffers targeted at one remote.
pub struct SendContext {
    pub local: Option<Addr>,
    pub remote: Addr,
    pub buffers: Vec<SendBuffer>,
    /// Index of the next buffer to attempt sending; advanced as buffers in
    /// the batch are successfully handed to the kernel.
    pub current_index: usize,
    pub pending: bool,
}

impl SendContext {
    pub fn new(remote: Addr, local: Option<Addr>) -> Self {
        Self {
            local,
            remote,
            buffers: Vec::with_capacity(MAX_SEND_BATCH_SIZE),
            current_index: 0,
            pending: false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.buffers.len() >= MAX_SEND_BATCH_SIZE
    }

    /// Draws one buffer from `buffer_pool` and appends it to this batch,
    /// refusing once [`MAX_SEND_BATCH_SIZE`] has been reached.
    pub fn alloc_datagram(&mut self, buffer_pool: &Pool<SendBuffer>, len: usize) -> Option<&mut [u8]> {
        if self.is_full() || len > SEND_BUFFER_CAPACITY {
            return None;
        }
        let mut buf = buffer_pool.alloc();
        buf.len = len;
        self.buffers.push(buf);
        Some(&mut self.buffers.last_mut().unwrap().data[..len])
    }

    pub fn remaining(&self) -> &[SendBuffer] {
        &self.buffers[self.current_index.min(self.buffers.len())..]
    }

    /// Returns every buffer in this batch to `buffer_pool`, leaving the
    /// context empty. Called once a batch has been fully sent or has
    /// failed terminally.
    pub fn release_buffers(&mut self, buffer_pool: &Pool<SendBuffer>) {
        buffer_pool.free_batch(self.buffers.drain(..));
        self.current_index = 0;
    }
}

pub fn new_send_context_pool(initial_count: usize) -> Arc<Pool<Box<SendContext>>> {
    let placeholder_remote = Addr::new_v4(std::net::Ipv4Addr::UNSPECIFIED, 0, 0);
    Arc::new(Pool::new(initial_count, move || {
        Box::new(SendContext::new(placeholder_remote, None))
    }))
}
