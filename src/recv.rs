//! Receive blocks: pre-sized buffers handed to the upper layer on each
//! completed `recvmsg`.

use crate::addr::Tuple;
use crate::pool::Pool;
use std::sync::{Arc, Weak};

/// Maximum UDP payload this datapath will ever hand upstream: `QUIC_MAX_MTU`
/// minus the largest IPv4/UDP header overhead it needs to allow for.
pub const QUIC_MAX_MTU: usize = 1452;
pub const MAX_UDP_PAYLOAD_LENGTH: usize = QUIC_MAX_MTU;

/// One received datagram plus the local/remote tuple it arrived with.
///
/// `client_context` is an opaque tail the upper layer can use to stash
/// per-datagram bookkeeping (the spec's `ClientRecvContextLength`) without
/// this crate knowing its shape.
pub struct RecvBlock {
    /// Back-reference to the pool this block was drawn from, so
    /// [`return_recv_datagrams`] can free it without the caller needing to
    /// know which `ProcContext` it arrived on. `Weak` rather than `Arc`
    /// because the block must not keep the pool (and transitively the
    /// `ProcContext`) alive past the datapath's own shutdown.
    owning_pool: Weak<Pool<Box<RecvBlock>>>,
    /// Which `ProcContext`'s socket this block was received on — the
    /// spec's `PartitionIndex`, surfaced to the upper layer for
    /// affinity-aware replies.
    pub partition_index: usize,
    pub tuple: Tuple,
    pub buffer: Box<[u8; MAX_UDP_PAYLOAD_LENGTH]>,
    pub buffer_length: usize,
    pub client_context: Vec<u8>,
    /// Link for chaining multiple completed receives together when handed
    /// to the upper-layer callback as a batch.
    pub next: Option<Box<RecvBlock>>,
}

impl RecvBlock {
    fn new(client_context_len: usize, owning_pool: Weak<Pool<Box<RecvBlock>>>) -> Box<RecvBlock> {
        Box::new(RecvBlock {
            owning_pool,
            partition_index: 0,
            tuple: Tuple {
                local: crate::addr::Addr::new_v4(std::net::Ipv4Addr::UNSPECIFIED, 0, 0),
                remote: crate::addr::Addr::new_v4(std::net::Ipv4Addr::UNSPECIFIED, 0, 0),
            },
            buffer: Box::new([0u8; MAX_UDP_PAYLOAD_LENGTH]),
            buffer_length: 0,
            client_context: vec![0u8; client_context_len],
            next: None,
        })
    }
}

/// Builds the per-`ProcContext` pool of `RecvBlock`s, each with a
/// `client_context` tail of `client_context_len` bytes and an `owning_pool`
/// back-reference into this same pool.
pub fn new_recv_pool(initial_count: usize, client_context_len: usize) -> Arc<Pool<Box<RecvBlock>>> {
    Arc::new_cyclic(|weak| {
        let weak = weak.clone();
        Pool::new(initial_count, move || RecvBlock::new(client_context_len, weak.clone()))
    })
}

/// `ReturnRecvDatagrams`: walks the `Next` chain handed to the receive
/// callback and frees every block back to the pool it was allocated from.
/// Safe to call on a chain spanning multiple `ProcContext`s (each block
/// carries its own pool back-reference) — and a no-op, rather than a leak or
/// a panic, for a block whose pool has already been torn down by
/// `Datapath::shutdown`.
pub fn return_recv_datagrams(chain: Box<RecvBlock>) {
    let mut next = Some(chain);
    while let Some(mut block) = next {
        next = block.next.take();
        if let Some(pool) = block.owning_pool.upgrade() {
            pool.free(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_block_round_trips_through_its_pool() {
        let pool = new_recv_pool(2, 16);
        assert_eq!(pool.available(), 2);

        let block = pool.alloc();
        assert_eq!(block.client_context.len(), 16);
        assert_eq!(pool.available(), 1);

        pool.free(block);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn buffer_is_sized_for_max_payload() {
        let pool = new_recv_pool(1, 0);
        let block = pool.alloc();
        assert_eq!(block.buffer.len(), MAX_UDP_PAYLOAD_LENGTH);
    }

    #[test]
    fn return_recv_datagrams_frees_every_block_in_the_chain_back_to_its_pool() {
        let pool = new_recv_pool(3, 0);
        assert_eq!(pool.available(), 3);

        let mut head = pool.alloc();
        head.next = Some(pool.alloc());
        head.next.as_mut().unwrap().next = Some(pool.alloc());
        assert_eq!(pool.available(), 0);

        return_recv_datagrams(head);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn return_recv_datagrams_is_a_no_op_once_the_owning_pool_is_gone() {
        let pool = new_recv_pool(1, 0);
        let block = pool.alloc();
        drop(pool);
        return_recv_datagrams(block);
    }
}
