//! Selects which per-core `SocketContext` handles a given send.
//!
//! The distilled design hard-codes index 0; this crate keeps the plural
//! per-core model (one `SocketContext` per `ProcContext`) and makes the
//! selection strategy a trait so a future caller can hash on the 4-tuple
//! without touching `Binding`/`SocketContext`.

use crate::addr::Tuple;

pub trait Partitioner: Send + Sync {
    /// Returns the index of the `SocketContext` (within `0..proc_count`)
    /// that should carry a send for this tuple.
    fn select(&self, tuple: &Tuple, proc_count: usize) -> usize;
}

/// Always uses the first core's socket. Matches the original single-core
/// behavior and is the right choice whenever `ProcCount == 1`.
#[derive(Default)]
pub struct FixedPartitioner;

impl Partitioner for FixedPartitioner {
    fn select(&self, _tuple: &Tuple, _proc_count: usize) -> usize {
        0
    }
}

/// Hashes the 4-tuple to spread sends (and therefore the sockets a
/// multi-core binding touches) across cores.
#[derive(Default)]
pub struct HashPartitioner;

impl Partitioner for HashPartitioner {
    fn select(&self, tuple: &Tuple, proc_count: usize) -> usize {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        if proc_count <= 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        tuple.local.hash(&mut hasher);
        tuple.remote.hash(&mut hasher);
        (hasher.finish() as usize) % proc_count
    }
}
