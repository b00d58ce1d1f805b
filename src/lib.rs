#![deny(unsafe_op_in_unsafe_fn)]

//! Per-core UDP datapath for a QUIC transport stack on Darwin/BSD.
//!
//! [`Datapath`] owns one [`proc_context::ProcContext`] (a kqueue-backed
//! worker thread, pinned to a logical core) per [`affinity::get_cpu_count`]
//! core. Callers create one [`Binding`] per logical UDP endpoint; a binding
//! fans out to one socket per proc context and routes sends across them
//! through a pluggable [`Partitioner`].

pub mod addr;
pub mod affinity;
pub mod binding;
pub mod cmsg;
pub mod config;
pub mod datapath;
pub mod error;
pub mod partitioner;
pub mod pool;
pub mod proc_context;
pub mod raw;
pub mod recv;
pub mod rundown;
pub mod send;
pub mod socket_context;

pub use addr::{Addr, Tuple};
pub use binding::Binding;
pub use config::DatapathConfig;
pub use datapath::{Datapath, RecvCallback, UnreachableCallback};
pub use error::{DatapathError, Result};
pub use partitioner::{FixedPartitioner, HashPartitioner, Partitioner};
pub use recv::{return_recv_datagrams, RecvBlock};
pub use send::SendContext;
