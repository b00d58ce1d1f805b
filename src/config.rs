//! Datapath tuning configuration.
//!
//! `DatapathConfig` is the single place a caller reaches for to trade off
//! latency against throughput and memory footprint. It covers the knobs the
//! core actually has: per-core pool sizes, socket buffer sizes, busy-poll,
//! TOS/traffic-class marking, and the event-loop poll timeout. It does not
//! cover per-datagram behavior (batch size is fixed at
//! [`crate::send::MAX_SEND_BATCH_SIZE`] by the wire format, not tunable here).
//!
//! # Examples
//!
//! ```rust
//! use quic_darwin_datapath::config::DatapathConfig;
//!
//! let low_latency = DatapathConfig::low_latency();
//! let balanced = DatapathConfig::default();
//! ```

use crate::raw;
use std::io;

/// Tuning knobs applied to every socket a [`crate::datapath::Datapath`]
/// creates, plus the per-core pool sizes used to pre-warm [`crate::pool::Pool`]s.
///
/// All socket-level fields are optional and left to the OS default when
/// `None`. Platform-unsupported options (`busy_poll` off Linux) are silently
/// ignored rather than surfaced as errors, matching the teacher crate's
/// `apply_low_latency` convention.
#[derive(Clone, Debug, PartialEq)]
pub struct DatapathConfig {
    /// Socket receive buffer size (`SO_RCVBUF`) in bytes.
    ///
    /// **Default**: `Some(4MiB)`.
    pub recv_buf: Option<usize>,

    /// Socket send buffer size (`SO_SNDBUF`) in bytes.
    ///
    /// **Default**: `Some(4MiB)`.
    pub send_buf: Option<usize>,

    /// `SO_BUSY_POLL` timeout in microseconds (Linux only; ignored
    /// elsewhere, including Darwin, which has no equivalent socket option).
    ///
    /// **Default**: `None`.
    pub busy_poll: Option<u32>,

    /// IP Type of Service / IPv6 traffic class marking applied to every
    /// socket this datapath creates, for QoS/DSCP classification.
    ///
    /// **Default**: `None`.
    pub tos: Option<u32>,

    /// Event-loop poll timeout. Bounds how promptly a worker notices
    /// `Datapath::Shutdown` once no sockets are ready, and how much CPU an
    /// idle worker burns re-checking it.
    ///
    /// **Default**: `10ms`.
    pub poll_timeout: std::time::Duration,

    /// Number of `RecvBlock`s to pre-warm per `ProcContext` when a
    /// `Binding` registers a socket on it.
    ///
    /// **Default**: `8`.
    pub recv_pool_size_per_proc: usize,

    /// Number of `SendBuffer`s / `SendContext`s to pre-warm per
    /// `ProcContext`.
    ///
    /// **Default**: `8`.
    pub send_pool_size_per_proc: usize,
}

impl Default for DatapathConfig {
    /// Balanced defaults suitable for most QUIC workloads: moderate
    /// buffers, no busy polling, a 10ms poll timeout.
    fn default() -> Self {
        Self {
            recv_buf: Some(4 << 20),
            send_buf: Some(4 << 20),
            busy_poll: None,
            tos: None,
            poll_timeout: std::time::Duration::from_millis(10),
            recv_pool_size_per_proc: 8,
            send_pool_size_per_proc: 8,
        }
    }
}

impl DatapathConfig {
    /// Optimized for minimal latency: small buffers to minimize queuing
    /// delay, a low-delay DSCP marking, and a 1ms poll timeout so a worker
    /// notices readiness (and shutdown) almost immediately.
    pub fn low_latency() -> Self {
        Self {
            recv_buf: Some(256 * 1024),
            send_buf: Some(256 * 1024),
            busy_poll: Some(50),
            tos: Some(0x10),
            poll_timeout: std::time::Duration::from_millis(1),
            recv_pool_size_per_proc: 16,
            send_pool_size_per_proc: 16,
        }
    }

    /// Optimized for sustained throughput: large buffers, no busy polling
    /// (it only helps request/response latency), a longer poll timeout to
    /// reduce wakeups under steady load.
    pub fn high_throughput() -> Self {
        Self {
            recv_buf: Some(16 << 20),
            send_buf: Some(16 << 20),
            busy_poll: None,
            tos: Some(0x08),
            poll_timeout: std::time::Duration::from_millis(50),
            recv_pool_size_per_proc: 32,
            send_pool_size_per_proc: 32,
        }
    }

    /// Applies the socket-level knobs to a newly created, not-yet-bound
    /// socket. Must be called before `bind` so buffer-size/TOS changes take
    /// effect for the socket's whole lifetime.
    pub(crate) fn apply_to_socket(&self, os: raw::OsSocket, domain: raw::Domain) -> io::Result<()> {
        if let Some(sz) = self.recv_buf {
            raw::set_recv_buffer(os, sz as i32)?;
        }
        if let Some(sz) = self.send_buf {
            raw::set_send_buffer(os, sz as i32)?;
        }
        if let Some(tos) = self.tos {
            match domain {
                raw::Domain::Ipv4 => raw::set_tos_v4(os, tos as i32)?,
                raw::Domain::Ipv6 => raw::set_tos_v6(os, tos as i32)?,
            }
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some(us) = self.busy_poll {
            let _ = raw::set_busy_poll(os, us);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_balanced() {
        let cfg = DatapathConfig::default();
        assert_eq!(cfg.recv_buf, Some(4 << 20));
        assert_eq!(cfg.busy_poll, None);
    }

    #[test]
    fn low_latency_shrinks_buffers_and_poll_timeout() {
        let cfg = DatapathConfig::low_latency();
        assert_eq!(cfg.recv_buf, Some(256 * 1024));
        assert_eq!(cfg.poll_timeout, std::time::Duration::from_millis(1));
    }

    #[test]
    fn high_throughput_grows_buffers() {
        let cfg = DatapathConfig::high_throughput();
        assert_eq!(cfg.recv_buf, Some(16 << 20));
        assert_eq!(cfg.busy_poll, None);
    }
}
