// Logging setup and session statistics
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Installs a compact fmt subscriber filtered by `RUST_LOG`
/// (default `enav_core=info`).
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("enav_core=info"));

    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(env_filter)
        .try_init();
}

/// Point-in-time statistics of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub invocations: u64,
    pub responses: u64,
    pub orphaned_responses: u64,
    pub timeouts: u64,
    pub transport_failures: u64,
    pub inbound_requests: u64,
    pub unknown_service_replies: u64,
    pub information_sent: u64,
    pub information_received: u64,
    pub pending_requests: usize,
    pub active_registrations: usize,
}

/// Counters shared by the components of one connection.
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    pub invocations: AtomicU64,
    pub responses: AtomicU64,
    pub orphaned_responses: AtomicU64,
    pub timeouts: AtomicU64,
    pub transport_failures: AtomicU64,
    pub inbound_requests: AtomicU64,
    pub unknown_service_replies: AtomicU64,
    pub information_sent: AtomicU64,
    pub information_received: AtomicU64,
}

impl SessionCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pending_requests: usize, active_registrations: usize) -> ConnectionStats {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ConnectionStats {
            invocations: read(&self.invocations),
            responses: read(&self.responses),
            orphaned_responses: read(&self.orphaned_responses),
            timeouts: read(&self.timeouts),
            transport_failures: read(&self.transport_failures),
            inbound_requests: read(&self.inbound_requests),
            unknown_service_replies: read(&self.unknown_service_replies),
            information_sent: read(&self.information_sent),
            information_received: read(&self.information_received),
            pending_requests,
            active_registrations,
        }
    }
}
