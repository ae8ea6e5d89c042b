//! Process-wide connection counters.
//!
//! Plain relaxed atomics: the counters are advisory and read through [`snapshot`]
//! by the CLI and tests.
use std::sync::atomic::{AtomicU64, Ordering};

static CONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static CONNECT_ESTABLISHED: AtomicU64 = AtomicU64::new(0);
static CONNECT_FAILED: AtomicU64 = AtomicU64::new(0);
static HANDSHAKE_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static LINK_LOSSES: AtomicU64 = AtomicU64::new(0);
static KEEPALIVE_SENT: AtomicU64 = AtomicU64::new(0);
static KEEPALIVE_FAILED: AtomicU64 = AtomicU64::new(0);
static TRANSPORTS_OPENED: AtomicU64 = AtomicU64::new(0);
static TRANSPORTS_CLOSED: AtomicU64 = AtomicU64::new(0);

pub fn inc_connect_attempts() {
    CONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connect_established() {
    CONNECT_ESTABLISHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connect_failed() {
    CONNECT_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_handshake_timeouts() {
    HANDSHAKE_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_link_losses() {
    LINK_LOSSES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_keepalive_sent() {
    KEEPALIVE_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_keepalive_failed() {
    KEEPALIVE_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transports_opened() {
    TRANSPORTS_OPENED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_transports_closed() {
    TRANSPORTS_CLOSED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub connect_attempts: u64,
    pub connect_established: u64,
    pub connect_failed: u64,
    pub handshake_timeouts: u64,
    pub link_losses: u64,
    pub keepalive_sent: u64,
    pub keepalive_failed: u64,
    pub transports_opened: u64,
    pub transports_closed: u64,
}

impl Snapshot {
    /// Transports opened and not yet closed.
    pub fn transports_open(&self) -> u64 {
        self.transports_opened.saturating_sub(self.transports_closed)
    }
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        connect_attempts: CONNECT_ATTEMPTS.load(Ordering::Relaxed),
        connect_established: CONNECT_ESTABLISHED.load(Ordering::Relaxed),
        connect_failed: CONNECT_FAILED.load(Ordering::Relaxed),
        handshake_timeouts: HANDSHAKE_TIMEOUTS.load(Ordering::Relaxed),
        link_losses: LINK_LOSSES.load(Ordering::Relaxed),
        keepalive_sent: KEEPALIVE_SENT.load(Ordering::Relaxed),
        keepalive_failed: KEEPALIVE_FAILED.load(Ordering::Relaxed),
        transports_opened: TRANSPORTS_OPENED.load(Ordering::Relaxed),
        transports_closed: TRANSPORTS_CLOSED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        inc_keepalive_sent();
        inc_link_losses();
        let after = snapshot();
        // Other tests in the same process may bump counters concurrently
        assert!(after.keepalive_sent > before.keepalive_sent);
        assert!(after.link_losses > before.link_losses);
    }
}
