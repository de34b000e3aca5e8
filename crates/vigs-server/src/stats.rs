use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the server counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    pub batches: u64,
    pub requests: u64,
    pub protocol_errors: u64,
    pub surfaces_not_found: u64,
    pub backend_errors: u64,
    pub fence_acks: u64,
    pub captures: u64,
}

/// Counters updated by the dispatch and render threads.
#[derive(Debug, Default)]
pub struct ServerStats {
    batches: AtomicU64,
    requests: AtomicU64,
    protocol_errors: AtomicU64,
    surfaces_not_found: AtomicU64,
    backend_errors: AtomicU64,
    fence_acks: AtomicU64,
    captures: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_batches(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_requests(&self, n: u64) {
        self.requests.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_protocol_errors(&self, n: u64) {
        self.protocol_errors.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_surfaces_not_found(&self) {
        self.surfaces_not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_backend_errors(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fence_acks(&self) {
        self.fence_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_captures(&self) {
        self.captures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            surfaces_not_found: self.surfaces_not_found.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            fence_acks: self.fence_acks.load(Ordering::Relaxed),
            captures: self.captures.load(Ordering::Relaxed),
        }
    }
}
