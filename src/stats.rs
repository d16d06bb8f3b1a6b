//! Counters describing how requests were served.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Requests left to the default network path.
    pub passthrough: u64,
    /// Requests answered straight from the cache.
    pub cache_hits: u64,
    /// Requests answered by the network.
    pub network: u64,
    /// Network failures answered with a cached copy of the same request.
    pub fallback_exact: u64,
    /// Network failures answered with the cached shell.
    pub fallback_shell: u64,
    /// Synthesized offline responses.
    pub offline: u64,
    /// Responses written to the cache.
    pub stored: u64,
    /// Cache writes that failed and were dropped.
    pub write_failures: u64,
}

impl StatsSnapshot {
    /// Total requests that were intercepted.
    #[must_use]
    pub const fn intercepted(&self) -> u64 {
        self.cache_hits + self.network + self.fallback_exact + self.fallback_shell + self.offline
    }
}

/// Thread-safe request counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    passthrough: AtomicU64,
    cache_hits: AtomicU64,
    network: AtomicU64,
    fallback_exact: AtomicU64,
    fallback_shell: AtomicU64,
    offline: AtomicU64,
    stored: AtomicU64,
    write_failures: AtomicU64,
}

/// Which counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passthrough,
    CacheHit,
    Network,
    FallbackExact,
    FallbackShell,
    Offline,
    Stored,
    WriteFailure,
}

impl CacheStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter for `outcome`.
    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Passthrough => &self.passthrough,
            Outcome::CacheHit => &self.cache_hits,
            Outcome::Network => &self.network,
            Outcome::FallbackExact => &self.fallback_exact,
            Outcome::FallbackShell => &self.fallback_shell,
            Outcome::Offline => &self.offline,
            Outcome::Stored => &self.stored,
            Outcome::WriteFailure => &self.write_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            passthrough: self.passthrough.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            network: self.network.load(Ordering::Relaxed),
            fallback_exact: self.fallback_exact.load(Ordering::Relaxed),
            fallback_shell: self.fallback_shell.load(Ordering::Relaxed),
            offline: self.offline.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}
