//! Idle transport pool
//!
//! Keeps recently used transports around keyed by remote identity so the
//! engine can reuse them instead of paying connect + handshake again.
//! Entries are best-effort: a pooled transport may have been closed by the
//! peer in the meantime, which the engine treats as a recoverable first-write
//! failure rather than a fatal one.

use crate::config::PoolConfig;
use crate::transport::{Transport, TransportKey};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Pool of idle, still-connected transports
pub struct ConnectionPool {
    idle: Mutex<HashMap<TransportKey, VecDeque<Transport>>>,
    config: PoolConfig,
    stats: Mutex<PoolStats>,
}

/// Pool counters, exposed for logging and tests
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Acquires satisfied from the idle set
    pub hits: u64,
    /// Acquires that found no usable idle transport
    pub misses: u64,
    /// Idle entries dropped for exceeding the idle timeout or per-host cap
    pub evictions: u64,
    /// Transports discarded after an I/O failure
    pub invalidations: u64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            config,
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Take an idle transport for the given identity, if a fresh-enough
    /// one is parked. Never blocks and never dials; a `None` tells the
    /// caller to open a new transport.
    pub fn acquire(&self, key: &TransportKey) -> Option<Transport> {
        let now = Instant::now();
        let mut idle = self.idle.lock();
        let found = if let Some(queue) = idle.get_mut(key) {
            // Newest first: the most recently parked entry is the one
            // least likely to have been closed by the peer.
            let mut found = None;
            while let Some(transport) = queue.pop_back() {
                if now.duration_since(transport.last_used()) > self.config.idle_timeout() {
                    self.stats.lock().evictions += 1;
                    continue;
                }
                found = Some(transport);
                break;
            }
            if queue.is_empty() {
                idle.remove(key);
            }
            found
        } else {
            None
        };
        drop(idle);

        let mut stats = self.stats.lock();
        match found {
            Some(mut transport) => {
                stats.hits += 1;
                tracing::debug!(peer = %key, "reusing pooled transport");
                transport.touch();
                Some(transport)
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Park a transport after clean use, subject to the per-identity cap.
    pub fn release(&self, mut transport: Transport) {
        transport.touch();
        let key = transport.key().clone();
        let mut idle = self.idle.lock();
        let queue = idle.entry(key.clone()).or_default();
        if queue.len() >= self.config.max_idle_per_host {
            // Oldest entry makes room
            queue.pop_front();
            self.stats.lock().evictions += 1;
        }
        queue.push_back(transport);
        tracing::debug!(peer = %key, idle = queue.len(), "parked transport");
    }

    /// Discard a transport after an I/O failure or unclean protocol end.
    pub fn invalidate(&self, transport: Transport) {
        tracing::debug!(peer = %transport.key(), "invalidating transport");
        self.stats.lock().invalidations += 1;
        drop(transport);
    }

    /// Drop every idle entry (engine shutdown).
    pub fn clear(&self) {
        self.idle.lock().clear();
    }

    /// Number of idle transports currently parked for an identity
    pub fn idle_count(&self, key: &TransportKey) -> usize {
        self.idle.lock().get(key).map_or(0, VecDeque::len)
    }

    pub fn stats(&self) -> PoolStats {
        *self.stats.lock()
    }
}
