//! Processing counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the dispatcher and the partition workers.
#[derive(Debug, Default)]
pub struct CounterStats {
    messages: AtomicU64,
    words: AtomicU64,
    malformed: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`CounterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterStatsSnapshot {
    pub messages: u64,
    pub words: u64,
    pub malformed: u64,
    pub reconnects: u64,
}

impl CounterStats {
    pub fn record_message(&self, words: usize) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.words.fetch_add(words as u64, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterStatsSnapshot {
        CounterStatsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            words: self.words.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
