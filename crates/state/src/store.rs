//! Lock-guarded word count table.

use parking_lot::Mutex;
use std::collections::HashMap;
use tally_core::{now_millis, AggregationSnapshot, CountEntry, CountingMode};
use tracing::debug;

#[derive(Debug, Default)]
struct Counts {
    words: HashMap<String, u64>,
    malformed: u64,
}

impl Counts {
    fn to_snapshot(&self, flush_id: u64, mode: CountingMode) -> AggregationSnapshot {
        let mut entries: Vec<CountEntry> = self
            .words
            .iter()
            .map(|(word, count)| CountEntry::new(word.clone(), *count))
            .collect();
        entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));

        AggregationSnapshot {
            flush_id,
            timestamp: now_millis(),
            mode,
            entries,
            malformed: self.malformed,
        }
    }
}

/// Word -> count table shared by all partition workers.
///
/// Every operation takes the internal lock once, so a snapshot never
/// observes a line half-counted when callers use [`increment_all`].
///
/// [`increment_all`]: CountStore::increment_all
#[derive(Debug)]
pub struct CountStore {
    mode: CountingMode,
    counts: Mutex<Counts>,
}

impl Default for CountStore {
    fn default() -> Self {
        Self::new(CountingMode::default())
    }
}

impl CountStore {
    pub fn new(mode: CountingMode) -> Self {
        Self {
            mode,
            counts: Mutex::new(Counts::default()),
        }
    }

    pub fn mode(&self) -> CountingMode {
        self.mode
    }

    pub fn increment(&self, word: &str) {
        self.increment_by(word, 1);
    }

    pub fn increment_by(&self, word: &str, n: u64) {
        if n == 0 {
            return;
        }
        let mut counts = self.counts.lock();
        match counts.words.get_mut(word) {
            Some(count) => *count = count.saturating_add(n),
            None => {
                counts.words.insert(word.to_string(), n);
            }
        }
    }

    /// Count every word of one line under a single lock acquisition.
    /// Returns the number of words counted.
    pub fn increment_all<I, S>(&self, words: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut counts = self.counts.lock();
        let mut n = 0;
        for word in words {
            let word = word.as_ref();
            match counts.words.get_mut(word) {
                Some(count) => *count = count.saturating_add(1),
                None => {
                    counts.words.insert(word.to_string(), 1);
                }
            }
            n += 1;
        }
        n
    }

    /// Count a message whose payload could not be decoded.
    pub fn record_malformed(&self) {
        let mut counts = self.counts.lock();
        counts.malformed = counts.malformed.saturating_add(1);
    }

    /// Copy the current counts. The store is left untouched.
    pub fn snapshot(&self, flush_id: u64) -> AggregationSnapshot {
        self.counts.lock().to_snapshot(flush_id, self.mode)
    }

    /// Clear all counts, including the malformed counter.
    pub fn reset(&self) {
        *self.counts.lock() = Counts::default();
    }

    /// Replace the table with previously checkpointed counts.
    pub fn restore(&self, entries: &[CountEntry], malformed: u64) {
        let mut counts = self.counts.lock();
        counts.words = entries
            .iter()
            .filter(|e| e.count > 0)
            .map(|e| (e.word.clone(), e.count))
            .collect();
        counts.malformed = malformed;
        debug!(words = counts.words.len(), malformed, "Counts restored");
    }

    /// Number of distinct words.
    pub fn len(&self) -> usize {
        self.counts.lock().words.len()
    }

    pub fn is_empty(&self) -> bool {
        let counts = self.counts.lock();
        counts.words.is_empty() && counts.malformed == 0
    }

    /// Sum of all word counts.
    pub fn total(&self) -> u64 {
        self.counts.lock().words.values().sum()
    }

    pub fn malformed(&self) -> u64 {
        self.counts.lock().malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tally_operators::WordSplitter;

    #[test]
    fn test_counts_two_lines() {
        let store = CountStore::default();
        let splitter = WordSplitter::new();
        for line in ["the cat sat", "the dog ran"] {
            store.increment_all(splitter.split(line));
        }

        let snapshot = store.snapshot(1);
        assert_eq!(snapshot.count("the"), 2);
        for word in ["cat", "sat", "dog", "ran"] {
            assert_eq!(snapshot.count(word), 1);
        }
        assert_eq!(snapshot.total(), 6);
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_snapshot_order() {
        let store = CountStore::default();
        store.increment_by("b", 2);
        store.increment_by("a", 2);
        store.increment_by("z", 5);
        store.increment("c");

        let snapshot = store.snapshot(1);
        let words: Vec<&str> = snapshot.entries.iter().map(|e| e.word.as_str()).collect();
        assert_eq!(words, ["z", "a", "b", "c"]);
    }

    #[test]
    fn test_snapshot_does_not_clear() {
        let store = CountStore::new(CountingMode::Windowed);
        store.increment("cat");
        assert_eq!(store.snapshot(1).count("cat"), 1);
        assert_eq!(store.snapshot(2).count("cat"), 1);
    }

    #[test]
    fn test_windowed_reset_between_snapshots() {
        let windowed = CountStore::new(CountingMode::Windowed);
        windowed.increment("cat");
        windowed.record_malformed();
        let first = windowed.snapshot(1);
        windowed.reset();
        assert_eq!(first.count("cat"), 1);
        assert_eq!(first.malformed, 1);
        assert!(windowed.is_empty());

        windowed.increment("dog");
        let second = windowed.snapshot(2);
        assert_eq!(second.count("cat"), 0);
        assert_eq!(second.count("dog"), 1);
        assert_eq!(second.mode, CountingMode::Windowed);
    }

    #[test]
    fn test_malformed_leaves_words_untouched() {
        let store = CountStore::default();
        store.increment("the");
        store.record_malformed();
        store.record_malformed();

        let snapshot = store.snapshot(1);
        assert_eq!(snapshot.total(), 1);
        assert_eq!(snapshot.malformed, 2);
        assert_eq!(
            snapshot.records().last().as_deref(),
            Some("__malformed__\t2")
        );
    }

    #[test]
    fn test_restore_replaces_counts() {
        let store = CountStore::default();
        store.increment("stale");
        store.restore(
            &[CountEntry::new("the", 4), CountEntry::new("gone", 0)],
            3,
        );

        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot(7).count("the"), 4);
        assert_eq!(store.malformed(), 3);

        store.increment("the");
        assert_eq!(store.snapshot(8).count("the"), 5);
    }

    #[test]
    fn test_reset() {
        let store = CountStore::default();
        store.increment("a");
        store.record_malformed();
        store.reset();
        assert!(store.is_empty());
        assert_eq!(store.total(), 0);
    }

    #[test]
    fn test_concurrent_increments() {
        let store = Arc::new(CountStore::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        store.increment_all(["the", "cat"]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = store.snapshot(1);
        assert_eq!(snapshot.count("the"), 8000);
        assert_eq!(snapshot.count("cat"), 8000);
    }
}
