//! Aggregation state for the word count consumer.
//!
//! A single [`CountStore`] is shared by every partition worker. It keeps a
//! word -> count table plus a counter of malformed messages, and hands out
//! point-in-time [`AggregationSnapshot`](tally_core::AggregationSnapshot)s at
//! flush boundaries.
//!
//! Two counting modes are supported:
//! - [`CountingMode::Cumulative`](tally_core::CountingMode): counts only grow
//!   for the lifetime of the job (and across restarts via checkpoints)
//! - [`CountingMode::Windowed`](tally_core::CountingMode): counts are cleared
//!   after every flush, so each snapshot covers one window
//!
//! # Example
//!
//! ```
//! use tally_core::CountingMode;
//! use tally_state::CountStore;
//!
//! let store = CountStore::new(CountingMode::Cumulative);
//! store.increment("the");
//! store.increment("cat");
//! store.increment("the");
//!
//! let snapshot = store.snapshot(1);
//! assert_eq!(snapshot.count("the"), 2);
//! assert_eq!(snapshot.total(), 3);
//! ```

mod store;

pub use store::CountStore;
