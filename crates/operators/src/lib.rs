//! Record-level operators of the word count pipeline.
//!
//! - [`WordSplitter`] - Split a line into normalized words

mod split;

pub use split::WordSplitter;
