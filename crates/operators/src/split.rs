//! Word splitting.

/// Splits lines into lowercase words with surrounding punctuation removed.
///
/// A word is a whitespace-separated token with every leading and trailing
/// non-alphanumeric character stripped. Inner punctuation is kept, so
/// `"don't"` and `"well-known"` stay single words. Tokens that strip down to
/// nothing (`"--"`, `"!!"`) are dropped.
///
/// # Example
///
/// ```
/// use tally_operators::WordSplitter;
///
/// let words: Vec<String> = WordSplitter::default().split("The cat, the HAT!").collect();
/// assert_eq!(words, ["the", "cat", "the", "hat"]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct WordSplitter;

impl WordSplitter {
    pub fn new() -> Self {
        Self
    }

    pub fn split<'a>(&self, line: &'a str) -> impl Iterator<Item = String> + 'a {
        line.split_whitespace()
            .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|word| !word.is_empty())
            .map(str::to_lowercase)
    }
}
