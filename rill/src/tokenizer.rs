//! Word and basic tokenizers with bounded-memory frequency collection.
//!
//! A [`TokenCounter`] runs in one of two modes:
//! - collecting: counts every token, optionally capped at `max_collected`
//!   distinct entries with frequent-items stream cleaning after each text;
//! - specific: counts only the tokens of a fixed vocabulary, exactly.
//!
//! [`DeployedTokens`] maps a fixed vocabulary to block member positions and
//! produces sparse counts for one value at scoring time.

use std::collections::HashMap;
use std::fmt::Write;

use crate::common::{MAX_WORD_LENGTH, TRUNCATION_MARK, TextFeatureKind, TokenFrequency, keep_most_frequent};

/// Highest frequency tracked by the stream-cleaning histogram.
const CLEANING_HISTOGRAM_SIZE: usize = 100;

// ============================================================================
// Splitting
// ============================================================================

/// How a text value is cut into tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPolicy {
    /// Split on whitespace and control characters, and between punctuation
    /// runs and other runs.
    Words,
    /// Split on the space character only.
    Basic,
}

impl TokenPolicy {
    /// `None` for n-grams, which are not tokenized this way.
    pub fn for_kind(kind: TextFeatureKind) -> Option<Self> {
        match kind {
            TextFeatureKind::Ngrams => None,
            TextFeatureKind::Words => Some(TokenPolicy::Words),
            TextFeatureKind::Tokens => Some(TokenPolicy::Basic),
        }
    }

    /// Calls `emit` for every token of `text`, in order.
    ///
    /// Tokens longer than [`MAX_WORD_LENGTH`] bytes are cut at a char
    /// boundary and suffixed with [`TRUNCATION_MARK`]; the rest of the token
    /// is skipped.
    pub fn split(self, text: &str, mut emit: impl FnMut(&str)) {
        let mut token = String::new();
        let mut token_is_punct = false;
        let mut truncated = false;

        let mut flush = |token: &mut String, truncated: &mut bool| {
            if !token.is_empty() {
                if *truncated {
                    token.push_str(TRUNCATION_MARK);
                }
                emit(token);
                token.clear();
            }
            *truncated = false;
        };

        for c in text.chars() {
            let (is_space, is_punct) = match self {
                TokenPolicy::Words => (c.is_whitespace() || c.is_control(), c.is_ascii_punctuation()),
                TokenPolicy::Basic => (c == ' ', false),
            };
            if is_space || (!token.is_empty() && is_punct != token_is_punct) {
                flush(&mut token, &mut truncated);
                if is_space {
                    continue;
                }
            }
            if token.is_empty() {
                token_is_punct = is_punct;
            }
            if truncated {
                continue;
            }
            if token.len() + c.len_utf8() <= MAX_WORD_LENGTH {
                token.push(c);
            } else {
                truncated = true;
            }
        }
        flush(&mut token, &mut truncated);
    }
}

// ============================================================================
// Token Counter
// ============================================================================

#[derive(Debug, Clone)]
enum Mode {
    Collecting {
        /// Cap on distinct entries, 0 for unbounded.
        max_collected: usize,
        counts: HashMap<String, u64>,
    },
    Specific {
        index: HashMap<String, usize>,
        vocabulary: Vec<String>,
        counts: Vec<u64>,
    },
}

#[derive(Debug, Clone)]
pub struct TokenCounter {
    policy: TokenPolicy,
    mode: Mode,
}

impl TokenCounter {
    /// Counts every token, keeping at most `max_collected` distinct entries
    /// (0 keeps everything).
    pub fn collecting(policy: TokenPolicy, max_collected: usize) -> Self {
        Self {
            policy,
            mode: Mode::Collecting {
                max_collected,
                counts: HashMap::new(),
            },
        }
    }

    /// Counts only the tokens of `vocabulary`, exactly.
    pub fn specific(policy: TokenPolicy, vocabulary: &[String]) -> Self {
        let index = vocabulary
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        Self {
            policy,
            mode: Mode::Specific {
                index,
                vocabulary: vocabulary.to_vec(),
                counts: vec![0; vocabulary.len()],
            },
        }
    }

    pub fn tokenize(&mut self, text: &str) {
        let policy = self.policy;
        match &mut self.mode {
            Mode::Collecting { counts, .. } => policy.split(text, |token| {
                if let Some(count) = counts.get_mut(token) {
                    *count += 1;
                } else {
                    counts.insert(token.to_string(), 1);
                }
            }),
            Mode::Specific { index, counts, .. } => policy.split(text, |token| {
                if let Some(&i) = index.get(token) {
                    counts[i] += 1;
                }
            }),
        }
        self.stream_clean();
    }

    pub fn tokenize_list(&mut self, texts: &[String]) {
        for text in texts {
            self.tokenize(text);
        }
    }

    /// Number of distinct tokens currently held (with a non-zero count).
    pub fn collected_count(&self) -> usize {
        match &self.mode {
            Mode::Collecting { counts, .. } => counts.len(),
            Mode::Specific { counts, .. } => counts.iter().filter(|&&c| c > 0).count(),
        }
    }

    /// Frequent-items cleaning: once the table exceeds the cap, decrement all
    /// counts and drop zeros, then keep raising the drop threshold (by whole
    /// histogram steps rather than one at a time) until it fits.
    fn stream_clean(&mut self) {
        let Mode::Collecting { max_collected, counts } = &mut self.mode else {
            return;
        };
        let max = *max_collected;
        if max == 0 {
            return;
        }

        if counts.len() > max {
            counts.retain(|_, c| {
                *c -= 1;
                *c > 0
            });
        }

        while counts.len() > max {
            let mut histogram = [0usize; CLEANING_HISTOGRAM_SIZE + 1];
            for &c in counts.values() {
                if c as usize <= CLEANING_HISTOGRAM_SIZE {
                    histogram[c as usize] += 1;
                }
            }

            let mut remaining = counts.len();
            let mut min_frequency = 1;
            while remaining > max && min_frequency < CLEANING_HISTOGRAM_SIZE {
                remaining -= histogram[min_frequency];
                min_frequency += 1;
            }
            debug_assert!(min_frequency > 1);

            let decrement = (min_frequency - 1) as u64;
            counts.retain(|_, c| {
                *c = c.saturating_sub(decrement);
                *c > 0
            });
        }
    }

    /// Top `max_count` tokens by decreasing frequency, tie-break lexicographic.
    pub fn export_frequent(&self, max_count: usize) -> Vec<TokenFrequency> {
        let mut tokens = self.export();
        keep_most_frequent(&mut tokens, max_count);
        tokens
    }

    /// All held tokens with a non-zero count, unordered.
    fn export(&self) -> Vec<TokenFrequency> {
        match &self.mode {
            Mode::Collecting { counts, .. } => counts
                .iter()
                .map(|(t, &c)| TokenFrequency::new(t.clone(), c))
                .collect(),
            Mode::Specific { vocabulary, counts, .. } => vocabulary
                .iter()
                .zip(counts)
                .filter(|&(_, &c)| c > 0)
                .map(|(t, &c)| TokenFrequency::new(t.clone(), c))
                .collect(),
        }
    }

    /// Held tokens sorted lexicographically, as needed for a k-way merge.
    pub fn into_sorted_by_token(self) -> Vec<TokenFrequency> {
        let mut tokens = self.export();
        tokens.sort_unstable_by(TokenFrequency::cmp_by_token);
        tokens
    }

    /// Exact counts aligned with the specific vocabulary; empty in
    /// collecting mode.
    pub fn into_specific_counts(self) -> Vec<u64> {
        match self.mode {
            Mode::Specific { counts, .. } => counts,
            Mode::Collecting { .. } => Vec::new(),
        }
    }
}

// ============================================================================
// Deployment
// ============================================================================

/// A fixed vocabulary mapping tokens to block member positions.
#[derive(Debug, Clone)]
pub struct DeployedTokens {
    policy: TokenPolicy,
    index: HashMap<String, usize>,
}

impl DeployedTokens {
    pub fn new(policy: TokenPolicy, tokens: impl IntoIterator<Item = String>) -> Self {
        let index = tokens.into_iter().enumerate().map(|(i, t)| (t, i)).collect();
        Self { policy, index }
    }

    /// Sparse `(position, count)` pairs sorted by position, non-zero only.
    pub fn count<'a>(&self, texts: impl IntoIterator<Item = &'a str>) -> Vec<(usize, u64)> {
        let mut counts: HashMap<usize, u64> = HashMap::new();
        for text in texts {
            self.policy.split(text, |token| {
                if let Some(&i) = self.index.get(token) {
                    *counts.entry(i).or_insert(0) += 1;
                }
            });
        }
        let mut sparse: Vec<_> = counts.into_iter().collect();
        sparse.sort_unstable();
        sparse
    }
}

// ============================================================================
// Token Keys
// ============================================================================

/// Printable key for a token: runs of control characters become `{HEX}`
/// groups of their UTF-8 bytes and a literal `{` is doubled.
pub fn token_to_key(token: &str) -> String {
    let mut key = String::with_capacity(token.len());
    let mut in_bytes = false;
    for c in token.chars() {
        if c.is_control() {
            if !in_bytes {
                key.push('{');
                in_bytes = true;
            }
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(key, "{b:02X}");
            }
        } else {
            if in_bytes {
                key.push('}');
                in_bytes = false;
            }
            key.push(c);
            if c == '{' {
                key.push('{');
            }
        }
    }
    if in_bytes {
        key.push('}');
    }
    key
}

/// Inverse of [`token_to_key`]. `None` for a malformed key.
pub fn key_to_token(key: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(key.len());
    let mut chars = key.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '{' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            bytes.push(b'{');
            continue;
        }
        loop {
            let high = chars.next()?;
            if high == '}' {
                break;
            }
            let low = chars.next()?;
            let byte = (high.to_digit(16)? * 16 + low.to_digit(16)?) as u8;
            bytes.push(byte);
        }
    }
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(policy: TokenPolicy, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        policy.split(text, |t| tokens.push(t.to_string()));
        tokens
    }

    #[test]
    fn test_word_split_separates_punctuation_runs() {
        assert_eq!(
            split(TokenPolicy::Words, "Bonjour, tout le monde!!!"),
            vec!["Bonjour", ",", "tout", "le", "monde", "!!!"]
        );
        assert_eq!(split(TokenPolicy::Words, "a\tb\n\nc...d"), vec!["a", "b", "c", "...", "d"]);
        assert!(split(TokenPolicy::Words, "  \n ").is_empty());
    }

    #[test]
    fn test_basic_split_on_space_only() {
        assert_eq!(
            split(TokenPolicy::Basic, "Bonjour, tout  le\tmonde!!!"),
            vec!["Bonjour,", "tout", "le\tmonde!!!"]
        );
    }

    #[test]
    fn test_long_tokens_are_truncated() {
        let long = "x".repeat(45);
        let tokens = split(TokenPolicy::Words, &format!("{long} end"));
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0], format!("{}...", "x".repeat(MAX_WORD_LENGTH)));
        assert_eq!(tokens[1], "end");

        // A punctuation switch ends the skipped tail and starts a new token.
        let tokens = split(TokenPolicy::Words, &format!("{long}!?"));
        assert_eq!(tokens, vec![format!("{}...", "x".repeat(MAX_WORD_LENGTH)), "!?".to_string()]);
    }

    #[test]
    fn test_unbounded_collection_is_exact() {
        let mut counter = TokenCounter::collecting(TokenPolicy::Words, 0);
        counter.tokenize("the cat and the dog");
        counter.tokenize_list(&["the end".to_string(), "dog".to_string()]);
        let tokens = counter.export_frequent(3);
        assert_eq!(
            tokens,
            vec![
                TokenFrequency::new("the", 3),
                TokenFrequency::new("dog", 2),
                TokenFrequency::new("and", 1),
            ]
        );
    }

    #[test]
    fn test_capped_collection_keeps_heavy_hitters() {
        let mut counter = TokenCounter::collecting(TokenPolicy::Basic, 5);
        for i in 0..200 {
            counter.tokenize(&format!("alpha beta alpha rare{i}"));
            assert!(counter.collected_count() <= 5);
        }
        let tokens = counter.export_frequent(2);
        assert_eq!(tokens[0].token, "alpha");
        assert_eq!(tokens[1].token, "beta");
        assert!(tokens[0].frequency > tokens[1].frequency);
    }

    #[test]
    fn test_cleaning_histogram_step() {
        // 30 distinct singletons in one text blow well past the cap: the
        // first decrement alone empties the table.
        let mut counter = TokenCounter::collecting(TokenPolicy::Basic, 4);
        let text: Vec<String> = (0..30).map(|i| format!("t{i}")).collect();
        counter.tokenize(&text.join(" "));
        assert_eq!(counter.collected_count(), 0);

        // With frequencies spread out, the histogram pass drops the low tail.
        let mut counter = TokenCounter::collecting(TokenPolicy::Basic, 3);
        let mut text = Vec::new();
        for (token, n) in [("a", 9), ("b", 7), ("c", 5), ("d", 3), ("e", 2), ("f", 2)] {
            text.extend(std::iter::repeat_n(token, n));
        }
        counter.tokenize(&text.join(" "));
        let kept: Vec<_> = counter.export_frequent(10).into_iter().map(|t| t.token).collect();
        assert_eq!(kept, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_specific_counts() {
        let vocabulary = vec!["dog".to_string(), "cat".to_string(), "emu".to_string()];
        let mut counter = TokenCounter::specific(TokenPolicy::Words, &vocabulary);
        counter.tokenize("cat dog cat bird");
        counter.tokenize("cat");
        assert_eq!(counter.collected_count(), 2);
        assert_eq!(
            counter.export_frequent(10),
            vec![TokenFrequency::new("cat", 3), TokenFrequency::new("dog", 1)]
        );
        assert_eq!(counter.into_specific_counts(), vec![1, 3, 0]);
    }

    #[test]
    fn test_deployed_tokens() {
        let deployed = DeployedTokens::new(TokenPolicy::Words, ["b".to_string(), "a".to_string()]);
        assert_eq!(deployed.count(["a b a", "c", "b"]), vec![(0, 2), (1, 2)]);
        assert!(deployed.count(["zzz"]).is_empty());
    }

    #[test]
    fn test_token_keys() {
        assert_eq!(token_to_key("plain"), "plain");
        assert_eq!(token_to_key("a{b"), "a{{b");
        assert_eq!(token_to_key("le\tmonde\n"), "le{09}monde{0A}");
        for token in ["plain", "a{b", "le\tmonde\n", "\u{1}\u{2}x", "été"] {
            assert_eq!(key_to_token(&token_to_key(token)).as_deref(), Some(token));
        }
        assert_eq!(key_to_token("{0"), None);
        assert_eq!(key_to_token("{ZZ}"), None);
    }
}
