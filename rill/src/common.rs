//! Common types and constants used throughout the project.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest token (in bytes) kept verbatim by the word and basic tokenizers.
/// Longer tokens are cut at this length and suffixed with [`TRUNCATION_MARK`].
pub const MAX_WORD_LENGTH: usize = 30;

/// Suffix appended to a token that was cut at [`MAX_WORD_LENGTH`].
pub const TRUNCATION_MARK: &str = "...";

// ============================================================================
// Index NewTypes
// ============================================================================

/// Index of a class in the [`Schema`](crate::schema::Schema).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassIdx(pub u32);

/// Index of a field inside its owning class. Also the position of the field's
/// value in a [`Record`](crate::database::Record) of that class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldIdx(pub u32);

/// Index of a feature block inside its owning class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockIdx(pub u32);

/// Global index of one slot in the cascading n-gram hash-table layout.
/// Starts at 1; see [`crate::ngram::HashTableLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarKey(pub u32);

impl ClassIdx {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl FieldIdx {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BlockIdx {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// Field Types
// ============================================================================

/// Storage type of a schema field.
///
/// `Text` and `TextList` are the text-based types the feature construction
/// works on. `Object` and `ObjectArray` are relations to another class
/// (one-to-one and one-to-many respectively).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Numerical,
    Categorical,
    Text,
    TextList,
    Object(ClassIdx),
    ObjectArray(ClassIdx),
}

impl FieldType {
    pub fn is_text_based(self) -> bool {
        matches!(self, FieldType::Text | FieldType::TextList)
    }

    /// Target class of a relation field.
    pub fn target_class(self) -> Option<ClassIdx> {
        match self {
            FieldType::Object(c) | FieldType::ObjectArray(c) => Some(c),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FieldType::Numerical => "Numerical",
            FieldType::Categorical => "Categorical",
            FieldType::Text => "Text",
            FieldType::TextList => "TextList",
            FieldType::Object(_) => "Object",
            FieldType::ObjectArray(_) => "ObjectArray",
        }
    }
}

// ============================================================================
// Feature Kind
// ============================================================================

#[derive(Debug, Error)]
#[error("unknown text feature kind {0:?} (expected one of: ngrams, words, tokens)")]
pub struct UnknownFeatureKind(pub String);

/// What a constructed text feature counts.
///
/// - `Ngrams`: hashed byte n-grams over a fixed table layout; generic and
///   robust but not interpretable. Needs no vocabulary sample.
/// - `Words`: words and punctuation runs, split on whitespace and on
///   punctuation boundaries.
/// - `Tokens`: raw space-separated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextFeatureKind {
    #[default]
    Ngrams,
    Words,
    Tokens,
}

impl TextFeatureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TextFeatureKind::Ngrams => "ngrams",
            TextFeatureKind::Words => "words",
            TextFeatureKind::Tokens => "tokens",
        }
    }

    /// Whether features of this kind come from a sampled vocabulary.
    pub fn needs_token_sample(self) -> bool {
        !matches!(self, TextFeatureKind::Ngrams)
    }
}

impl FromStr for TextFeatureKind {
    type Err = UnknownFeatureKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ngrams" => Ok(TextFeatureKind::Ngrams),
            "words" => Ok(TextFeatureKind::Words),
            "tokens" => Ok(TextFeatureKind::Tokens),
            other => Err(UnknownFeatureKind(other.to_string())),
        }
    }
}

impl fmt::Display for TextFeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Token Frequency
// ============================================================================

/// A token with its observed frequency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenFrequency {
    pub token: String,
    pub frequency: u64,
}

impl TokenFrequency {
    pub fn new(token: impl Into<String>, frequency: u64) -> Self {
        Self {
            token: token.into(),
            frequency,
        }
    }

    /// Lexicographic on token, then decreasing frequency.
    pub fn cmp_by_token(&self, other: &Self) -> Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| other.frequency.cmp(&self.frequency))
    }

    /// Decreasing frequency, then lexicographic on token.
    pub fn cmp_by_frequency(&self, other: &Self) -> Ordering {
        other
            .frequency
            .cmp(&self.frequency)
            .then_with(|| self.token.cmp(&other.token))
    }
}

/// Sorts by decreasing frequency and keeps at most `max_count` entries.
pub fn keep_most_frequent(tokens: &mut Vec<TokenFrequency>, max_count: usize) {
    tokens.sort_unstable_by(TokenFrequency::cmp_by_frequency);
    tokens.truncate(max_count);
}
