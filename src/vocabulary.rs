//! # Character Vocabulary
//!
//! A fixed-capacity, ordered alphabet used to turn lyrics into integer sequences
//! for training and back into text during generation.
//!
//! The capacity is reserved up front so that a trained model's character-indexed
//! layers never need resizing. Unused slots are filled with [`VOCAB_PLACEHOLDER`],
//! which can never be produced from real text since it is longer than one character.
//! Merging a vocabulary only ever appends characters into free slots, so every
//! index handed out before a merge keeps its meaning afterwards.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Symbol stored in unused vocabulary slots.
pub const VOCAB_PLACEHOLDER: &str = "UNDEF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VocabularyError {
    /// More distinct characters than the vocabulary can hold.
    CapacityExceeded { needed: usize, capacity: usize },
    /// A character with no slot in the vocabulary.
    UnknownCharacter(char),
    /// An index outside the real (non-placeholder) prefix.
    InvalidIndex(u32),
    /// A persisted slot that is neither a single character nor the placeholder.
    MalformedSlot(String),
    /// A persisted vocabulary listing the same character twice.
    DuplicateCharacter(char),
}

impl fmt::Display for VocabularyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VocabularyError::CapacityExceeded { needed, capacity } => write!(
                f,
                "vocabulary needs {} characters but its capacity is {}",
                needed, capacity
            ),
            VocabularyError::UnknownCharacter(c) => {
                write!(f, "character {:?} is not in the vocabulary", c)
            }
            VocabularyError::InvalidIndex(i) => {
                write!(f, "index {} does not map to a vocabulary character", i)
            }
            VocabularyError::MalformedSlot(s) => write!(f, "malformed vocabulary slot {:?}", s),
            VocabularyError::DuplicateCharacter(c) => {
                write!(f, "character {:?} appears twice in the vocabulary", c)
            }
        }
    }
}

impl std::error::Error for VocabularyError {}

/// Ordered character set padded to a fixed capacity.
///
/// Only the real prefix is stored; the placeholder padding is implied by
/// `capacity` and materialised when the vocabulary is serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Vocabulary {
    capacity: usize,
    symbols: Vec<char>,
}

impl Vocabulary {
    /// Builds a vocabulary from the distinct characters of `text`, sorted by code point.
    pub fn build(text: &str, capacity: usize) -> Result<Self, VocabularyError> {
        let distinct: BTreeSet<char> = text.chars().collect();
        if distinct.len() > capacity {
            return Err(VocabularyError::CapacityExceeded {
                needed: distinct.len(),
                capacity,
            });
        }
        Ok(Self {
            capacity,
            symbols: distinct.into_iter().collect(),
        })
    }

    /// Appends the characters of `new` that `old` lacks, in `new`'s order.
    ///
    /// The result keeps `old`'s capacity (the size the model was built with). An
    /// empty `old` with no capacity of its own adopts `new`'s capacity.
    pub fn merge(old: &Vocabulary, new: &Vocabulary) -> Result<Self, VocabularyError> {
        let capacity = if old.capacity > 0 { old.capacity } else { new.capacity };
        let known: HashSet<char> = old.symbols.iter().copied().collect();

        let mut symbols = old.symbols.clone();
        symbols.extend(new.symbols.iter().copied().filter(|c| !known.contains(c)));

        if symbols.len() > capacity {
            return Err(VocabularyError::CapacityExceeded {
                needed: symbols.len(),
                capacity,
            });
        }
        Ok(Self { capacity, symbols })
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>, VocabularyError> {
        let lookup: HashMap<char, u32> = self
            .symbols
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u32))
            .collect();

        text.chars()
            .map(|c| lookup.get(&c).copied().ok_or(VocabularyError::UnknownCharacter(c)))
            .collect()
    }

    pub fn decode(&self, encoded: &[u32]) -> Result<String, VocabularyError> {
        encoded
            .iter()
            .map(|&i| self.symbol(i).ok_or(VocabularyError::InvalidIndex(i)))
            .collect()
    }

    /// Character stored at `index`, or `None` for placeholder and out-of-range slots.
    pub fn symbol(&self, index: u32) -> Option<char> {
        self.symbols.get(index as usize).copied()
    }

    pub fn index_of(&self, c: char) -> Option<u32> {
        self.symbols.iter().position(|&s| s == c).map(|i| i as u32)
    }

    /// Number of real (non-placeholder) characters.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// An empty vocabulary marks a model whose training has not finished.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn symbols(&self) -> &[char] {
        &self.symbols
    }
}

impl From<Vocabulary> for Vec<String> {
    fn from(vocab: Vocabulary) -> Self {
        // A placeholder record persists as `[]` rather than a page of padding.
        if vocab.symbols.is_empty() {
            return Vec::new();
        }
        let mut slots: Vec<String> = vocab.symbols.iter().map(|c| c.to_string()).collect();
        slots.resize(vocab.capacity, VOCAB_PLACEHOLDER.to_string());
        slots
    }
}

impl TryFrom<Vec<String>> for Vocabulary {
    type Error = VocabularyError;

    fn try_from(slots: Vec<String>) -> Result<Self, Self::Error> {
        let capacity = slots.len();
        let mut symbols = Vec::new();
        let mut seen = HashSet::new();

        for slot in slots.iter().take_while(|s| s.as_str() != VOCAB_PLACEHOLDER) {
            let mut chars = slot.chars();
            let c = match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => return Err(VocabularyError::MalformedSlot(slot.clone())),
            };
            if !seen.insert(c) {
                return Err(VocabularyError::DuplicateCharacter(c));
            }
            symbols.push(c);
        }

        Ok(Self { capacity, symbols })
    }
}
