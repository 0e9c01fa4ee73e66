// src/text_generator.rs

use std::fmt;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::trainer::{InferenceSession, TrainerError};
use crate::vocabulary::{Vocabulary, VocabularyError};

#[derive(Debug)]
pub enum TextGeneratorError {
    Inference(TrainerError),
    Vocabulary(VocabularyError),
    InvalidInput(String),
}

impl fmt::Display for TextGeneratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextGeneratorError::Inference(e) => write!(f, "inference error: {}", e),
            TextGeneratorError::Vocabulary(e) => write!(f, "vocabulary error: {}", e),
            TextGeneratorError::InvalidInput(s) => write!(f, "invalid input: {}", s),
        }
    }
}

impl std::error::Error for TextGeneratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TextGeneratorError::Inference(e) => Some(e),
            TextGeneratorError::Vocabulary(e) => Some(e),
            TextGeneratorError::InvalidInput(_) => None,
        }
    }
}

impl From<TrainerError> for TextGeneratorError {
    fn from(err: TrainerError) -> Self {
        TextGeneratorError::Inference(err)
    }
}

impl From<VocabularyError> for TextGeneratorError {
    fn from(err: VocabularyError) -> Self {
        TextGeneratorError::Vocabulary(err)
    }
}

/// Lazily generated lyrics: the seed's characters, then exactly `length` sampled ones.
///
/// Each sampled character is fed back into the session as the next input, so the
/// sequence cannot be restarted midway; build a new `Generation` to start over
/// from the seed. After an error the iterator is exhausted.
pub struct Generation {
    seed: std::vec::IntoIter<char>,
    session: Box<dyn InferenceSession>,
    vocabulary: Vocabulary,
    last_token: u32,
    remaining: usize,
    rng: StdRng,
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("vocabulary_len", &self.vocabulary.len())
            .field("last_token", &self.last_token)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl Generation {
    pub fn new(
        session: Box<dyn InferenceSession>,
        vocabulary: Vocabulary,
        seed_text: &str,
        length: usize,
    ) -> Result<Self, TextGeneratorError> {
        Self::with_rng(session, vocabulary, seed_text, length, StdRng::from_entropy())
    }

    pub fn with_rng(
        mut session: Box<dyn InferenceSession>,
        vocabulary: Vocabulary,
        seed_text: &str,
        length: usize,
        rng: StdRng,
    ) -> Result<Self, TextGeneratorError> {
        if seed_text.is_empty() {
            return Err(TextGeneratorError::InvalidInput("Seed text cannot be empty.".to_string()));
        }
        if vocabulary.capacity() != session.vocab_size() {
            return Err(TextGeneratorError::InvalidInput(format!(
                "Vocabulary capacity {} does not match the model's size {}.",
                vocabulary.capacity(),
                session.vocab_size()
            )));
        }

        let encoded = vocabulary.encode(seed_text)?;
        // Prime the session with everything but the last seed token; that one is
        // fed on the first call to `next`.
        let (&last_token, prefix) = match encoded.split_last() {
            Some(split) => split,
            None => return Err(TextGeneratorError::InvalidInput("Seed text cannot be empty.".to_string())),
        };
        for &token in prefix {
            session.step(token)?;
        }

        Ok(Self {
            seed: seed_text.chars().collect::<Vec<_>>().into_iter(),
            session,
            vocabulary,
            last_token,
            remaining: length,
            rng,
        })
    }

    /// Draws one index from `distribution`, restricted to real vocabulary slots.
    fn sample(&mut self, distribution: &[f32]) -> u32 {
        let real = self.vocabulary.len();
        let weights: Vec<f32> = distribution
            .iter()
            .take(real)
            .map(|&p| if p.is_finite() && p > 0.0 { p } else { 0.0 })
            .collect();
        match WeightedIndex::new(&weights) {
            Ok(index) => index.sample(&mut self.rng) as u32,
            // No usable mass on real characters; fall back to a uniform pick.
            Err(_) => self.rng.gen_range(0..real) as u32,
        }
    }

    fn next_sampled(&mut self) -> Result<char, TextGeneratorError> {
        let distribution = self.session.step(self.last_token)?;
        let token = self.sample(&distribution);
        self.last_token = token;
        self.vocabulary
            .symbol(token)
            .ok_or(TextGeneratorError::Vocabulary(VocabularyError::InvalidIndex(token)))
    }
}

impl Iterator for Generation {
    type Item = Result<char, TextGeneratorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(c) = self.seed.next() {
            return Some(Ok(c));
        }
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let result = self.next_sampled();
        if result.is_err() {
            self.remaining = 0;
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.seed.len() + self.remaining;
        (left, Some(left))
    }
}
