//! # Trainer
//!
//! The controller treats model training as an opaque capability: hand over an
//! encoded corpus and a vocabulary size, get checkpoints back; later, open an
//! inference session over the latest checkpoint and step it one token at a time.
//!
//! [`BigramTrainer`] is the bundled implementation, a count-based character
//! transition model. The corpus is cut into windows of `seq_len + 1` tokens, each
//! window yields `seq_len` input/target pairs, and every epoch adds the pair
//! counts into the model. A checkpoint is written after every epoch to
//! `<root>/<model>/cp_<epoch>.json`.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub const DEF_SEQ_LEN: usize = 10;
pub const DEF_SMOOTHING: f32 = 0.01;

#[derive(Debug)]
pub enum TrainerError {
    Io(io::Error),
    Json(serde_json::Error),
    InvalidModelName(String),
    NotEnoughData { tokens: usize, needed: usize },
    TokenOutOfRange { token: u32, vocab_size: usize },
    NoCheckpoint(String),
    VocabSizeMismatch { checkpoint: usize, requested: usize },
}

impl fmt::Display for TrainerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainerError::Io(e) => write!(f, "checkpoint I/O error: {}", e),
            TrainerError::Json(e) => write!(f, "checkpoint format error: {}", e),
            TrainerError::InvalidModelName(name) => write!(f, "invalid model name {:?}", name),
            TrainerError::NotEnoughData { tokens, needed } => write!(
                f,
                "corpus has {} characters but at least {} are needed",
                tokens, needed
            ),
            TrainerError::TokenOutOfRange { token, vocab_size } => write!(
                f,
                "token {} is outside the vocabulary of size {}",
                token, vocab_size
            ),
            TrainerError::NoCheckpoint(name) => write!(f, "no checkpoint found for model {}", name),
            TrainerError::VocabSizeMismatch { checkpoint, requested } => write!(
                f,
                "checkpoint was trained with vocabulary size {} but {} was requested",
                checkpoint, requested
            ),
        }
    }
}

impl std::error::Error for TrainerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainerError::Io(e) => Some(e),
            TrainerError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainerError {
    fn from(err: io::Error) -> Self {
        TrainerError::Io(err)
    }
}

impl From<serde_json::Error> for TrainerError {
    fn from(err: serde_json::Error) -> Self {
        TrainerError::Json(err)
    }
}

/// A model name doubles as its checkpoint directory name.
pub fn is_valid_model_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.chars().any(|c| c == '/' || c == '\\' || c.is_control())
}

#[derive(Debug, Clone)]
pub struct TrainingRequest<'a> {
    pub model_name: &'a str,
    pub encoded: &'a [u32],
    pub vocab_size: usize,
    pub epochs: u32,
    /// Continue from the latest checkpoint instead of starting from scratch.
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingReport {
    pub first_epoch: u32,
    pub last_epoch: u32,
    pub pairs_per_epoch: usize,
    pub checkpoint: PathBuf,
}

pub trait Trainer: Send + Sync {
    fn train(&self, request: &TrainingRequest<'_>) -> Result<TrainingReport, TrainerError>;

    /// Opens a stateful inference session over the model's latest checkpoint.
    fn open_session(&self, model_name: &str, vocab_size: usize) -> Result<Box<dyn InferenceSession>, TrainerError>;
}

pub trait InferenceSession: Send {
    /// Feeds one token and returns the probability distribution of the next one.
    fn step(&mut self, token: u32) -> Result<Vec<f32>, TrainerError>;

    fn vocab_size(&self) -> usize;
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    epoch: u32,
    vocab_size: usize,
    /// Row-major `vocab_size x vocab_size` transition counts.
    counts: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct BigramTrainer {
    root: PathBuf,
    seq_len: usize,
    smoothing: f32,
}

impl BigramTrainer {
    pub fn new(root: impl Into<PathBuf>, seq_len: usize, smoothing: f32) -> Self {
        Self {
            root: root.into(),
            seq_len: seq_len.max(1),
            smoothing: smoothing.max(f32::MIN_POSITIVE),
        }
    }

    pub fn with_defaults(root: impl Into<PathBuf>) -> Self {
        Self::new(root, DEF_SEQ_LEN, DEF_SMOOTHING)
    }

    fn model_dir(&self, model_name: &str) -> Result<PathBuf, TrainerError> {
        if !is_valid_model_name(model_name) {
            return Err(TrainerError::InvalidModelName(model_name.to_string()));
        }
        Ok(self.root.join(model_name))
    }

    fn checkpoint_path(dir: &Path, epoch: u32) -> PathBuf {
        dir.join(format!("cp_{}.json", epoch))
    }

    /// Path and epoch of the newest `cp_<epoch>.json` in `dir`.
    fn latest_checkpoint(dir: &Path) -> Result<Option<(u32, PathBuf)>, TrainerError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut latest: Option<(u32, PathBuf)> = None;
        for entry in entries {
            let path = entry?.path();
            let epoch = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("cp_"))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(epoch) = epoch {
                if latest.as_ref().map_or(true, |(best, _)| epoch > *best) {
                    latest = Some((epoch, path));
                }
            }
        }
        Ok(latest)
    }

    fn load_latest(&self, model_name: &str, vocab_size: usize) -> Result<Checkpoint, TrainerError> {
        let dir = self.model_dir(model_name)?;
        let (_, path) = Self::latest_checkpoint(&dir)?
            .ok_or_else(|| TrainerError::NoCheckpoint(model_name.to_string()))?;
        let checkpoint: Checkpoint = serde_json::from_reader(BufReader::new(File::open(&path)?))?;
        if checkpoint.vocab_size != vocab_size {
            return Err(TrainerError::VocabSizeMismatch {
                checkpoint: checkpoint.vocab_size,
                requested: vocab_size,
            });
        }
        Ok(checkpoint)
    }

    fn save_checkpoint(dir: &Path, checkpoint: &Checkpoint) -> Result<PathBuf, TrainerError> {
        let path = Self::checkpoint_path(dir, checkpoint.epoch);
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(writer, checkpoint)?;
        Ok(path)
    }

    /// Transition counts contributed by one pass over the corpus.
    fn count_pairs(&self, encoded: &[u32], vocab_size: usize) -> Vec<u64> {
        let window = self.seq_len + 1;
        encoded
            .par_chunks_exact(window)
            .fold(
                || vec![0u64; vocab_size * vocab_size],
                |mut acc, chunk| {
                    for pair in chunk.windows(2) {
                        acc[pair[0] as usize * vocab_size + pair[1] as usize] += 1;
                    }
                    acc
                },
            )
            .reduce(
                || vec![0u64; vocab_size * vocab_size],
                |mut left, right| {
                    left.iter_mut().zip(right).for_each(|(l, r)| *l += r);
                    left
                },
            )
    }
}

impl Trainer for BigramTrainer {
    fn train(&self, request: &TrainingRequest<'_>) -> Result<TrainingReport, TrainerError> {
        let vocab_size = request.vocab_size;
        let dir = self.model_dir(request.model_name)?;

        let window = self.seq_len + 1;
        if request.encoded.len() < window {
            return Err(TrainerError::NotEnoughData {
                tokens: request.encoded.len(),
                needed: window,
            });
        }
        if let Some(&token) = request.encoded.iter().find(|&&t| t as usize >= vocab_size) {
            return Err(TrainerError::TokenOutOfRange { token, vocab_size });
        }

        let mut checkpoint = if request.resume {
            self.load_latest(request.model_name, vocab_size)?
        } else {
            // Leftovers from an abandoned run under the same name must not be resumed later.
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            Checkpoint {
                epoch: 0,
                vocab_size,
                counts: vec![0; vocab_size * vocab_size],
            }
        };
        fs::create_dir_all(&dir)?;

        let epoch_counts = self.count_pairs(request.encoded, vocab_size);
        let pairs_per_epoch = (request.encoded.len() / window) * self.seq_len;
        let first_epoch = checkpoint.epoch + 1;
        let mut last_path = Self::checkpoint_path(&dir, checkpoint.epoch);

        for _ in 0..request.epochs {
            checkpoint.epoch += 1;
            checkpoint
                .counts
                .iter_mut()
                .zip(&epoch_counts)
                .for_each(|(total, added)| *total += added);
            last_path = Self::save_checkpoint(&dir, &checkpoint)?;
            debug!(
                "Model {} epoch {} done ({} pairs), checkpoint {:?}",
                request.model_name, checkpoint.epoch, pairs_per_epoch, last_path
            );
        }

        info!(
            "Model {} trained epochs {}..={}",
            request.model_name, first_epoch, checkpoint.epoch
        );
        Ok(TrainingReport {
            first_epoch,
            last_epoch: checkpoint.epoch,
            pairs_per_epoch,
            checkpoint: last_path,
        })
    }

    fn open_session(&self, model_name: &str, vocab_size: usize) -> Result<Box<dyn InferenceSession>, TrainerError> {
        let checkpoint = self.load_latest(model_name, vocab_size)?;
        Ok(Box::new(BigramSession {
            counts: checkpoint.counts,
            vocab_size,
            smoothing: self.smoothing,
        }))
    }
}

#[derive(Debug)]
struct BigramSession {
    counts: Vec<u64>,
    vocab_size: usize,
    smoothing: f32,
}

impl InferenceSession for BigramSession {
    fn step(&mut self, token: u32) -> Result<Vec<f32>, TrainerError> {
        let v = self.vocab_size;
        if token as usize >= v {
            return Err(TrainerError::TokenOutOfRange { token, vocab_size: v });
        }
        let row = &self.counts[token as usize * v..(token as usize + 1) * v];
        let total: u64 = row.iter().sum();
        let denominator = total as f32 + self.smoothing * v as f32;
        Ok(row
            .iter()
            .map(|&c| (c as f32 + self.smoothing) / denominator)
            .collect())
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trainer(dir: &Path) -> BigramTrainer {
        BigramTrainer::new(dir, 3, 0.01)
    }

    // "abab..." encoded against [a, b, c]
    fn alternating(len: usize) -> Vec<u32> {
        (0..len).map(|i| (i % 2) as u32).collect()
    }

    #[test]
    fn test_model_name_validation() {
        assert!(is_valid_model_name("Eminem_53234"));
        assert!(is_valid_model_name("my model"));
        assert!(!is_valid_model_name(""));
        assert!(!is_valid_model_name(".."));
        assert!(!is_valid_model_name("a/b"));
        assert!(!is_valid_model_name("a\\b"));
    }

    #[test]
    fn test_fresh_training_writes_a_checkpoint_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = trainer(dir.path());
        let encoded = alternating(16);
        let report = trainer
            .train(&TrainingRequest {
                model_name: "m1",
                encoded: &encoded,
                vocab_size: 3,
                epochs: 3,
                resume: false,
            })
            .unwrap();

        assert_eq!(report.first_epoch, 1);
        assert_eq!(report.last_epoch, 3);
        // 16 tokens -> 4 windows of 4 -> 3 pairs each
        assert_eq!(report.pairs_per_epoch, 12);
        for epoch in 1..=3 {
            assert!(dir.path().join("m1").join(format!("cp_{}.json", epoch)).exists());
        }
        assert_eq!(report.checkpoint, dir.path().join("m1").join("cp_3.json"));
    }

    #[test]
    fn test_resume_continues_epoch_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = trainer(dir.path());
        let encoded = alternating(8);
        let mut request = TrainingRequest {
            model_name: "m1",
            encoded: &encoded,
            vocab_size: 3,
            epochs: 2,
            resume: false,
        };
        trainer.train(&request).unwrap();

        request.resume = true;
        request.epochs = 1;
        let report = trainer.train(&request).unwrap();
        assert_eq!((report.first_epoch, report.last_epoch), (3, 3));
    }

    #[test]
    fn test_fresh_training_discards_old_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = trainer(dir.path());
        let encoded = alternating(8);
        let mut request = TrainingRequest {
            model_name: "m1",
            encoded: &encoded,
            vocab_size: 3,
            epochs: 5,
            resume: false,
        };
        trainer.train(&request).unwrap();
        request.epochs = 1;
        let report = trainer.train(&request).unwrap();
        assert_eq!(report.last_epoch, 1);
        assert!(!dir.path().join("m1").join("cp_5.json").exists());
    }

    #[test]
    fn test_resume_requires_checkpoint_and_matching_size() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = trainer(dir.path());
        let encoded = alternating(8);
        let mut request = TrainingRequest {
            model_name: "m1",
            encoded: &encoded,
            vocab_size: 3,
            epochs: 1,
            resume: true,
        };
        assert!(matches!(trainer.train(&request), Err(TrainerError::NoCheckpoint(_))));

        request.resume = false;
        trainer.train(&request).unwrap();
        request.resume = true;
        request.vocab_size = 4;
        assert!(matches!(
            trainer.train(&request),
            Err(TrainerError::VocabSizeMismatch { checkpoint: 3, requested: 4 })
        ));
    }

    #[test]
    fn test_rejects_short_corpus_and_foreign_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = trainer(dir.path());
        let short = vec![0u32, 1];
        let request = TrainingRequest {
            model_name: "m1",
            encoded: &short,
            vocab_size: 3,
            epochs: 1,
            resume: false,
        };
        assert!(matches!(
            trainer.train(&request),
            Err(TrainerError::NotEnoughData { tokens: 2, needed: 4 })
        ));

        let foreign = vec![0u32, 1, 2, 7];
        let request = TrainingRequest { encoded: &foreign, ..request };
        assert!(matches!(
            trainer.train(&request),
            Err(TrainerError::TokenOutOfRange { token: 7, vocab_size: 3 })
        ));
    }

    #[test]
    fn test_session_follows_learned_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = trainer(dir.path());
        let encoded = alternating(40);
        trainer
            .train(&TrainingRequest {
                model_name: "m1",
                encoded: &encoded,
                vocab_size: 3,
                epochs: 2,
                resume: false,
            })
            .unwrap();

        let mut session = trainer.open_session("m1", 3).unwrap();
        assert_eq!(session.vocab_size(), 3);
        let after_a = session.step(0).unwrap();
        assert_eq!(after_a.len(), 3);
        assert!((after_a.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        assert!(after_a[1] > 0.9, "a should be followed by b: {:?}", after_a);
        // Never-seen transitions still get a little mass.
        assert!(after_a[2] > 0.0);

        assert!(matches!(session.step(5), Err(TrainerError::TokenOutOfRange { .. })));
        assert!(matches!(trainer.open_session("missing", 3), Err(TrainerError::NoCheckpoint(_))));
    }
}
