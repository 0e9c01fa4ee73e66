//! # Job Controller
//!
//! Validates download and training requests, applies the placeholder claim policy
//! against the [`Repository`], and hands accepted work to a fixed-size worker pool.
//! Every request method returns as soon as its job is queued; clients poll the
//! job id for the outcome.
//!
//! ## Claim policy
//!
//! Records with an empty payload claim a name for in-flight work. When a request
//! names an artist (or model) the controller scans the matching records:
//! - a complete record means the name is taken;
//! - a placeholder younger than the staleness window means work is in progress;
//! - older placeholders are presumed abandoned, deleted, and the request proceeds.
//!
//! The scan and the worker's placeholder write are separate steps, so two
//! submissions arriving together can both be accepted.
//!
//! ## Worker tasks
//!
//! A task always ends with exactly one write to the [`JobRegistry`]: its success
//! message, or `"<description> failed: <reason>"` for an error or a panic. A task
//! that fails cleanly removes the placeholder it wrote.
//!
//! Retraining an existing model holds a per-model claim for the whole task, so a
//! second retrain of the same model is rejected until the first one ends. Two
//! concurrent merges would hand the same free slot to different characters.

use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use log::{error, info, warn};
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use crate::downloader::{DownloadError, LyricsSource};
use crate::jobs::{JobId, JobRegistry, JobStatus, RegistryError};
use crate::repository::{ArtistLyricsRecord, Collection, ModelRecord, Record, RecordId, Repository, StoreError};
use crate::text_generator::{Generation, TextGeneratorError};
use crate::trainer::{is_valid_model_name, Trainer, TrainerError, TrainingRequest};
use crate::vocabulary::{Vocabulary, VocabularyError};

#[derive(Debug)]
pub enum JobError {
    ArtistNotFound(String),
    AlreadyDownloaded(String),
    DownloadInProgress(String),
    ModelNameTaken(String),
    TrainingInProgress(String),
    InvalidEpochCount { requested: u32, min: u32, max: u32 },
    UnknownArtistId(String),
    ModelNotFound(String),
    InvalidModelName(String),
    EmptyCorpus,
    InvalidSeed(String),
    ComposeTooLong { requested: usize, max: usize },
    RegistryExhausted(RegistryError),
    Storage(StoreError),
    Download(DownloadError),
    Vocabulary(VocabularyError),
    Training(TrainerError),
    Generation(TextGeneratorError),
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::ArtistNotFound(name) => write!(f, "The artist {} was not found", name),
            JobError::AlreadyDownloaded(name) => {
                write!(f, "The lyrics of {} were already downloaded before", name)
            }
            JobError::DownloadInProgress(name) => {
                write!(f, "The lyrics of {} are being downloaded right now", name)
            }
            JobError::ModelNameTaken(name) => write!(f, "A model named {} already exists", name),
            JobError::TrainingInProgress(name) => write!(f, "The model {} is being trained right now", name),
            JobError::InvalidEpochCount { requested, min, max } => write!(
                f,
                "The number of epochs must be between {} and {}, got {}",
                min, max, requested
            ),
            JobError::UnknownArtistId(id) => write!(f, "No downloaded lyrics have the id {}", id),
            JobError::ModelNotFound(model) => write!(f, "The model {} was not found", model),
            JobError::InvalidModelName(name) => write!(f, "{:?} is not a valid model name", name),
            JobError::EmptyCorpus => write!(f, "The selected artists have no downloaded lyrics yet"),
            JobError::InvalidSeed(reason) => write!(f, "Invalid start lyrics: {}", reason),
            JobError::ComposeTooLong { requested, max } => write!(
                f,
                "At most {} characters can be composed at once, got {}",
                max, requested
            ),
            JobError::RegistryExhausted(e) => write!(f, "No free job ids: {}", e),
            JobError::Storage(e) => write!(f, "{}", e),
            JobError::Download(e) => write!(f, "{}", e),
            JobError::Vocabulary(e) => write!(f, "{}", e),
            JobError::Training(e) => write!(f, "{}", e),
            JobError::Generation(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobError::RegistryExhausted(e) => Some(e),
            JobError::Storage(e) => Some(e),
            JobError::Download(e) => Some(e),
            JobError::Vocabulary(e) => Some(e),
            JobError::Training(e) => Some(e),
            JobError::Generation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RegistryError> for JobError {
    fn from(err: RegistryError) -> Self {
        JobError::RegistryExhausted(err)
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        JobError::Storage(err)
    }
}

impl From<DownloadError> for JobError {
    fn from(err: DownloadError) -> Self {
        JobError::Download(err)
    }
}

impl From<VocabularyError> for JobError {
    fn from(err: VocabularyError) -> Self {
        JobError::Vocabulary(err)
    }
}

impl From<TrainerError> for JobError {
    fn from(err: TrainerError) -> Self {
        JobError::Training(err)
    }
}

/// Policy knobs for the controller.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub vocab_size: usize,
    /// Placeholders younger than this are treated as work in progress.
    pub new_song_age: Duration,
    pub min_epoch_count: u32,
    pub max_epoch_count: u32,
    pub max_songs: usize,
    pub worker_threads: usize,
    pub job_id_space: u32,
    pub max_compose_length: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            vocab_size: 300,
            new_song_age: Duration::days(1),
            min_epoch_count: 1,
            max_epoch_count: 50,
            max_songs: 100,
            worker_threads: 4,
            job_id_space: crate::jobs::DEFAULT_ID_SPACE,
            max_compose_length: 2000,
        }
    }
}

/// Returned for every accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTicket {
    pub job_id: JobId,
    pub info: String,
}

/// Marks a model as being retrained; released on drop, including during unwinding.
struct RetrainClaim {
    claimed: Arc<Mutex<HashSet<RecordId>>>,
    model_id: RecordId,
}

impl RetrainClaim {
    fn acquire(claimed: &Arc<Mutex<HashSet<RecordId>>>, model_id: &str) -> Option<Self> {
        let mut ids = claimed.lock().unwrap_or_else(|p| p.into_inner());
        if !ids.insert(model_id.to_string()) {
            return None;
        }
        Some(Self {
            claimed: Arc::clone(claimed),
            model_id: model_id.to_string(),
        })
    }
}

impl Drop for RetrainClaim {
    fn drop(&mut self) {
        self.claimed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.model_id);
    }
}

enum Slot {
    Free,
    Complete,
    InProgress,
}

pub struct Controller {
    settings: JobSettings,
    registry: Arc<JobRegistry>,
    repository: Repository,
    lyrics_source: Arc<dyn LyricsSource>,
    trainer: Arc<dyn Trainer>,
    pool: ThreadPool,
    retraining: Arc<Mutex<HashSet<RecordId>>>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("settings", &self.settings)
            .field("tracked_jobs", &self.registry.len())
            .finish()
    }
}

fn rollback<T: Record>(collection: &dyn Collection<T>, placeholder: &T) {
    if let Err(e) = collection.delete(placeholder.id()) {
        error!("Could not remove placeholder {} for {}: {}", placeholder.id(), placeholder.key(), e);
    }
}

impl Controller {
    pub fn new(
        settings: JobSettings,
        repository: Repository,
        lyrics_source: Arc<dyn LyricsSource>,
        trainer: Arc<dyn Trainer>,
    ) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.worker_threads.max(1))
            .thread_name(|i| format!("brapper-worker-{}", i))
            .panic_handler(|_| error!("A worker task panicked outside its job guard"))
            .build()?;
        Ok(Self {
            registry: Arc::new(JobRegistry::with_id_space(settings.job_id_space)),
            settings,
            repository,
            lyrics_source,
            trainer,
            pool,
            retraining: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn poll(&self, job_id: JobId) -> JobStatus {
        info!("Checking job {} state", job_id);
        self.registry.poll(job_id)
    }

    pub fn list_lyrics(&self) -> Result<Vec<ArtistLyricsRecord>, JobError> {
        Ok(self.repository.lyrics.find_all()?)
    }

    pub fn list_models(&self) -> Result<Vec<ModelRecord>, JobError> {
        Ok(self.repository.models.find_all()?)
    }

    /// Queues `task` on the worker pool; its outcome becomes the job's result.
    fn submit<F>(&self, job_id: JobId, description: String, task: F)
    where
        F: FnOnce() -> Result<String, JobError> + Send + 'static,
    {
        info!("Submitting job {}: {}", job_id, description);
        let registry = Arc::clone(&self.registry);
        self.pool.spawn(move || {
            let message = match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(message)) => {
                    info!("Job {} finished: {}", job_id, message);
                    message
                }
                Ok(Err(e)) => {
                    error!("Job {} failed: {}", job_id, e);
                    format!("{} failed: {}", description, e)
                }
                Err(_) => {
                    error!("Job {} panicked", job_id);
                    format!("{} failed: the worker crashed", description)
                }
            };
            registry.complete(job_id, message);
        });
    }

    /// Scans `collection` for records claiming `key`, deleting stale placeholders.
    fn check_slot<T: Record>(&self, collection: &dyn Collection<T>, key: &str) -> Result<Slot, JobError> {
        let now = Utc::now();
        let claims: Vec<T> = collection
            .find_all()?
            .into_iter()
            .filter(|r| r.key() == key)
            .collect();

        if claims.iter().any(|r| !r.is_placeholder()) {
            return Ok(Slot::Complete);
        }
        if claims.iter().any(|r| !r.is_older_than(self.settings.new_song_age, now)) {
            return Ok(Slot::InProgress);
        }
        for stale in &claims {
            warn!(
                "Removing stale placeholder {} for {} created at {}",
                stale.id(),
                key,
                stale.created_at()
            );
            collection.delete(stale.id())?;
        }
        Ok(Slot::Free)
    }

    fn validate_epochs(&self, epochs: u32) -> Result<(), JobError> {
        let (min, max) = (self.settings.min_epoch_count, self.settings.max_epoch_count);
        if epochs < min || epochs > max {
            return Err(JobError::InvalidEpochCount { requested: epochs, min, max });
        }
        Ok(())
    }

    /// Looks up every id, preserving the caller's order. Downloads still in flight are rejected.
    fn resolve_artists(&self, artist_ids: &[String]) -> Result<Vec<ArtistLyricsRecord>, JobError> {
        artist_ids
            .iter()
            .map(|id| {
                let record = self
                    .repository
                    .lyrics
                    .find_by_id(id)?
                    .ok_or_else(|| JobError::UnknownArtistId(id.clone()))?;
                if record.is_placeholder() {
                    return Err(JobError::DownloadInProgress(record.artist));
                }
                Ok(record)
            })
            .collect()
    }

    fn build_corpus(sources: &[ArtistLyricsRecord]) -> Result<String, JobError> {
        let corpus: String = sources.iter().map(|r| r.lyrics.as_str()).collect();
        if corpus.is_empty() {
            return Err(JobError::EmptyCorpus);
        }
        Ok(corpus)
    }

    pub fn download_lyrics(&self, artist_name: &str) -> Result<JobTicket, JobError> {
        info!("Attempting to download lyrics for {}", artist_name);
        let artist = match self.lyrics_source.find_artist(artist_name)? {
            Some(artist) => artist,
            None => {
                info!("Artist {} not found", artist_name);
                return Err(JobError::ArtistNotFound(artist_name.to_string()));
            }
        };

        match self.check_slot(self.repository.lyrics.as_ref(), &artist.name)? {
            Slot::Complete => return Err(JobError::AlreadyDownloaded(artist.name)),
            Slot::InProgress => return Err(JobError::DownloadInProgress(artist.name)),
            Slot::Free => {}
        }

        let job_id = self.registry.allocate()?;
        let info = format!("Downloading lyrics for {}", artist.name);
        let lyrics = Arc::clone(&self.repository.lyrics);
        let source = Arc::clone(&self.lyrics_source);
        let max_songs = self.settings.max_songs;

        self.submit(job_id, info.clone(), move || {
            let mut record = ArtistLyricsRecord::placeholder(&artist.name);
            lyrics.save(&record)?;

            let outcome = (|| -> Result<String, JobError> {
                let batch = source.download_songs(&artist, max_songs)?;
                if batch.song_count == 0 {
                    return Err(DownloadError::Source(format!("no songs found for {}", artist.name)).into());
                }
                info!("Lyrics of {} downloaded ({} songs)", artist.name, batch.song_count);
                record.lyrics = batch.lyrics;
                record.song_count = batch.song_count;
                lyrics.save(&record)?;
                Ok(format!(
                    "{} {} songs saved into the database",
                    record.song_count, artist.name
                ))
            })();

            if outcome.is_err() {
                rollback(lyrics.as_ref(), &record);
            }
            outcome
        });

        Ok(JobTicket { job_id, info })
    }

    pub fn train_new_model(
        &self,
        model_name: &str,
        artist_ids: &[String],
        epochs: u32,
    ) -> Result<JobTicket, JobError> {
        info!("Attempting to train model {} on {} artists", model_name, artist_ids.len());
        self.validate_epochs(epochs)?;
        let sources = self.resolve_artists(artist_ids)?;

        if !is_valid_model_name(model_name) {
            return Err(JobError::InvalidModelName(model_name.to_string()));
        }
        match self.check_slot(self.repository.models.as_ref(), model_name)? {
            Slot::Complete => return Err(JobError::ModelNameTaken(model_name.to_string())),
            Slot::InProgress => return Err(JobError::TrainingInProgress(model_name.to_string())),
            Slot::Free => {}
        }
        let corpus = Self::build_corpus(&sources)?;

        let job_id = self.registry.allocate()?;
        let info = format!("Training model {}", model_name);
        let models = Arc::clone(&self.repository.models);
        let trainer = Arc::clone(&self.trainer);
        let vocab_size = self.settings.vocab_size;
        let name = model_name.to_string();

        self.submit(job_id, info.clone(), move || {
            let placeholder = ModelRecord::placeholder(&name);
            models.save(&placeholder)?;

            let outcome = (|| -> Result<String, JobError> {
                let vocabulary = Vocabulary::build(&corpus, vocab_size)?;
                let encoded = vocabulary.encode(&corpus)?;
                trainer.train(&TrainingRequest {
                    model_name: &name,
                    encoded: &encoded,
                    vocab_size: vocabulary.capacity(),
                    epochs,
                    resume: false,
                })?;
                models.save(&ModelRecord {
                    vocabulary,
                    ..placeholder.clone()
                })?;
                Ok(format!("Model {} trained for {} epochs", name, epochs))
            })();

            if outcome.is_err() {
                rollback(models.as_ref(), &placeholder);
            }
            outcome
        });

        Ok(JobTicket { job_id, info })
    }

    pub fn train_existing_model(
        &self,
        model_id: &str,
        artist_ids: &[String],
        epochs: u32,
    ) -> Result<JobTicket, JobError> {
        info!("Attempting to retrain model {} on {} artists", model_id, artist_ids.len());
        self.validate_epochs(epochs)?;
        let sources = self.resolve_artists(artist_ids)?;

        let model = self
            .repository
            .models
            .find_by_id(model_id)?
            .ok_or_else(|| JobError::ModelNotFound(model_id.to_string()))?;
        if model.is_placeholder() {
            // An abandoned first training left nothing to resume from.
            if model.is_older_than(self.settings.new_song_age, Utc::now()) {
                return Err(JobError::ModelNotFound(model_id.to_string()));
            }
            return Err(JobError::TrainingInProgress(model.name));
        }
        let corpus = Self::build_corpus(&sources)?;

        let claim = match RetrainClaim::acquire(&self.retraining, &model.id) {
            Some(claim) => claim,
            None => return Err(JobError::TrainingInProgress(model.name)),
        };
        let job_id = self.registry.allocate()?;
        let info = format!("Retraining model {}", model.name);
        let models = Arc::clone(&self.repository.models);
        let trainer = Arc::clone(&self.trainer);

        self.submit(job_id, info.clone(), move || {
            let _claim = claim;
            let fresh = Vocabulary::build(&corpus, model.vocabulary.capacity())?;
            let vocabulary = Vocabulary::merge(&model.vocabulary, &fresh)?;
            let encoded = vocabulary.encode(&corpus)?;
            trainer.train(&TrainingRequest {
                model_name: &model.name,
                encoded: &encoded,
                vocab_size: vocabulary.capacity(),
                epochs,
                resume: true,
            })?;
            let message = format!("Model {} retrained for {} epochs", model.name, epochs);
            models.save(&ModelRecord { vocabulary, ..model })?;
            Ok(message)
        });

        Ok(JobTicket { job_id, info })
    }

    /// Starts generating `length` characters after `seed_text` with a trained model.
    pub fn generate(&self, model_name: &str, seed_text: &str, length: usize) -> Result<Generation, JobError> {
        if length > self.settings.max_compose_length {
            return Err(JobError::ComposeTooLong {
                requested: length,
                max: self.settings.max_compose_length,
            });
        }
        let model = self
            .repository
            .models
            .find_all()?
            .into_iter()
            .find(|m| m.name == model_name && !m.is_placeholder())
            .ok_or_else(|| JobError::ModelNotFound(model_name.to_string()))?;
        if seed_text.is_empty() {
            return Err(JobError::InvalidSeed("the start lyrics cannot be empty".to_string()));
        }

        // Seed characters the model never saw take free slots in a transient copy.
        let capacity = model.vocabulary.capacity();
        let vocabulary = Vocabulary::build(seed_text, capacity)
            .and_then(|seed_vocab| Vocabulary::merge(&model.vocabulary, &seed_vocab))
            .map_err(|e| JobError::InvalidSeed(e.to_string()))?;

        let session = self.trainer.open_session(&model.name, capacity)?;
        Generation::new(session, vocabulary, seed_text, length).map_err(JobError::Generation)
    }
}
