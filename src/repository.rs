//! # Record Repository
//!
//! Typed records for downloaded lyrics and trained models, and the narrow
//! [`Collection`] interface the controller persists them through.
//!
//! Two collection backends are provided:
//! - [`MemoryCollection`]: records live in a `RwLock<Vec<_>>`; used by tests and
//!   throwaway runs.
//! - [`JsonFileCollection`]: the whole collection is kept in memory and rewritten
//!   to a single pretty-printed JSON file after every mutation.
//!
//! A record with an empty payload (`song_count == 0`, or an empty vocabulary) is
//! a placeholder claiming a name for work still in flight. Collections enforce no
//! uniqueness, so two near-simultaneous submissions for one name can both pass
//! the controller's scan before either placeholder lands.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::vocabulary::Vocabulary;

pub type RecordId = String;

pub const LYRICS_COLLECTION: &str = "lyrics";
pub const MODELS_COLLECTION: &str = "models";

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "storage I/O error: {}", e),
            StoreError::Json(e) => write!(f, "storage format error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Json(e) => Some(e),
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Json(err)
    }
}

/// Common view over persisted entities, used by the controller's claim checks.
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
    /// Name the record claims (artist name or model name).
    fn key(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    fn is_placeholder(&self) -> bool;

    /// True when the record was created at least `window` ago.
    fn is_older_than(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at()) >= window
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtistLyricsRecord {
    #[serde(rename = "_id")]
    pub id: RecordId,
    pub artist: String,
    pub lyrics: String,
    pub song_count: usize,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
}

impl ArtistLyricsRecord {
    /// Empty record claiming `artist` while its songs download.
    pub fn placeholder(artist: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            artist: artist.to_string(),
            lyrics: String::new(),
            song_count: 0,
            created_at: Utc::now(),
        }
    }
}

impl Record for ArtistLyricsRecord {
    fn id(&self) -> &str {
        &self.id
    }
    fn key(&self) -> &str {
        &self.artist
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn is_placeholder(&self) -> bool {
        self.song_count == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    #[serde(rename = "_id")]
    pub id: RecordId,
    pub name: String,
    pub vocabulary: Vocabulary,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
}

impl ModelRecord {
    /// Record with an empty vocabulary claiming `name` while it trains.
    pub fn placeholder(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            vocabulary: Vocabulary::default(),
            created_at: Utc::now(),
        }
    }
}

impl Record for ModelRecord {
    fn id(&self) -> &str {
        &self.id
    }
    fn key(&self) -> &str {
        &self.name
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn is_placeholder(&self) -> bool {
        self.vocabulary.is_empty()
    }
}

/// Storage for one record type.
pub trait Collection<T: Record>: Send + Sync {
    /// Inserts `record`, replacing any stored record with the same id.
    fn save(&self, record: &T) -> Result<(), StoreError>;
    /// Removes the record with `id`; returns whether one was removed.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;
    fn find_all(&self) -> Result<Vec<T>, StoreError>;
    fn find_by_id(&self, id: &str) -> Result<Option<T>, StoreError>;
}

fn upsert<T: Record>(records: &mut Vec<T>, record: &T) {
    match records.iter_mut().find(|r| r.id() == record.id()) {
        Some(existing) => *existing = record.clone(),
        None => records.push(record.clone()),
    }
}

#[derive(Debug)]
pub struct MemoryCollection<T> {
    records: RwLock<Vec<T>>,
}

impl<T> Default for MemoryCollection<T> {
    fn default() -> Self {
        Self { records: RwLock::new(Vec::new()) }
    }
}

impl<T> MemoryCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: Record> Collection<T> for MemoryCollection<T> {
    fn save(&self, record: &T) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        upsert(&mut records, record);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        let before = records.len();
        records.retain(|r| r.id() != id);
        Ok(records.len() != before)
    }

    fn find_all(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.records.read().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn find_by_id(&self, id: &str) -> Result<Option<T>, StoreError> {
        let records = self.records.read().unwrap_or_else(|p| p.into_inner());
        Ok(records.iter().find(|r| r.id() == id).cloned())
    }
}

/// Collection persisted as a JSON array in a single file.
#[derive(Debug)]
pub struct JsonFileCollection<T> {
    path: PathBuf,
    records: Mutex<Vec<T>>,
}

impl<T: Record + Serialize + DeserializeOwned> JsonFileCollection<T> {
    /// Opens the collection at `path`. A missing or empty file is an empty collection.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = match Self::load(&path) {
            Ok(records) => records,
            Err(StoreError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                log::info!("No collection file at {:?}, starting empty", path);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<Vec<T>, StoreError> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Vec::new());
        }
        let records = serde_json::from_reader(BufReader::new(file))?;
        Ok(records)
    }

    // Written to a sibling temp file first so a crash mid-write leaves the old file intact.
    fn persist(&self, records: &[T]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), records)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<T: Record + Serialize + DeserializeOwned> Collection<T> for JsonFileCollection<T> {
    fn save(&self, record: &T) -> Result<(), StoreError> {
        let mut records = self.lock();
        let mut updated = records.clone();
        upsert(&mut updated, record);
        self.persist(&updated)?;
        *records = updated;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut records = self.lock();
        let updated: Vec<T> = records.iter().filter(|r| r.id() != id).cloned().collect();
        if updated.len() == records.len() {
            return Ok(false);
        }
        self.persist(&updated)?;
        *records = updated;
        Ok(true)
    }

    fn find_all(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.lock().clone())
    }

    fn find_by_id(&self, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self.lock().iter().find(|r| r.id() == id).cloned())
    }
}

/// The two collections the service works with.
#[derive(Clone)]
pub struct Repository {
    pub lyrics: Arc<dyn Collection<ArtistLyricsRecord>>,
    pub models: Arc<dyn Collection<ModelRecord>>,
}

impl Repository {
    pub fn new(
        lyrics: Arc<dyn Collection<ArtistLyricsRecord>>,
        models: Arc<dyn Collection<ModelRecord>>,
    ) -> Self {
        Self { lyrics, models }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryCollection::new()),
            Arc::new(MemoryCollection::new()),
        )
    }

    /// Opens `<dir>/lyrics.json` and `<dir>/models.json`.
    pub fn open_dir(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let lyrics = JsonFileCollection::<ArtistLyricsRecord>::open(
            dir.join(format!("{}.json", LYRICS_COLLECTION)),
        )?;
        let models =
            JsonFileCollection::<ModelRecord>::open(dir.join(format!("{}.json", MODELS_COLLECTION)))?;
        Ok(Self::new(Arc::new(lyrics), Arc::new(models)))
    }
}
