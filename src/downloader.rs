//! # Lyrics Sources
//!
//! The controller only needs two things from wherever lyrics come from: resolve a
//! user-typed artist name to its canonical identity, and fetch the text of that
//! artist's songs. [`LyricsSource`] is that seam. [`FsLyricsSource`] serves songs
//! from a local directory tree, one sub-directory per artist and one `.txt` file
//! per song.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Separator placed between consecutive songs in a downloaded batch.
pub const SONG_SEPARATOR: &str = "\n\n";

#[derive(Debug)]
pub enum DownloadError {
    Io(io::Error),
    /// The artist resolved earlier is no longer available at the source.
    ArtistVanished(String),
    Source(String),
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::Io(e) => write!(f, "lyrics I/O error: {}", e),
            DownloadError::ArtistVanished(name) => {
                write!(f, "artist {} is no longer available", name)
            }
            DownloadError::Source(msg) => write!(f, "lyrics source error: {}", msg),
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DownloadError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DownloadError {
    fn from(err: io::Error) -> Self {
        DownloadError::Io(err)
    }
}

/// Canonical identity of an artist at the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtistMatch {
    /// Source-specific handle used to fetch songs.
    pub source_id: String,
    /// Canonical display name; the key lyrics records are stored under.
    pub name: String,
}

/// All fetched songs of one artist joined into a single text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongBatch {
    pub lyrics: String,
    pub song_count: usize,
}

impl SongBatch {
    /// Joins raw song texts, unescaping HTML entities left over from scraping.
    pub fn from_songs<I, S>(songs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let texts: Vec<String> = songs.into_iter().map(|s| unescape_lyrics(s.as_ref())).collect();
        Self {
            song_count: texts.len(),
            lyrics: texts.join(SONG_SEPARATOR),
        }
    }
}

pub fn unescape_lyrics(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}

pub trait LyricsSource: Send + Sync {
    /// Resolves `name` to a canonical artist, `None` when there is no match.
    fn find_artist(&self, name: &str) -> Result<Option<ArtistMatch>, DownloadError>;

    /// Fetches up to `max_songs` songs of `artist`.
    fn download_songs(&self, artist: &ArtistMatch, max_songs: usize) -> Result<SongBatch, DownloadError>;
}

/// Lyrics served from `<root>/<Artist Name>/<song>.txt`.
#[derive(Debug, Clone)]
pub struct FsLyricsSource {
    root: PathBuf,
}

impl FsLyricsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Lowercased alphanumerics only, so "the weeknd" matches "The Weeknd" and "AC/DC" matches "acdc".
fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl LyricsSource for FsLyricsSource {
    fn find_artist(&self, name: &str) -> Result<Option<ArtistMatch>, DownloadError> {
        let wanted = normalize_name(name);
        if wanted.is_empty() {
            return Ok(None);
        }

        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("Lyrics directory {:?} does not exist", self.root);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut candidates = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            if normalize_name(&dir_name) == wanted {
                candidates.push(dir_name);
            }
        }
        // read_dir order is platform dependent; pick deterministically.
        candidates.sort();

        Ok(candidates.into_iter().next().map(|dir_name| ArtistMatch {
            source_id: dir_name.clone(),
            name: dir_name,
        }))
    }

    fn download_songs(&self, artist: &ArtistMatch, max_songs: usize) -> Result<SongBatch, DownloadError> {
        let artist_dir = self.root.join(&artist.source_id);
        if !artist_dir.is_dir() {
            return Err(DownloadError::ArtistVanished(artist.name.clone()));
        }

        let mut song_paths: Vec<PathBuf> = fs::read_dir(&artist_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "txt"))
            .collect();
        song_paths.sort();
        song_paths.truncate(max_songs);

        let songs = song_paths
            .iter()
            .map(fs::read_to_string)
            .collect::<Result<Vec<String>, io::Error>>()?;

        Ok(SongBatch::from_songs(songs))
    }
}
