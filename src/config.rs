use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use crate::controller::JobSettings;
use crate::trainer::{DEF_SEQ_LEN, DEF_SMOOTHING};

/// Upper bound for `new_song_age_days`, about a century.
pub const MAX_NEW_SONG_AGE_DAYS: i64 = 36_500;

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, io::Error),
    Json(PathBuf, serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Failed to open config file {}: {}", path.display(), e),
            ConfigError::Json(path, e) => {
                write!(f, "Failed to deserialize JSON from {}: {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(_, e) => Some(e),
            ConfigError::Json(_, e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Prefix every API route is mounted under, e.g. `/api/v1`.
    pub base_path: String,
    /// Holds `lyrics.json`, `models.json` and `checkpoints/`.
    pub data_dir: PathBuf,
    pub lyrics_dir: PathBuf,
    pub worker_threads: usize,
    pub job_id_space: u32,
    pub vocab_size: usize,
    pub new_song_age_days: i64,
    pub min_epoch_count: u32,
    pub max_epoch_count: u32,
    pub max_songs: usize,
    /// Longest text a single compose request may generate.
    pub max_compose_length: usize,
    pub seq_len: usize,
    pub smoothing: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            base_path: "/api/v1".to_string(),
            data_dir: PathBuf::from("./resources"),
            lyrics_dir: PathBuf::from("./resources/lyrics"),
            worker_threads: 4,
            job_id_space: crate::jobs::DEFAULT_ID_SPACE,
            vocab_size: 300,
            new_song_age_days: 1,
            min_epoch_count: 1,
            max_epoch_count: 50,
            max_songs: 100,
            max_compose_length: 2000,
            seq_len: DEF_SEQ_LEN,
            smoothing: DEF_SMOOTHING,
        }
    }
}

impl AppConfig {
    /// Reads a JSON config file; keys it leaves out keep their defaults.
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(config_path).map_err(|e| ConfigError::Io(config_path.to_path_buf(), e))?;
        let config: AppConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| ConfigError::Json(config_path.to_path_buf(), e))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_epoch_count > self.max_epoch_count {
            return Err(ConfigError::Invalid(format!(
                "min_epoch_count {} is greater than max_epoch_count {}",
                self.min_epoch_count, self.max_epoch_count
            )));
        }
        if self.vocab_size == 0 {
            return Err(ConfigError::Invalid("vocab_size must be positive".to_string()));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be positive".to_string()));
        }
        if self.job_id_space == 0 {
            return Err(ConfigError::Invalid("job_id_space must be positive".to_string()));
        }
        if !(0..=MAX_NEW_SONG_AGE_DAYS).contains(&self.new_song_age_days) {
            return Err(ConfigError::Invalid(format!(
                "new_song_age_days must be between 0 and {}, got {}",
                MAX_NEW_SONG_AGE_DAYS, self.new_song_age_days
            )));
        }
        Ok(())
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            vocab_size: self.vocab_size,
            new_song_age: chrono::Duration::days(self.new_song_age_days.clamp(0, MAX_NEW_SONG_AGE_DAYS)),
            min_epoch_count: self.min_epoch_count,
            max_epoch_count: self.max_epoch_count,
            max_songs: self.max_songs,
            worker_threads: self.worker_threads,
            job_id_space: self.job_id_space,
            max_compose_length: self.max_compose_length,
        }
    }
}
