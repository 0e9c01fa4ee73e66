//! Lyrics download and character-level lyrics model training behind a job-polling HTTP API.

pub mod config;
pub mod controller;
pub mod downloader;
pub mod jobs;
pub mod repository;
pub mod server;
pub mod text_generator;
pub mod trainer;
pub mod vocabulary;
