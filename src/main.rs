// src/main.rs
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use env_logger::Env;
use log::{info, LevelFilter};

use brapper::config::{AppConfig, ConfigError};
use brapper::controller::Controller;
use brapper::downloader::FsLyricsSource;
use brapper::repository::{Repository, StoreError};
use brapper::server::routes::run_server;
use brapper::trainer::BigramTrainer;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Lyrics download and lyrics model training service", long_about = None)]
struct CliArgs {
    /// JSON config file; keys it leaves out take their defaults
    #[clap(long, value_parser)]
    config: Option<PathBuf>,
    #[clap(long, value_parser)]
    host: Option<String>,
    #[clap(long, value_parser)]
    port: Option<u16>,
    #[clap(long, value_parser)]
    data_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[clap(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
    /// Decrease verbosity (-q, -qq)
    #[clap(short = 'q', long, action = ArgAction::Count)]
    quiet: u8,
}

#[derive(Debug)]
enum StartupError {
    Config(ConfigError),
    Storage(StoreError),
    WorkerPool(rayon::ThreadPoolBuildError),
    Io(std::io::Error),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "Configuration error: {}", e),
            StartupError::Storage(e) => write!(f, "Could not open the database: {}", e),
            StartupError::WorkerPool(e) => write!(f, "Could not start the worker pool: {}", e),
            StartupError::Io(e) => write!(f, "Server error: {}", e),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupError::Config(e) => Some(e),
            StartupError::Storage(e) => Some(e),
            StartupError::WorkerPool(e) => Some(e),
            StartupError::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for StartupError {
    fn from(err: ConfigError) -> Self {
        StartupError::Config(err)
    }
}

impl From<StoreError> for StartupError {
    fn from(err: StoreError) -> Self {
        StartupError::Storage(err)
    }
}

impl From<rayon::ThreadPoolBuildError> for StartupError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        StartupError::WorkerPool(err)
    }
}

impl From<std::io::Error> for StartupError {
    fn from(err: std::io::Error) -> Self {
        StartupError::Io(err)
    }
}

/// Level forced by -v/-q; `None` leaves the choice to RUST_LOG.
fn level_override(verbose: u8, quiet: u8) -> Option<LevelFilter> {
    match (quiet, verbose) {
        (0, 0) => None,
        (1, _) => Some(LevelFilter::Warn),
        (q, _) if q > 1 => Some(LevelFilter::Error),
        (_, 1) => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    }
}

/// Installs the logger; returns false when one was already installed.
fn init_logging(verbose: u8, quiet: u8) -> bool {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    if let Some(level) = level_override(verbose, quiet) {
        builder.filter_level(level);
    }
    match builder.try_init() {
        Ok(()) => true,
        Err(e) => {
            eprintln!("Could not install the logger: {}", e);
            false
        }
    }
}

fn load_config(args: &CliArgs) -> Result<AppConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn run(args: CliArgs) -> Result<(), StartupError> {
    let config = load_config(&args)?;
    info!("Using data directory {}", config.data_dir.display());

    let repository = Repository::open_dir(&config.data_dir)?;
    let lyrics_source = Arc::new(FsLyricsSource::new(&config.lyrics_dir));
    let trainer = Arc::new(BigramTrainer::new(
        config.checkpoint_dir(),
        config.seq_len,
        config.smoothing,
    ));
    let controller = Controller::new(config.job_settings(), repository, lyrics_source, trainer)?;

    actix_web::rt::System::new().block_on(run_server(&config, controller))?;
    info!("Server stopped");
    Ok(())
}

fn main() {
    let args = CliArgs::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args) {
        eprintln!("Application error: {}", e);
        let mut current_err: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(&e);
        while let Some(source) = current_err {
            eprintln!("Caused by: {}", source);
            current_err = source.source();
        }
        std::process::exit(1);
    }
}
