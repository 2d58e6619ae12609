//! Tracing subscriber setup.

use std::fs::OpenOptions;

use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// filter. With a log file configured, output goes to stdout and the file.
pub fn init_logging(config: &LoggingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| format!("invalid log filter {:?}: {}", config.filter, e))?;

    let (writer, ansi) = match config.file_path() {
        Some(path) => {
            std::fs::create_dir_all(&config.directory)
                .map_err(|e| format!("failed to create {}: {}", config.directory.display(), e))?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
            let file = std::sync::Mutex::new(file);
            (BoxMakeWriter::new(std::io::stdout.and(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| e.to_string())
}
