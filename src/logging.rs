use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use simplelog::{Config, ConfigBuilder, LevelFilter, WriteLogger};

/// Map a config string ("debug", "WARN", ...) to a level, defaulting to Info.
#[must_use]
pub fn level_from_str(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::Info)
}

/// Send log output to a file. The host owns stdout/stderr.
pub fn init_file_logger(path: &Path, level: LevelFilter) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {parent:?}"))?;
    }
    let file =
        File::create(path).with_context(|| format!("Failed to create log file {path:?}"))?;
    WriteLogger::init(level, logger_config(), file).context("Logger already initialized")?;
    info!("Logging to {path:?} at {level}");
    Ok(())
}

fn logger_config() -> Config {
    ConfigBuilder::new()
        .set_target_level(LevelFilter::Error)
        .set_thread_level(LevelFilter::Debug)
        .build()
}
