use std::{
    fs::{OpenOptions, create_dir_all},
    io,
    path::Path,
};

use env_logger::{Builder, Target};
use log::LevelFilter;

pub fn parse_level(log_level: &str) -> Option<LevelFilter> {
    match log_level.trim().to_lowercase().as_str() {
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        "off" => Some(LevelFilter::Off),
        _ => None,
    }
}

pub fn init_logger(log_level: &str, log_enabled: bool, log_file: &str) -> io::Result<()> {
    let level = parse_level(log_level).unwrap_or_else(|| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        LevelFilter::Info
    });

    let mut builder = Builder::new();
    builder.filter_level(level).format_timestamp_secs();

    // only write to file if enabled
    if log_enabled {
        if let Some(parent) = Path::new(log_file).parent() {
            create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(log_file)?;

        builder.target(Target::Pipe(Box::new(file)));
    }
    // else → default (stderr)

    builder
        .try_init()
        .map_err(|err| io::Error::new(io::ErrorKind::AlreadyExists, err))
}
