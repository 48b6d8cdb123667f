use fern::{
    FormatCallback,
    colors::{Color, ColoredLevelConfig},
};
use log::{LevelFilter, Record};
use std::fmt::Arguments;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// Crates whose records pass at the chosen level; everything else stays at `Warn`.
// Rust compiler makes module names use _ instead of -
const OWN_CRATES: [&str; 2] = ["u2init_core", "u2init"];

#[must_use]
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(format!("u2init_{}.log", chrono::Local::now().format("%Y%m%d")))
}

/// Sets up logging to the terminal and to `<log_dir>/u2init_{date}.log`.
pub fn setup_logger(verbose: bool, log_dir: &Path) -> Result<(), fern::InitError> {
    let colors = ColoredLevelConfig::new().info(Color::Green);

    let make_formatter = |use_colors: bool| {
        move |out: FormatCallback, message: &Arguments, record: &Record| {
            out.finish(format_args!(
                "{} {} [{}:{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                if use_colors {
                    format!("{:5}", colors.color(record.level()))
                } else {
                    format!("{:5}", record.level().to_string())
                },
                record.file().unwrap_or("?"),
                record.line().map(|l| l.to_string()).unwrap_or_default(),
                message
            ));
        }
    };

    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let with_own_level = |dispatch: fern::Dispatch| {
        OWN_CRATES
            .iter()
            .fold(dispatch.level(LevelFilter::Warn), |d, name| d.level_for(*name, level))
    };

    fs::create_dir_all(log_dir)?;
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(log_dir))?;

    let file_dispatcher = with_own_level(fern::Dispatch::new().format(make_formatter(false)))
        .chain(log_file);

    // stdout carries command output (`config`, `completions`)
    let terminal_dispatcher = with_own_level(fern::Dispatch::new().format(make_formatter(true)))
        .chain(std::io::stderr());

    fern::Dispatch::new()
        .chain(terminal_dispatcher)
        .chain(file_dispatcher)
        .apply()?;

    Ok(())
}
