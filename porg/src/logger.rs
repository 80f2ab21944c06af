// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Session scoped logging.
//!
//! Every run appends UTC timestamped lines to one session file under
//! the log directory, mirrors them to stdout unless quiet, and keeps
//! per-level counters. The sink plugs into the `log` facade so the
//! rest of the codebase just uses `info!` / `warn!` / `error!`.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;

use chrono::Utc;
use fs_err as fs;
use log::{Level, LevelFilter, Log, Metadata, Record};
use thiserror::Error;

use crate::tui::Styled;
use crate::util;

pub mod perf;
pub mod progress;

/// Target used to mark stage transition events
pub const STAGE_TARGET: &str = "porg::stage";

static LOGGER: OnceLock<Arc<Inner>> = OnceLock::new();

#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub debug: u64,
    pub info: u64,
    pub warn: u64,
    pub error: u64,
}

struct Inner {
    level: LevelFilter,
    quiet: bool,
    color: bool,
    session_path: PathBuf,
    file: Mutex<fs::File>,
    json: Option<Mutex<fs::File>>,
    debug: AtomicU64,
    info: AtomicU64,
    warn: AtomicU64,
    error: AtomicU64,
}

/// Install the session logger. Returns the session log path.
pub fn init(
    log_dir: &Path,
    session: &str,
    level: LevelFilter,
    quiet: bool,
    color: bool,
    json_mirror: bool,
) -> Result<PathBuf, Error> {
    util::ensure_dir_exists(log_dir)?;

    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let session_path = log_dir.join(format!("porg-{session}-{stamp}.log"));

    let file = fs::OpenOptions::new().create(true).append(true).open(&session_path)?;

    let json = if json_mirror {
        let json_path = session_path.with_extension("log.json");
        Some(Mutex::new(
            fs::OpenOptions::new().create(true).append(true).open(json_path)?,
        ))
    } else {
        None
    };

    let inner = Arc::new(Inner {
        level,
        quiet,
        color,
        session_path: session_path.clone(),
        file: Mutex::new(file),
        json,
        debug: AtomicU64::new(0),
        info: AtomicU64::new(0),
        warn: AtomicU64::new(0),
        error: AtomicU64::new(0),
    });

    LOGGER.set(inner.clone()).map_err(|_| Error::AlreadyInitialized)?;

    log::set_boxed_logger(Box::new(Facade(inner))).map_err(|_| Error::AlreadyInitialized)?;
    // Stage events ride on Info and must always pass the facade
    log::set_max_level(level.max(LevelFilter::Info));

    Ok(session_path)
}

/// Emit a stage transition, always visible
pub fn stage(message: impl std::fmt::Display) {
    log::info!(target: STAGE_TARGET, "{message}");
}

pub fn counters() -> Counters {
    let Some(inner) = LOGGER.get() else {
        return Counters::default();
    };

    Counters {
        debug: inner.debug.load(Ordering::Relaxed),
        info: inner.info.load(Ordering::Relaxed),
        warn: inner.warn.load(Ordering::Relaxed),
        error: inner.error.load(Ordering::Relaxed),
    }
}

pub fn session_path() -> Option<PathBuf> {
    LOGGER.get().map(|inner| inner.session_path.clone())
}

struct Facade(Arc<Inner>);

impl Log for Facade {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.0.level || metadata.target() == STAGE_TARGET
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        self.0.count(record.level());

        let is_stage = record.target() == STAGE_TARGET;
        let label = if is_stage { "STAGE" } else { record.level().as_str() };
        let message = format!("{}", record.args());

        // One write per line keeps interleaving message-atomic when
        // the file is shared across processes
        let line = format!("{} [{label}] {message}\n", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"));
        if let Ok(mut file) = self.0.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }

        if let Some(json) = &self.0.json {
            let entry = serde_json::json!({
                "ts": Utc::now().to_rfc3339(),
                "level": label,
                "target": record.target(),
                "message": message,
            });
            if let Ok(mut file) = json.lock() {
                let _ = writeln!(file, "{entry}");
            }
        }

        self.0.echo(record.level(), is_stage, &message);
    }

    fn flush(&self) {
        if let Ok(mut file) = self.0.file.lock() {
            let _ = file.flush();
        }
    }
}

impl Inner {
    fn count(&self, level: Level) {
        let counter = match level {
            Level::Error => &self.error,
            Level::Warn => &self.warn,
            Level::Info => &self.info,
            _ => &self.debug,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn echo(&self, level: Level, is_stage: bool, message: &str) {
        // Errors and warnings always reach the terminal
        if self.quiet && level > Level::Warn && !is_stage {
            return;
        }

        let mut out = String::new();

        if self.color {
            let label = if is_stage {
                format!("{}", "==>".blue())
            } else {
                match level {
                    Level::Error => format!("{}", "error:".red()),
                    Level::Warn => format!("{}", "warning:".yellow()),
                    Level::Info => format!("{}", "::".dim()),
                    _ => format!("{}", "debug:".dim()),
                }
            };
            let _ = write!(out, "{label} {message}");
        } else {
            let label = if is_stage { "==>" } else { level.as_str() };
            let _ = write!(out, "{label} {message}");
        }

        if level <= Level::Warn {
            eprintln!("{out}");
        } else {
            println!("{out}");
        }
    }
}

/// Compress session logs older than `days` and delete compressed
/// logs older than twice that
pub fn rotate(log_dir: &Path, days: u64) -> Result<usize, Error> {
    let mut rotated = 0;

    let compress_after = std::time::Duration::from_secs(days * 24 * 60 * 60);
    let delete_after = compress_after * 2;
    let now = SystemTime::now();

    for entry in fs::read_dir(log_dir)?.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let Ok(age) = entry.metadata().and_then(|m| m.modified()).map(|m| now.duration_since(m).unwrap_or_default())
        else {
            continue;
        };

        if name.ends_with(".log.zst") || name.ends_with(".log.json.zst") {
            if age > delete_after {
                fs::remove_file(&path)?;
                rotated += 1;
            }
        } else if (name.ends_with(".log") || name.ends_with(".log.json")) && age > compress_after {
            compress(&path)?;
            fs::remove_file(&path)?;
            rotated += 1;
        }
    }

    Ok(rotated)
}

fn compress(path: &Path) -> Result<(), Error> {
    let mut target_name = path.file_name().unwrap_or_default().to_os_string();
    target_name.push(".zst");

    let mut reader = fs::File::open(path)?;
    let writer = fs::File::create(path.with_file_name(target_name))?;

    let mut encoder = zstd::Encoder::new(writer, 0)?;
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?;

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("logger already initialized")]
    AlreadyInitialized,
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rotate_compresses_old_and_removes_ancient() {
        let temp = tempfile::tempdir().unwrap();

        let old = temp.path().join("porg-install-1.log");
        fs::write(&old, "old session").unwrap();
        let ancient = temp.path().join("porg-install-0.log.zst");
        fs::write(&ancient, "ancient").unwrap();

        // Backdate both beyond the thresholds
        let past = filetime_seconds(40 * 24 * 60 * 60);
        set_mtime(&old, past);
        set_mtime(&ancient, past);

        let rotated = rotate(temp.path(), 14).unwrap();
        assert_eq!(rotated, 2);

        assert!(!old.exists());
        assert!(temp.path().join("porg-install-1.log.zst").exists());
        assert!(!ancient.exists());
    }

    #[test]
    fn rotate_keeps_fresh_logs() {
        let temp = tempfile::tempdir().unwrap();

        let fresh = temp.path().join("porg-upgrade-2.log");
        fs::write(&fresh, "fresh session").unwrap();

        assert_eq!(rotate(temp.path(), 14).unwrap(), 0);
        assert!(fresh.exists());
    }

    fn filetime_seconds(ago: u64) -> std::time::SystemTime {
        SystemTime::now() - std::time::Duration::from_secs(ago)
    }

    fn set_mtime(path: &Path, to: std::time::SystemTime) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.file().set_modified(to).unwrap();
    }
}
