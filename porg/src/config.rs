// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! `porg.conf` handling: flat KEY=VALUE lines, `#` comments.
//!
//! Unrecognized keys are carried along untouched so site-local
//! tooling can stash its own settings in the same file.

use std::collections::BTreeMap;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use container::Isolation;
use fs_err as fs;
use log::LevelFilter;
use thiserror::Error;

use crate::compression::Format;
use crate::util;

pub const DEFAULT_PATH: &str = "/etc/porg/porg.conf";

#[derive(Debug, Clone)]
pub struct Config {
    pub ports_dir: PathBuf,
    pub work_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: LevelFilter,
    pub log_color: bool,
    pub log_json: bool,
    pub log_rotate_days: u64,
    pub installed_db: PathBuf,
    pub jobs: NonZeroUsize,
    pub chroot_method: Isolation,
    pub package_format: Format,
    pub strip_binaries: bool,
    pub strict_gpg: bool,
    pub gpg_keyring: Option<PathBuf>,
    pub parallel_n: NonZeroUsize,
    pub lfs_root: PathBuf,
    pub lfs_user: String,
    pub lfs_target: String,
    pub git_repo: Option<String>,
    pub git_branch: String,
    /// Keys we do not interpret, preserved verbatim
    pub extra: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports_dir: "/usr/ports".into(),
            work_dir: "/var/tmp/porg".into(),
            cache_dir: "/var/cache/porg".into(),
            log_dir: "/var/log/porg".into(),
            log_level: LevelFilter::Info,
            log_color: true,
            log_json: false,
            log_rotate_days: 14,
            installed_db: "/var/lib/porg/db/installed.json".into(),
            jobs: util::num_cpus(),
            chroot_method: Isolation::detect(),
            package_format: Format::default(),
            strip_binaries: true,
            strict_gpg: false,
            gpg_keyring: None,
            parallel_n: NonZeroUsize::new(1).unwrap(),
            lfs_root: "/mnt/lfs".into(),
            lfs_user: "lfs".to_owned(),
            lfs_target: "x86_64-lfs-linux-gnu".to_owned(),
            git_repo: None,
            git_branch: "master".to_owned(),
            extra: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load `path` over the defaults. A missing file is not an error,
    /// the defaults stand.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut config = Config::default();

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(config),
            Err(err) => return Err(Error::Io(err)),
        };

        config.apply(&contents)?;

        Ok(config)
    }

    fn apply(&mut self, contents: &str) -> Result<(), Error> {
        for (i, line) in contents.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Malformed {
                    line: i + 1,
                    content: line.to_owned(),
                });
            };

            let key = key.trim();
            let value = value.trim().trim_matches('"');

            self.set(key, value).map_err(|reason| Error::InvalidValue {
                key: key.to_owned(),
                value: value.to_owned(),
                reason,
            })?;
        }

        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "PORTS_DIR" => self.ports_dir = value.into(),
            "WORKDIR" => self.work_dir = value.into(),
            "CACHE_DIR" => self.cache_dir = value.into(),
            "LOG_DIR" => self.log_dir = value.into(),
            "LOG_LEVEL" => self.log_level = parse_level(value)?,
            "LOG_COLOR" => self.log_color = parse_bool(value)?,
            "LOG_JSON" => self.log_json = parse_bool(value)?,
            "LOG_ROTATE_DAYS" => self.log_rotate_days = value.parse().map_err(|_| "expected a day count".to_owned())?,
            "INSTALLED_DB" => self.installed_db = value.into(),
            "JOBS" => self.jobs = parse_jobs(value)?,
            "CHROOT_METHOD" => self.chroot_method = value.parse().map_err(|_| "expected sandbox or chroot".to_owned())?,
            "PACKAGE_FORMAT" => {
                self.package_format = value.parse().map_err(|_| "expected zst, xz, gz or tar".to_owned())?;
            }
            "STRIP_BINARIES" => self.strip_binaries = parse_bool(value)?,
            "STRICT_GPG" => self.strict_gpg = parse_bool(value)?,
            "GPG_KEYRING" => self.gpg_keyring = Some(value.into()),
            "PARALLEL_N" => self.parallel_n = parse_jobs(value)?,
            "LFS" => self.lfs_root = value.into(),
            "LFS_USER" => self.lfs_user = value.to_owned(),
            "LFS_TGT" => self.lfs_target = value.to_owned(),
            "GIT_REPO" => self.git_repo = Some(value.to_owned()),
            "GIT_BRANCH" => self.git_branch = value.to_owned(),
            _ => {
                self.extra.insert(key.to_owned(), value.to_owned());
            }
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err("expected a boolean".to_owned()),
    }
}

fn parse_level(value: &str) -> Result<LevelFilter, String> {
    match value.to_lowercase().as_str() {
        "debug" => Ok(LevelFilter::Debug),
        "info" | "stage" => Ok(LevelFilter::Info),
        "warn" | "warning" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        _ => Err("expected debug, info, warn or error".to_owned()),
    }
}

fn parse_jobs(value: &str) -> Result<NonZeroUsize, String> {
    // 0 means all available processors
    match value.parse::<usize>() {
        Ok(0) => Ok(util::num_cpus()),
        Ok(n) => Ok(NonZeroUsize::new(n).unwrap()),
        Err(_) => Err("expected a count".to_owned()),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed config line {line}: {content:?}")]
    Malformed { line: usize, content: String },
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue { key: String, value: String, reason: String },
    #[error("io")]
    Io(#[from] io::Error),
}
