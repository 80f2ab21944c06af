// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The installed package database.
//!
//! A single JSON object mapping `"{name}-{version}"` to a record,
//! sorted by key. Every mutation rewrites the whole file through a
//! temp file + rename in the same directory, so readers observe
//! either the previous or the new content and never a torn write.
//! This module is the only code that touches the file.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs_err as fs;
use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util;

pub use self::lockfile::Lock;

pub mod lockfile;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub version: String,
    pub prefix: PathBuf,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Record {
    pub fn key(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// A problem found by [`Database::verify`]
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    pub packages: usize,
    pub disk_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    /// Root the recorded (virtual) prefixes are resolved against
    system_root: PathBuf,
}

impl Database {
    pub fn open(path: impl Into<PathBuf>, system_root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            system_root: system_root.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a recorded prefix to its on-disk location
    pub fn resolve_prefix(&self, prefix: &Path) -> PathBuf {
        self.system_root.join(prefix.strip_prefix("/").unwrap_or(prefix))
    }

    /// Insert a record under `"{name}-{version}"`. Any already
    /// installed version of the same name is replaced in the same
    /// atomic write, so two versions never coexist.
    pub fn register(&self, record: Record) -> Result<(), Error> {
        self.validate_prefix(&record.prefix)?;

        let _lock = self.lock()?;

        let mut records = self.load()?;
        records.retain(|_, existing| existing.name != record.name);
        records.insert(record.key(), record);

        self.store(&records)
    }

    /// Remove every record matching `query`, returning the removed keys
    pub fn unregister(&self, query: &str) -> Result<Vec<String>, Error> {
        let _lock = self.lock()?;

        let mut records = self.load()?;

        let removed = records
            .iter()
            .filter(|(key, record)| matches(key, record, query))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        if removed.is_empty() {
            return Err(Error::NotFound(query.to_owned()));
        }

        records.retain(|key, _| !removed.contains(key));

        self.store(&records)?;

        Ok(removed)
    }

    /// First record matching `query`, by full key, `name-` key prefix
    /// or exact name
    pub fn get(&self, query: &str) -> Result<Record, Error> {
        self.load()?
            .iter()
            .find(|(key, record)| matches(key, record, query))
            .map(|(_, record)| record.clone())
            .ok_or_else(|| Error::NotFound(query.to_owned()))
    }

    pub fn list(&self) -> Result<Vec<Record>, Error> {
        Ok(self.load()?.into_values().collect())
    }

    pub fn is_installed(&self, query: &str) -> bool {
        self.get(query).is_ok()
    }

    /// Copy the current DB aside, returning the backup path
    pub fn backup(&self, dest_dir: Option<&Path>) -> Result<PathBuf, Error> {
        let dir = dest_dir
            .map(Path::to_path_buf)
            .or_else(|| self.path.parent().map(Path::to_path_buf))
            .unwrap_or_default();

        util::ensure_dir_exists(&dir)?;

        let dest = dir.join(format!("installed.json.bak.{}", Utc::now().format("%Y%m%d%H%M%S")));

        if self.path.exists() {
            fs::copy(&self.path, &dest)?;
        } else {
            fs::write(&dest, b"{}")?;
        }

        Ok(dest)
    }

    /// Replace the DB with the contents of `src`, which must decode
    /// as a record map
    pub fn restore(&self, src: &Path) -> Result<(), Error> {
        if !src.exists() {
            return Err(Error::NotFound(src.display().to_string()));
        }

        let contents = fs::read(src)?;
        let records: BTreeMap<String, Record> =
            serde_json::from_slice(&contents).map_err(|err| Error::InvalidFormat(err.to_string()))?;

        let _lock = self.lock()?;
        self.store(&records)
    }

    pub fn stats(&self) -> Result<Stats, Error> {
        let records = self.load()?;

        let mut prefixes = records
            .values()
            .map(|record| self.resolve_prefix(&record.prefix))
            .collect::<Vec<_>>();
        prefixes.sort();
        prefixes.dedup();

        let disk_bytes = prefixes.iter().map(|prefix| util::dir_size(prefix)).sum();

        Ok(Stats {
            packages: records.len(),
            disk_bytes,
        })
    }

    /// Sanity-check every record against the filesystem
    pub fn verify(&self) -> Result<Vec<Issue>, Error> {
        let records = self.load()?;

        let mut issues = vec![];

        for (key, record) in &records {
            let prefix = self.resolve_prefix(&record.prefix);

            if !prefix.exists() {
                issues.push(Issue {
                    key: key.clone(),
                    reason: format!("prefix {} does not exist", record.prefix.display()),
                });
            } else if !prefix.join("bin").is_dir() && !prefix.join("usr/bin").is_dir() {
                issues.push(Issue {
                    key: key.clone(),
                    reason: format!("prefix {} has no bin or usr/bin", record.prefix.display()),
                });
            }
        }

        Ok(issues)
    }

    fn lock(&self) -> Result<Lock, Error> {
        let lock_path = self.path.with_extension("lock");

        if let Some(parent) = lock_path.parent() {
            util::ensure_dir_exists(parent)?;
        }

        Ok(lockfile::acquire(lock_path)?)
    }

    fn load(&self) -> Result<BTreeMap<String, Record>, Error> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(Error::Io(err)),
        };

        serde_json::from_slice(&contents).map_err(|err| Error::Corrupt(err.to_string()))
    }

    /// Write-to-temp-then-rename in the DB directory. A failed write
    /// leaves the previous file intact.
    fn store(&self, records: &BTreeMap<String, Record>) -> Result<(), Error> {
        let serialized = serde_json::to_vec_pretty(records).map_err(|err| Error::InvalidFormat(err.to_string()))?;

        let temp = self.path.with_extension("tmp");
        fs::write(&temp, serialized)?;
        fs::rename(&temp, &self.path)?;

        Ok(())
    }

    /// A prefix is registerable when it is the root itself or a
    /// directory we can create and write to
    fn validate_prefix(&self, prefix: &Path) -> Result<(), Error> {
        if prefix == Path::new("/") {
            return Ok(());
        }

        let resolved = self.resolve_prefix(prefix);

        if !resolved.exists() && fs::create_dir_all(&resolved).is_err() {
            return Err(Error::InvalidPrefix(prefix.to_path_buf()));
        }

        if access(&resolved, AccessFlags::W_OK).is_err() {
            return Err(Error::InvalidPrefix(prefix.to_path_buf()));
        }

        Ok(())
    }
}

/// The partial key rule shared by get, unregister and is_installed
fn matches(key: &str, record: &Record, query: &str) -> bool {
    key == query || key.starts_with(&format!("{query}-")) || record.name == query
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no installed package matches {0:?}")]
    NotFound(String),
    #[error("prefix {0:?} is neither root nor creatable and writable")]
    InvalidPrefix(PathBuf),
    #[error("database is corrupt: {0}")]
    Corrupt(String),
    #[error("invalid database format: {0}")]
    InvalidFormat(String),
    #[error("lock")]
    Lock(#[from] lockfile::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
