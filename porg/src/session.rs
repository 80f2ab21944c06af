// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Resume checkpoints for the orchestrators.
//!
//! One small JSON file per orchestrator, written atomically on state
//! entry and removed on successful completion. `--resume` reads it
//! back and re-enters from the recorded position.

use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionState {
    pub phase_index: usize,
    pub current_package: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Builder step to re-enter from, when the failure was mid-build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl SessionState {
    pub fn new(phase_index: usize, current_package: impl Into<String>) -> Self {
        Self {
            phase_index,
            current_package: current_package.into(),
            timestamp: Utc::now(),
            failure_reason: None,
            step: None,
        }
    }

    pub fn with_step(mut self, step: impl ToString) -> Self {
        self.step = Some(step.to_string());
        self
    }

    pub fn failed(mut self, reason: impl ToString) -> Self {
        self.failure_reason = Some(reason.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> Result<Option<SessionState>, Error> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::Io(err)),
        };

        Ok(Some(serde_json::from_slice(&contents)?))
    }

    /// Atomic write: temp file + rename in the same directory
    pub fn write(&self, state: &SessionState) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            util::ensure_dir_exists(parent)?;
        }

        let serialized = serde_json::to_vec_pretty(state)?;

        let temp = self.path.with_extension("tmp");
        fs::write(&temp, serialized)?;
        fs::rename(&temp, &self.path)?;

        Ok(())
    }

    pub fn clear(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Io(err)),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("decode session state")]
    Decode(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_read_clear_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let file = StateFile::new(temp.path().join("upgrade.json"));

        assert!(file.read().unwrap().is_none());

        let state = SessionState::new(2, "bigpkg").with_step("patch").failed("hook exited 1");
        file.write(&state).unwrap();

        let read = file.read().unwrap().unwrap();
        assert_eq!(read, state);
        assert_eq!(read.step.as_deref(), Some("patch"));

        file.clear().unwrap();
        assert!(!file.exists());
        // Clearing twice is fine
        file.clear().unwrap();
    }
}
