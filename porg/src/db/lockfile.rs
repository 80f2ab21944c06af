// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fs_err::{self as fs, File};
use nix::fcntl::{flock, FlockArg};
use thiserror::Error;

/// How often we retry a held lock before giving up
const MAX_ATTEMPTS: u32 = 50;
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// An acquired advisory lock guaranteeing exclusive write access to
/// the database file.
///
/// Released when all clones are dropped, on every exit path.
#[derive(Debug, Clone)]
#[allow(unused)]
pub struct Lock(Arc<File>);

/// Acquire the advisory lock at `path`, polling a bounded number of
/// times when another process holds it.
pub fn acquire(path: impl Into<PathBuf>) -> Result<Lock, Error> {
    let path = path.into();

    let file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)?;

    for attempt in 0..MAX_ATTEMPTS {
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(_) => return Ok(Lock(Arc::new(file))),
            Err(nix::errno::Errno::EWOULDBLOCK) => {
                if attempt == 0 {
                    log::debug!("database is locked, waiting");
                }
                thread::sleep(RETRY_INTERVAL);
            }
            Err(e) => return Err(Error::Flock(e)),
        }
    }

    Err(Error::Timeout(path))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("obtaining exclusive file lock")]
    Flock(#[source] nix::Error),
    #[error("database still locked after {MAX_ATTEMPTS} attempts: {0:?}")]
    Timeout(PathBuf),
}
