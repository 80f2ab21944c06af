// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::fmt;
use std::path::{Path, PathBuf};

use log::trace;
use nix::unistd::{access, AccessFlags, Uid};

use crate::Config;

/// System mutability - do we have readwrite?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// We only have readonly access
    ReadOnly,
    /// We have read-write access
    ReadWrite,
}

impl fmt::Display for Mutability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutability::ReadOnly => "read-only".fmt(f),
            Mutability::ReadWrite => "read-write".fmt(f),
        }
    }
}

/// The resolved on-disk layout for one run: target root plus every
/// derived directory. All other modules get their paths from here.
#[derive(Debug, Clone)]
pub struct Installation {
    pub root: PathBuf,
    pub config: Config,
    pub mutability: Mutability,
}

impl Installation {
    pub fn open(root: impl Into<PathBuf>, config: Config) -> Self {
        let root: PathBuf = root.into();

        let mutability = if Uid::effective().is_root() {
            Mutability::ReadWrite
        } else if access(&root, AccessFlags::W_OK).is_ok() {
            Mutability::ReadWrite
        } else {
            Mutability::ReadOnly
        };

        trace!("Mutability: {mutability}");
        trace!("Root dir: {root:?}");

        let this = Self { root, config, mutability };

        if matches!(this.mutability, Mutability::ReadWrite) {
            this.ensure_dirs_exist();
        }

        this
    }

    pub fn read_only(&self) -> bool {
        matches!(self.mutability, Mutability::ReadOnly)
    }

    /// Rebase an absolute path under the target root
    pub fn under_root(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    pub fn db_path(&self) -> PathBuf {
        self.under_root(&self.config.installed_db)
    }

    pub fn ports_dir(&self) -> PathBuf {
        self.under_root(&self.config.ports_dir)
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.under_root(&self.config.cache_dir).join("sources")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.under_root(&self.config.cache_dir).join("artifacts")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.under_root(&self.config.log_dir)
    }

    /// Session / orchestrator state files live next to the DB
    pub fn state_dir(&self) -> PathBuf {
        self.under_root("/var/lib/porg/state")
    }

    /// Per-package build work area
    pub fn work_dir(&self, id: &str) -> PathBuf {
        self.under_root(&self.config.work_dir).join(id)
    }

    /// Per-package staged install tree
    pub fn stage_dir(&self, id: &str) -> PathBuf {
        self.under_root(&self.config.work_dir).join("stage").join(id)
    }

    /// Per-package sandbox rootfs
    pub fn sandbox_root(&self, id: &str) -> PathBuf {
        self.under_root(&self.config.work_dir).join("chroot_root").join(id)
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.under_root("/etc/porg/hooks")
    }

    /// Alternate root that bootstrap / toolchain stages install under
    pub fn bootstrap_root(&self) -> PathBuf {
        self.under_root(&self.config.lfs_root)
    }

    fn ensure_dirs_exist(&self) {
        for dir in [
            self.db_path().parent().map(Path::to_path_buf).unwrap_or_default(),
            self.sources_dir(),
            self.artifacts_dir(),
            self.log_dir(),
            self.state_dir(),
            self.under_root(&self.config.work_dir),
        ] {
            let _ = fs_err::create_dir_all(dir);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn paths_rebase_under_root() {
        let temp = tempfile::tempdir().unwrap();
        let install = Installation::open(temp.path(), Config::default());

        assert!(install.db_path().starts_with(temp.path()));
        assert_eq!(
            install.db_path(),
            temp.path().join("var/lib/porg/db/installed.json")
        );
        assert!(install.stage_dir("hello-2.12").ends_with("stage/hello-2.12"));
    }
}
