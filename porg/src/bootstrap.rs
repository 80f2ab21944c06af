// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Bootstrap orchestration: ordered phase execution into the
//! alternate root, with one state file per phase so an interrupted
//! bootstrap picks up at the first phase that has not succeeded.

use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use container::{Container, Isolation};
use fs_err as fs;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::build::{self, Builder};
use crate::db::{lockfile, Database};
use crate::ports;
use crate::{logger, signal, util, Installation};

/// One phase per line, `#` comments. The named recipes carry
/// `stage: toolchain` or `stage: bootstrap` and install under the
/// alternate root.
pub const MANIFEST_NAME: &str = "bootstrap/manifest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Building,
    Success,
    Failed,
}

/// Per-phase state record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub name: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    pub ts: DateTime<Utc>,
}

pub struct Bootstrap<'a> {
    install: &'a Installation,
    db: &'a Database,
    ports: &'a ports::Tree,
    phases: Vec<String>,
    // One bootstrap at a time, process wide
    _lock: lockfile::Lock,
}

impl<'a> Bootstrap<'a> {
    pub fn open(install: &'a Installation, db: &'a Database, ports: &'a ports::Tree) -> Result<Self, Error> {
        let lock_path = install.state_dir().join("bootstrap.lock");
        util::ensure_dir_exists(&install.state_dir())?;
        let lock = lockfile::acquire(lock_path)?;

        let phases = read_manifest(ports)?;

        Ok(Self {
            install,
            db,
            ports,
            phases,
            _lock: lock,
        })
    }

    pub fn phases(&self) -> &[String] {
        &self.phases
    }

    fn state_dir(&self) -> PathBuf {
        self.install.state_dir().join("bootstrap")
    }

    fn state_path(&self, index: usize, name: &str) -> PathBuf {
        self.state_dir().join(format!("{index:02}-{name}.json"))
    }

    pub fn phase_state(&self, index: usize, name: &str) -> Result<Option<PhaseState>, Error> {
        let contents = match fs::read(self.state_path(index, name)) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::Io(err)),
        };

        Ok(Some(serde_json::from_slice(&contents)?))
    }

    fn write_phase_state(&self, index: usize, name: &str, status: Status, extra: Option<String>) -> Result<(), Error> {
        util::ensure_dir_exists(&self.state_dir())?;

        let path = self.state_path(index, name);
        let state = PhaseState {
            name: name.to_owned(),
            status,
            extra,
            ts: Utc::now(),
        };

        let temp = path.with_extension("tmp");
        fs::write(&temp, serde_json::to_vec_pretty(&state)?)?;
        fs::rename(&temp, &path)?;

        Ok(())
    }

    /// Create the bootstrap root and sanity-check the environment
    pub fn prepare(&self) -> Result<(), Error> {
        let root = self.install.bootstrap_root();

        util::ensure_dir_exists(&root)?;
        util::ensure_dir_exists(&root.join(".porg").join("stage"))?;
        util::ensure_dir_exists(&self.state_dir())?;

        info!(
            "bootstrap root {} prepared for target {} (build user {})",
            root.display(),
            self.install.config.lfs_target,
            self.install.config.lfs_user
        );

        Ok(())
    }

    /// Status of every phase, in manifest order
    pub fn verify(&self) -> Result<Vec<(String, Option<PhaseState>)>, Error> {
        self.phases
            .iter()
            .enumerate()
            .map(|(index, name)| Ok((name.clone(), self.phase_state(index, name)?)))
            .collect()
    }

    /// Run all phases from the first non-success. `resume` only skips
    /// phases already marked success; `dry` prints the plan.
    pub fn build(&self, resume: bool, dry: bool) -> Result<(), Error> {
        for (index, name) in self.phases.iter().enumerate() {
            let done = resume
                && self
                    .phase_state(index, name)?
                    .map(|state| state.status == Status::Success)
                    .unwrap_or_default();

            if done {
                info!("phase {name} already built, skipping");
                continue;
            }

            if dry {
                info!("dry-run: would build phase {name}");
                continue;
            }

            if signal::interrupted() {
                return Err(Error::Interrupted);
            }

            self.run_phase(index, name)?;
        }

        Ok(())
    }

    /// Re-run a single phase unconditionally
    pub fn rebuild(&self, phase: &str) -> Result<(), Error> {
        let index = self
            .phases
            .iter()
            .position(|name| name == phase)
            .ok_or_else(|| Error::UnknownPhase(phase.to_owned()))?;

        self.run_phase(index, phase)
    }

    fn run_phase(&self, index: usize, name: &str) -> Result<(), Error> {
        logger::stage(format!("bootstrap phase {name}"));

        self.write_phase_state(index, name, Status::Building, None)?;

        let recipe = self.ports.load(name)?;

        if !recipe.parsed.stage.redirected() {
            warn!("phase {name} recipe is not marked bootstrap or toolchain");
        }

        let builder = Builder::new(recipe, self.install, self.db, build::Options::default());

        match builder.run() {
            Ok(artifact) => {
                let log_ref = logger::session_path()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| artifact.display().to_string());
                self.write_phase_state(index, name, Status::Success, Some(log_ref))?;
                Ok(())
            }
            Err(err) => {
                self.write_phase_state(index, name, Status::Failed, Some(err.to_string()))?;
                Err(Error::PhaseFailed {
                    phase: name.to_owned(),
                    source: Box::new(err),
                })
            }
        }
    }

    /// Drop into a shell inside the bootstrap root
    pub fn enter(&self) -> Result<(), Error> {
        let root = self.install.bootstrap_root();

        Container::new(root, Isolation::detect())
            .hostname("porg-bootstrap")
            .networking(true)
            .work_dir("/")
            .run(|| {
                let mut child = std::process::Command::new("/bin/bash")
                    .arg("--login")
                    .env_clear()
                    .env("HOME", "/root")
                    .env("PATH", "/usr/bin:/usr/sbin:/bin:/sbin")
                    .env("TERM", "xterm-256color")
                    .spawn()?;

                child.wait()?;

                Ok(())
            })?;

        Ok(())
    }

    /// Image generation stays outside the core; delegate to the iso
    /// hook when the site ships one
    pub fn iso(&self) -> Result<(), Error> {
        let hook = self.install.hooks_dir().join("iso");

        if !hook.is_file() {
            return Err(Error::IsoUnsupported);
        }

        let status = std::process::Command::new(&hook)
            .env("LFS", self.install.bootstrap_root())
            .status()?;

        if !status.success() {
            return Err(Error::IsoFailed(status.code().unwrap_or(-1)));
        }

        Ok(())
    }

    /// Forget all phase state
    pub fn clean(&self) -> Result<(), Error> {
        let dir = self.state_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!("bootstrap state cleared");
        Ok(())
    }

    /// prepare + build, the one-shot flow
    pub fn full(&self) -> Result<(), Error> {
        self.prepare()?;
        self.build(true, false)
    }
}

fn read_manifest(ports: &ports::Tree) -> Result<Vec<String>, Error> {
    let path = ports.dir().join(MANIFEST_NAME);

    let contents = fs::read_to_string(&path).map_err(|_| Error::MissingManifest(path.clone()))?;

    let phases = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect::<Vec<_>>();

    if phases.is_empty() {
        return Err(Error::EmptyManifest(path));
    }

    Ok(phases)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bootstrap manifest not found at {0:?}")]
    MissingManifest(PathBuf),
    #[error("bootstrap manifest {0:?} lists no phases")]
    EmptyManifest(PathBuf),
    #[error("unknown bootstrap phase {0:?}")]
    UnknownPhase(String),
    #[error("bootstrap phase {phase} failed")]
    PhaseFailed {
        phase: String,
        #[source]
        source: Box<build::Error>,
    },
    #[error("no iso hook installed, image generation is handled externally")]
    IsoUnsupported,
    #[error("iso hook exited with status {0}")]
    IsoFailed(i32),
    #[error("interrupted")]
    Interrupted,
    #[error("another bootstrap run holds the lock")]
    Lock(#[from] lockfile::Error),
    #[error("ports")]
    Ports(#[from] ports::Error),
    #[error("container")]
    Container(#[from] container::Error),
    #[error("decode phase state")]
    Decode(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;

    struct Fixture {
        temp: tempfile::TempDir,
        install: Installation,
        db: Database,
        ports: ports::Tree,
    }

    fn fixture(phases: &[&str]) -> Fixture {
        let temp = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.lfs_root = "/lfs".into();
        let install = Installation::open(temp.path(), config);
        let db = Database::open(install.db_path(), temp.path());

        let ports_dir = temp.path().join("ports");
        fs::create_dir_all(ports_dir.join("bootstrap")).unwrap();
        fs::write(
            ports_dir.join("bootstrap/manifest"),
            format!("# toolchain phases\n{}\n", phases.join("\n")),
        )
        .unwrap();

        for phase in phases {
            let dir = ports_dir.join("toolchain").join(phase);
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join("package.yml"),
                format!("name: {phase}\nversion: '1'\nstage: toolchain\n"),
            )
            .unwrap();
        }

        Fixture {
            install,
            db,
            ports: ports::Tree::open(ports_dir),
            temp,
        }
    }

    #[test]
    fn manifest_drives_phase_order() {
        let fixture = fixture(&["binutils-pass1", "gcc-pass1"]);

        let bootstrap = Bootstrap::open(&fixture.install, &fixture.db, &fixture.ports).unwrap();
        assert_eq!(bootstrap.phases(), ["binutils-pass1", "gcc-pass1"]);
    }

    #[test]
    fn build_records_success_and_resume_skips() {
        let fixture = fixture(&["binutils-pass1"]);

        let bootstrap = Bootstrap::open(&fixture.install, &fixture.db, &fixture.ports).unwrap();
        bootstrap.prepare().unwrap();
        bootstrap.build(false, false).unwrap();

        let status = bootstrap.verify().unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].1.as_ref().unwrap().status, Status::Success);

        // Toolchain artifacts stage under the alternate root, not
        // the installed DB
        assert!(!fixture.db.is_installed("binutils-pass1"));
        assert!(fixture.temp.path().join("lfs").exists());

        // A resumed build has nothing left to do
        bootstrap.build(true, false).unwrap();
    }

    #[test]
    fn failed_phase_is_recorded() {
        let fixture = fixture(&["broken"]);

        // Sabotage the recipe with a failing hook
        let recipe = fixture.temp.path().join("ports/toolchain/broken/package.yml");
        fs::write(
            &recipe,
            "name: broken\nversion: '1'\nstage: toolchain\nhooks:\n  pre-build:\n    - exit 1\n",
        )
        .unwrap();

        let bootstrap = Bootstrap::open(&fixture.install, &fixture.db, &fixture.ports).unwrap();
        assert!(bootstrap.build(false, false).is_err());

        let status = bootstrap.verify().unwrap();
        assert_eq!(status[0].1.as_ref().unwrap().status, Status::Failed);

        // rebuild re-runs one phase unconditionally
        fs::write(&recipe, "name: broken\nversion: '1'\nstage: toolchain\n").unwrap();
        bootstrap.rebuild("broken").unwrap();
        assert_eq!(bootstrap.verify().unwrap()[0].1.as_ref().unwrap().status, Status::Success);
    }

    #[test]
    fn dry_run_touches_no_state() {
        let fixture = fixture(&["binutils-pass1"]);

        let bootstrap = Bootstrap::open(&fixture.install, &fixture.db, &fixture.ports).unwrap();
        bootstrap.build(false, true).unwrap();

        assert!(bootstrap.verify().unwrap()[0].1.is_none());
    }

    #[test]
    fn unknown_phase_is_rejected() {
        let fixture = fixture(&["binutils-pass1"]);

        let bootstrap = Bootstrap::open(&fixture.install, &fixture.db, &fixture.ports).unwrap();
        assert!(matches!(bootstrap.rebuild("ghost"), Err(Error::UnknownPhase(_))));
    }
}
