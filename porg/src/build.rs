// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The build pipeline: a linear state machine from fetched sources
//! to a registered artifact.
//!
//! Each step persists a checkpoint before it runs. A failed or
//! interrupted run leaves the checkpoint behind and `--resume`
//! re-enters at the recorded step, skipping everything already done.

use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;

use chrono::Utc;
use fs_err as fs;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;

use porg_recipe::{Hook, SourceKind, Stage};

use crate::db::{self, Database, Record};
use crate::session::{SessionState, StateFile};
use crate::{logger, package, signal, upstream, util, Installation, Recipe};

pub mod hooks;
pub mod sandbox;

/// Pipeline steps, strictly in execution order. Hook points fire
/// inside their owning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum Step {
    Download,
    Verify,
    Extract,
    Patch,
    Build,
    Install,
    Merge,
    Strip,
    Package,
    Expand,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Downgrade hook failures to warnings, ignore dependents
    pub force: bool,
    /// Answer yes to interactive questions
    pub auto_yes: bool,
    /// Re-enter from a persisted checkpoint when one exists
    pub resume: bool,
    /// Leave DB registration to the caller (the upgrade swap
    /// sequences removal of the old version first)
    pub skip_register: bool,
}

/// Marker describing the source chosen by the download step,
/// persisted in the work dir so later steps and resumes agree
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourceMarker {
    path: PathBuf,
    vcs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

pub struct Builder<'a> {
    pub recipe: Recipe,
    install: &'a Installation,
    db: &'a Database,
    opts: Options,
    state: StateFile,
}

impl<'a> Builder<'a> {
    pub fn new(recipe: Recipe, install: &'a Installation, db: &'a Database, opts: Options) -> Self {
        let state = state_file(install, &recipe.id());

        Self {
            recipe,
            install,
            db,
            opts,
            state,
        }
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.install
            .artifacts_dir()
            .join(self.recipe.artifact_file_name(self.install.config.package_format))
    }

    /// Stage dir honoring the bootstrap / toolchain redirect
    pub fn stage_dir(&self) -> PathBuf {
        if self.recipe.parsed.stage.redirected() {
            self.install
                .bootstrap_root()
                .join(".porg")
                .join("stage")
                .join(self.recipe.id())
        } else {
            self.install.stage_dir(&self.recipe.id())
        }
    }

    fn work_dir(&self) -> PathBuf {
        self.install.work_dir(&self.recipe.id())
    }

    fn src_dir(&self) -> PathBuf {
        self.work_dir().join("src")
    }

    fn destdir(&self) -> PathBuf {
        self.work_dir().join("destdir")
    }

    fn marker_path(&self) -> PathBuf {
        self.work_dir().join(".source")
    }

    /// Run the pipeline to completion and register the result.
    /// Returns the artifact path.
    pub fn run(&self) -> Result<PathBuf, Error> {
        let id = self.recipe.id();
        let start = self.start_step()?;

        if start > Step::Download {
            info!("resuming {id} from {start}");
        }

        util::ensure_dir_exists(&self.work_dir())?;

        for (index, step) in Step::iter().enumerate() {
            if step < start {
                continue;
            }

            if signal::interrupted() {
                self.checkpoint(index, step, Some("interrupted"))?;
                return Err(Error::Interrupted);
            }

            self.checkpoint(index, step, None)?;
            logger::stage(format!("{id} {step}"));

            if let Err(err) = self.execute(step) {
                self.checkpoint(index, step, Some(&err.to_string()))?;
                return Err(err);
            }
        }

        self.state.clear()?;

        if !self.opts.skip_register {
            self.register()?;
        }

        Ok(self.artifact_path())
    }

    fn start_step(&self) -> Result<Step, Error> {
        if !self.opts.resume {
            return Ok(Step::Download);
        }

        let Some(state) = self.state.read()? else {
            return Ok(Step::Download);
        };

        if state.current_package != self.recipe.id() {
            return Ok(Step::Download);
        }

        Ok(state
            .step
            .as_deref()
            .and_then(|step| Step::from_str(step).ok())
            .unwrap_or(Step::Download))
    }

    fn checkpoint(&self, index: usize, step: Step, failure: Option<&str>) -> Result<(), Error> {
        let mut state = SessionState::new(index, self.recipe.id()).with_step(step);
        if let Some(reason) = failure {
            state = state.failed(reason);
        }

        self.state.write(&state)?;
        Ok(())
    }

    fn execute(&self, step: Step) -> Result<(), Error> {
        match step {
            Step::Download => self.download(),
            Step::Verify => self.verify(),
            Step::Extract => self.extract(),
            Step::Patch => self.patch(),
            Step::Build => self.build(),
            Step::Install => self.install_step(),
            Step::Merge => self.merge(),
            Step::Strip => self.strip(),
            Step::Package => self.package_step(),
            Step::Expand => self.expand(),
        }
    }

    fn download(&self) -> Result<(), Error> {
        self.hooks(Hook::PreDownload)?;

        // An empty recipe has nothing to fetch but still packages
        if self.recipe.parsed.sources.is_empty() {
            let _ = fs::remove_file(self.marker_path());
        } else {
            let fetched = upstream::acquire(&self.recipe, self.install)?;

            let marker = SourceMarker {
                path: fetched.path,
                vcs: fetched.kind == SourceKind::Vcs,
                checksum: fetched.checksum,
            };
            fs::write(self.marker_path(), serde_json::to_vec_pretty(&marker)?)?;
        }

        self.hooks(Hook::PostDownload)
    }

    fn marker(&self) -> Result<Option<SourceMarker>, Error> {
        match fs::read(self.marker_path()) {
            Ok(contents) => Ok(Some(serde_json::from_slice(&contents)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::Io(err)),
        }
    }

    fn verify(&self) -> Result<(), Error> {
        let Some(marker) = self.marker()? else {
            return Ok(());
        };

        if !marker.path.exists() {
            return Err(Error::MissingSource(marker.path));
        }

        if let Some(expected) = &marker.checksum {
            if !marker.vcs {
                let actual = upstream::sha256_file(&marker.path)?;
                if &actual != expected {
                    return Err(Error::Upstream(upstream::Error::ChecksumMismatch {
                        expected: expected.clone(),
                        actual,
                    }));
                }
            }
        }

        Ok(())
    }

    fn extract(&self) -> Result<(), Error> {
        let src = self.src_dir();
        util::recreate_dir(&src)?;

        let Some(marker) = self.marker()? else {
            return Ok(());
        };

        if marker.vcs {
            let name = marker.path.file_name().map(PathBuf::from).unwrap_or_else(|| "src".into());
            util::copy_dir(&marker.path, &src.join(name))?;
            return Ok(());
        }

        let file_name = marker.path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

        match archive_format(file_name) {
            Some(format) => {
                let reader = fs::File::open(&marker.path)?;
                let decoder = format.decoder(reader).map_err(|err| Error::ExtractFailed {
                    source_path: marker.path.clone(),
                    err,
                })?;

                let mut archive = tar::Archive::new(decoder);
                archive.set_preserve_permissions(true);
                archive.unpack(&src).map_err(|err| Error::ExtractFailed {
                    source_path: marker.path.clone(),
                    err,
                })?;
            }
            // Not an archive: take the file as-is
            None => {
                fs::copy(&marker.path, src.join(file_name))?;
            }
        }

        Ok(())
    }

    /// The tree build scripts run in: a single extracted top-level
    /// directory when there is exactly one, the extract dir otherwise
    fn source_root(&self) -> Result<PathBuf, Error> {
        let src = self.src_dir();

        let entries = fs::read_dir(&src)?.flatten().collect::<Vec<_>>();

        if entries.len() == 1 {
            let path = entries[0].path();
            if path.is_dir() {
                return Ok(path);
            }
        }

        Ok(src)
    }

    fn patch(&self) -> Result<(), Error> {
        self.hooks(Hook::PrePatch)?;

        let source_root = self.source_root()?;

        for patch in &self.recipe.parsed.patches {
            let path = self.recipe.dir().join(patch);

            if !path.exists() {
                return Err(Error::PatchFailed {
                    patch: patch.clone(),
                    code: None,
                });
            }

            info!("applying {}", patch.display());

            let status = Command::new("patch")
                .args(["-N", "-p1", "-i"])
                .arg(&path)
                .current_dir(&source_root)
                .status()?;

            if !status.success() {
                return Err(Error::PatchFailed {
                    patch: patch.clone(),
                    code: status.code(),
                });
            }
        }

        self.hooks(Hook::PostPatch)
    }

    fn build(&self) -> Result<(), Error> {
        self.hooks(Hook::PreBuild)?;

        if let Some(script) = self.recipe.parsed.build.clone() {
            self.in_sandbox("build", &script)?;
        }

        Ok(())
    }

    fn install_step(&self) -> Result<(), Error> {
        if let Some(script) = self.recipe.parsed.install.clone() {
            self.in_sandbox("install", &script)?;
        }

        self.hooks(Hook::PostBuild)
    }

    fn in_sandbox(&self, phase: &str, script: &str) -> Result<(), Error> {
        let sandbox = sandbox::Sandbox::new(&self.recipe, self.install, self.source_root()?, self.destdir())?;
        sandbox.execute(phase, script)?;
        Ok(())
    }

    fn merge(&self) -> Result<(), Error> {
        let stage = self.stage_dir();

        if let Some(parent) = stage.parent() {
            util::ensure_dir_exists(parent)?;
        }
        if stage.exists() {
            fs::remove_dir_all(&stage)?;
        }

        let destdir = self.destdir();
        util::ensure_dir_exists(&destdir)?;

        // Prefer a cheap rename, fall back to copying across devices
        if fs::rename(&destdir, &stage).is_err() {
            util::copy_dir(&destdir, &stage)?;
        }

        self.hooks(Hook::PostInstall)
    }

    fn strip(&self) -> Result<(), Error> {
        if !self.install.config.strip_binaries {
            return Ok(());
        }

        let stripped = package::strip_tree(&self.stage_dir())?;
        if stripped > 0 {
            info!("stripped {stripped} binaries");
        }

        Ok(())
    }

    fn package_step(&self) -> Result<(), Error> {
        let stage = self.stage_dir();

        if util::enumerate_files(&stage, |_| true)?.is_empty() {
            warn!("staging for {} is empty, packaging an empty artifact", self.recipe.id());
        }

        let artifact = package::create_artifact(
            &stage,
            &self.install.artifacts_dir(),
            &self.recipe.id(),
            self.install.config.package_format,
        )?;

        info!("packaged {}", artifact.display());

        self.hooks(Hook::PostPackage)
    }

    fn expand(&self) -> Result<(), Error> {
        if !self.recipe.parsed.expand_to_root {
            return Ok(());
        }

        self.hooks(Hook::PreExpandRoot)?;

        package::expand_to_root(&self.artifact_path(), &self.recipe, self.install, self.opts.auto_yes)?;

        self.hooks(Hook::PostExpandRoot)
    }

    fn hooks(&self, hook: Hook) -> Result<(), Error> {
        hooks::run(hook, &self.recipe, self.install, self.opts.force)?;
        Ok(())
    }

    /// Record the build in the installed DB. Bootstrap and toolchain
    /// builds live under the alternate root and are tracked by the
    /// bootstrap phase state instead.
    pub fn register(&self) -> Result<(), Error> {
        if self.recipe.parsed.stage != Stage::Normal {
            return Ok(());
        }

        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert(
            "artifact".to_owned(),
            self.recipe.artifact_file_name(self.install.config.package_format),
        );

        self.db.register(Record {
            name: self.recipe.name.clone(),
            version: self.recipe.version.clone(),
            prefix: PathBuf::from(&self.recipe.parsed.prefix),
            installed_at: Utc::now(),
            dependencies: self.recipe.parsed.dependencies.runtime.clone(),
            metadata,
        })?;

        info!("registered {}", self.recipe.id());

        Ok(())
    }
}

pub fn state_file(install: &Installation, id: &str) -> StateFile {
    StateFile::new(install.state_dir().join(format!("build-{id}.json")))
}

fn archive_format(file_name: &str) -> Option<crate::compression::Format> {
    crate::compression::Format::from_file_name(file_name)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cached source vanished: {0:?}")]
    MissingSource(PathBuf),
    #[error("extract {source_path:?}")]
    ExtractFailed {
        source_path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("patch {patch:?} failed{}", .code.map(|c| format!(" with status {c}")).unwrap_or_default())]
    PatchFailed { patch: PathBuf, code: Option<i32> },
    #[error("interrupted")]
    Interrupted,
    #[error("upstream")]
    Upstream(#[from] upstream::Error),
    #[error("sandbox")]
    Sandbox(#[from] sandbox::Error),
    #[error("hook")]
    Hook(#[from] hooks::Error),
    #[error("package")]
    Package(#[from] package::Error),
    #[error("db")]
    Db(#[from] db::Error),
    #[error("session state")]
    Session(#[from] crate::session::Error),
    #[error("decode source marker")]
    Marker(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;

    fn fixture(recipe_yaml: &str) -> (tempfile::TempDir, Installation, Database, Recipe) {
        let temp = tempfile::tempdir().unwrap();
        let install = Installation::open(temp.path(), Config::default());
        let db = Database::open(install.db_path(), temp.path());

        let recipe_path = temp.path().join("pkg.yml");
        fs::write(&recipe_path, recipe_yaml).unwrap();
        let recipe = Recipe::load(&recipe_path).unwrap();

        (temp, install, db, recipe)
    }

    #[test]
    fn step_order_matches_pipeline() {
        let steps = Step::iter().collect::<Vec<_>>();
        assert_eq!(steps.first(), Some(&Step::Download));
        assert_eq!(steps.last(), Some(&Step::Expand));
        assert!(steps.windows(2).all(|w| w[0] < w[1]));

        // Names are stable, they appear in persisted checkpoints
        assert_eq!(Step::Download.to_string(), "download");
        assert_eq!("patch".parse::<Step>().unwrap(), Step::Patch);
    }

    #[test]
    fn empty_recipe_produces_empty_artifact_and_registers() {
        let (_temp, install, db, recipe) = fixture("name: empty\nversion: '0.1'\n");

        let builder = Builder::new(recipe, &install, &db, Options::default());
        let artifact = builder.run().unwrap();

        assert!(artifact.exists());
        assert_eq!(package::artifact_entry_count(&artifact).unwrap(), 0);
        assert!(db.is_installed("empty"));

        // Checkpoint is cleared after success
        assert!(!builder.state.exists());
    }

    #[test]
    fn failed_hook_leaves_resumable_checkpoint() {
        let (_temp, install, db, recipe) = fixture(
            "name: flaky\nversion: '1'\nhooks:\n  pre-build:\n    - exit 1\n",
        );

        let builder = Builder::new(recipe.clone(), &install, &db, Options::default());
        assert!(builder.run().is_err());

        let state = builder.state.read().unwrap().unwrap();
        assert_eq!(state.current_package, "flaky-1");
        assert_eq!(state.step.as_deref(), Some("build"));
        assert!(state.failure_reason.is_some());
        assert!(!db.is_installed("flaky"));

        // Resume with force: hook failure downgrades, pipeline
        // re-enters at build and completes
        let resumed = Builder::new(
            recipe,
            &install,
            &db,
            Options {
                force: true,
                resume: true,
                ..Default::default()
            },
        );
        resumed.run().unwrap();
        assert!(db.is_installed("flaky"));
    }

    #[test]
    fn bootstrap_stage_redirects_staging() {
        let (_temp, install, db, recipe) = fixture("name: gcc-pass1\nversion: '13'\nstage: toolchain\n");

        let builder = Builder::new(recipe, &install, &db, Options::default());
        assert!(builder.stage_dir().starts_with(install.bootstrap_root()));

        // Toolchain builds do not enter the installed DB
        builder.run().unwrap();
        assert!(!db.is_installed("gcc-pass1"));
    }

    #[test]
    fn missing_patch_fails_the_patch_step() {
        let (_temp, install, db, recipe) = fixture("name: pkg\nversion: '1'\npatches:\n  - nonexistent.patch\n");

        let builder = Builder::new(recipe, &install, &db, Options::default());
        assert!(matches!(builder.run(), Err(Error::PatchFailed { .. })));

        let state = builder.state.read().unwrap().unwrap();
        assert_eq!(state.step.as_deref(), Some("patch"));
    }
}
