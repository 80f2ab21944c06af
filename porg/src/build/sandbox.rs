// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Script execution inside the build sandbox.
//!
//! The sandbox root carries the extracted source tree at `/<name>`
//! and a writable `/destdir`, with the host toolchain visible through
//! read-only binds. Network access is denied. Because the calling
//! user maps to root inside the user namespace, files created under
//! `DESTDIR` read as root:root without requiring privilege.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{self, Stdio};
use std::thread;

use container::{Container, Isolation};
use fs_err as fs;
use log::warn;
use thiserror::Error;

use crate::tui::Styled;
use crate::util;
use crate::{Installation, Recipe};

/// Read-only host binds giving the guest toolchain visibility
const TOOLCHAIN_BINDS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib64"];

pub struct Sandbox<'a> {
    recipe: &'a Recipe,
    install: &'a Installation,
    rootfs: PathBuf,
    source_root: PathBuf,
    destdir: PathBuf,
}

impl<'a> Sandbox<'a> {
    pub fn new(recipe: &'a Recipe, install: &'a Installation, source_root: PathBuf, destdir: PathBuf) -> io::Result<Self> {
        let rootfs = install.sandbox_root(&recipe.id());
        util::ensure_dir_exists(&rootfs)?;
        util::ensure_dir_exists(&destdir)?;

        Ok(Self {
            recipe,
            install,
            rootfs,
            source_root,
            destdir,
        })
    }

    /// Pick the configured isolation primitive, falling back to
    /// chroot with a warning when namespaces are unavailable
    fn isolation(&self) -> Isolation {
        let configured = self.install.config.chroot_method;

        if configured.available() {
            return configured;
        }

        match configured {
            Isolation::Namespaces => {
                warn!("namespace sandbox unavailable, falling back to privileged chroot");
                Isolation::Chroot
            }
            Isolation::Chroot => configured,
        }
    }

    /// Run one script block to completion inside the sandbox
    pub fn execute(&self, phase: &str, script: &str) -> Result<(), Error> {
        let guest_source = PathBuf::from("/").join(&self.recipe.name);

        let mut container = Container::new(&self.rootfs, self.isolation())
            .hostname("porg")
            .networking(false)
            .work_dir(&guest_source)
            .bind_rw(&self.source_root, &guest_source)
            .bind_rw(&self.destdir, "/destdir");

        for bind in TOOLCHAIN_BINDS.iter().copied() {
            if Path::new(bind).is_dir() {
                container = container.bind_ro(bind, bind);
            }
        }

        let env = [
            ("HOME".to_owned(), guest_source.display().to_string()),
            ("PATH".to_owned(), "/usr/bin:/usr/sbin:/bin:/sbin".to_owned()),
            ("TERM".to_owned(), "xterm-256color".to_owned()),
            ("DESTDIR".to_owned(), "/destdir".to_owned()),
            ("JOBS".to_owned(), self.install.config.jobs.to_string()),
            ("PKG_NAME".to_owned(), self.recipe.name.clone()),
            ("PKG_VERSION".to_owned(), self.recipe.version.clone()),
            ("PKG_PREFIX".to_owned(), self.recipe.parsed.prefix.clone()),
        ];

        let script = script.to_owned();
        let phase_tag = phase.to_owned();

        container
            .run(move || {
                let script_path = "/tmp/script";
                fs::write(script_path, &script)?;

                let result = logged(&phase_tag, "/bin/sh", |command| {
                    command.arg(script_path).env_clear().envs(env.iter().cloned())
                })?;

                if result.success() {
                    Ok(())
                } else {
                    Err(container::Error::Failed(result.code().unwrap_or(-1)))
                }
            })
            .map_err(|err| match err {
                container::Error::Failed(code) => Error::Script {
                    phase: phase.to_owned(),
                    code,
                },
                other => Error::Container(other),
            })
    }
}

/// Spawn `command` with piped output, tagging every line with the
/// phase so interleaved build logs stay readable
fn logged(
    phase: &str,
    command: &str,
    f: impl FnOnce(&mut process::Command) -> &mut process::Command,
) -> Result<process::ExitStatus, io::Error> {
    let mut command = process::Command::new(command);

    f(&mut command);

    let mut child = command.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;

    let stdout_log = log_pipe(phase.to_owned(), child.stdout.take().unwrap());
    let stderr_log = log_pipe(phase.to_owned(), child.stderr.take().unwrap());

    // Forward SIGINT so ^C reaches the build script
    container::forward_sigint(nix::unistd::Pid::from_raw(child.id() as i32)).ok();

    let result = child.wait()?;

    let _ = stdout_log.join();
    let _ = stderr_log.join();

    Ok(result)
}

fn log_pipe<R>(phase: String, pipe: R) -> thread::JoinHandle<()>
where
    R: io::Read + Send + 'static,
{
    use std::io::BufRead;

    thread::spawn(move || {
        let tag = format!("{}{}", "│".dim(), phase.dim());

        let mut lines = io::BufReader::new(pipe).lines();

        while let Some(Ok(line)) = lines.next() {
            println!("{tag} {line}");
        }
    })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{phase} script failed with status code {code}")]
    Script { phase: String, code: i32 },
    #[error("container")]
    Container(#[from] container::Error),
    #[error("io")]
    Io(#[from] io::Error),
}
