// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Hook execution.
//!
//! Each hook point runs the executable files from the global hooks
//! directory first, then the recipe's own commands, in order. Hooks
//! see the package identity through the documented environment.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use fs_err as fs;
use log::{debug, warn};
use thiserror::Error;

use porg_recipe::Hook;

use crate::{Installation, Recipe};

/// Environment handed to every hook and build command
pub fn package_env(recipe: &Recipe, install: &Installation) -> Vec<(String, String)> {
    vec![
        ("PKG_NAME".to_owned(), recipe.name.clone()),
        ("PKG_VERSION".to_owned(), recipe.version.clone()),
        ("PKG_PREFIX".to_owned(), recipe.parsed.prefix.clone()),
        ("JOBS".to_owned(), install.config.jobs.to_string()),
        (
            "DESTDIR".to_owned(),
            install.stage_dir(&recipe.id()).display().to_string(),
        ),
    ]
}

/// Run every hook registered for `hook`. A failing hook aborts the
/// current state unless `force` downgrades it to a warning.
pub fn run(hook: Hook, recipe: &Recipe, install: &Installation, force: bool) -> Result<(), Error> {
    let lines = recipe.parsed.hooks.get(&hook).cloned().unwrap_or_default();
    execute(hook, package_env(recipe, install), &lines, install, force)
}

/// Removal-time variant: the recipe may be gone from the ports tree,
/// so the environment comes from the installed record
pub fn run_for_record(
    hook: Hook,
    record: &crate::db::Record,
    recipe: Option<&Recipe>,
    install: &Installation,
    force: bool,
) -> Result<(), Error> {
    let env = vec![
        ("PKG_NAME".to_owned(), record.name.clone()),
        ("PKG_VERSION".to_owned(), record.version.clone()),
        ("PKG_PREFIX".to_owned(), record.prefix.display().to_string()),
        ("JOBS".to_owned(), install.config.jobs.to_string()),
    ];

    let lines = recipe
        .and_then(|recipe| recipe.parsed.hooks.get(&hook).cloned())
        .unwrap_or_default();

    execute(hook, env, &lines, install, force)
}

fn execute(
    hook: Hook,
    env: Vec<(String, String)>,
    recipe_lines: &[String],
    install: &Installation,
    force: bool,
) -> Result<(), Error> {
    let mut commands: Vec<(String, Command)> = vec![];

    for path in global_hooks(&install.hooks_dir().join(hook.to_string()))? {
        let label = path.display().to_string();
        let mut command = Command::new(&path);
        command.env("PORG_HOOK", hook.to_string());
        commands.push((label, command));
    }

    for line in recipe_lines {
        let mut command = Command::new("/bin/sh");
        command.args(["-c", line]);
        commands.push((line.clone(), command));
    }

    if commands.is_empty() {
        return Ok(());
    }

    debug!("running {} {hook} hook(s)", commands.len());

    for (label, mut command) in commands {
        command.envs(env.iter().cloned()).current_dir(install.root.as_path());

        let status = command.status().map_err(|err| Error::Spawn(label.clone(), err))?;

        if !status.success() {
            let code = status.code().unwrap_or(-1);

            if force {
                warn!("{hook} hook {label:?} exited {code}, continuing (force)");
            } else {
                return Err(Error::HookFailed {
                    hook,
                    command: label,
                    code,
                });
            }
        }
    }

    Ok(())
}

/// Executable entries of the global hook directory, sorted by name
fn global_hooks(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(Error::Io(err)),
    };

    let mut paths = vec![];

    for entry in read_dir.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };

        // Executable bit = eligible
        if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
            paths.push(path);
        }
    }

    paths.sort();
    Ok(paths)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{hook} hook {command:?} exited with status {code}")]
    HookFailed { hook: Hook, command: String, code: i32 },
    #[error("spawn hook {0:?}")]
    Spawn(String, #[source] io::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;

    fn fixture(hook_line: &str) -> (tempfile::TempDir, Installation, Recipe) {
        let temp = tempfile::tempdir().unwrap();
        let install = Installation::open(temp.path(), Config::default());

        let recipe_path = temp.path().join("pkg.yml");
        fs::write(
            &recipe_path,
            format!("name: pkg\nversion: '1'\nhooks:\n  post-install:\n    - {hook_line}\n"),
        )
        .unwrap();
        let recipe = Recipe::load(&recipe_path).unwrap();

        (temp, install, recipe)
    }

    #[test]
    fn recipe_hook_sees_package_env() {
        let (temp, install, recipe) = fixture("echo $PKG_NAME-$PKG_VERSION > $OUT");

        let out = temp.path().join("out");
        std::env::set_var("OUT", &out);

        run(Hook::PostInstall, &recipe, &install, false).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "pkg-1");
    }

    #[test]
    fn failing_hook_aborts_unless_forced() {
        let (_temp, install, recipe) = fixture("exit 7");

        let err = run(Hook::PostInstall, &recipe, &install, false).unwrap_err();
        assert!(matches!(err, Error::HookFailed { code: 7, .. }));

        // Forced runs downgrade to a warning
        run(Hook::PostInstall, &recipe, &install, true).unwrap();
    }

    #[test]
    fn unregistered_hooks_are_noops() {
        let (_temp, install, recipe) = fixture("exit 1");
        run(Hook::PreRemove, &recipe, &install, false).unwrap();
    }
}
