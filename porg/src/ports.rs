// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The ports tree: `<ports>/<category>/<name>/*.y{a,}ml` recipe files
//! owned by an external repository. We only read it, except for an
//! explicit `sync`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{info, warn};
use thiserror::Error;

use crate::recipe::{self, Recipe};

#[derive(Debug, Clone)]
pub struct Tree {
    dir: PathBuf,
}

impl Tree {
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Locate the recipe file for `name` anywhere in the tree
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        let patterns = [
            format!("{}/*/{name}/package.yml", self.dir.display()),
            format!("{}/*/{name}/package.yaml", self.dir.display()),
            format!("{}/*/{name}/{name}.yml", self.dir.display()),
            format!("{}/*/{name}/{name}.yaml", self.dir.display()),
            format!("{}/{name}/package.yml", self.dir.display()),
            format!("{}/{name}.yml", self.dir.display()),
        ];

        patterns
            .iter()
            .filter_map(|pattern| glob::glob(pattern).ok())
            .flat_map(|paths| paths.flatten())
            .next()
    }

    /// Load the recipe for `name`, or a recipe file / directory given
    /// directly as a path
    pub fn load(&self, name: &str) -> Result<Recipe, Error> {
        let direct = Path::new(name);
        if direct.exists() && (direct.is_dir() || direct.extension().is_some()) {
            return Ok(Recipe::load(direct)?);
        }

        let path = self.locate(name).ok_or_else(|| Error::MissingRecipe(name.to_owned()))?;

        Ok(Recipe::load(path)?)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.locate(name).is_some()
    }

    /// Every recipe in the tree, covering the same layouts `locate`
    /// accepts. Undecodable files are skipped with a warning rather
    /// than failing the whole enumeration.
    pub fn all(&self) -> Vec<Recipe> {
        let patterns = [
            format!("{}/*/*/*.yml", self.dir.display()),
            format!("{}/*/*/*.yaml", self.dir.display()),
            format!("{}/*/package.yml", self.dir.display()),
            format!("{}/*/package.yaml", self.dir.display()),
            format!("{}/*.yml", self.dir.display()),
            format!("{}/*.yaml", self.dir.display()),
        ];

        let mut paths = patterns
            .iter()
            .filter_map(|pattern| glob::glob(pattern).ok())
            .flat_map(|paths| paths.flatten())
            .collect::<Vec<_>>();
        paths.sort();
        paths.dedup();

        let mut recipes = vec![];

        for path in paths {
            match Recipe::load(&path) {
                Ok(recipe) => recipes.push(recipe),
                Err(err) => warn!("skipping unreadable recipe {}: {err}", path.display()),
            }
        }

        recipes.sort_by(|a, b| a.name.cmp(&b.name));
        recipes
    }

    /// Update the tree from its git remote, cloning on first use
    pub fn sync(&self, repo: Option<&str>, branch: &str) -> Result<(), Error> {
        if self.dir.join(".git").exists() {
            info!("updating ports tree in {}", self.dir.display());
            run_git(&["fetch", "origin", branch], Some(&self.dir))?;
            run_git(&["reset", "--hard", &format!("origin/{branch}")], Some(&self.dir))?;
        } else {
            let repo = repo.ok_or(Error::NoRemote)?;
            info!("cloning ports tree from {repo}");
            crate::util::ensure_dir_exists(&self.dir)?;
            run_git(
                &["clone", "--branch", branch, "--", repo, &self.dir.display().to_string()],
                None,
            )?;
        }

        Ok(())
    }
}

fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<(), Error> {
    let mut command = Command::new("git");

    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command.args(args).output()?;

    if !output.status.success() {
        eprint!("{}", String::from_utf8_lossy(&output.stderr));
        return Err(Error::GitFailed);
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no recipe for {0} in the ports tree")]
    MissingRecipe(String),
    #[error("ports tree has no git checkout and GIT_REPO is unset")]
    NoRemote,
    #[error("git command failed")]
    GitFailed,
    #[error("recipe")]
    Recipe(#[from] recipe::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use fs_err as fs;

    fn write_recipe(dir: &Path, category: &str, name: &str, contents: &str) {
        let package_dir = dir.join(category).join(name);
        fs::create_dir_all(&package_dir).unwrap();
        fs::write(package_dir.join("package.yml"), contents).unwrap();
    }

    #[test]
    fn locate_and_load() {
        let temp = tempfile::tempdir().unwrap();
        write_recipe(temp.path(), "core", "hello", "name: hello\nversion: '2.12'\n");

        let tree = Tree::open(temp.path());
        assert!(tree.contains("hello"));
        assert!(!tree.contains("missing"));

        let recipe = tree.load("hello").unwrap();
        assert_eq!(recipe.id(), "hello-2.12");

        assert!(matches!(tree.load("missing"), Err(Error::MissingRecipe(_))));
    }

    #[test]
    fn all_enumerates_every_layout_locate_accepts() {
        let temp = tempfile::tempdir().unwrap();
        write_recipe(temp.path(), "core", "zsh", "name: zsh\nversion: '5.9'\n");
        write_recipe(temp.path(), "libs", "acl", "name: acl\nversion: '2.3'\n");

        // Flat layouts: <ports>/<name>/package.yml and <ports>/<name>.yml
        let flat_dir = temp.path().join("make");
        fs::create_dir_all(&flat_dir).unwrap();
        fs::write(flat_dir.join("package.yml"), "name: make\nversion: '4.4'\n").unwrap();
        fs::write(temp.path().join("sed.yml"), "name: sed\nversion: '4.9'\n").unwrap();

        let tree = Tree::open(temp.path());

        let names = tree.all().into_iter().map(|r| r.name).collect::<Vec<_>>();
        assert_eq!(names, vec!["acl", "make", "sed", "zsh"]);

        // Everything all() reports is also installable through locate()
        for name in names {
            assert!(tree.contains(&name), "{name} not locatable");
        }
    }
}
