// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;
use thiserror::Error;

use crate::compression::Format;

pub type Parsed = porg_recipe::Recipe;

/// A loaded recipe: the parsed model plus its origin and the
/// resolved identity. Read-only for the duration of a run.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub path: PathBuf,
    pub source: String,
    pub parsed: Parsed,
    pub name: String,
    pub version: String,
}

impl Recipe {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = resolve_path(path)?;
        let source = fs::read_to_string(&path)?;
        let parsed = porg_recipe::from_str(&source)?;

        // Identity falls back to the file name and a zero version
        let name = parsed
            .name
            .clone()
            .unwrap_or_else(|| derived_name(&path));
        let version = parsed.version.clone().unwrap_or_else(|| "0.0.0".to_owned());

        Ok(Self {
            path,
            source,
            parsed,
            name,
            version,
        })
    }

    /// `{name}-{version}`, the identity used for staging dirs,
    /// artifacts and DB keys
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    pub fn artifact_file_name(&self, format: Format) -> String {
        format!("{}.{}", self.id(), format.extension())
    }

    /// Directory the recipe's patch references resolve against
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }
}

pub fn resolve_path(path: impl AsRef<Path>) -> Result<PathBuf, Error> {
    let path = path.as_ref();

    // Resolve dir to dir + package.yml
    let path = if path.is_dir() {
        let yml = path.join("package.yml");
        if yml.exists() {
            yml
        } else {
            path.join("package.yaml")
        }
    } else {
        path.to_path_buf()
    };

    // Ensure it's absolute & exists
    fs::canonicalize(&path).map_err(|_| Error::MissingRecipe(path))
}

fn derived_name(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();

    // `<name>/package.yml` layouts take the directory's name
    if stem == "package" {
        if let Some(dir) = path.parent().and_then(Path::file_name).and_then(|s| s.to_str()) {
            return dir.to_owned();
        }
    }

    stem.to_owned()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("recipe file does not exist: {0:?}")]
    MissingRecipe(PathBuf),
    #[error("load recipe")]
    Load(#[from] io::Error),
    #[error("decode recipe")]
    Decode(#[from] porg_recipe::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identity_defaults_from_file_name() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("hello");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("package.yml"), "build: |\n  make\n").unwrap();

        let recipe = Recipe::load(&dir).unwrap();
        assert_eq!(recipe.name, "hello");
        assert_eq!(recipe.version, "0.0.0");
        assert_eq!(recipe.id(), "hello-0.0.0");
    }

    #[test]
    fn artifact_names_follow_format() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("zlib.yml");
        fs::write(&file, "name: zlib\nversion: 1.3.1\n").unwrap();

        let recipe = Recipe::load(&file).unwrap();
        assert_eq!(recipe.artifact_file_name(Format::Zst), "zlib-1.3.1.tar.zst");
        assert_eq!(recipe.artifact_file_name(Format::Tar), "zlib-1.3.1.tar");
    }

    #[test]
    fn missing_recipe_is_reported() {
        assert!(matches!(
            Recipe::load("/nonexistent/thing.yml"),
            Err(Error::MissingRecipe(_))
        ));
    }
}
