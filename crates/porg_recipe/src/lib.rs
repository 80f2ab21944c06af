// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub use self::hook::Hook;
pub use self::source::{Source, SourceKind};

mod hook;
mod source;

/// Decode a recipe document.
///
/// Single-source conveniences (`source:` + `sha256:` / `gpg:`) are folded
/// into the `sources` list so callers only ever see the list form.
pub fn from_str(input: &str) -> Result<Recipe, Error> {
    let mut recipe: Recipe = serde_yaml::from_str(input).map_err(|err| Error::Parse {
        line: err.location().map(|l| l.line()).unwrap_or_default(),
        column: err.location().map(|l| l.column()).unwrap_or_default(),
        reason: err.to_string(),
    })?;

    recipe.fold_convenience_source()?;

    Ok(recipe)
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub expand_to_root: bool,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default, deserialize_with = "single_as_sequence")]
    pub patches: Vec<PathBuf>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub install: Option<String>,
    #[serde(default)]
    pub dependencies: Dependencies,
    #[serde(default)]
    pub hooks: BTreeMap<Hook, Vec<String>>,

    // Single-source convenience keys, folded into `sources`
    #[serde(default)]
    source: Option<String>,
    #[serde(default, alias = "checksum")]
    sha256: Option<String>,
    #[serde(default, alias = "signature")]
    gpg: Option<Url>,

    /// Unrecognized keys are retained as opaque metadata, never an error
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Recipe {
    fn fold_convenience_source(&mut self) -> Result<(), Error> {
        if let Some(raw) = self.source.take() {
            let source = Source::parse(&raw, self.sha256.take(), self.gpg.take())
                .map_err(|err| Error::InvalidSource(raw, err))?;
            self.sources.insert(0, source);
        }

        Ok(())
    }
}

/// Which root the staged install is redirected to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Normal,
    Bootstrap,
    Toolchain,
}

impl Stage {
    /// Bootstrap and toolchain builds stage under the alternate root
    pub fn redirected(&self) -> bool {
        !matches!(self, Stage::Normal)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dependencies {
    #[serde(default, deserialize_with = "single_as_sequence")]
    pub build: Vec<String>,
    #[serde(default, deserialize_with = "single_as_sequence")]
    pub runtime: Vec<String>,
    #[serde(default, deserialize_with = "single_as_sequence")]
    pub optional: Vec<String>,
}

impl Dependencies {
    /// build ∪ runtime, the edge set used for build ordering
    pub fn for_build(&self) -> impl Iterator<Item = &str> {
        self.build.iter().chain(self.runtime.iter()).map(String::as_str)
    }
}

fn default_prefix() -> String {
    "/usr".to_owned()
}

/// Deserialize a single value or sequence of values as a vec
fn single_as_sequence<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: serde::Deserialize<'de>,
    D: serde::de::Deserializer<'de>,
{
    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    enum Value<T> {
        Single(T),
        Sequence(Vec<T>),
    }

    match Value::deserialize(deserializer)? {
        Value::Single(value) => Ok(vec![value]),
        Value::Sequence(sequence) => Ok(sequence),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error at line {line}, column {column}: {reason}")]
    Parse { line: usize, column: usize, reason: String },
    #[error("invalid source {0:?}")]
    InvalidSource(String, #[source] source::ParseError),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_full_recipe() {
        let input = r#"
name: hello
version: "2.12"
sources:
  - url: https://example.org/hello-2.12.tar.gz
    checksum: aabbcc
  - url: git|https://example.org/hello.git
patches:
  - fix-musl.patch
build: |
  ./configure --prefix=/usr
  make
install: |
  make DESTDIR=$DESTDIR install
dependencies:
  build:
    - gmp
  runtime:
    - libc
hooks:
  post-install:
    - ldconfig
maintainer: nobody@example.org
"#;

        let recipe = from_str(input).unwrap();

        assert_eq!(recipe.name.as_deref(), Some("hello"));
        assert_eq!(recipe.version.as_deref(), Some("2.12"));
        assert_eq!(recipe.stage, Stage::Normal);
        assert_eq!(recipe.prefix, "/usr");
        assert_eq!(recipe.sources.len(), 2);
        assert_eq!(recipe.sources[0].checksum.as_deref(), Some("aabbcc"));
        assert_eq!(recipe.sources[1].kind, SourceKind::Vcs);
        assert_eq!(recipe.patches, vec![PathBuf::from("fix-musl.patch")]);
        assert!(recipe.build.as_deref().unwrap().contains("./configure --prefix=/usr\n"));
        assert_eq!(recipe.dependencies.build, vec!["gmp"]);
        assert_eq!(recipe.hooks[&Hook::PostInstall], vec!["ldconfig"]);
        // Unknown keys are preserved, not rejected
        assert!(recipe.extra.contains_key("maintainer"));
    }

    #[test]
    fn fold_single_source_convenience() {
        let input = r#"
name: zlib
version: 1.3.1
source: https://example.org/zlib-1.3.1.tar.xz
sha256: ddff
"#;

        let recipe = from_str(input).unwrap();

        assert_eq!(recipe.sources.len(), 1);
        assert_eq!(recipe.sources[0].kind, SourceKind::Archive);
        assert_eq!(recipe.sources[0].checksum.as_deref(), Some("ddff"));
    }

    #[test]
    fn folded_scalar_collapses_newlines() {
        let input = "name: x\nversion: '1'\nbuild: >\n  a\n  b\n";

        let recipe = from_str(input).unwrap();
        assert_eq!(recipe.build.as_deref(), Some("a b\n"));
    }

    #[test]
    fn parse_error_carries_location() {
        let err = from_str("name: [unclosed").unwrap_err();

        let Error::Parse { line, .. } = err else {
            panic!("expected parse error");
        };
        assert!(line >= 1);
    }

    #[test]
    fn bootstrap_stage_redirects() {
        let recipe = from_str("name: gcc-pass1\nversion: '13.2'\nstage: toolchain\n").unwrap();
        assert!(recipe.stage.redirected());
    }
}
