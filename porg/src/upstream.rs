// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Fetch and verify recipe sources.
//!
//! Sources are tried in recipe order: download (or clone), then
//! checksum, then detached signature. A source failing verification
//! is discarded from the cache with a warning and the next one is
//! tried. Only the cache directory is ever written to.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use fs_err as fs;
use futures_util::StreamExt;
use log::{info, warn};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

use porg_recipe::{Source, SourceKind};

use crate::environment::FILE_READ_BUFFER_SIZE;
use crate::tui::{ProgressBar, ProgressStyle, Styled};
use crate::{request, runtime, util, Installation, Recipe};

/// A fetched and verified source ready for extraction
#[derive(Debug, Clone)]
pub struct Fetched {
    pub kind: SourceKind,
    pub path: PathBuf,
    pub was_cached: bool,
    /// Checksum the source was verified against, if any
    pub checksum: Option<String>,
}

/// Walk the recipe's sources in order until one passes verification
pub fn acquire(recipe: &Recipe, install: &Installation) -> Result<Fetched, Error> {
    if recipe.parsed.sources.is_empty() {
        return Err(Error::NoSources(recipe.name.clone()));
    }

    let _rt = runtime::init();

    for source in &recipe.parsed.sources {
        let name = util::uri_file_name(&source.url);

        let fetched = match fetch(source, install) {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!("source {} failed to fetch: {err}", source.url);
                continue;
            }
        };

        match verify(source, &fetched, install) {
            Ok(_) => {
                let cached = fetched.was_cached.then_some(" (cached)").unwrap_or_default();
                info!("acquired {name}{cached}");
                return Ok(Fetched {
                    checksum: source.checksum.clone(),
                    ..fetched
                });
            }
            Err(err) => {
                warn!("source {} failed verification: {err}", source.url);
                discard(&fetched);
            }
        }
    }

    Err(Error::NoValidSource(recipe.name.clone()))
}

fn fetch(source: &Source, install: &Installation) -> Result<Fetched, Error> {
    match source.kind {
        SourceKind::Vcs => fetch_git(source, install),
        SourceKind::Archive => fetch_archive(source, install),
    }
}

fn fetch_archive(source: &Source, install: &Installation) -> Result<Fetched, Error> {
    let dest = install.sources_dir().join(util::uri_file_name(&source.url));

    if dest.exists() {
        return Ok(Fetched {
            kind: SourceKind::Archive,
            path: dest,
            was_cached: true,
            checksum: None,
        });
    }

    util::ensure_dir_exists(&install.sources_dir())?;

    let partial = dest.with_extension(format!(
        "{}.part",
        dest.extension().and_then(|e| e.to_str()).unwrap_or_default()
    ));

    match source.url.scheme() {
        "file" => {
            let from = PathBuf::from(source.url.path());
            if !from.exists() {
                return Err(Error::MissingLocalFile(from));
            }
            util::hardlink_or_copy(&from, &dest)?;
        }
        "http" | "https" => {
            download(&source.url, &partial)?;
            fs::rename(&partial, &dest)?;
        }
        // The http client has no ftp support; lean on curl like we
        // lean on git
        "ftp" => {
            run_fetch_tool(&source.url, &partial)?;
            fs::rename(&partial, &dest)?;
        }
        other => return Err(Error::UnsupportedScheme(other.to_owned())),
    }

    Ok(Fetched {
        kind: SourceKind::Archive,
        path: dest,
        was_cached: false,
        checksum: None,
    })
}

fn download(url: &Url, dest: &Path) -> Result<(), Error> {
    let pb = ProgressBar::new(u64::MAX).with_message(format!("{} {}", "Downloading".blue(), util::uri_file_name(url).bold()));
    pb.set_style(
        ProgressStyle::with_template(" {spinner} {wide_msg} {binary_bytes_per_sec:>.dim} ")
            .unwrap()
            .tick_chars("--=≡■≡=--"),
    );
    pb.enable_steady_tick(Duration::from_millis(150));

    let result = runtime::block_on(async {
        let mut stream = request::get(url.clone()).await?;

        let mut out = tokio::fs::File::create(dest).await?;

        while let Some(chunk) = stream.next().await {
            let bytes = &chunk?;
            pb.inc(bytes.len() as u64);
            out.write_all(bytes).await?;
        }

        out.flush().await?;

        Ok(()) as Result<(), Error>
    });

    pb.finish_and_clear();

    result
}

fn run_fetch_tool(url: &Url, dest: &Path) -> Result<(), Error> {
    let output = Command::new("curl")
        .args(["--fail", "--location", "--silent", "--show-error", "--output"])
        .arg(dest)
        .arg(url.as_str())
        .output()?;

    if !output.status.success() {
        eprint!("{}", String::from_utf8_lossy(&output.stderr));
        return Err(Error::FetchFailed(url.clone()));
    }

    Ok(())
}

fn fetch_git(source: &Source, install: &Installation) -> Result<Fetched, Error> {
    let dest = install
        .sources_dir()
        .join("git")
        .join(util::uri_relative_path(&source.url));

    if let Some(parent) = dest.parent() {
        util::ensure_dir_exists(parent)?;
    }

    let was_cached = dest.join(".git").exists();

    if was_cached {
        run_git(&["fetch", "--tags"], Some(&dest))?;
        run_git(&["pull", "--ff-only"], Some(&dest)).ok();
    } else {
        let _ = fs::remove_dir_all(&dest);
        run_git(
            &[
                "clone",
                "--depth",
                "1",
                "--",
                source.url.as_str(),
                &dest.display().to_string(),
            ],
            None,
        )?;
    }

    // Success means a populated tree
    if fs::read_dir(&dest).map(|mut dir| dir.next().is_none()).unwrap_or(true) {
        return Err(Error::EmptyClone(source.url.clone()));
    }

    Ok(Fetched {
        kind: SourceKind::Vcs,
        path: dest,
        was_cached,
        checksum: None,
    })
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

fn verify(source: &Source, fetched: &Fetched, install: &Installation) -> Result<(), Error> {
    // Clones carry a ref, not a checksum
    if fetched.kind == SourceKind::Vcs {
        return Ok(());
    }

    if let Some(expected) = &source.checksum {
        let actual = sha256_file(&fetched.path)?;

        if &actual != expected {
            return Err(Error::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }
    }

    if let Some(signature_url) = &source.signature_url {
        verify_signature(signature_url, fetched, install)?;
    }

    Ok(())
}

/// Detached signature check through gpgv against the configured
/// keyring. Without a keyring we can only verify in strict mode by
/// refusing.
fn verify_signature(signature_url: &Url, fetched: &Fetched, install: &Installation) -> Result<(), Error> {
    let strict = install.config.strict_gpg;

    let Some(keyring) = install.config.gpg_keyring.clone() else {
        if strict {
            return Err(Error::NoKeyring);
        }
        warn!("GPG_KEYRING unset, accepting {} unverified", fetched.path.display());
        return Ok(());
    };

    let sig_path = fetched.path.with_extension(format!(
        "{}.sig",
        fetched.path.extension().and_then(|e| e.to_str()).unwrap_or_default()
    ));

    if signature_url.scheme() == "file" {
        util::hardlink_or_copy(&PathBuf::from(signature_url.path()), &sig_path)?;
    } else {
        download(signature_url, &sig_path)?;
    }

    let output = Command::new("gpgv")
        .arg("--keyring")
        .arg(&keyring)
        .arg(&sig_path)
        .arg(&fetched.path)
        .output();

    match output {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => {
            eprint!("{}", String::from_utf8_lossy(&output.stderr));
            Err(Error::SignatureInvalid)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if strict {
                Err(Error::NoVerifier)
            } else {
                warn!("gpgv unavailable, accepting {} unverified", fetched.path.display());
                Ok(())
            }
        }
        Err(err) => Err(Error::Io(err)),
    }
}

fn discard(fetched: &Fetched) {
    let _ = match fetched.kind {
        SourceKind::Archive => fs::remove_file(&fetched.path),
        SourceKind::Vcs => fs::remove_dir_all(&fetched.path),
    };
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = io::BufReader::with_capacity(FILE_READ_BUFFER_SIZE, fs::File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; FILE_READ_BUFFER_SIZE];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("recipe {0} declares no sources")]
    NoSources(String),
    #[error("all sources for {0} were exhausted without a valid artifact")]
    NoValidSource(String),
    #[error("checksum mismatch, expected {expected} got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("signature did not verify")]
    SignatureInvalid,
    #[error("STRICT_GPG is set but GPG_KEYRING is not")]
    NoKeyring,
    #[error("STRICT_GPG is set but gpgv is unavailable")]
    NoVerifier,
    #[error("local file does not exist: {0:?}")]
    MissingLocalFile(PathBuf),
    #[error("unsupported url scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("failed to fetch {0}")]
    FetchFailed(Url),
    #[error("failed to clone {0}")]
    EmptyClone(Url),
    #[error("git command failed")]
    GitFailed,
    #[error("request")]
    Request(#[from] reqwest::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Config;

    fn install_at(root: &Path) -> Installation {
        Installation::open(root, Config::default())
    }

    fn write_recipe(dir: &Path, contents: &str) -> Recipe {
        let file = dir.join("recipe.yml");
        fs::write(&file, contents).unwrap();
        Recipe::load(&file).unwrap()
    }

    #[test]
    fn file_source_with_good_checksum() {
        let temp = tempfile::tempdir().unwrap();
        let install = install_at(temp.path());

        let payload = b"tarball bytes";
        let tarball = temp.path().join("hello-2.12.tar.gz");
        fs::write(&tarball, payload).unwrap();

        let checksum = hex::encode(Sha256::digest(payload));
        let recipe = write_recipe(
            temp.path(),
            &format!("name: hello\nversion: '2.12'\nsource: file://{}\nsha256: {checksum}\n", tarball.display()),
        );

        let fetched = acquire(&recipe, &install).unwrap();
        assert_eq!(fetched.kind, SourceKind::Archive);
        assert!(fetched.path.starts_with(install.sources_dir()));
        assert!(!fetched.was_cached);

        // Second acquire hits the cache
        let again = acquire(&recipe, &install).unwrap();
        assert!(again.was_cached);
    }

    #[test]
    fn bad_first_source_falls_through_to_good_second() {
        let temp = tempfile::tempdir().unwrap();
        let install = install_at(temp.path());

        let payload = b"real contents";
        let good = temp.path().join("pkg-good.tar.gz");
        fs::write(&good, payload).unwrap();
        let bad = temp.path().join("pkg-bad.tar.gz");
        fs::write(&bad, b"tampered").unwrap();

        let checksum = hex::encode(Sha256::digest(payload));
        let recipe = write_recipe(
            temp.path(),
            &format!(
                "name: pkg\nversion: '1'\nsources:\n  - url: file://{}\n    checksum: {checksum}\n  - url: file://{}\n    checksum: {checksum}\n",
                bad.display(),
                good.display()
            ),
        );

        let fetched = acquire(&recipe, &install).unwrap();
        assert!(fetched.path.ends_with("pkg-good.tar.gz"));

        // The rejected download was discarded from the cache
        assert!(!install.sources_dir().join("pkg-bad.tar.gz").exists());
    }

    #[test]
    fn exhausted_sources_error() {
        let temp = tempfile::tempdir().unwrap();
        let install = install_at(temp.path());

        let bad = temp.path().join("pkg.tar.gz");
        fs::write(&bad, b"junk").unwrap();

        let recipe = write_recipe(
            temp.path(),
            &format!("name: pkg\nversion: '1'\nsource: file://{}\nsha256: {}\n", bad.display(), "00".repeat(32)),
        );

        assert!(matches!(acquire(&recipe, &install), Err(Error::NoValidSource(_))));
    }

    #[test]
    fn sha256_matches_known_vector() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("empty");
        fs::write(&path, b"").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
