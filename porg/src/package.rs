// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Artifact production: strip pass, tarball assembly, compression,
//! and overlaying an artifact onto a root.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;

use fs_err as fs;
use log::{error, info, warn};
use thiserror::Error;

use crate::compression::Format;
use crate::environment::CRITICAL_PREFIXES;
use crate::tui;
use crate::util;
use crate::{Installation, Recipe};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Walk `stage` and strip every ELF image in place.
///
/// Idempotent: stripping an already stripped binary changes nothing.
/// Returns how many files were stripped.
pub fn strip_tree(stage: &Path) -> Result<usize, Error> {
    let files = util::enumerate_files(stage, |_| true)?;

    let mut stripped = 0;

    for file in files {
        if !is_elf(&file)? {
            continue;
        }

        let status = match Command::new("strip").arg("--strip-unneeded").arg(&file).status() {
            Ok(status) => status,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("strip unavailable, leaving binaries untouched");
                return Ok(stripped);
            }
            Err(err) => return Err(Error::Io(err)),
        };

        if status.success() {
            stripped += 1;
        } else {
            warn!("strip failed on {}", file.display());
        }
    }

    Ok(stripped)
}

fn is_elf(path: &Path) -> Result<bool, Error> {
    let mut magic = [0u8; 4];

    let mut file = fs::File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(_) => Ok(magic == ELF_MAGIC),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(Error::Io(err)),
    }
}

/// Tar the staging root into `{id}.tar`, then compress it per the
/// configured format. The uncompressed tar is removed on success.
pub fn create_artifact(stage: &Path, dest_dir: &Path, id: &str, format: Format) -> Result<PathBuf, Error> {
    util::ensure_dir_exists(dest_dir)?;
    util::ensure_dir_exists(stage)?;

    let tar_path = dest_dir.join(format!("{id}.tar"));

    {
        let file = fs::File::create(&tar_path)?;
        let mut builder = tar::Builder::new(file);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", stage)?;
        builder.finish()?;
    }

    if format == Format::Tar {
        return Ok(tar_path);
    }

    let artifact = dest_dir.join(format!("{id}.{}", format.extension()));

    {
        let mut reader = fs::File::open(&tar_path)?;
        let writer = fs::File::create(&artifact)?;
        let mut encoder = format.encoder(writer)?;
        io::copy(&mut reader, &mut encoder)?;
    }

    fs::remove_file(&tar_path)?;

    Ok(artifact)
}

/// Unpack `artifact` into `dest`, preserving relative paths
pub fn extract_artifact(artifact: &Path, dest: &Path) -> Result<(), Error> {
    let name = artifact.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let format = Format::from_file_name(name).ok_or_else(|| Error::UnknownFormat(artifact.to_path_buf()))?;

    util::ensure_dir_exists(dest)?;

    let reader = fs::File::open(artifact)?;
    let decoder = format.decoder(reader)?;

    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.unpack(dest)?;

    Ok(())
}

/// Number of non-directory entries inside `artifact`
pub fn artifact_entry_count(artifact: &Path) -> Result<usize, Error> {
    let name = artifact.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let format = Format::from_file_name(name).ok_or_else(|| Error::UnknownFormat(artifact.to_path_buf()))?;

    let reader = fs::File::open(artifact)?;
    let decoder = format.decoder(reader)?;

    let mut archive = tar::Archive::new(decoder);

    let mut count = 0;
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Directory {
            count += 1;
        }
    }

    Ok(count)
}

/// Overlay `artifact` onto the target root.
///
/// Requires confirmation (or auto-yes). A trivially empty artifact
/// aimed at a critical prefix is refused outright; a populated one
/// proceeds but is logged loudly.
pub fn expand_to_root(artifact: &Path, recipe: &Recipe, install: &Installation, auto_yes: bool) -> Result<(), Error> {
    let entries = artifact_entry_count(artifact)?;
    let prefix = Path::new(&recipe.parsed.prefix);
    let critical = CRITICAL_PREFIXES.iter().any(|c| prefix == Path::new(c));

    if entries == 0 && critical {
        return Err(Error::EmptyOverlay {
            artifact: artifact.to_path_buf(),
            prefix: prefix.to_path_buf(),
        });
    }

    let question = format!(
        "Expand {} ({entries} file(s)) into {}?",
        recipe.id(),
        install.root.display()
    );
    if !tui::ask_yes_no(&question, auto_yes).map_err(Error::Io)? {
        return Err(Error::Declined);
    }

    if critical {
        error!(
            "expanding {} over critical prefix {} on {}",
            recipe.id(),
            prefix.display(),
            install.root.display()
        );
    }

    extract_artifact(artifact, &install.root)?;

    info!("expanded {} into {}", recipe.id(), install.root.display());

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot determine artifact format of {0:?}")]
    UnknownFormat(PathBuf),
    #[error("refusing to overlay empty artifact {artifact:?} onto critical prefix {prefix:?}")]
    EmptyOverlay { artifact: PathBuf, prefix: PathBuf },
    #[error("expand to root declined")]
    Declined,
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use super::*;

    fn file_set(dir: &Path) -> BTreeSet<PathBuf> {
        util::enumerate_files(dir, |_| true)
            .unwrap()
            .into_iter()
            .map(|p| p.strip_prefix(dir).unwrap().to_path_buf())
            .collect()
    }

    #[test]
    fn package_extract_round_trip_preserves_file_set() {
        let temp = tempfile::tempdir().unwrap();

        let stage = temp.path().join("stage");
        fs::create_dir_all(stage.join("usr/bin")).unwrap();
        fs::write(stage.join("usr/bin/tool"), b"#!/bin/sh\necho hi\n").unwrap();
        fs::create_dir_all(stage.join("usr/share/doc")).unwrap();
        fs::write(stage.join("usr/share/doc/README"), b"docs").unwrap();

        for format in [Format::Zst, Format::Gz, Format::Tar] {
            let artifact = create_artifact(&stage, &temp.path().join("out"), "pkg-1.0", format).unwrap();
            assert!(artifact.exists());
            // Uncompressed intermediate is gone for compressed formats
            if format != Format::Tar {
                assert!(!temp.path().join("out/pkg-1.0.tar").exists());
            }

            let unpacked = temp.path().join(format!("unpack-{format}"));
            extract_artifact(&artifact, &unpacked).unwrap();

            assert_eq!(file_set(&stage), file_set(&unpacked));
            assert_eq!(
                fs::read(stage.join("usr/bin/tool")).unwrap(),
                fs::read(unpacked.join("usr/bin/tool")).unwrap()
            );

            fs::remove_file(&artifact).unwrap();
        }
    }

    #[test]
    fn empty_stage_packages_into_empty_artifact() {
        let temp = tempfile::tempdir().unwrap();

        let stage = temp.path().join("stage");
        fs::create_dir_all(&stage).unwrap();

        let artifact = create_artifact(&stage, &temp.path().join("out"), "empty-0.1", Format::Zst).unwrap();
        assert_eq!(artifact_entry_count(&artifact).unwrap(), 0);
    }

    #[test]
    fn strip_skips_non_elf_and_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();

        let stage = temp.path().join("stage");
        fs::create_dir_all(stage.join("bin")).unwrap();
        fs::write(stage.join("bin/script"), b"#!/bin/sh\n").unwrap();
        fs::write(stage.join("bin/short"), b"ab").unwrap();

        assert_eq!(strip_tree(&stage).unwrap(), 0);

        let before = fs::read(stage.join("bin/script")).unwrap();
        assert_eq!(strip_tree(&stage).unwrap(), 0);
        assert_eq!(fs::read(stage.join("bin/script")).unwrap(), before);
    }

    #[test]
    fn elf_detection_reads_magic() {
        let temp = tempfile::tempdir().unwrap();

        let fake_elf = temp.path().join("lib.so");
        fs::write(&fake_elf, [0x7f, b'E', b'L', b'F', 0, 0]).unwrap();
        assert!(is_elf(&fake_elf).unwrap());

        let text = temp.path().join("notes.txt");
        fs::write(&text, "plain text").unwrap();
        assert!(!is_elf(&text).unwrap());
    }
}
