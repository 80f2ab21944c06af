// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Streaming encoders and decoders for the artifact formats.

use std::io::{self, Read, Write};

use strum::{Display, EnumString};

/// Artifact compression, chosen by the `PACKAGE_FORMAT` key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Format {
    #[default]
    Zst,
    Xz,
    Gz,
    /// Plain tar, no compression pass
    Tar,
}

impl Format {
    /// File extension of an artifact in this format
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Zst => "tar.zst",
            Format::Xz => "tar.xz",
            Format::Gz => "tar.gz",
            Format::Tar => "tar",
        }
    }

    /// Derive the format from a file name, used when expanding
    /// artifacts produced under a different configuration
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(".tar.zst") {
            Some(Format::Zst)
        } else if name.ends_with(".tar.xz") {
            Some(Format::Xz)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Format::Gz)
        } else if name.ends_with(".tar") {
            Some(Format::Tar)
        } else {
            None
        }
    }

    pub fn encoder<'a>(&self, writer: impl Write + 'a) -> io::Result<Box<dyn Write + 'a>> {
        Ok(match self {
            Format::Zst => Box::new(zstd::Encoder::new(writer, 0)?.auto_finish()),
            Format::Xz => Box::new(xz2::write::XzEncoder::new(writer, 6)),
            Format::Gz => Box::new(flate2::write::GzEncoder::new(writer, flate2::Compression::default())),
            Format::Tar => Box::new(writer),
        })
    }

    pub fn decoder<'a>(&self, reader: impl Read + 'a) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Format::Zst => Box::new(zstd::Decoder::new(reader)?),
            Format::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
            Format::Gz => Box::new(flate2::read::GzDecoder::new(reader)),
            Format::Tar => Box::new(reader),
        })
    }
}
