// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// One fetchable origin for a recipe's upstream code.
///
/// Sources are attempted in list order until one downloads and
/// verifies; later entries are mirrors or fallbacks.
#[derive(Debug, Clone)]
pub struct Source {
    pub url: Url,
    pub kind: SourceKind,
    pub checksum: Option<String>,
    pub signature_url: Option<Url>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A downloadable file (http, https, ftp or file scheme)
    Archive,
    /// A git-like repository, cloned rather than downloaded
    Vcs,
}

impl Source {
    /// Parse the scalar URL form. `git|URL` and a `vcs+` scheme prefix
    /// both mark a VCS source.
    pub fn parse(raw: &str, checksum: Option<String>, signature_url: Option<Url>) -> Result<Self, ParseError> {
        let (kind, rest) = if let Some((_, rest)) = raw.split_once("git|") {
            (SourceKind::Vcs, rest)
        } else if let Some(rest) = raw.strip_prefix("vcs+") {
            (SourceKind::Vcs, rest)
        } else {
            (SourceKind::Archive, raw)
        };

        let url: Url = rest.parse()?;

        let kind = if kind == SourceKind::Vcs || url.scheme() == "git" {
            SourceKind::Vcs
        } else {
            SourceKind::Archive
        };

        Ok(Self {
            url,
            kind,
            checksum,
            signature_url,
        })
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Debug, Deserialize)]
        #[serde(untagged)]
        enum Outer {
            // `- https://...` shorthand
            Scalar(String),
            // `- url: https://...` with optional fields
            Map {
                url: String,
                #[serde(default, alias = "sha256")]
                checksum: Option<String>,
                #[serde(default, alias = "gpg")]
                signature_url: Option<Url>,
            },
        }

        let (raw, checksum, signature_url) = match Outer::deserialize(deserializer)? {
            Outer::Scalar(raw) => (raw, None, None),
            Outer::Map {
                url,
                checksum,
                signature_url,
            } => (url, checksum, signature_url),
        };

        Source::parse(&raw, checksum, signature_url).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
#[error("invalid url: {0}")]
pub struct ParseError(#[from] url::ParseError);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scheme_detection() {
        let plain = Source::parse("https://example.org/a.tar.gz", None, None).unwrap();
        assert_eq!(plain.kind, SourceKind::Archive);

        let file = Source::parse("file:///srv/src/a.tar.gz", None, None).unwrap();
        assert_eq!(file.kind, SourceKind::Archive);

        let git = Source::parse("git|https://example.org/a.git", None, None).unwrap();
        assert_eq!(git.kind, SourceKind::Vcs);
        assert_eq!(git.url.scheme(), "https");

        let vcs = Source::parse("vcs+https://example.org/a.git", None, None).unwrap();
        assert_eq!(vcs.kind, SourceKind::Vcs);
    }
}
