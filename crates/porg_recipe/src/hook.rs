// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use serde::Deserialize;
use strum::{Display, EnumIter, EnumString};

/// Well known hook points across the build, install and removal
/// lifecycle. Recipe hooks and global hook directories share these
/// names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Hook {
    PreDownload,
    PostDownload,
    PrePatch,
    PostPatch,
    PreBuild,
    PostBuild,
    PostInstall,
    PostPackage,
    PreExpandRoot,
    PostExpandRoot,
    PreRemove,
    PostRemove,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kebab_names_round_trip() {
        assert_eq!(Hook::PreExpandRoot.to_string(), "pre-expand-root");
        assert_eq!("post-install".parse::<Hook>().unwrap(), Hook::PostInstall);
    }
}
