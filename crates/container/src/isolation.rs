// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::Path;

use nix::unistd::Uid;
use strum::{Display, EnumString};

/// The isolation primitive used to confine a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Isolation {
    /// User + mount + pid + ipc + uts namespaces, unprivileged
    #[strum(serialize = "sandbox")]
    Namespaces,
    /// fork + chroot, requires a privileged caller
    Chroot,
}

impl Isolation {
    /// Pick the best primitive the running kernel and user allow.
    ///
    /// Rootless namespaces need user namespace support; when that is
    /// unavailable we can only offer chroot, which itself needs root.
    pub fn detect() -> Self {
        if namespaces_available() {
            Isolation::Namespaces
        } else {
            Isolation::Chroot
        }
    }

    pub fn available(&self) -> bool {
        match self {
            Isolation::Namespaces => namespaces_available(),
            Isolation::Chroot => Uid::effective().is_root(),
        }
    }
}

fn namespaces_available() -> bool {
    if !Path::new("/proc/self/ns/user").exists() {
        return false;
    }

    if Uid::effective().is_root() {
        return true;
    }

    // Debian-style kernels gate unprivileged user namespaces
    match std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone") {
        Ok(contents) => contents.trim() != "0",
        Err(_) => true,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_config_values() {
        assert_eq!("sandbox".parse::<Isolation>().unwrap(), Isolation::Namespaces);
        assert_eq!("chroot".parse::<Isolation>().unwrap(), Isolation::Chroot);
        assert!("jail".parse::<Isolation>().is_err());
    }
}
