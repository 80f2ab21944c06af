// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

/// Buffer size used when reading a file, 16KiB
pub const FILE_READ_BUFFER_SIZE: usize = 16 * 1024;
/// Prefixes that are never deleted and never reported as orphan roots
pub const CRITICAL_PREFIXES: &[&str] = &["/", "/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc"];
