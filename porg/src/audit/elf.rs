// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Dynamic section inspection for the revdep scan.

use std::path::Path;

use elf::{
    abi::{DT_NEEDED, DT_RPATH, DT_RUNPATH},
    endian::AnyEndian,
};
use fs_err::File;

/// What an ELF image asks the dynamic linker for
#[derive(Debug, Clone, Default)]
pub struct DynamicInfo {
    pub needed: Vec<String>,
    pub rpaths: Vec<String>,
}

/// Read DT_NEEDED and rpath entries from `path`.
///
/// Returns `None` for anything that is not a parseable dynamic ELF,
/// so callers can feed every file through without pre-filtering.
pub fn dynamic_info(path: &Path) -> Option<DynamicInfo> {
    let file = File::open(path).ok()?;
    let mut elf = elf::ElfStream::<AnyEndian, _>::open_stream(file).ok()?;

    let mut needed_offsets = vec![];
    let mut rpath_offsets = vec![];

    let Ok(Some(table)) = elf.dynamic() else {
        return None;
    };

    for entry in table.iter() {
        match entry.d_tag {
            DT_NEEDED => needed_offsets.push(entry.d_val() as usize),
            DT_RPATH | DT_RUNPATH => rpath_offsets.push(entry.d_val() as usize),
            _ => {}
        }
    }

    let mut info = DynamicInfo::default();

    // Resolve offsets against the dynamic string table
    if let Ok(Some((_, strtab))) = elf.dynamic_symbol_table() {
        for offset in needed_offsets {
            if let Ok(name) = strtab.get(offset) {
                info.needed.push(name.to_owned());
            }
        }

        let origin = path.parent().map(|p| p.display().to_string()).unwrap_or_default();

        for offset in rpath_offsets {
            if let Ok(rpath) = strtab.get(offset) {
                for entry in rpath.split(':').filter(|entry| !entry.is_empty()) {
                    info.rpaths.push(entry.replace("$ORIGIN", &origin));
                }
            }
        }
    }

    Some(info)
}
