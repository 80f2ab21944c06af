// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Version ordering for recipes and installed records.
//!
//! One rule, used everywhere: split on `.` and `-`, compare component
//! wise. Two numeric components compare numerically, anything else
//! lexicographically. A missing trailing component counts as zero, and
//! a non-numeric suffix sorts below the bare prefix (`1.0-rc1 < 1.0`).

use std::cmp::Ordering;

pub fn compare(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);

    for i in 0..left.len().max(right.len()) {
        let ordering = match (left.get(i), right.get(i)) {
            (Some(x), Some(y)) => compare_components(x, y),
            (Some(Component::Num(x)), None) => x.cmp(&0),
            (None, Some(Component::Num(y))) => 0.cmp(y),
            // Suffix-only difference: the suffixed version is older
            (Some(Component::Text(_)), None) => Ordering::Less,
            (None, Some(Component::Text(_))) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    Ordering::Equal
}

pub fn is_newer(candidate: &str, installed: &str) -> bool {
    compare(candidate, installed) == Ordering::Greater
}

enum Component<'a> {
    Num(u64),
    Text(&'a str),
}

fn components(version: &str) -> Vec<Component<'_>> {
    version
        .split(['.', '-'])
        .map(|part| match part.parse::<u64>() {
            Ok(n) => Component::Num(n),
            Err(_) => Component::Text(part),
        })
        .collect()
}

fn compare_components(a: &Component<'_>, b: &Component<'_>) -> Ordering {
    match (a, b) {
        (Component::Num(x), Component::Num(y)) => x.cmp(y),
        (Component::Num(x), Component::Text(y)) => x.to_string().as_str().cmp(y),
        (Component::Text(x), Component::Num(y)) => x.cmp(&y.to_string().as_str()),
        (Component::Text(x), Component::Text(y)) => x.cmp(y),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numeric_beats_lexicographic() {
        assert_eq!(compare("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare("10.0", "9.9"), Ordering::Greater);
    }

    #[test]
    fn missing_components_are_zero() {
        assert_eq!(compare("1.0.1", "1.0"), Ordering::Greater);
        assert_eq!(compare("1.0", "1.0.0"), Ordering::Equal);
    }

    #[test]
    fn non_numeric_suffix_is_older() {
        assert_eq!(compare("1.0-rc1", "1.0"), Ordering::Less);
        assert_eq!(compare("1.0", "1.0-rc1"), Ordering::Greater);
    }

    #[test]
    fn mixed_components_compare_lexicographically() {
        assert_eq!(compare("1.0a", "1.0b"), Ordering::Less);
        assert_eq!(compare("2.0-rc1", "2.0-rc2"), Ordering::Less);
    }

    #[test]
    fn is_newer_matches_compare() {
        assert!(is_newer("2.12.1", "2.12"));
        assert!(!is_newer("2.12", "2.12"));
        assert!(!is_newer("2.11", "2.12"));
    }
}
