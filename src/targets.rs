//! Target list loading.
//!
//! Targets come from the config's `targets.hosts`, repeated `--target` flags and
//! an optional file with one target per line.

use ahash::AHashSet as HashSet;
use std::fs;
use std::io;
use std::path::Path;

use crate::config::Config;

/// Reads one target per line, skipping blank lines and `#` comments.
pub fn load_targets_from_file(path: &Path) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(parse_target_list(&content))
}

pub fn parse_target_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Merges target lists, keeping first-seen order and dropping duplicates.
pub fn merge_targets<I, S>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for target in lists.into_iter().flatten() {
        let target = target.trim().to_string();
        if target.is_empty() {
            continue;
        }
        if seen.insert(target.clone()) {
            merged.push(target);
        }
    }
    merged
}

/// Configured hosts followed by the target file's entries.
///
/// A file that cannot be read is reported in the second tuple element; the
/// configured hosts are still returned.
pub fn resolve_targets(cfg: &Config) -> (Vec<String>, Option<io::Error>) {
    let hosts = cfg.targets.hosts.clone();
    match cfg.targets.file.as_deref() {
        Some(path) => match load_targets_from_file(path) {
            Ok(from_file) => (merge_targets([hosts, from_file]), None),
            Err(e) => (merge_targets([hosts]), Some(e)),
        },
        None => (merge_targets([hosts]), None),
    }
}
