//! Decides which folders under the ingestion root are passes, and of which type.

use glob::{MatchOptions, Pattern};
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

use super::relative_slash_path;
use crate::prefs::FolderInclude;

/// A folder that matched a folder include rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassCandidate {
    /// Relative to the ingestion root, forward slashes.
    pub folder: String,
    pub pass_type: String,
}

/// Patterns containing `*` or `/` are globs rooted at the ingestion root;
/// anything else is a case-insensitive substring of a top-level folder name.
pub fn is_glob_pattern(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('/')
}

/// Resolve every folder include rule against `root`. Rules are applied in
/// order and the first rule to claim a folder decides its pass type.
pub fn classify_folders(root: &Path, includes: &[FolderInclude]) -> Vec<PassCandidate> {
    let top_level = top_level_dirs(root);

    let mut seen: HashSet<String> = HashSet::new();
    let mut candidates = Vec::new();
    let mut claim = |folder: String, pass_type: &str| {
        if seen.insert(folder.clone()) {
            candidates.push(PassCandidate {
                folder,
                pass_type: pass_type.to_string(),
            });
        }
    };

    for include in includes {
        let pattern = include.pattern.trim();
        if pattern.is_empty() {
            continue;
        }

        if is_glob_pattern(pattern) {
            for folder in expand_glob_dirs(root, pattern) {
                claim(folder, &include.pass_type);
            }
        } else {
            let needle = pattern.to_lowercase();
            for name in &top_level {
                if name.to_lowercase().contains(&needle) {
                    claim(name.clone(), &include.pass_type);
                }
            }
        }
    }

    candidates
}

/// Pass type code for an already stored pass name, using the same rule order
/// as [`classify_folders`]. Glob rules are matched against the name itself.
pub fn resolve_pass_type<'a>(pass_name: &str, includes: &'a [FolderInclude]) -> Option<&'a str> {
    let lower_name = pass_name.to_lowercase();

    includes
        .iter()
        .find(|include| {
            let pattern = include.pattern.trim();
            if pattern.is_empty() {
                false
            } else if is_glob_pattern(pattern) {
                glob_matches_path(pattern, pass_name)
            } else {
                lower_name.contains(&pattern.to_lowercase())
            }
        })
        .map(|include| include.pass_type.as_str())
}

/// Glob match where `*` and `?` stop at `/`, the same way directory
/// expansion treats each path segment.
pub(crate) fn glob_matches_path(pattern: &str, path: &str) -> bool {
    let options = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::new()
    };
    Pattern::new(pattern)
        .map(|p| p.matches_with(path, options))
        .unwrap_or(false)
}

fn top_level_dirs(root: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(e) => {
            warn!("Cannot read ingestion root {}: {}", root.display(), e);
            return Vec::new();
        }
    };

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

/// Directories matching `pattern` under `root`, as root-relative paths.
/// Matches that resolve outside the root are dropped.
pub(crate) fn expand_glob_dirs(root: &Path, pattern: &str) -> Vec<String> {
    let full = format!(
        "{}/{}",
        Pattern::escape(&root.to_string_lossy()).trim_end_matches('/'),
        pattern.trim_start_matches('/')
    );

    let paths = match glob::glob(&full) {
        Ok(paths) => paths,
        Err(e) => {
            warn!("Invalid glob pattern {:?}: {}", pattern, e);
            return Vec::new();
        }
    };

    let mut folders: Vec<String> = paths
        .filter_map(|p| p.ok())
        .filter(|p| p.is_dir())
        .filter_map(|p| relative_slash_path(root, &p))
        .collect();
    folders.sort();
    folders
}
