//! Mapping filesystem events to packages and filtering by `files` patterns.

use regex::Regex;
use std::path::Path;

/// Find the package owning `file` by containment: the first entry whose root
/// is an ancestor of the file wins. Order is caller-determined (registration
/// order).
pub fn find_owning_package<'a>(
    file: &Path,
    entries: &'a [(String, std::path::PathBuf)],
) -> Option<(&'a str, &'a Path)> {
    entries
        .iter()
        .find(|(_, root)| file.strip_prefix(root).is_ok())
        .map(|(name, root)| (name.as_str(), root.as_path()))
}

/// Decide whether a file (path relative to its package root) is covered by
/// the package's `files` inclusion patterns.
///
/// No patterns means everything is included. `package.json` is always
/// included since dependency tracking needs it. A pattern matches exactly, as
/// a directory prefix (with or without trailing slash), or — when it contains
/// a `*` — as a path-wide wildcard. Matching is case-sensitive.
pub fn should_include_file(relative_path: &str, files_patterns: Option<&[String]>) -> bool {
    let Some(patterns) = files_patterns.filter(|patterns| !patterns.is_empty()) else {
        return true;
    };

    if relative_path == "package.json" {
        return true;
    }

    patterns.iter().any(|pattern| {
        if relative_path == pattern {
            return true;
        }

        let normalized = pattern.strip_suffix('/').unwrap_or(pattern);
        if relative_path.starts_with(&format!("{normalized}/")) {
            return true;
        }

        if pattern.contains('*') {
            let expression = pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            if let Ok(regex) = Regex::new(&expression) {
                return regex.is_match(relative_path);
            }
        }

        false
    })
}
