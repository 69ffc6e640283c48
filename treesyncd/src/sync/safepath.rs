use std::cmp::Ordering;
use std::collections::HashMap;

use thiserror::Error;

pub const MAX_PATH_LENGTH: usize = 1024;
pub const MAX_PATH_DEPTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path must be relative to the tree root")]
    Absolute,
    #[error("path exceeds {} characters", MAX_PATH_LENGTH)]
    TooLong,
    #[error("path exceeds {} segments", MAX_PATH_DEPTH)]
    TooDeep,
    #[error("path contains an empty segment")]
    EmptySegment,
    #[error("path contains percent encoding")]
    PercentEncoded,
    #[error("path contains a traversal segment")]
    Traversal,
    #[error("path contains a hidden segment")]
    Hidden,
    #[error("path contains an unsupported character")]
    InvalidCharacter,
}

/// Tree paths are slash-delimited and relative; a trailing slash (or the
/// empty string, the root) marks a directory.
pub fn is_dir(path: &str) -> bool {
    path.is_empty() || path.ends_with('/')
}

pub fn validate(path: &str) -> Result<(), PathError> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(PathError::TooLong);
    }
    if path.starts_with('/') {
        return Err(PathError::Absolute);
    }
    if path.is_empty() {
        return Ok(());
    }
    if path.contains('%') {
        return Err(PathError::PercentEncoded);
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    let mut count = 0usize;
    for segment in trimmed.split('/') {
        count += 1;
        if segment.is_empty() {
            return Err(PathError::EmptySegment);
        }
        if segment == "." || segment == ".." {
            return Err(PathError::Traversal);
        }
        if segment.starts_with('.') {
            return Err(PathError::Hidden);
        }
        if segment.chars().any(|c| c.is_control() || c == '\\') {
            return Err(PathError::InvalidCharacter);
        }
    }
    if count > MAX_PATH_DEPTH {
        return Err(PathError::TooDeep);
    }
    Ok(())
}

/// Number of segments; the root is depth zero and a trailing slash does not
/// add one.
pub fn depth(path: &str) -> usize {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        0
    } else {
        trimmed.split('/').count()
    }
}

/// Containing directory in trailing-slash form; empty for top-level entries.
pub fn parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => trimmed[..=idx].to_string(),
        None => String::new(),
    }
}

pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

pub fn split(path: &str) -> impl Iterator<Item = &str> {
    path.trim_end_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
}

/// Appends `tail` under `base` and validates the result, so traversal can
/// never escape `base`.
pub fn join(base: &str, tail: &str) -> Result<String, PathError> {
    let mut out = String::with_capacity(base.len() + tail.len() + 1);
    out.push_str(base);
    if !out.is_empty() && !out.ends_with('/') {
        out.push('/');
    }
    out.push_str(tail);
    validate(&out)?;
    Ok(out)
}

/// Proper containment: a directory does not contain itself, the root
/// contains everything else.
pub fn in_dir(path: &str, dir: &str) -> bool {
    if dir.is_empty() {
        return !path.is_empty();
    }
    if !dir.ends_with('/') {
        return false;
    }
    path != dir && path.starts_with(dir)
}

/// Orders by segment count with a lexicographic tie-break, so both
/// directions are deterministic across runs.
pub fn depth_cmp(a: &str, b: &str, ascending: bool) -> Ordering {
    let by_depth = depth(a).cmp(&depth(b));
    let by_depth = if ascending { by_depth } else { by_depth.reverse() };
    by_depth.then_with(|| a.cmp(b))
}

pub fn sort_by_depth(paths: &mut [String], ascending: bool) {
    paths.sort_by(|a, b| depth_cmp(a, b, ascending));
}

/// Directory-membership trie. Adding a path records every ancestor as a
/// directory and the leaf with its own kind, and lookups match kind: a path
/// added as a file does not exist as a directory.
#[derive(Debug, Default)]
pub struct Trie {
    root: TrieNode,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    file: bool,
    dir: bool,
}

impl Trie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: &str) -> Result<(), PathError> {
        validate(path)?;
        let as_dir = is_dir(path);
        let segments: Vec<&str> = split(path).collect();
        let mut node = &mut self.root;
        for (i, segment) in segments.iter().enumerate() {
            node = node.children.entry((*segment).to_string()).or_default();
            if i + 1 == segments.len() && !as_dir {
                node.file = true;
            } else {
                node.dir = true;
            }
        }
        Ok(())
    }

    pub fn exists(&self, path: &str) -> bool {
        let as_dir = is_dir(path);
        let mut node = &self.root;
        let mut seen = false;
        for segment in split(path) {
            seen = true;
            match node.children.get(segment) {
                Some(next) => node = next,
                None => return false,
            }
        }
        if !seen {
            return as_dir;
        }
        if as_dir { node.dir } else { node.file }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_nested_file_and_dir() {
        assert_eq!(validate("reports/weekly.json"), Ok(()));
        assert_eq!(validate("a/b/c/"), Ok(()));
        assert_eq!(validate(""), Ok(()));
    }

    #[test]
    fn validate_rejects_each_malformed_shape() {
        assert_eq!(validate("/abs/path"), Err(PathError::Absolute));
        assert_eq!(validate("a//b"), Err(PathError::EmptySegment));
        assert_eq!(validate("a/%2e%2e/b"), Err(PathError::PercentEncoded));
        assert_eq!(validate("a/../b"), Err(PathError::Traversal));
        assert_eq!(validate("./a"), Err(PathError::Traversal));
        assert_eq!(validate(".hidden/a.json"), Err(PathError::Hidden));
        assert_eq!(validate("a/.git/config"), Err(PathError::Hidden));
        assert_eq!(validate("a/b\\c"), Err(PathError::InvalidCharacter));
        assert_eq!(validate("a/b\x07"), Err(PathError::InvalidCharacter));
    }

    #[test]
    fn validate_enforces_limits() {
        let long = "x".repeat(MAX_PATH_LENGTH + 1);
        assert_eq!(validate(&long), Err(PathError::TooLong));
        let deep = vec!["d"; MAX_PATH_DEPTH + 1].join("/");
        assert_eq!(validate(&deep), Err(PathError::TooDeep));
    }

    #[test]
    fn parent_and_depth_walk_the_hierarchy() {
        assert_eq!(parent("a/b/c.json"), "a/b/");
        assert_eq!(parent("a/b/"), "a/");
        assert_eq!(parent("a"), "");
        assert_eq!(depth(""), 0);
        assert_eq!(depth("a/"), 1);
        assert_eq!(depth("a/b/c.json"), 3);
        assert_eq!(base_name("a/b/c.json"), "c.json");
        assert_eq!(base_name("a/b/"), "b");
    }

    #[test]
    fn join_stays_inside_base() {
        assert_eq!(join("a/b/", "c.json").unwrap(), "a/b/c.json");
        assert_eq!(join("", "top.json").unwrap(), "top.json");
        assert_eq!(join("a/", "../escape"), Err(PathError::Traversal));
        assert_eq!(join("a/", "b/"), Ok("a/b/".to_string()));
    }

    #[test]
    fn in_dir_is_proper_containment() {
        assert!(in_dir("a/b.json", "a/"));
        assert!(in_dir("a/b/c.json", "a/"));
        assert!(!in_dir("a/", "a/"));
        assert!(!in_dir("ab/c.json", "a/"));
        assert!(in_dir("a/", ""));
        assert!(!in_dir("", ""));
    }

    #[test]
    fn trie_matches_path_kind() {
        let mut trie = Trie::new();
        trie.add("a/b/c.json").unwrap();
        assert!(trie.exists("a/"));
        assert!(trie.exists("a/b/"));
        assert!(trie.exists("a/b/c.json"));
        assert!(!trie.exists("a/b/c.json/"));
        assert!(!trie.exists("a/b"));
        assert!(!trie.exists("a/other.json"));

        trie.add("d/").unwrap();
        assert!(trie.exists("d/"));
        assert!(!trie.exists("d"));
    }

    #[test]
    fn sort_by_depth_is_deterministic_in_both_directions() {
        let mut asc = vec![
            "b/".to_string(),
            "a/x.json".to_string(),
            "a/".to_string(),
            "top.json".to_string(),
        ];
        sort_by_depth(&mut asc, true);
        assert_eq!(asc, vec!["a/", "b/", "top.json", "a/x.json"]);

        let mut desc = asc.clone();
        sort_by_depth(&mut desc, false);
        assert_eq!(desc, vec!["a/x.json", "a/", "b/", "top.json"]);

        // Equal depths keep lexicographic order regardless of direction.
        let mut ties = vec!["c/".to_string(), "a/".to_string(), "b/".to_string()];
        sort_by_depth(&mut ties, false);
        assert_eq!(ties, vec!["a/", "b/", "c/"]);
    }
}
