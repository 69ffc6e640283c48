use std::collections::HashMap;

use sha2::{Digest, Sha256};
use thiserror::Error;
use treesync_core::{RemoteResource, StoreError};

use super::safepath;

/// Folder creation failure, keyed by the directory path that could not be
/// materialized. The apply loop uses that path to contain everything nested
/// under it.
#[derive(Debug, Error)]
#[error("ensuring folder exists at path {path}: {source}")]
pub struct PathCreationError {
    pub path: String,
    #[source]
    pub source: StoreError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: String,
    pub title: String,
    pub path: String,
}

/// Stable, content-derived folder identity: a readable slug plus a short
/// digest over the owning job and the path, so distinct jobs never collide.
pub fn folder_id(job: &str, path: &str) -> String {
    derived_id(&slugify(safepath::base_name(path)), job, path)
}

/// Id of the folder holding the whole job; it carries the job's name.
pub fn root_folder_id(job: &str) -> String {
    derived_id(&slugify(job), job, "")
}

fn derived_id(slug: &str, job: &str, path: &str) -> String {
    let suffix = stable_suffix(job, path);
    if slug.is_empty() {
        suffix
    } else {
        format!("{slug}-{suffix}")
    }
}

/// Eight hex characters of a digest over `job:path`.
pub(crate) fn stable_suffix(job: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();
    format!(
        "{:02x}{:02x}{:02x}{:02x}",
        digest[0], digest[1], digest[2], digest[3]
    )
}

pub(crate) fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

/// In-memory index of the target's directory structure: id to (parent id,
/// folder). The empty id stands for the reconciliation root and is always
/// present implicitly.
#[derive(Debug, Default)]
pub struct FolderTree {
    entries: HashMap<String, TreeEntry>,
}

#[derive(Debug)]
struct TreeEntry {
    parent: String,
    folder: Folder,
}

impl FolderTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the tree from a target listing by scanning folder-kind items;
    /// their `folder` field names the parent. `root_id` is the job's root
    /// folder, which maps onto the tree's implicit empty root.
    pub fn from_listing(items: &[RemoteResource], root_id: &str) -> Self {
        let mut tree = Self::new();
        for item in items {
            if !item.is_folder() || item.path.is_empty() {
                continue;
            }
            let parent = match item.folder.as_deref() {
                Some(parent) if parent != root_id => parent.to_string(),
                _ => String::new(),
            };
            let folder = Folder {
                id: item.name.clone(),
                title: safepath::base_name(&item.path).to_string(),
                path: item.path.clone(),
            };
            tree.add(folder, parent);
        }
        tree
    }

    pub fn contains(&self, id: &str) -> bool {
        id.is_empty() || self.entries.contains_key(id)
    }

    pub fn add(&mut self, folder: Folder, parent: impl Into<String>) {
        self.entries.insert(
            folder.id.clone(),
            TreeEntry {
                parent: parent.into(),
                folder,
            },
        );
    }

    pub fn remove(&mut self, id: &str) {
        self.entries.remove(id);
    }

    pub fn find_by_path(&self, path: &str) -> Option<&Folder> {
        self.entries
            .values()
            .map(|entry| &entry.folder)
            .find(|folder| folder.path == path)
    }

    /// The folder with its path rewritten relative to `base`. None when
    /// either id is unknown or `base` is not on the parent chain.
    pub fn path_from_ancestor(&self, id: &str, base: &str) -> Option<Folder> {
        let target = &self.entries.get(id)?.folder;
        let mut cursor: &str = id;
        while cursor != base {
            if cursor.is_empty() {
                return None;
            }
            cursor = match self.entries.get(cursor) {
                Some(entry) => entry.parent.as_str(),
                None => return None,
            };
        }
        let relative = if base.is_empty() {
            target.path.clone()
        } else {
            let base_path = &self.entries.get(base)?.folder.path;
            target.path.strip_prefix(base_path.as_str())?.to_string()
        };
        Some(Folder {
            id: target.id.clone(),
            title: target.title.clone(),
            path: relative,
        })
    }

    /// Visits every folder shallowest-first, parents before children, in a
    /// deterministic order.
    pub fn walk(&self, mut visit: impl FnMut(&Folder, &str)) {
        let mut entries: Vec<&TreeEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| safepath::depth_cmp(&a.folder.path, &b.folder.path, true));
        for entry in entries {
            visit(&entry.folder, &entry.parent);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
