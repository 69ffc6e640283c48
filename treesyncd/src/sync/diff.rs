use std::collections::HashMap;

use thiserror::Error;
use treesync_core::RemoteResource;

use super::safepath;
use super::source::{ChangeAction, SourceEntry};
use super::writer::is_path_supported;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("unexpected empty path on a non-folder item {group}/{kind} {name}")]
    UnexpectedEmptyPath {
        group: String,
        kind: String,
        name: String,
    },
    #[error("track kept path: {0}")]
    Keep(#[from] safepath::PathError),
}

/// A unit of work for the apply loop. `existing` carries the store identity
/// for updates and deletes; `previous_path` is set on renames; the rev fields
/// say which revision to read file content from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceFileChange {
    pub path: String,
    pub action: ChangeAction,
    pub existing: Option<RemoteResource>,
    pub previous_path: Option<String>,
    pub rev: Option<String>,
    pub previous_rev: Option<String>,
}

impl ResourceFileChange {
    pub fn created(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: ChangeAction::Created,
            existing: None,
            previous_path: None,
            rev: None,
            previous_rev: None,
        }
    }

    pub fn updated(path: impl Into<String>, existing: RemoteResource) -> Self {
        Self {
            path: path.into(),
            action: ChangeAction::Updated,
            existing: Some(existing),
            previous_path: None,
            rev: None,
            previous_rev: None,
        }
    }

    pub fn deleted(path: impl Into<String>, existing: RemoteResource) -> Self {
        Self {
            path: path.into(),
            action: ChangeAction::Deleted,
            existing: Some(existing),
            previous_path: None,
            rev: None,
            previous_rev: None,
        }
    }
}

/// Compares a full source listing against a full target listing. Only blobs
/// drive the comparison; directories survive through the kept-path trie, so a
/// folder whose only content is hidden or unsupported files is preserved
/// rather than deleted.
pub fn changes(
    source: &[SourceEntry],
    target: &[RemoteResource],
) -> Result<Vec<ResourceFileChange>, DiffError> {
    let mut lookup: HashMap<&str, &RemoteResource> = HashMap::with_capacity(target.len());
    for item in target {
        if item.path.is_empty() {
            if !item.is_folder() {
                return Err(DiffError::UnexpectedEmptyPath {
                    group: item.group.clone(),
                    kind: item.kind.clone(),
                    name: item.name.clone(),
                });
            }
            // The namespace root itself never takes part in the diff.
            continue;
        }
        lookup.insert(item.path.as_str(), item);
    }

    let mut keep = safepath::Trie::new();
    let mut out = Vec::with_capacity(source.len());
    for entry in source {
        if !entry.blob {
            continue;
        }

        if let Some(existing) = lookup.remove(entry.path.as_str()) {
            if existing.hash != entry.hash {
                out.push(ResourceFileChange::updated(&entry.path, existing.clone()));
            }
            keep.add(&entry.path)?;
            continue;
        }

        if is_path_supported(&entry.path) {
            out.push(ResourceFileChange::created(&entry.path));
            keep.add(&entry.path)?;
            continue;
        }

        // Unsupported content still pins its nearest visible directory.
        if let Some(dir) = nearest_supported_dir(&entry.path)
            && !keep.exists(&dir)
        {
            if !lookup.contains_key(dir.as_str()) {
                out.push(ResourceFileChange::created(&dir));
            }
            keep.add(&dir)?;
        }
    }

    for item in lookup.values() {
        if item.is_folder() && keep.exists(&item.path) {
            continue;
        }
        out.push(ResourceFileChange::deleted(&item.path, (*item).clone()));
    }

    out.sort_by(|a, b| safepath::depth_cmp(&a.path, &b.path, false));
    Ok(out)
}

pub(crate) fn nearest_supported_dir(path: &str) -> Option<String> {
    let mut dir = safepath::parent(path);
    while !dir.is_empty() {
        if safepath::validate(&dir).is_ok() {
            return Some(dir);
        }
        dir = safepath::parent(&dir);
    }
    None
}
