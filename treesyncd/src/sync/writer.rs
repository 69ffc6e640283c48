use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use treesync_core::{
    DEFAULT_GROUP, DocumentOrigin, FOLDER_GROUP, FOLDER_KIND, FolderPayload, RemoteResource,
    ResourceDocument, StoreError,
};

use super::engine::SyncError;
use super::folders::{self, Folder, FolderTree, PathCreationError};
use super::retry::RetryStore;
use super::safepath;
use super::source::{Source, content_hash};

pub const SUPPORTED_EXTENSION: &str = ".json";

/// Whether a path names a file the reconciler can turn into a document:
/// structurally valid, a file rather than a directory, and carrying the
/// supported extension.
pub fn is_path_supported(path: &str) -> bool {
    safepath::validate(path).is_ok()
        && !safepath::is_dir(path)
        && path.ends_with(SUPPORTED_EXTENSION)
}

/// Store identity of one written or deleted object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub name: String,
    pub group: String,
    pub kind: String,
}

/// Turns source files into store objects: parses documents, materializes the
/// folder chain above them, and stamps provenance so later deletions can be
/// trusted. One writer serves one reconciliation run.
pub struct ResourceWriter {
    store: Arc<RetryStore>,
    source: Arc<dyn Source>,
    tree: FolderTree,
    job: String,
    root_title: String,
}

impl ResourceWriter {
    pub fn new(
        store: Arc<RetryStore>,
        source: Arc<dyn Source>,
        job: impl Into<String>,
        root_title: impl Into<String>,
    ) -> Self {
        Self {
            store,
            source,
            tree: FolderTree::new(),
            job: job.into(),
            root_title: root_title.into(),
        }
    }

    pub fn root_id(&self) -> String {
        folders::root_folder_id(&self.job)
    }

    /// Replaces the folder index with one built from a target listing.
    pub fn seed_tree(&mut self, items: &[RemoteResource]) {
        self.tree = FolderTree::from_listing(items, &self.root_id());
    }

    /// Idempotent create of the folder everything this job writes lives in.
    pub async fn ensure_root_folder(&self) -> Result<(), StoreError> {
        let payload = FolderPayload {
            title: self.root_title.clone(),
            parent: None,
            owner: self.job.clone(),
        };
        self.store.create_folder(&self.root_id(), &payload).await?;
        Ok(())
    }

    /// Walks `dir` segment by segment and creates whatever folders are
    /// missing, parents first. Returns the id of the deepest folder; on
    /// failure the error names the segment path that could not be created.
    pub async fn ensure_folder_path_exist(
        &mut self,
        dir: &str,
    ) -> Result<String, PathCreationError> {
        if dir.is_empty() {
            return Ok(self.root_id());
        }
        let mut tree_parent = String::new();
        let mut walked = String::new();
        for segment in safepath::split(dir) {
            walked.push_str(segment);
            walked.push('/');
            let id = folders::folder_id(&self.job, &walked);
            if !self.tree.contains(&id) {
                let wire_parent = if tree_parent.is_empty() {
                    self.root_id()
                } else {
                    tree_parent.clone()
                };
                let payload = FolderPayload {
                    title: segment.to_string(),
                    parent: Some(wire_parent),
                    owner: self.job.clone(),
                };
                if let Err(source) = self.store.create_folder(&id, &payload).await {
                    return Err(PathCreationError {
                        path: walked,
                        source,
                    });
                }
                debug!(path = %walked, id = %id, "created folder");
                self.tree.add(
                    Folder {
                        id: id.clone(),
                        title: segment.to_string(),
                        path: walked.clone(),
                    },
                    tree_parent.clone(),
                );
            }
            tree_parent = id;
        }
        Ok(tree_parent)
    }

    /// Reads the file, parses it into a document and upserts it, creating
    /// missing parent folders first. A folder failure surfaces as
    /// `SyncError::PathCreation` so the caller can contain the subtree.
    pub async fn write_resource_from_file(
        &mut self,
        path: &str,
        rev: Option<&str>,
    ) -> Result<ResourceRef, SyncError> {
        let bytes = self
            .source
            .read_file(path, rev)
            .await
            .map_err(|source| SyncError::Read {
                path: path.to_string(),
                source,
            })?;
        let parsed = parse_document(path, &bytes)?;
        let folder = self.ensure_folder_path_exist(&safepath::parent(path)).await?;
        let name = parsed
            .name
            .clone()
            .unwrap_or_else(|| object_name(&self.job, path));
        let document = ResourceDocument {
            kind: parsed.kind.clone(),
            group: parsed.group.clone(),
            name: Some(name.clone()),
            folder: Some(folder),
            origin: Some(DocumentOrigin {
                job: self.job.clone(),
                path: path.to_string(),
                hash: content_hash(&bytes),
                rev: rev.unwrap_or_default().to_string(),
            }),
            spec: parsed.spec,
        };
        self.store
            .upsert_resource(&parsed.group, &parsed.kind, &name, &document)
            .await
            .map_err(|source| SyncError::Write {
                path: path.to_string(),
                source,
            })?;
        Ok(ResourceRef {
            name,
            group: parsed.group,
            kind: parsed.kind,
        })
    }

    /// The store identity a file produces, read at the revision it existed
    /// in. Touches only the source, never the store.
    async fn resolve_identity(&self, path: &str, rev: Option<&str>) -> Result<ResourceRef, SyncError> {
        let bytes = self
            .source
            .read_file(path, rev)
            .await
            .map_err(|source| SyncError::Read {
                path: path.to_string(),
                source,
            })?;
        let parsed = parse_document(path, &bytes)?;
        let name = parsed
            .name
            .unwrap_or_else(|| object_name(&self.job, path));
        Ok(ResourceRef {
            name,
            group: parsed.group,
            kind: parsed.kind,
        })
    }

    async fn delete_identity(&self, identity: &ResourceRef) -> Result<(), SyncError> {
        self.store
            .delete_resource(&identity.group, &identity.kind, &identity.name)
            .await
            .map_err(|source| SyncError::Delete {
                group: identity.group.clone(),
                kind: identity.kind.clone(),
                name: identity.name.clone(),
                source,
            })
    }

    /// Resolves the identity of a deleted file by reading it at the revision
    /// it last existed in, then deletes that object from the store.
    pub async fn remove_resource_from_file(
        &self,
        path: &str,
        rev: Option<&str>,
    ) -> Result<ResourceRef, SyncError> {
        let identity = self.resolve_identity(path, rev).await?;
        self.delete_identity(&identity).await?;
        Ok(identity)
    }

    /// A move: writes the object at its new path first, then deletes the one
    /// the old path produced. A failed write leaves the old object in place,
    /// and a move that keeps the identity is a plain upsert.
    pub async fn rename_resource_file(
        &mut self,
        path: &str,
        previous_path: &str,
        rev: Option<&str>,
        previous_rev: Option<&str>,
    ) -> Result<ResourceRef, SyncError> {
        let previous = self.resolve_identity(previous_path, previous_rev).await?;
        let written = self.write_resource_from_file(path, rev).await?;
        if previous != written {
            self.delete_identity(&previous).await?;
        }
        Ok(written)
    }

    /// Deletes a listed item; folder items go through the folder endpoint.
    pub async fn delete_existing(&self, item: &RemoteResource) -> Result<(), SyncError> {
        let result = if item.is_folder() {
            self.store.delete_folder(&item.name).await
        } else {
            self.store
                .delete_resource(&item.group, &item.kind, &item.name)
                .await
        };
        result.map_err(|source| SyncError::Delete {
            group: item.group.clone(),
            kind: item.kind.clone(),
            name: item.name.clone(),
            source,
        })
    }

    /// Removes the folder at `dir`, resolving its id from the tree when
    /// seeded and deriving it otherwise. A folder the store no longer has
    /// counts as removed.
    pub async fn delete_folder_by_path(&mut self, dir: &str) -> Result<String, SyncError> {
        let id = match self.tree.find_by_path(dir) {
            Some(folder) => folder.id.clone(),
            None => folders::folder_id(&self.job, dir),
        };
        match self.store.delete_folder(&id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(source) => {
                return Err(SyncError::Delete {
                    group: FOLDER_GROUP.to_string(),
                    kind: FOLDER_KIND.to_string(),
                    name: id,
                    source,
                });
            }
        }
        self.tree.remove(&id);
        Ok(id)
    }
}

struct ParsedDocument {
    kind: String,
    group: String,
    name: Option<String>,
    spec: Value,
}

fn parse_document(path: &str, bytes: &[u8]) -> Result<ParsedDocument, SyncError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| SyncError::Unsupported {
            path: path.to_string(),
            reason: err.to_string(),
        })?;
    let Some(kind) = value.get("kind").and_then(Value::as_str) else {
        return Err(SyncError::Unsupported {
            path: path.to_string(),
            reason: "document has no kind".to_string(),
        });
    };
    let group = value
        .get("group")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_GROUP)
        .to_string();
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string);
    let spec = value.get("spec").cloned().unwrap_or(Value::Null);
    Ok(ParsedDocument {
        kind: kind.to_string(),
        group,
        name,
        spec,
    })
}

/// Store name for documents that do not declare one, derived the same way as
/// folder ids so the mapping survives restarts.
fn object_name(job: &str, path: &str) -> String {
    let base = safepath::base_name(path);
    let stem = base.strip_suffix(SUPPORTED_EXTENSION).unwrap_or(base);
    let slug = folders::slugify(stem);
    let suffix = folders::stable_suffix(job, path);
    if slug.is_empty() {
        suffix
    } else {
        format!("{slug}-{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::retry::RetryConfig;
    use crate::sync::source::LocalSource;
    use std::path::Path;
    use tokio_util::sync::CancellationToken;
    use treesync_core::StoreClient;
    use wiremock::matchers::{body_partial_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const JOB: &str = "docs-job";

    fn writer_for(server: &MockServer, root: &Path) -> ResourceWriter {
        let client = StoreClient::new(&server.uri(), "token").unwrap();
        let store = Arc::new(RetryStore::new(
            client,
            RetryConfig::default(),
            CancellationToken::new(),
        ));
        ResourceWriter::new(store, Arc::new(LocalSource::new(root)), JOB, "Docs")
    }

    fn folder_info_body(id: &str) -> serde_json::Value {
        serde_json::json!({"id": id, "title": id, "parent": null, "owner": JOB})
    }

    #[test]
    fn supported_paths_are_valid_json_files() {
        assert!(is_path_supported("a/report.json"));
        assert!(is_path_supported("top.json"));
        assert!(!is_path_supported("a/"));
        assert!(!is_path_supported("a/readme.txt"));
        assert!(!is_path_supported(".hidden/report.json"));
        assert!(!is_path_supported("a/../b.json"));
    }

    #[test]
    fn object_name_is_stable_and_readable() {
        let name = object_name(JOB, "a/b/Weekly Report.json");
        assert!(name.starts_with("weekly-report-"), "unexpected {name}");
        assert_eq!(name, object_name(JOB, "a/b/Weekly Report.json"));
        assert_ne!(name, object_name("other", "a/b/Weekly Report.json"));
    }

    #[tokio::test]
    async fn write_creates_parent_folders_then_document() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(
            dir.path().join("a/b/report.json"),
            br#"{"kind":"report","spec":{"title":"Weekly"}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a/b/second.json"),
            br#"{"kind":"report","spec":{"title":"Second"}}"#,
        )
        .unwrap();

        Mock::given(method("PUT"))
            .and(path_regex("^/v1/folders/.+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(folder_info_body("x")))
            .expect(2)
            .mount(&server)
            .await;
        let name = object_name(JOB, "a/b/report.json");
        Mock::given(method("PUT"))
            .and(path(format!("/v1/resources/default/report/{name}")))
            .and(body_partial_json(serde_json::json!({
                "kind": "report",
                "origin": {"job": JOB, "path": "a/b/report.json"},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "path": "a/b/report.json",
                "group": "default",
                "kind": "report",
                "name": name,
            })))
            .expect(1)
            .mount(&server)
            .await;
        let second = object_name(JOB, "a/b/second.json");
        Mock::given(method("PUT"))
            .and(path(format!("/v1/resources/default/report/{second}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "path": "a/b/second.json",
                "group": "default",
                "kind": "report",
                "name": second,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut writer = writer_for(&server, dir.path());
        let written = writer
            .write_resource_from_file("a/b/report.json", None)
            .await
            .unwrap();
        assert_eq!(written.kind, "report");
        assert_eq!(written.name, name);

        // The second file reuses the folder chain cached by the first.
        writer
            .write_resource_from_file("a/b/second.json", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn write_surfaces_folder_creation_failures() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/x.json"), br#"{"kind":"report"}"#).unwrap();

        Mock::given(method("PUT"))
            .and(path_regex("^/v1/folders/.+$"))
            .respond_with(ResponseTemplate::new(409).set_body_string("owned by someone else"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex("^/v1/resources/.+$"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let mut writer = writer_for(&server, dir.path());
        let err = writer
            .write_resource_from_file("a/x.json", None)
            .await
            .unwrap_err();
        match err {
            SyncError::PathCreation(path_err) => assert_eq!(path_err.path, "a/"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn write_rejects_documents_without_kind() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), br#"{"title":"x"}"#).unwrap();

        let mut writer = writer_for(&server, dir.path());
        let err = writer
            .write_resource_from_file("bad.json", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("document has no kind"), "{err}");
    }

    #[tokio::test]
    async fn remove_resolves_identity_from_the_file() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("del.json"),
            br#"{"kind":"report","name":"custom-name"}"#,
        )
        .unwrap();

        Mock::given(method("DELETE"))
            .and(path("/v1/resources/default/report/custom-name"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let writer = writer_for(&server, dir.path());
        let removed = writer
            .remove_resource_from_file("del.json", None)
            .await
            .unwrap();
        assert_eq!(removed.name, "custom-name");
    }

    #[tokio::test]
    async fn rename_writes_the_new_object_then_deletes_the_old() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(
            dir.path().join("a/old.json"),
            br#"{"kind":"report","name":"old-name"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("a/new.json"), br#"{"kind":"report"}"#).unwrap();

        Mock::given(method("DELETE"))
            .and(path("/v1/resources/default/report/old-name"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex("^/v1/folders/.+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(folder_info_body("a-x")))
            .expect(1)
            .mount(&server)
            .await;
        let name = object_name(JOB, "a/new.json");
        Mock::given(method("PUT"))
            .and(path(format!("/v1/resources/default/report/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "path": "a/new.json",
                "group": "default",
                "kind": "report",
                "name": name,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut writer = writer_for(&server, dir.path());
        let written = writer
            .rename_resource_file("a/new.json", "a/old.json", None, None)
            .await
            .unwrap();
        assert_eq!(written.name, name);
    }

    #[tokio::test]
    async fn rename_that_keeps_the_identity_never_deletes() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        std::fs::write(
            dir.path().join("old.json"),
            br#"{"kind":"report","name":"pinned"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b/new.json"),
            br#"{"kind":"report","name":"pinned"}"#,
        )
        .unwrap();

        Mock::given(method("PUT"))
            .and(path_regex("^/v1/folders/.+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(folder_info_body("b-x")))
            .expect(1)
            .mount(&server)
            .await;
        // The upsert moves the object; deleting afterwards would lose it.
        Mock::given(method("PUT"))
            .and(path("/v1/resources/default/report/pinned"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "path": "b/new.json",
                "group": "default",
                "kind": "report",
                "name": "pinned",
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path_regex("^/v1/resources/.+$"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let mut writer = writer_for(&server, dir.path());
        let written = writer
            .rename_resource_file("b/new.json", "old.json", None, None)
            .await
            .unwrap();
        assert_eq!(written.name, "pinned");
    }

    #[tokio::test]
    async fn delete_existing_routes_folders_to_the_folder_endpoint() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("DELETE"))
            .and(path("/v1/folders/a-123"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let writer = writer_for(&server, dir.path());
        writer
            .delete_existing(&RemoteResource {
                path: "a/".into(),
                group: FOLDER_GROUP.into(),
                kind: FOLDER_KIND.into(),
                name: "a-123".into(),
                hash: String::new(),
                folder: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_folder_by_path_treats_missing_folders_as_gone() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let id = folders::folder_id(JOB, "a/");

        Mock::given(method("DELETE"))
            .and(path(format!("/v1/folders/{id}")))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such folder"))
            .expect(1)
            .mount(&server)
            .await;

        let mut writer = writer_for(&server, dir.path());
        assert_eq!(writer.delete_folder_by_path("a/").await.unwrap(), id);
    }
}
