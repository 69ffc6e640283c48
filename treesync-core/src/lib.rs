mod client;

pub use client::{
    ApiErrorClass, DocumentOrigin, FolderInfo, FolderPayload, RemoteResource, ResourceCount,
    ResourceDocument, ResourcePage, ResourceStats, StoreClient, StoreError, DEFAULT_GROUP,
    FOLDER_GROUP, FOLDER_KIND,
};
