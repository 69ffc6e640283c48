use std::time::SystemTime;

use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Group and kind the store reserves for structural folder resources. Every
/// other (group, kind) pair is content.
pub const FOLDER_GROUP: &str = "folders";
pub const FOLDER_KIND: &str = "folder";

/// Group assumed for content documents that do not declare one.
pub const DEFAULT_GROUP: &str = "default";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct StoreClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl StoreClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, StoreError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn list_resources(
        &self,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<ResourcePage, StoreError> {
        let mut url = self.endpoint("/v1/resources")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(offset) = offset {
                query.append_pair("offset", &offset.to_string());
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_resources_all(
        &self,
        page_size: u32,
    ) -> Result<Vec<RemoteResource>, StoreError> {
        let page_size = page_size.max(1);
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let page = self
                .list_resources(Some(page_size), Some(offset))
                .await?;
            offset = offset.saturating_add(page.items.len() as u32);
            let total = page.total;
            items.extend(page.items);
            if offset >= total {
                break;
            }
        }
        Ok(items)
    }

    pub async fn get_stats(&self) -> Result<ResourceStats, StoreError> {
        let url = self.endpoint("/v1/stats")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Idempotent folder create. The store answers 409 when the id already
    /// exists under a different owner.
    pub async fn create_folder(
        &self,
        id: &str,
        payload: &FolderPayload,
    ) -> Result<FolderInfo, StoreError> {
        let url = self.endpoint(&format!("/v1/folders/{id}"))?;
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .json(payload)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_folder(&self, id: &str) -> Result<(), StoreError> {
        let url = self.endpoint(&format!("/v1/folders/{id}"))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_empty_response(response).await
    }

    pub async fn upsert_resource(
        &self,
        group: &str,
        kind: &str,
        name: &str,
        document: &ResourceDocument,
    ) -> Result<RemoteResource, StoreError> {
        let url = self.endpoint(&format!("/v1/resources/{group}/{kind}/{name}"))?;
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .json(document)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_resource(
        &self,
        group: &str,
        kind: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let url = self.endpoint(&format!("/v1/resources/{group}/{kind}/{name}"))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_empty_response(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StoreError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn handle_empty_response(response: reqwest::Response) -> Result<(), StoreError> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> StoreError {
        let status = response.status();
        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
        let body = response.text().await.unwrap_or_default();
        StoreError::Api {
            status,
            body,
            retry_after,
        }
    }
}

impl StoreError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            StoreError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Request(err) => err.is_timeout() || err.is_connect(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }

    /// Server-suggested wait in seconds, from the Retry-After header.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            StoreError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::Api { status, .. } if *status == StatusCode::NOT_FOUND
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(value: Option<&HeaderValue>) -> Option<u64> {
    let text = value?.to_str().ok()?.trim();
    if let Ok(seconds) = text.parse::<u64>() {
        return Some(seconds);
    }
    let when = httpdate::parse_http_date(text).ok()?;
    match when.duration_since(SystemTime::now()) {
        Ok(wait) => Some(wait.as_secs()),
        Err(_) => Some(0),
    }
}

/// One entry of the store listing. Folder items carry the parent folder id in
/// `folder`; the namespace root is listed with an empty path.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteResource {
    pub path: String,
    pub group: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub folder: Option<String>,
}

impl RemoteResource {
    pub fn is_folder(&self) -> bool {
        self.kind == FOLDER_KIND
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ResourcePage {
    pub items: Vec<RemoteResource>,
    pub limit: u32,
    pub offset: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceStats {
    #[serde(default)]
    pub quota_exceeded: bool,
    pub items: Vec<ResourceCount>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceCount {
    pub group: String,
    pub kind: String,
    pub count: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FolderPayload {
    pub title: String,
    #[serde(default)]
    pub parent: Option<String>,
    pub owner: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FolderInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub parent: Option<String>,
    pub owner: String,
}

/// Body of a resource upsert. `spec` is the payload taken from the source
/// file; the other fields situate it in the store.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceDocument {
    pub kind: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub origin: Option<DocumentOrigin>,
    #[serde(default)]
    pub spec: Value,
}

/// Provenance stamped on every document the reconciler writes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DocumentOrigin {
    pub job: String,
    pub path: String,
    pub hash: String,
    pub rev: String,
}
