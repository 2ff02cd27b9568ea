//! Remote file-storage surface used by the reconciler.
//!
//! The master copy physically lives in a Google Drive folder; the pipeline
//! only needs find/create/download/update over single files, so that is the
//! whole trait. `MemoryRemote` backs the reconciler tests.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote returned status {status} during {operation}")]
    Status { status: u16, operation: String },
    #[error("remote file {0} not found")]
    NotFound(String),
    #[error("unexpected remote response: {0}")]
    Malformed(String),
}

/// Minimal contract the reconciler needs from the remote storage service.
#[async_trait]
pub trait RemoteFileStore: Send + Sync {
    /// Id of the file named `name` under folder `parent`, if any.
    async fn find(&self, name: &str, parent: &str) -> Result<Option<String>, RemoteError>;
    /// Create a file with the given content and return its id.
    async fn create(&self, name: &str, parent: &str, content: &[u8]) -> Result<String, RemoteError>;
    async fn download(&self, id: &str) -> Result<Vec<u8>, RemoteError>;
    /// Full-content overwrite of an existing file.
    async fn update(&self, id: &str, content: &[u8]) -> Result<(), RemoteError>;
}

/// Accept either a bare Drive folder id or a full Drive folder URL.
pub fn normalize_drive_folder_id(raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        return String::new();
    }
    if value.contains("drive.google.com") {
        if let Some(rest) = value.split("folders/").nth(1) {
            return rest
                .split(['?', '&', '#', '/'])
                .next()
                .unwrap_or_default()
                .to_string();
        }
    }
    value
        .split(['?', '&', '#', '/'])
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Google Drive v3 client. Credential resolution happens outside this crate;
/// the client receives an already-resolved bearer token.
pub struct DriveClient {
    http: reqwest::Client,
    api_base: String,
    upload_base: String,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
            token: token.into(),
        })
    }

    fn check_status(
        operation: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(RemoteError::Status {
                status: status.as_u16(),
                operation: operation.to_string(),
            })
        }
    }
}

#[async_trait]
impl RemoteFileStore for DriveClient {
    async fn find(&self, name: &str, parent: &str) -> Result<Option<String>, RemoteError> {
        let escaped = name.replace('\'', "\\'");
        let query = format!("name = '{escaped}' and '{parent}' in parents and trashed = false");
        let response = self
            .http
            .get(format!("{}/files", self.api_base))
            .bearer_auth(&self.token)
            .query(&[
                ("q", query.as_str()),
                ("pageSize", "1"),
                ("fields", "files(id)"),
            ])
            .send()
            .await?;
        let body: serde_json::Value = Self::check_status("find", response)?.json().await?;
        Ok(body
            .get("files")
            .and_then(|files| files.as_array())
            .and_then(|files| files.first())
            .and_then(|file| file.get("id"))
            .and_then(|id| id.as_str())
            .map(ToString::to_string))
    }

    async fn create(&self, name: &str, parent: &str, content: &[u8]) -> Result<String, RemoteError> {
        let metadata = serde_json::json!({ "name": name, "parents": [parent] });
        let response = self
            .http
            .post(format!("{}/files", self.api_base))
            .bearer_auth(&self.token)
            .query(&[("fields", "id")])
            .json(&metadata)
            .send()
            .await?;
        let body: serde_json::Value = Self::check_status("create", response)?.json().await?;
        let id = body
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| RemoteError::Malformed("create response missing file id".to_string()))?
            .to_string();
        self.update(&id, content).await?;
        debug!(name, id, "created remote file");
        Ok(id)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, RemoteError> {
        let response = self
            .http
            .get(format!("{}/files/{id}", self.api_base))
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        let response = Self::check_status("download", response)?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn update(&self, id: &str, content: &[u8]) -> Result<(), RemoteError> {
        let response = self
            .http
            .patch(format!("{}/files/{id}", self.upload_base))
            .bearer_auth(&self.token)
            .query(&[("uploadType", "media")])
            .header(reqwest::header::CONTENT_TYPE, "text/csv")
            .body(content.to_vec())
            .send()
            .await?;
        Self::check_status("update", response)?;
        Ok(())
    }
}

/// In-memory remote used by tests across the workspace.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    writes: usize,
    files: Vec<MemoryFile>,
}

#[derive(Debug)]
struct MemoryFile {
    id: String,
    name: String,
    parent: String,
    content: Vec<u8>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of create/update calls observed, for no-write assertions.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    pub async fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .files
            .iter()
            .find(|file| file.id == id)
            .map(|file| file.content.clone())
    }
}

#[async_trait]
impl RemoteFileStore for MemoryRemote {
    async fn find(&self, name: &str, parent: &str) -> Result<Option<String>, RemoteError> {
        Ok(self
            .state
            .lock()
            .await
            .files
            .iter()
            .find(|file| file.name == name && file.parent == parent)
            .map(|file| file.id.clone()))
    }

    async fn create(&self, name: &str, parent: &str, content: &[u8]) -> Result<String, RemoteError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        state.writes += 1;
        let id = format!("mem-{}", state.next_id);
        state.files.push(MemoryFile {
            id: id.clone(),
            name: name.to_string(),
            parent: parent.to_string(),
            content: content.to_vec(),
        });
        Ok(id)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, RemoteError> {
        self.state
            .lock()
            .await
            .files
            .iter()
            .find(|file| file.id == id)
            .map(|file| file.content.clone())
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn update(&self, id: &str, content: &[u8]) -> Result<(), RemoteError> {
        let mut state = self.state.lock().await;
        state.writes += 1;
        let file = state
            .files
            .iter_mut()
            .find(|file| file.id == id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        file.content = content.to_vec();
        Ok(())
    }
}
