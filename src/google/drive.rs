//! Storage capability — folder/file lookup, creation and content overwrite.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;

use crate::error::RemoteError;
use crate::google::http::{GoogleHttp, encode_path_segment};

const SERVICE: &str = "drive";

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Restricts a lookup to folders or to regular files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Folder,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StorageItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<StorageItem>,
}

/// Operations the archival dispatcher needs from object storage.
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// First non-trashed item named exactly `name` directly under `parent_id`.
    async fn find(
        &self,
        name: &str,
        parent_id: &str,
        kind: ItemKind,
    ) -> Result<Option<StorageItem>, RemoteError>;

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<StorageItem, RemoteError>;

    async fn create_file(
        &self,
        name: &str,
        parent_id: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<StorageItem, RemoteError>;

    /// Replace the content of an existing file, keeping its id.
    async fn update_file_content(
        &self,
        file_id: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<StorageItem, RemoteError>;
}

/// Escape a value for a single-quoted Drive query literal.
pub fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn lookup_query(name: &str, parent_id: &str, kind: ItemKind) -> String {
    let mime_clause = match kind {
        ItemKind::Folder => format!("mimeType = '{FOLDER_MIME_TYPE}'"),
        ItemKind::File => format!("mimeType != '{FOLDER_MIME_TYPE}'"),
    };
    format!(
        "name = '{}' and '{}' in parents and trashed = false and {mime_clause}",
        escape_query_value(name),
        escape_query_value(parent_id)
    )
}

/// Drive v3 REST adapter. Metadata goes to `base_url`, bytes to `upload_url`.
pub struct DriveClient {
    http: GoogleHttp,
    base_url: String,
    upload_url: String,
}

impl DriveClient {
    pub fn new(
        http: GoogleHttp,
        base_url: impl Into<String>,
        upload_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            upload_url: upload_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn create(
        &self,
        name: &str,
        parent_id: &str,
        mime_type: &str,
    ) -> Result<StorageItem, RemoteError> {
        let request = self
            .http
            .request(Method::POST, &format!("{}/files", self.base_url))
            .query(&[("fields", "id,name")])
            .json(&serde_json::json!({
                "name": name,
                "mimeType": mime_type,
                "parents": [parent_id],
            }));
        self.http.send_json(SERVICE, name, request).await
    }
}

#[async_trait]
impl StorageApi for DriveClient {
    async fn find(
        &self,
        name: &str,
        parent_id: &str,
        kind: ItemKind,
    ) -> Result<Option<StorageItem>, RemoteError> {
        let query = lookup_query(name, parent_id, kind);
        let request = self
            .http
            .request(Method::GET, &format!("{}/files", self.base_url))
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id,name)"),
                ("spaces", "drive"),
                ("pageSize", "10"),
            ]);
        let list: FileList = self.http.send_json(SERVICE, name, request).await?;
        Ok(list.files.into_iter().next())
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<StorageItem, RemoteError> {
        self.create(name, parent_id, FOLDER_MIME_TYPE).await
    }

    async fn create_file(
        &self,
        name: &str,
        parent_id: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<StorageItem, RemoteError> {
        // Metadata first, then the bytes as a media upload onto the new id.
        let item = self.create(name, parent_id, mime_type).await?;
        self.update_file_content(&item.id, mime_type, content).await
    }

    async fn update_file_content(
        &self,
        file_id: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<StorageItem, RemoteError> {
        let url = format!("{}/files/{}", self.upload_url, encode_path_segment(file_id));
        let request = self
            .http
            .request(Method::PATCH, &url)
            .query(&[("uploadType", "media"), ("fields", "id,name")])
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(content.to_vec());
        self.http
            .send_json(SERVICE, &format!("file {file_id}"), request)
            .await
    }
}
