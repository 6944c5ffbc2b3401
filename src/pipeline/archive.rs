//! Archival dispatcher — upload-or-overwrite into a nested folder path.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::RemoteError;
use crate::google::drive::{ItemKind, StorageApi};
use crate::pipeline::types::Artifact;

/// Where the artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutcome {
    pub file_id: String,
    /// `false` when an existing file was overwritten in place.
    pub created: bool,
}

pub struct ArchivalDispatcher {
    storage: Arc<dyn StorageApi>,
    root_id: String,
}

impl ArchivalDispatcher {
    pub fn new(storage: Arc<dyn StorageApi>, root_id: impl Into<String>) -> Self {
        Self {
            storage,
            root_id: root_id.into(),
        }
    }

    /// Store `artifact` under `folder_path` ('/'-delimited, relative to root).
    ///
    /// Folder levels are found or created one at a time, so a retry after a
    /// partial failure reuses what the earlier attempt created. A file with
    /// the same name in the leaf folder is overwritten, keeping its id.
    pub async fn archive(
        &self,
        artifact: &Artifact,
        folder_path: &str,
    ) -> Result<ArchiveOutcome, RemoteError> {
        let folder_id = self.resolve_folder(folder_path).await?;

        let existing = self
            .storage
            .find(&artifact.file_name, &folder_id, ItemKind::File)
            .await?;

        let outcome = match existing {
            Some(file) => {
                self.storage
                    .update_file_content(&file.id, &artifact.mime_type, &artifact.content)
                    .await?;
                ArchiveOutcome {
                    file_id: file.id,
                    created: false,
                }
            }
            None => {
                let file = self
                    .storage
                    .create_file(
                        &artifact.file_name,
                        &folder_id,
                        &artifact.mime_type,
                        &artifact.content,
                    )
                    .await?;
                ArchiveOutcome {
                    file_id: file.id,
                    created: true,
                }
            }
        };

        info!(
            file = %artifact.file_name,
            folder = folder_path,
            file_id = %outcome.file_id,
            created = outcome.created,
            "Archived artifact"
        );
        Ok(outcome)
    }

    async fn resolve_folder(&self, folder_path: &str) -> Result<String, RemoteError> {
        let mut parent = self.root_id.clone();
        for name in folder_path.split('/').map(str::trim).filter(|s| !s.is_empty()) {
            parent = match self.storage.find(name, &parent, ItemKind::Folder).await? {
                Some(folder) => folder.id,
                None => {
                    let folder = self.storage.create_folder(name, &parent).await?;
                    debug!(folder = name, id = %folder.id, "Created folder");
                    folder.id
                }
            };
        }
        Ok(parent)
    }
}
