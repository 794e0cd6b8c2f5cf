//! Ingestion pipeline.
//!
//! Turns normalized filesystem actions into catalog mutations, thumbnails and
//! change events. Every step for one file is ordered: the store commits
//! before the thumbnail is rendered, and the event is published last.
//!
//! Each action runs in two halves. [`IngestPipeline::stage`] commits the
//! catalog change; [`IngestPipeline::complete`] renders or removes artifacts
//! and publishes. The watcher runs the second half off its shard so one slow
//! render does not hold back unrelated files.
//!
//! Both entry points are idempotent. Seeing the same file twice refreshes the
//! existing document instead of creating a second one; a vanish for a file
//! the catalog does not know is a no-op.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::broadcast::EventBroadcaster;
use crate::error::IngestError;
use crate::models::{ChangeEvent, Document, EnsuredDocument, RemovedDocument};
use crate::store::CatalogStore;
use crate::thumbnail::{self, ThumbnailService};
use crate::watcher::FsAction;

/// What a pipeline call did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Indexed {
        document: Document,
        created: bool,
        thumbnail: Option<String>,
    },
    Removed {
        document: Document,
        artifacts: usize,
    },
    /// The file was never in the catalog (or already gone).
    NotTracked,
}

/// An action whose catalog change is committed but not yet announced.
#[derive(Debug, Clone)]
pub enum Staged {
    Indexed {
        path: PathBuf,
        filename: String,
        ensured: EnsuredDocument,
    },
    Removed {
        filename: String,
        removed: RemovedDocument,
    },
    NotTracked,
}

pub struct IngestPipeline {
    store: Arc<dyn CatalogStore>,
    thumbnails: Arc<ThumbnailService>,
    events: EventBroadcaster,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        thumbnails: Arc<ThumbnailService>,
        events: EventBroadcaster,
    ) -> Self {
        Self {
            store,
            thumbnails,
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub fn thumbnails(&self) -> &Arc<ThumbnailService> {
        &self.thumbnails
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    /// Index a file that appeared or changed.
    ///
    /// A new filename becomes a document with `source = fallback`; a known
    /// one has its path and `updated_at` refreshed. A thumbnail is rendered
    /// either way, and a `created` or `updated` event follows.
    pub async fn on_appeared_or_changed(&self, path: &Path) -> Result<Outcome, IngestError> {
        let staged = self.stage_index(path).await?;
        Ok(self.complete(staged).await)
    }

    /// Remove the document for a file that vanished.
    pub async fn on_vanished(&self, path: &Path) -> Result<Outcome, IngestError> {
        let filename = filename_of(path)?;
        self.forget(&filename).await
    }

    /// Delete the document named `filename` with its thumbnails and
    /// conflicts, then its artifacts, then announce it.
    pub async fn forget(&self, filename: &str) -> Result<Outcome, IngestError> {
        let staged = self.stage_removal(filename).await?;
        Ok(self.complete(staged).await)
    }

    /// Commit the catalog side of a watcher action. Nothing is rendered,
    /// removed from disk or published until [`complete`](Self::complete).
    pub async fn stage(&self, action: &FsAction) -> Result<Staged, IngestError> {
        match action {
            FsAction::Appeared(path) | FsAction::Changed(path) => self.stage_index(path).await,
            FsAction::Vanished(path) => {
                let filename = filename_of(path)?;
                self.stage_removal(&filename).await
            }
        }
    }

    async fn stage_index(&self, path: &Path) -> Result<Staged, IngestError> {
        let filename = filename_of(path)?;
        let now = Utc::now().timestamp();

        let ensured = self
            .store
            .ensure_document(&filename, &path.to_string_lossy(), now)
            .await
            .map_err(|e| IngestError::storage("index", &filename, e))?;

        Ok(Staged::Indexed {
            path: path.to_path_buf(),
            filename,
            ensured,
        })
    }

    async fn stage_removal(&self, filename: &str) -> Result<Staged, IngestError> {
        let Some(document) = self
            .store
            .find_by_filename(filename)
            .await
            .map_err(|e| IngestError::storage("lookup", filename, e))?
        else {
            debug!(filename, "vanished file was not tracked");
            return Ok(Staged::NotTracked);
        };

        let Some(removed) = self
            .store
            .delete_document(document.id)
            .await
            .map_err(|e| IngestError::storage("delete", filename, e))?
        else {
            // Someone else removed it between lookup and delete.
            return Ok(Staged::NotTracked);
        };

        Ok(Staged::Removed {
            filename: filename.to_string(),
            removed,
        })
    }

    /// Render or remove artifacts for a staged action, then publish its event.
    pub async fn complete(&self, staged: Staged) -> Outcome {
        match staged {
            Staged::Indexed {
                path,
                filename,
                ensured,
            } => {
                let document = ensured.document;
                let thumbnail = self
                    .thumbnails
                    .generate(document.id, &path, &filename)
                    .await
                    .map(|generated| generated.url);

                let event =
                    ChangeEvent::indexed(ensured.created, document.id, &filename, thumbnail.clone());
                let action = event.action;
                let delivered = self.events.publish(event);

                info!(
                    document_id = document.id,
                    filename = %filename,
                    action = %action,
                    thumbnail = thumbnail.as_deref().unwrap_or(""),
                    subscribers = delivered,
                    "document indexed"
                );

                Outcome::Indexed {
                    document,
                    created: ensured.created,
                    thumbnail,
                }
            }
            Staged::Removed { filename, removed } => {
                let artifacts: BTreeSet<&str> = removed
                    .thumbnails
                    .iter()
                    .map(|t| t.thumbnail_path.as_str())
                    .collect();
                for artifact in &artifacts {
                    thumbnail::remove_artifact(artifact).await;
                }

                let delivered = self
                    .events
                    .publish(ChangeEvent::deleted(removed.document.id, &filename));
                info!(
                    document_id = removed.document.id,
                    filename = %filename,
                    artifacts = artifacts.len(),
                    subscribers = delivered,
                    "document removed"
                );

                Outcome::Removed {
                    artifacts: artifacts.len(),
                    document: removed.document,
                }
            }
            Staged::NotTracked => Outcome::NotTracked,
        }
    }
}

fn filename_of(path: &Path) -> Result<String, IngestError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| IngestError::InvalidPath(path.to_path_buf()))
}
