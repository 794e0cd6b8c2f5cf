//! In-memory [`CatalogStore`] implementation for tests and embedding.
//!
//! All state sits behind one `std::sync::RwLock`, so every method observes
//! and mutates the catalog atomically.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{
    Conflict, ConflictStatus, Document, DocumentSource, EnsuredDocument, RemovedDocument,
    Thumbnail,
};

use super::{CatalogStore, DocumentQuery};

#[derive(Default)]
struct Catalog {
    next_document_id: i64,
    next_thumbnail_id: i64,
    next_conflict_id: i64,
    documents: BTreeMap<i64, Document>,
    thumbnails: Vec<Thumbnail>,
    conflicts: Vec<Conflict>,
}

/// In-memory catalog.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<Catalog>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Catalog>> {
        self.inner
            .read()
            .map_err(|_| anyhow!("memory catalog lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Catalog>> {
        self.inner
            .write()
            .map_err(|_| anyhow!("memory catalog lock poisoned"))
    }
}

fn matches_text(doc: &Document, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    doc.filename.to_lowercase().contains(&needle)
        || doc
            .title
            .as_deref()
            .is_some_and(|t| t.to_lowercase().contains(&needle))
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn ensure_document(
        &self,
        filename: &str,
        path: &str,
        now: i64,
    ) -> Result<EnsuredDocument> {
        let mut catalog = self.write()?;

        if let Some(doc) = catalog
            .documents
            .values_mut()
            .find(|d| d.filename == filename)
        {
            doc.path = path.to_string();
            doc.updated_at = doc.updated_at.max(now);
            return Ok(EnsuredDocument {
                document: doc.clone(),
                created: false,
            });
        }

        catalog.next_document_id += 1;
        let document = Document {
            id: catalog.next_document_id,
            filename: filename.to_string(),
            title: None,
            summary: None,
            keywords: None,
            path: path.to_string(),
            source: DocumentSource::Fallback,
            added_at: now,
            updated_at: now,
        };
        catalog.documents.insert(document.id, document.clone());

        Ok(EnsuredDocument {
            document,
            created: true,
        })
    }

    async fn get_document(&self, id: i64) -> Result<Option<Document>> {
        Ok(self.read()?.documents.get(&id).cloned())
    }

    async fn find_by_filename(&self, filename: &str) -> Result<Option<Document>> {
        Ok(self
            .read()?
            .documents
            .values()
            .find(|d| d.filename == filename)
            .cloned())
    }

    async fn list_documents(&self, query: &DocumentQuery) -> Result<Vec<Document>> {
        let catalog = self.read()?;
        let needle = query.text.as_deref().map(str::trim).filter(|t| !t.is_empty());

        let mut docs: Vec<Document> = catalog
            .documents
            .values()
            .filter(|d| needle.map_or(true, |n| matches_text(d, n)))
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.added_at.cmp(&a.added_at).then(b.id.cmp(&a.id)));

        if let Some(limit) = query.limit.filter(|l| *l >= 0) {
            docs.truncate(limit as usize);
        }
        Ok(docs)
    }

    async fn all_documents(&self) -> Result<Vec<Document>> {
        Ok(self.read()?.documents.values().cloned().collect())
    }

    async fn delete_document(&self, id: i64) -> Result<Option<RemovedDocument>> {
        let mut catalog = self.write()?;

        let Some(document) = catalog.documents.remove(&id) else {
            return Ok(None);
        };

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut catalog.thumbnails)
            .into_iter()
            .partition(|t| t.document_id == id);
        catalog.thumbnails = kept;
        catalog.conflicts.retain(|c| c.document_id != id);

        Ok(Some(RemovedDocument {
            document,
            thumbnails: removed,
        }))
    }

    async fn insert_thumbnail(
        &self,
        document_id: i64,
        thumbnail_path: &str,
        created_at: i64,
    ) -> Result<Thumbnail> {
        let mut catalog = self.write()?;
        if !catalog.documents.contains_key(&document_id) {
            anyhow::bail!("thumbnail references unknown document {}", document_id);
        }

        catalog.next_thumbnail_id += 1;
        let thumbnail = Thumbnail {
            id: catalog.next_thumbnail_id,
            document_id,
            thumbnail_path: thumbnail_path.to_string(),
            created_at,
        };
        catalog.thumbnails.push(thumbnail.clone());
        Ok(thumbnail)
    }

    async fn thumbnails_for(&self, document_id: i64) -> Result<Vec<Thumbnail>> {
        let mut thumbs: Vec<Thumbnail> = self
            .read()?
            .thumbnails
            .iter()
            .filter(|t| t.document_id == document_id)
            .cloned()
            .collect();
        thumbs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(thumbs)
    }

    async fn latest_thumbnail(&self, document_id: i64) -> Result<Option<Thumbnail>> {
        Ok(self.thumbnails_for(document_id).await?.pop())
    }

    async fn insert_conflict(
        &self,
        document_id: i64,
        conflict_hash: &str,
        created_at: i64,
    ) -> Result<Conflict> {
        let mut catalog = self.write()?;
        if !catalog.documents.contains_key(&document_id) {
            anyhow::bail!("conflict references unknown document {}", document_id);
        }

        catalog.next_conflict_id += 1;
        let conflict = Conflict {
            id: catalog.next_conflict_id,
            document_id,
            conflict_hash: conflict_hash.to_string(),
            status: ConflictStatus::Unresolved,
            created_at,
        };
        catalog.conflicts.push(conflict.clone());
        Ok(conflict)
    }

    async fn conflicts_for(&self, document_id: i64) -> Result<Vec<Conflict>> {
        Ok(self
            .read()?
            .conflicts
            .iter()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn set_conflict_status(&self, id: i64, status: ConflictStatus) -> Result<bool> {
        let mut catalog = self.write()?;
        match catalog.conflicts.iter_mut().find(|c| c.id == id) {
            Some(conflict) => {
                conflict.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
