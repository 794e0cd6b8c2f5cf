//! Catalog storage abstraction.
//!
//! The [`CatalogStore`] trait defines every operation the ingestion pipeline,
//! thumbnail service, reconciler and query layer need against the catalog,
//! so components receive the store as an explicit `Arc<dyn CatalogStore>`
//! rather than reaching for a process-wide session.
//!
//! Each mutating method is a single atomic unit: it either commits in full
//! or leaves the catalog untouched.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Conflict, ConflictStatus, Document, EnsuredDocument, RemovedDocument, Thumbnail};

pub use memory::MemoryCatalog;
pub use sqlite::SqliteCatalog;

/// Filter for [`CatalogStore::list_documents`].
#[derive(Debug, Clone, Default)]
pub struct DocumentQuery {
    /// Case-insensitive substring matched against filename or title.
    pub text: Option<String>,
    pub limit: Option<i64>,
}

impl DocumentQuery {
    pub fn matching(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            limit: None,
        }
    }
}

/// Abstract storage backend for the catalog.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_document`](CatalogStore::ensure_document) | Insert by filename, or refresh the existing row |
/// | [`delete_document`](CatalogStore::delete_document) | Remove a document with its thumbnails and conflicts |
/// | [`insert_thumbnail`](CatalogStore::insert_thumbnail) | Record a rendered artifact |
/// | [`list_documents`](CatalogStore::list_documents) | Filtered listing, newest first |
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Insert a document for `filename` if none exists (`source = fallback`,
    /// both timestamps `now`). Otherwise update its `path` and move
    /// `updated_at` forward to `now` (never backwards).
    async fn ensure_document(&self, filename: &str, path: &str, now: i64)
        -> Result<EnsuredDocument>;

    async fn get_document(&self, id: i64) -> Result<Option<Document>>;

    async fn find_by_filename(&self, filename: &str) -> Result<Option<Document>>;

    /// Documents ordered by `added_at` descending (newest first).
    async fn list_documents(&self, query: &DocumentQuery) -> Result<Vec<Document>>;

    async fn all_documents(&self) -> Result<Vec<Document>>;

    /// Delete the document, all of its thumbnails and conflicts in one
    /// transaction. Returns the removed rows, or `None` if the id is unknown.
    async fn delete_document(&self, id: i64) -> Result<Option<RemovedDocument>>;

    async fn insert_thumbnail(
        &self,
        document_id: i64,
        thumbnail_path: &str,
        created_at: i64,
    ) -> Result<Thumbnail>;

    /// Thumbnails for a document, oldest first.
    async fn thumbnails_for(&self, document_id: i64) -> Result<Vec<Thumbnail>>;

    /// The current (most recently created) thumbnail.
    async fn latest_thumbnail(&self, document_id: i64) -> Result<Option<Thumbnail>>;

    async fn insert_conflict(
        &self,
        document_id: i64,
        conflict_hash: &str,
        created_at: i64,
    ) -> Result<Conflict>;

    async fn conflicts_for(&self, document_id: i64) -> Result<Vec<Conflict>>;

    /// Returns `false` if no conflict has this id.
    async fn set_conflict_status(&self, id: i64, status: ConflictStatus) -> Result<bool>;
}

/// Shared backend contract checks, run against every implementation.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;

    pub async fn ensure_is_idempotent(store: &dyn CatalogStore) {
        let first = store.ensure_document("a.txt", "/w/a.txt", 100).await.unwrap();
        assert!(first.created);
        assert_eq!(first.document.added_at, 100);

        let second = store.ensure_document("a.txt", "/w/a.txt", 200).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.document.id, first.document.id);
        assert_eq!(second.document.added_at, 100);
        assert_eq!(second.document.updated_at, 200);

        // updated_at never moves backwards
        let third = store.ensure_document("a.txt", "/w/a.txt", 150).await.unwrap();
        assert_eq!(third.document.updated_at, 200);

        assert_eq!(store.all_documents().await.unwrap().len(), 1);
    }

    pub async fn delete_cascades(store: &dyn CatalogStore) {
        let doc = store
            .ensure_document("b.pdf", "/w/b.pdf", 10)
            .await
            .unwrap()
            .document;
        let other = store
            .ensure_document("c.pdf", "/w/c.pdf", 10)
            .await
            .unwrap()
            .document;
        store.insert_thumbnail(doc.id, "/t/1.png", 11).await.unwrap();
        store.insert_thumbnail(doc.id, "/t/2.png", 12).await.unwrap();
        store.insert_thumbnail(other.id, "/t/3.png", 12).await.unwrap();
        store.insert_conflict(doc.id, "abc", 13).await.unwrap();

        let latest = store.latest_thumbnail(doc.id).await.unwrap().unwrap();
        assert_eq!(latest.thumbnail_path, "/t/2.png");

        let removed = store.delete_document(doc.id).await.unwrap().unwrap();
        assert_eq!(removed.document.filename, "b.pdf");
        assert_eq!(removed.thumbnails.len(), 2);

        assert!(store.get_document(doc.id).await.unwrap().is_none());
        assert!(store.thumbnails_for(doc.id).await.unwrap().is_empty());
        assert!(store.conflicts_for(doc.id).await.unwrap().is_empty());
        assert_eq!(store.thumbnails_for(other.id).await.unwrap().len(), 1);

        assert!(store.delete_document(doc.id).await.unwrap().is_none());
    }

    pub async fn listing_filters_and_orders(store: &dyn CatalogStore) {
        store.ensure_document("Alpha Report.pdf", "/w/1", 1).await.unwrap();
        store.ensure_document("beta.txt", "/w/2", 2).await.unwrap();
        store.ensure_document("gamma_report.docx", "/w/3", 3).await.unwrap();

        let all = store.list_documents(&DocumentQuery::default()).await.unwrap();
        let names: Vec<_> = all.iter().map(|d| d.filename.as_str()).collect();
        assert_eq!(names, vec!["gamma_report.docx", "beta.txt", "Alpha Report.pdf"]);

        let reports = store
            .list_documents(&DocumentQuery::matching("REPORT"))
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].filename, "gamma_report.docx");

        let limited = store
            .list_documents(&DocumentQuery {
                text: None,
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    pub async fn conflicts_update_status(store: &dyn CatalogStore) {
        let doc = store
            .ensure_document("d.txt", "/w/d.txt", 1)
            .await
            .unwrap()
            .document;
        let conflict = store.insert_conflict(doc.id, "hash", 2).await.unwrap();
        assert_eq!(conflict.status, ConflictStatus::Unresolved);

        assert!(store
            .set_conflict_status(conflict.id, ConflictStatus::Resolved)
            .await
            .unwrap());
        let conflicts = store.conflicts_for(doc.id).await.unwrap();
        assert_eq!(conflicts[0].status, ConflictStatus::Resolved);

        assert!(!store
            .set_conflict_status(9999, ConflictStatus::Resolved)
            .await
            .unwrap());
    }
}
