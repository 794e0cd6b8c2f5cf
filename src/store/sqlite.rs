//! SQLite-backed [`CatalogStore`] implementation.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{
    Conflict, ConflictStatus, Document, EnsuredDocument, RemovedDocument, Thumbnail,
};

use super::{CatalogStore, DocumentQuery};

const DOCUMENT_COLUMNS: &str =
    "id, filename, title, summary, keywords, path, source, added_at, updated_at";

/// SQLite implementation of the [`CatalogStore`] trait.
///
/// Wraps a [`SqlitePool`]; multi-statement mutations run inside a
/// transaction so a failure rolls back everything written by that call.
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let source: String = row.try_get("source")?;
    Ok(Document {
        id: row.try_get("id")?,
        filename: row.try_get("filename")?,
        title: row.try_get("title")?,
        summary: row.try_get("summary")?,
        keywords: row.try_get("keywords")?,
        path: row.try_get("path")?,
        source: source.parse()?,
        added_at: row.try_get("added_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn thumbnail_from_row(row: &SqliteRow) -> Result<Thumbnail> {
    Ok(Thumbnail {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        thumbnail_path: row.try_get("thumbnail_path")?,
        created_at: row.try_get("created_at")?,
    })
}

fn conflict_from_row(row: &SqliteRow) -> Result<Conflict> {
    let status: String = row.try_get("status")?;
    Ok(Conflict {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        conflict_hash: row.try_get("conflict_hash")?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

/// Escape LIKE wildcards so user text matches literally.
fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn ensure_document(
        &self,
        filename: &str,
        path: &str,
        now: i64,
    ) -> Result<EnsuredDocument> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents (filename, path, source, added_at, updated_at)
            VALUES (?, ?, 'fallback', ?, ?)
            ON CONFLICT(filename) DO NOTHING
            "#,
        )
        .bind(filename)
        .bind(path)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            sqlx::query(
                "UPDATE documents SET path = ?, updated_at = MAX(updated_at, ?) WHERE filename = ?",
            )
            .bind(path)
            .bind(now)
            .bind(filename)
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE filename = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(filename)
        .fetch_one(&mut *tx)
        .await?;
        let document = document_from_row(&row)?;

        tx.commit().await?;

        Ok(EnsuredDocument {
            document,
            created: inserted,
        })
    }

    async fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn find_by_filename(&self, filename: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE filename = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents(&self, query: &DocumentQuery) -> Result<Vec<Document>> {
        let limit = query.limit.unwrap_or(-1);
        let rows = match query.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => {
                let pattern = like_pattern(text);
                sqlx::query(&format!(
                    r#"
                    SELECT {} FROM documents
                    WHERE filename LIKE ? ESCAPE '\' OR title LIKE ? ESCAPE '\'
                    ORDER BY added_at DESC, id DESC
                    LIMIT ?
                    "#,
                    DOCUMENT_COLUMNS
                ))
                .bind(&pattern)
                .bind(&pattern)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            _ => {
                sqlx::query(&format!(
                    "SELECT {} FROM documents ORDER BY added_at DESC, id DESC LIMIT ?",
                    DOCUMENT_COLUMNS
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(document_from_row).collect()
    }

    async fn all_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents ORDER BY id ASC",
            DOCUMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn delete_document(&self, id: i64) -> Result<Option<RemovedDocument>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let document = match row {
            Some(row) => document_from_row(&row)?,
            None => {
                tx.commit().await?;
                return Ok(None);
            }
        };

        let thumbnails = sqlx::query(
            "SELECT id, document_id, thumbnail_path, created_at FROM thumbnails WHERE document_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(thumbnail_from_row)
        .collect::<Result<Vec<_>>>()?;

        sqlx::query("DELETE FROM thumbnails WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conflicts WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(RemovedDocument {
            document,
            thumbnails,
        }))
    }

    async fn insert_thumbnail(
        &self,
        document_id: i64,
        thumbnail_path: &str,
        created_at: i64,
    ) -> Result<Thumbnail> {
        let id = sqlx::query(
            "INSERT INTO thumbnails (document_id, thumbnail_path, created_at) VALUES (?, ?, ?)",
        )
        .bind(document_id)
        .bind(thumbnail_path)
        .bind(created_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Thumbnail {
            id,
            document_id,
            thumbnail_path: thumbnail_path.to_string(),
            created_at,
        })
    }

    async fn thumbnails_for(&self, document_id: i64) -> Result<Vec<Thumbnail>> {
        let rows = sqlx::query(
            "SELECT id, document_id, thumbnail_path, created_at FROM thumbnails WHERE document_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(thumbnail_from_row).collect()
    }

    async fn latest_thumbnail(&self, document_id: i64) -> Result<Option<Thumbnail>> {
        let row = sqlx::query(
            "SELECT id, document_id, thumbnail_path, created_at FROM thumbnails WHERE document_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(thumbnail_from_row).transpose()
    }

    async fn insert_conflict(
        &self,
        document_id: i64,
        conflict_hash: &str,
        created_at: i64,
    ) -> Result<Conflict> {
        let status = ConflictStatus::Unresolved;
        let id = sqlx::query(
            "INSERT INTO conflicts (document_id, conflict_hash, status, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(document_id)
        .bind(conflict_hash)
        .bind(status.as_str())
        .bind(created_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Conflict {
            id,
            document_id,
            conflict_hash: conflict_hash.to_string(),
            status,
            created_at,
        })
    }

    async fn conflicts_for(&self, document_id: i64) -> Result<Vec<Conflict>> {
        let rows = sqlx::query(
            "SELECT id, document_id, conflict_hash, status, created_at FROM conflicts WHERE document_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conflict_from_row).collect()
    }

    async fn set_conflict_status(&self, id: i64, status: ConflictStatus) -> Result<bool> {
        let affected = sqlx::query("UPDATE conflicts SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::contract;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> SqliteCatalog {
        let config = Config::with_paths(
            &tmp.path().join("data/catalog.sqlite"),
            &tmp.path().join("watch"),
            &tmp.path().join("thumbs"),
        );
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        SqliteCatalog::new(pool)
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        contract::ensure_is_idempotent(&open(&tmp).await).await;
    }

    #[tokio::test]
    async fn delete_cascades() {
        let tmp = TempDir::new().unwrap();
        contract::delete_cascades(&open(&tmp).await).await;
    }

    #[tokio::test]
    async fn listing_filters_and_orders() {
        let tmp = TempDir::new().unwrap();
        contract::listing_filters_and_orders(&open(&tmp).await).await;
    }

    #[tokio::test]
    async fn conflicts_update_status() {
        let tmp = TempDir::new().unwrap();
        contract::conflicts_update_status(&open(&tmp).await).await;
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        crate::migrate::run_migrations(store.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn like_wildcards_match_literally() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        store.ensure_document("100%.txt", "/w/1", 1).await.unwrap();
        store.ensure_document("1000.txt", "/w/2", 2).await.unwrap();

        let hits = store
            .list_documents(&DocumentQuery::matching("0%"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filename, "100%.txt");
    }

    #[test]
    fn like_pattern_escapes() {
        assert_eq!(like_pattern("a_b"), "%a\\_b%");
    }

    #[tokio::test]
    async fn failed_delete_rolls_back_the_cascade() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let doc = store
            .ensure_document("kept.pdf", "/watch/kept.pdf", 1)
            .await
            .unwrap()
            .document;
        store.insert_thumbnail(doc.id, "/thumbs/1_kept.png", 2).await.unwrap();
        store.insert_conflict(doc.id, "abc123", 3).await.unwrap();

        // Thumbnails and conflicts go first inside the transaction; refusing
        // the document row must bring them back.
        sqlx::query(
            "CREATE TRIGGER refuse_delete BEFORE DELETE ON documents BEGIN SELECT RAISE(ABORT, 'refused'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let err = store.delete_document(doc.id).await.unwrap_err();
        assert!(format!("{:#}", err).contains("refused"));
        assert!(store.get_document(doc.id).await.unwrap().is_some());
        assert_eq!(store.thumbnails_for(doc.id).await.unwrap().len(), 1);
        assert_eq!(store.conflicts_for(doc.id).await.unwrap().len(), 1);
    }
}
