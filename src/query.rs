//! Document listing.
//!
//! Read side of the catalog: a case-insensitive substring filter over
//! filename and title, newest first, with each document's current thumbnail
//! resolved to a public URL. Used by `docwatch list` and by embedders.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use crate::config::{Config, ThumbnailConfig};
use crate::db;
use crate::migrate;
use crate::models::{Document, DocumentSource};
use crate::store::{CatalogStore, DocumentQuery, SqliteCatalog};
use crate::thumbnail;

/// One row of a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentListing {
    pub id: i64,
    pub filename: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub keywords: Option<String>,
    pub path: String,
    pub source: DocumentSource,
    pub added_at: String,   // ISO8601
    pub updated_at: String, // ISO8601
    /// URL of the current thumbnail, only when its artifact exists on disk.
    pub thumbnail: Option<String>,
}

/// List documents matching `filter` (all documents when `None` or blank).
pub async fn list_documents(
    store: &dyn CatalogStore,
    config: &ThumbnailConfig,
    filter: Option<&str>,
) -> Result<Vec<DocumentListing>> {
    let query = match filter.map(str::trim).filter(|f| !f.is_empty()) {
        Some(text) => DocumentQuery::matching(text),
        None => DocumentQuery::default(),
    };

    let documents = store.list_documents(&query).await?;
    let mut listings = Vec::with_capacity(documents.len());
    for document in documents {
        let thumbnail = match store.latest_thumbnail(document.id).await? {
            Some(t) if Path::new(&t.thumbnail_path).exists() => {
                thumbnail::artifact_url(&config.url_prefix, Path::new(&t.thumbnail_path))
            }
            _ => None,
        };
        listings.push(listing(document, thumbnail));
    }
    Ok(listings)
}

fn listing(document: Document, thumbnail: Option<String>) -> DocumentListing {
    DocumentListing {
        id: document.id,
        added_at: format_ts_iso(document.added_at),
        updated_at: format_ts_iso(document.updated_at),
        filename: document.filename,
        title: document.title,
        summary: document.summary,
        keywords: document.keywords,
        path: document.path,
        source: document.source,
        thumbnail,
    }
}

/// CLI entry point for `docwatch list`.
pub async fn run_list(config: &Config, filter: Option<&str>, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let store = SqliteCatalog::new(pool.clone());

    let listings = list_documents(&store, &config.thumbnails, filter).await?;
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }

    if listings.is_empty() {
        println!("No documents.");
        return Ok(());
    }

    for doc in &listings {
        println!(
            "{:>5}  {}  {}",
            doc.id,
            doc.added_at,
            doc.title.as_deref().unwrap_or(&doc.filename)
        );
        if doc.title.is_some() {
            println!("       file: {}", doc.filename);
        }
        match &doc.thumbnail {
            Some(url) => println!("       thumbnail: {}", url),
            None => println!("       thumbnail: (none)"),
        }
    }
    println!();
    println!("{} document(s)", listings.len());

    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
