//! Core data models used throughout docwatch.
//!
//! These types represent the catalog rows (documents, thumbnails, conflicts)
//! and the change notifications that flow from the ingestion pipeline to
//! subscribers.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Whether a document's title/summary/keywords came from the annotation
/// process or are the defaults written at indexing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentSource {
    Gpt,
    Fallback,
}

impl DocumentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentSource::Gpt => "gpt",
            DocumentSource::Fallback => "fallback",
        }
    }
}

impl FromStr for DocumentSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gpt" => Ok(DocumentSource::Gpt),
            "fallback" => Ok(DocumentSource::Fallback),
            other => anyhow::bail!("unknown document source: '{}'", other),
        }
    }
}

/// One indexed file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: i64,
    pub filename: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub keywords: Option<String>,
    pub path: String,
    pub source: DocumentSource,
    pub added_at: i64,
    pub updated_at: i64,
}

/// A rendered preview artifact owned by a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thumbnail {
    pub id: i64,
    pub document_id: i64,
    pub thumbnail_path: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Unresolved => "unresolved",
            ConflictStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for ConflictStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unresolved" => Ok(ConflictStatus::Unresolved),
            "resolved" => Ok(ConflictStatus::Resolved),
            other => anyhow::bail!("unknown conflict status: '{}'", other),
        }
    }
}

/// Reserved for duplicate detection. Nothing in the ingestion path writes it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub id: i64,
    pub document_id: i64,
    pub conflict_hash: String,
    pub status: ConflictStatus,
    pub created_at: i64,
}

/// Result of [`CatalogStore::ensure_document`](crate::store::CatalogStore::ensure_document).
#[derive(Debug, Clone)]
pub struct EnsuredDocument {
    pub document: Document,
    /// `true` when the row was inserted by this call.
    pub created: bool,
}

/// Rows removed by a cascading document delete.
#[derive(Debug, Clone)]
pub struct RemovedDocument {
    pub document: Document,
    pub thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeAction::Created => "created",
            ChangeAction::Updated => "updated",
            ChangeAction::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Notification published after a catalog mutation has committed.
///
/// Serializes to one JSON object per notification, e.g.
/// `{"action":"created","id":3,"filename":"report.pdf","thumbnail":"/static/thumbnails/3_report.png"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl ChangeEvent {
    pub fn indexed(created: bool, id: i64, filename: &str, thumbnail: Option<String>) -> Self {
        Self {
            action: if created {
                ChangeAction::Created
            } else {
                ChangeAction::Updated
            },
            id: Some(id),
            filename: filename.to_string(),
            thumbnail,
        }
    }

    pub fn deleted(id: i64, filename: &str) -> Self {
        Self {
            action: ChangeAction::Deleted,
            id: Some(id),
            filename: filename.to_string(),
            thumbnail: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_event_omits_thumbnail() {
        let json = serde_json::to_value(ChangeEvent::deleted(7, "report.pdf")).unwrap();
        assert_eq!(json["action"], "deleted");
        assert_eq!(json["filename"], "report.pdf");
        assert!(json.get("thumbnail").is_none());
    }

    #[test]
    fn indexed_event_without_thumbnail() {
        let json = serde_json::to_value(ChangeEvent::indexed(false, 2, "a.txt", None)).unwrap();
        assert_eq!(json["action"], "updated");
        assert_eq!(json["id"], 2);
        assert!(json.get("thumbnail").is_none());
    }

    #[test]
    fn source_round_trips_through_str() {
        assert_eq!("gpt".parse::<DocumentSource>().unwrap(), DocumentSource::Gpt);
        assert_eq!(DocumentSource::Fallback.as_str(), "fallback");
        assert!("other".parse::<DocumentSource>().is_err());
    }
}
