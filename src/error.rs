use std::path::PathBuf;

/// Failures surfaced by the ingestion pipeline and the watcher.
///
/// Render failures never appear here: the thumbnail service absorbs them
/// and reports "no thumbnail" instead.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// A catalog operation could not complete; nothing it wrote was kept.
    #[error("storage failure during {operation} of '{filename}': {source}")]
    Storage {
        operation: &'static str,
        filename: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The OS notification source is unusable. The watcher cannot continue.
    #[error("watch channel failure: {0}")]
    WatchChannel(String),

    /// A path the pipeline cannot derive a filename from.
    #[error("path has no usable file name: {}", .0.display())]
    InvalidPath(PathBuf),
}

impl IngestError {
    pub fn storage(operation: &'static str, filename: &str, source: anyhow::Error) -> Self {
        IngestError::Storage {
            operation,
            filename: filename.to_string(),
            source: source.into(),
        }
    }
}

impl From<notify::Error> for IngestError {
    fn from(err: notify::Error) -> Self {
        IngestError::WatchChannel(err.to_string())
    }
}
