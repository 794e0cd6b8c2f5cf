//! Catalog/filesystem reconciliation.
//!
//! Notifications are lost whenever the process is not running, so the
//! catalog can drift from the watched directory. The [`Reconciler`] closes
//! the gap in both directions:
//!
//! - [`sweep`](Reconciler::sweep) removes documents whose file is gone and
//!   re-renders thumbnails whose artifact is missing;
//! - [`index_untracked`](Reconciler::index_untracked) indexes files that
//!   exist on disk but not in the catalog.
//!
//! [`startup`](Reconciler::startup) runs both before live watching begins.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::WatchConfig;
use crate::models::Document;
use crate::pipeline::{IngestPipeline, Outcome};
use crate::watcher::FileFilter;

/// Counters from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Documents examined by the sweep.
    pub checked: usize,
    /// Documents removed because their file no longer exists.
    pub removed: usize,
    pub thumbnails_regenerated: usize,
    /// Files found on disk that were not yet catalogued.
    pub indexed: usize,
    /// Per-item failures. They are logged and never abort the pass.
    pub failures: usize,
}

impl SweepReport {
    pub fn merge(&mut self, other: SweepReport) {
        self.checked += other.checked;
        self.removed += other.removed;
        self.thumbnails_regenerated += other.thumbnails_regenerated;
        self.indexed += other.indexed;
        self.failures += other.failures;
    }
}

pub struct Reconciler {
    pipeline: Arc<IngestPipeline>,
    root: PathBuf,
    filter: FileFilter,
}

impl Reconciler {
    pub fn new(config: &WatchConfig, pipeline: Arc<IngestPipeline>) -> Result<Self> {
        // Match the canonical paths the watcher reports.
        let root = config
            .root
            .canonicalize()
            .unwrap_or_else(|_| config.root.clone());
        Ok(Self {
            pipeline,
            root,
            filter: FileFilter::from_config(config)?,
        })
    }

    /// Check every catalogued document against the filesystem.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let documents = self
            .pipeline
            .store()
            .all_documents()
            .await
            .context("Failed to load documents for sweep")?;

        let mut report = SweepReport::default();
        for document in documents {
            report.checked += 1;
            self.check_document(&document, &mut report).await;
        }

        info!(
            checked = report.checked,
            removed = report.removed,
            regenerated = report.thumbnails_regenerated,
            failures = report.failures,
            "sweep complete"
        );
        Ok(report)
    }

    async fn check_document(&self, document: &Document, report: &mut SweepReport) {
        let path = Path::new(&document.path);

        match tokio::fs::try_exists(path).await {
            Ok(true) => {}
            Ok(false) => {
                match self.pipeline.forget(&document.filename).await {
                    Ok(Outcome::Removed { .. }) => report.removed += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(document_id = document.id, filename = %document.filename, error = %e, "sweep removal failed");
                        report.failures += 1;
                    }
                }
                return;
            }
            Err(e) => {
                // Unknown is not gone; leave the document alone.
                warn!(document_id = document.id, path = %path.display(), error = %e, "cannot stat document path");
                report.failures += 1;
                return;
            }
        }

        let current = match self.pipeline.store().latest_thumbnail(document.id).await {
            Ok(current) => current,
            Err(e) => {
                warn!(document_id = document.id, error = %e, "thumbnail lookup failed");
                report.failures += 1;
                return;
            }
        };
        let artifact_present = match &current {
            Some(t) => tokio::fs::try_exists(&t.thumbnail_path).await.unwrap_or(false),
            None => false,
        };
        if artifact_present {
            return;
        }

        debug!(document_id = document.id, filename = %document.filename, "thumbnail missing; regenerating");
        match self
            .pipeline
            .thumbnails()
            .generate(document.id, path, &document.filename)
            .await
        {
            Some(_) => report.thumbnails_regenerated += 1,
            None => report.failures += 1,
        }
    }

    /// Index tracked files in the watched directory that the catalog does
    /// not know yet.
    pub async fn index_untracked(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        if !self.root.is_dir() {
            debug!(root = %self.root.display(), "watched directory absent; nothing to index");
            return Ok(report);
        }

        let mut candidates = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    report.failures += 1;
                    continue;
                }
            };
            if entry.file_type().is_file() && self.filter.is_tracked(entry.path(), &self.root) {
                candidates.push(entry.into_path());
            }
        }
        candidates.sort();

        for path in candidates {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match self.pipeline.store().find_by_filename(filename).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    warn!(filename, error = %e, "lookup failed");
                    report.failures += 1;
                    continue;
                }
            }
            match self.pipeline.on_appeared_or_changed(&path).await {
                Ok(_) => report.indexed += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "indexing untracked file failed");
                    report.failures += 1;
                }
            }
        }

        info!(indexed = report.indexed, failures = report.failures, "untracked files indexed");
        Ok(report)
    }

    /// [`sweep`](Self::sweep) followed by [`index_untracked`](Self::index_untracked).
    pub async fn startup(&self) -> Result<SweepReport> {
        let mut report = self.sweep().await?;
        report.merge(self.index_untracked().await?);
        Ok(report)
    }

    /// Repeat [`sweep`](Self::sweep) every `interval` until `shutdown`
    /// resolves. The first pass happens one interval from now.
    pub async fn run_periodic(&self, interval: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "periodic sweep failed");
                    }
                }
            }
        }
        debug!("periodic sweep stopped");
    }
}
