//! Thumbnail generation.
//!
//! [`ThumbnailService::generate`] picks a renderer from the filename, runs it
//! on tokio's blocking pool (bounded by a semaphore, with a per-render
//! timeout), writes one PNG into the content area and records one
//! [`Thumbnail`](crate::models::Thumbnail) row.
//!
//! Artifacts are named `<document id>_<slug>.png`. The id makes names unique
//! across documents whose filenames slugify to the same text; the slug keeps
//! them readable.
//!
//! A render writes to a scratch file that is renamed into place only once it
//! finished in time. A render that times out keeps running on its blocking
//! thread with the document still locked; its scratch output is deleted when
//! it ends, so a late render never leaves an artifact behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ThumbnailConfig;
use crate::render::{self, RenderError, RenderKind};
use crate::store::CatalogStore;

type DocumentLock = Arc<AsyncMutex<()>>;
type LockMap = HashMap<i64, DocumentLock>;
type InFlight = Arc<Mutex<LockMap>>;
type RenderTask = JoinHandle<(Result<(), RenderError>, OwnedMutexGuard<()>)>;

/// A freshly recorded thumbnail.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedThumbnail {
    pub thumbnail_id: i64,
    pub path: PathBuf,
    pub url: String,
    pub kind: RenderKind,
}

pub struct ThumbnailService {
    store: Arc<dyn CatalogStore>,
    dir: PathBuf,
    url_prefix: String,
    render_timeout: Duration,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
    scratch_seq: AtomicU64,
}

impl ThumbnailService {
    pub fn new(store: Arc<dyn CatalogStore>, config: &ThumbnailConfig) -> Self {
        Self {
            store,
            dir: config.dir.clone(),
            url_prefix: config.url_prefix.trim_end_matches('/').to_string(),
            render_timeout: Duration::from_secs(config.render_timeout_secs),
            permits: Arc::new(Semaphore::new(config.max_concurrent_renders)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            scratch_seq: AtomicU64::new(0),
        }
    }

    /// Override the per-render timeout (the config only has whole seconds).
    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Artifact file name for a document: `<id>_<slug>.png`.
    pub fn artifact_name(document_id: i64, filename: &str) -> String {
        let stem = Path::new(filename)
            .file_stem()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default();
        format!("{}_{}.png", document_id, render::slugify(&stem))
    }

    /// Public URL for an artifact stored in the content area.
    pub fn url_for(&self, thumbnail_path: &Path) -> Option<String> {
        artifact_url(&self.url_prefix, thumbnail_path)
    }

    /// Render and record a thumbnail. Any failure is logged and reported as
    /// `None`; it never aborts the caller.
    pub async fn generate(
        &self,
        document_id: i64,
        path: &Path,
        filename: &str,
    ) -> Option<GeneratedThumbnail> {
        let lock = document_lock(&self.in_flight, document_id);
        let guard = lock.clone().lock_owned().await;
        let result = self
            .render_and_record(document_id, path, filename, &lock, guard)
            .await;
        release_document_lock(&self.in_flight, document_id, &lock);

        match result {
            Ok(generated) => generated,
            Err(e) => {
                warn!(document_id, filename, error = %e, "thumbnail generation failed");
                None
            }
        }
    }

    async fn render_and_record(
        &self,
        document_id: i64,
        path: &Path,
        filename: &str,
        lock: &DocumentLock,
        guard: OwnedMutexGuard<()>,
    ) -> Result<Option<GeneratedThumbnail>> {
        if !path.is_file() {
            debug!(document_id, path = %path.display(), "source file missing; no thumbnail");
            return Ok(None);
        }

        let kind = RenderKind::for_filename(filename);
        let name = Self::artifact_name(document_id, filename);
        let dst = self.dir.join(&name);
        let scratch = self.dir.join(format!(
            "{}.{}.partial",
            name,
            self.scratch_seq.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::create_dir_all(&self.dir).await?;

        // Permit and document guard move into the blocking task: a render
        // that outlives its timeout keeps its pool slot and keeps the document
        // locked until it really ends.
        let permit = self.permits.clone().acquire_owned().await?;
        let src = path.to_path_buf();
        let out = scratch.clone();
        let mut task: RenderTask = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            (render::render(kind, &src, &out), guard)
        });

        let waited = tokio::time::timeout(self.render_timeout, &mut task).await;
        let (rendered, _guard) = match waited {
            Err(_) => {
                self.abandon(document_id, task, scratch, lock.clone());
                return Err(RenderError::Timeout(self.render_timeout).into());
            }
            Ok(Err(join)) => {
                remove_artifact(&scratch).await;
                return Err(RenderError::Join(join.to_string()).into());
            }
            Ok(Ok(finished)) => finished,
        };
        if let Err(e) = rendered {
            remove_artifact(&scratch).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&scratch, &dst).await {
            remove_artifact(&scratch).await;
            return Err(e.into());
        }

        let dst_str = dst.to_string_lossy().to_string();
        let now = chrono::Utc::now().timestamp();
        let thumbnail = match self.store.insert_thumbnail(document_id, &dst_str, now).await {
            Ok(thumbnail) => thumbnail,
            Err(e) => {
                // Most likely the document was removed while rendering.
                remove_artifact(&dst).await;
                return Err(e);
            }
        };

        let url = self
            .url_for(&dst)
            .unwrap_or_else(|| format!("{}/{}", self.url_prefix, dst_str));
        info!(
            document_id,
            filename,
            kind = kind.as_str(),
            artifact = %dst.display(),
            "thumbnail created"
        );

        Ok(Some(GeneratedThumbnail {
            thumbnail_id: thumbnail.id,
            path: dst,
            url,
            kind,
        }))
    }

    /// Let a timed-out render run to completion in the background, then
    /// discard its output and release the document.
    fn abandon(&self, document_id: i64, task: RenderTask, scratch: PathBuf, lock: DocumentLock) {
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let finished = task.await;
            remove_artifact(&scratch).await;
            drop(finished);
            release_document_lock(&in_flight, document_id, &lock);
            debug!(document_id, "abandoned render finished");
        });
    }

    #[cfg(test)]
    fn in_flight(&self) -> MutexGuard<'_, LockMap> {
        lock_map(&self.in_flight)
    }

    /// Take the document's render lock, as a render in progress would.
    #[cfg(test)]
    pub(crate) async fn hold_document(&self, document_id: i64) -> OwnedMutexGuard<()> {
        document_lock(&self.in_flight, document_id)
            .lock_owned()
            .await
    }
}

fn lock_map(in_flight: &Mutex<LockMap>) -> MutexGuard<'_, LockMap> {
    in_flight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn document_lock(in_flight: &Mutex<LockMap>, document_id: i64) -> DocumentLock {
    lock_map(in_flight)
        .entry(document_id)
        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
        .clone()
}

fn release_document_lock(in_flight: &Mutex<LockMap>, document_id: i64, lock: &DocumentLock) {
    let mut map = lock_map(in_flight);
    // One reference in the map, one held by the caller: nobody else holds or
    // waits for it.
    if Arc::strong_count(lock) <= 2
        && map
            .get(&document_id)
            .is_some_and(|current| Arc::ptr_eq(current, lock))
    {
        map.remove(&document_id);
    }
}

/// `<url_prefix>/<artifact file name>`.
pub fn artifact_url(url_prefix: &str, thumbnail_path: &Path) -> Option<String> {
    let name = thumbnail_path.file_name()?.to_str()?;
    Some(format!("{}/{}", url_prefix.trim_end_matches('/'), name))
}

/// Delete an artifact from disk. A missing file is not an error; anything
/// else is logged and swallowed.
pub async fn remove_artifact(thumbnail_path: impl AsRef<Path>) {
    let path = thumbnail_path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(artifact = %path.display(), "thumbnail artifact removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(artifact = %path.display(), error = %e, "failed to remove thumbnail artifact"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCatalog;
    use tempfile::TempDir;

    fn service(tmp: &TempDir, store: Arc<dyn CatalogStore>) -> ThumbnailService {
        let config = ThumbnailConfig {
            dir: tmp.path().join("thumbs"),
            ..ThumbnailConfig::default()
        };
        ThumbnailService::new(store, &config)
    }

    #[test]
    fn artifact_name_is_keyed_by_id() {
        assert_eq!(
            ThumbnailService::artifact_name(7, "Q3 Report.final.pdf"),
            "7_q3_report_final.png"
        );
        assert_ne!(
            ThumbnailService::artifact_name(1, "a b.txt"),
            ThumbnailService::artifact_name(2, "a-b.txt")
        );
    }

    #[tokio::test]
    async fn generate_records_one_thumbnail() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::new());
        let thumbs = service(&tmp, store.clone());

        let src = tmp.path().join("blob.xyz");
        std::fs::write(&src, b"opaque").unwrap();
        let doc = store
            .ensure_document("blob.xyz", &src.to_string_lossy(), 1)
            .await
            .unwrap()
            .document;

        let generated = thumbs.generate(doc.id, &src, "blob.xyz").await.unwrap();
        assert_eq!(generated.kind, RenderKind::Placeholder);
        assert!(generated.path.exists());
        assert_eq!(
            generated.url,
            format!("/static/thumbnails/{}_blob.png", doc.id)
        );
        assert_eq!(store.thumbnails_for(doc.id).await.unwrap().len(), 1);
        assert!(thumbs.in_flight().is_empty());
    }

    #[tokio::test]
    async fn render_failure_yields_no_reference() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::new());
        let thumbs = service(&tmp, store.clone());

        let src = tmp.path().join("broken.pdf");
        std::fs::write(&src, b"not a pdf").unwrap();
        let doc = store
            .ensure_document("broken.pdf", &src.to_string_lossy(), 1)
            .await
            .unwrap()
            .document;

        assert!(thumbs.generate(doc.id, &src, "broken.pdf").await.is_none());
        assert!(store.thumbnails_for(doc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_source_is_absorbed() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::new());
        let thumbs = service(&tmp, store.clone());

        let src = tmp.path().join("gone.txt");
        assert!(thumbs.generate(1, &src, "gone.txt").await.is_none());
    }

    #[tokio::test]
    async fn orphaned_artifact_removed_when_document_vanished() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::new());
        let thumbs = service(&tmp, store.clone());

        let src = tmp.path().join("late.txt");
        std::fs::write(&src, "text").unwrap();

        // No document 42 in the catalog: the insert fails after rendering.
        assert!(thumbs.generate(42, &src, "late.txt").await.is_none());
        assert!(!thumbs.dir().join("42_late.png").exists());
    }

    #[test]
    fn artifact_url_uses_file_name_only() {
        assert_eq!(
            artifact_url("/static/thumbnails/", Path::new("/srv/thumbs/3_report.png")).as_deref(),
            Some("/static/thumbnails/3_report.png")
        );
    }

    #[tokio::test]
    async fn remove_artifact_tolerates_missing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nothing.png");
        remove_artifact(&path).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_render_keeps_document_locked_and_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::new());
        let thumbs =
            service(&tmp, store.clone()).with_render_timeout(Duration::from_millis(1));

        let src = tmp.path().join("scan.png");
        image::RgbImage::from_pixel(2500, 2500, image::Rgb([120, 40, 200]))
            .save(&src)
            .unwrap();
        let doc = store
            .ensure_document("scan.png", &src.to_string_lossy(), 1)
            .await
            .unwrap()
            .document;

        assert!(thumbs.generate(doc.id, &src, "scan.png").await.is_none());

        // The render is still running and still owns the document.
        let contended =
            tokio::time::timeout(Duration::from_millis(5), thumbs.hold_document(doc.id)).await;
        assert!(contended.is_err());
        assert!(thumbs.in_flight().contains_key(&doc.id));

        // The file vanishes while the abandoned render is still going.
        store.delete_document(doc.id).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        while !thumbs.in_flight().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "render never finished");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let leftovers: Vec<_> = std::fs::read_dir(thumbs.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "unexpected artifacts: {:?}", leftovers);
        assert!(store.thumbnails_for(doc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn renders_into_place_without_scratch_files() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::new());
        let thumbs = service(&tmp, store.clone());

        let src = tmp.path().join("memo.txt");
        std::fs::write(&src, "memo\n").unwrap();
        let doc = store
            .ensure_document("memo.txt", &src.to_string_lossy(), 1)
            .await
            .unwrap()
            .document;

        thumbs.generate(doc.id, &src, "memo.txt").await.unwrap();
        thumbs.generate(doc.id, &src, "memo.txt").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(thumbs.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![format!("{}_memo.png", doc.id)]);
    }
}
