//! End-to-end pipeline behaviour against a real SQLite catalog.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use docwatch::broadcast::EventBroadcaster;
use docwatch::config::Config;
use docwatch::models::ChangeAction;
use docwatch::pipeline::{IngestPipeline, Outcome};
use docwatch::reconcile::Reconciler;
use docwatch::store::{CatalogStore, SqliteCatalog};
use docwatch::thumbnail::ThumbnailService;
use docwatch::{db, migrate, query};
use tempfile::TempDir;

struct Harness {
    _tmp: TempDir,
    config: Config,
    watch: PathBuf,
    store: Arc<dyn CatalogStore>,
    events: EventBroadcaster,
    pipeline: Arc<IngestPipeline>,
}

async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let watch = tmp.path().join("watch");
    fs::create_dir_all(&watch).unwrap();
    let config = Config::with_paths(
        &tmp.path().join("data").join("docwatch.sqlite"),
        &watch,
        &tmp.path().join("thumbs"),
    );

    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let store: Arc<dyn CatalogStore> = Arc::new(SqliteCatalog::new(pool));
    let thumbnails = Arc::new(ThumbnailService::new(store.clone(), &config.thumbnails));
    let events = EventBroadcaster::new();
    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        thumbnails,
        events.clone(),
    ));

    Harness {
        watch: watch.canonicalize().unwrap(),
        _tmp: tmp,
        config,
        store,
        events,
        pipeline,
    }
}

/// Single-page PDF whose content stream shows one line of text.
fn minimal_pdf_with_phrase() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(b"4 0 obj << /Length 48 >> stream\nBT /F1 12 Tf 100 700 Td (quarterly report) Tj ET\nendstream endobj\n");
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

fn minimal_docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
    use std::io::Write;
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
            body
        );
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

fn artifact_dimensions(path: &str) -> (u32, u32) {
    image::image_dimensions(path).unwrap()
}

#[tokio::test]
async fn pdf_is_indexed_with_one_thumbnail_and_one_event() {
    let h = harness().await;
    let mut sub = h.events.subscribe();
    let path = h.watch.join("report.pdf");
    fs::write(&path, minimal_pdf_with_phrase()).unwrap();

    h.pipeline.on_appeared_or_changed(&path).await.unwrap();

    let docs = h.store.all_documents().await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].filename, "report.pdf");

    let thumbs = h.store.thumbnails_for(docs[0].id).await.unwrap();
    assert_eq!(thumbs.len(), 1);
    assert!(thumbs[0].thumbnail_path.ends_with("_report.png"));
    assert_eq!(artifact_dimensions(&thumbs[0].thumbnail_path).0, 850);

    let event = sub.recv().await.unwrap();
    assert_eq!(event.action, ChangeAction::Created);
    assert_eq!(event.filename, "report.pdf");
    assert!(!event.thumbnail.unwrap().is_empty());
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn deleting_a_file_removes_records_and_artifact() {
    let h = harness().await;
    let path = h.watch.join("report.pdf");
    fs::write(&path, minimal_pdf_with_phrase()).unwrap();
    h.pipeline.on_appeared_or_changed(&path).await.unwrap();
    let doc = h.store.find_by_filename("report.pdf").await.unwrap().unwrap();
    let artifact = h.store.latest_thumbnail(doc.id).await.unwrap().unwrap();
    h.store.insert_conflict(doc.id, "abc123", 5).await.unwrap();

    let mut sub = h.events.subscribe();
    fs::remove_file(&path).unwrap();
    h.pipeline.on_vanished(&path).await.unwrap();

    assert!(h.store.get_document(doc.id).await.unwrap().is_none());
    assert!(h.store.thumbnails_for(doc.id).await.unwrap().is_empty());
    assert!(h.store.conflicts_for(doc.id).await.unwrap().is_empty());
    assert!(!Path::new(&artifact.thumbnail_path).exists());

    let event = sub.recv().await.unwrap();
    assert_eq!(event.action, ChangeAction::Deleted);
    assert_eq!(event.filename, "report.pdf");
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn long_text_file_previews_first_twenty_lines() {
    let h = harness().await;
    let path = h.watch.join("notes.txt");
    let body: String = (1..=30).map(|i| format!("line {}\n", i)).collect();
    fs::write(&path, body).unwrap();

    let outcome = h.pipeline.on_appeared_or_changed(&path).await.unwrap();
    assert!(matches!(outcome, Outcome::Indexed { thumbnail: Some(_), .. }));

    let lines = docwatch::render::text_preview_lines(&path).unwrap();
    assert_eq!(lines.len(), 20);
    assert_eq!(lines.last().unwrap(), "line 20");

    let doc = h.store.find_by_filename("notes.txt").await.unwrap().unwrap();
    let thumb = h.store.latest_thumbnail(doc.id).await.unwrap().unwrap();
    assert_eq!(artifact_dimensions(&thumb.thumbnail_path), (800, 600));

    // Lines start 10px down and 20px apart: line 20 ends above y = 410 and
    // nothing from lines 21..30 reaches the canvas.
    let canvas = image::open(&thumb.thumbnail_path).unwrap().to_rgb8();
    let white = image::Rgb([255u8, 255, 255]);
    let ink = |ys: std::ops::Range<u32>| {
        ys.flat_map(|y| (0..800).map(move |x| (x, y)))
            .filter(|&(x, y)| *canvas.get_pixel(x, y) != white)
            .count()
    };
    assert!(ink(390..410) > 0, "line 20 was not drawn");
    assert_eq!(ink(410..600), 0, "text drawn below line 20");
}

#[tokio::test]
async fn image_deleted_while_stopped_is_removed_by_sweep() {
    let h = harness().await;
    let path = h.watch.join("photo.jpg");
    image::RgbImage::from_pixel(640, 480, image::Rgb([30, 90, 160]))
        .save(&path)
        .unwrap();
    h.pipeline.on_appeared_or_changed(&path).await.unwrap();
    let doc = h.store.find_by_filename("photo.jpg").await.unwrap().unwrap();
    let thumb = h.store.latest_thumbnail(doc.id).await.unwrap().unwrap();
    assert_eq!(artifact_dimensions(&thumb.thumbnail_path), (400, 300));

    // "Process stopped": the file disappears with nobody watching.
    fs::remove_file(&path).unwrap();

    let mut sub = h.events.subscribe();
    let reconciler = Reconciler::new(&h.config.watch, h.pipeline.clone()).unwrap();
    let report = reconciler.startup().await.unwrap();

    assert_eq!(report.removed, 1);
    assert!(h.store.all_documents().await.unwrap().is_empty());
    assert!(!Path::new(&thumb.thumbnail_path).exists());
    assert_eq!(sub.recv().await.unwrap().action, ChangeAction::Deleted);
}

#[tokio::test]
async fn repeated_appearance_keeps_one_document() {
    let h = harness().await;
    let path = h.watch.join("minutes.docx");
    fs::write(
        &path,
        minimal_docx_with_paragraphs(&["Agenda", "", "Budget", "Hiring"]),
    )
    .unwrap();

    for _ in 0..3 {
        h.pipeline.on_appeared_or_changed(&path).await.unwrap();
    }

    let docs = h.store.all_documents().await.unwrap();
    assert_eq!(docs.len(), 1);
    assert!(docs[0].updated_at >= docs[0].added_at);
    assert_eq!(
        docwatch::render::document_preview_paragraphs(&path).unwrap(),
        vec!["Agenda", "Budget", "Hiring"]
    );
}

#[tokio::test]
async fn sweep_converges_catalog_with_directory() {
    let h = harness().await;
    let kept = h.watch.join("kept.txt");
    let gone = h.watch.join("gone.txt");
    fs::write(&kept, "kept").unwrap();
    fs::write(&gone, "gone").unwrap();
    h.pipeline.on_appeared_or_changed(&kept).await.unwrap();
    h.pipeline.on_appeared_or_changed(&gone).await.unwrap();

    fs::remove_file(&gone).unwrap();
    fs::write(h.watch.join("arrived.bin"), [0u8, 1, 2]).unwrap();
    let kept_doc = h.store.find_by_filename("kept.txt").await.unwrap().unwrap();
    let kept_thumb = h.store.latest_thumbnail(kept_doc.id).await.unwrap().unwrap();
    fs::remove_file(&kept_thumb.thumbnail_path).unwrap();

    let reconciler = Reconciler::new(&h.config.watch, h.pipeline.clone()).unwrap();
    let report = reconciler.startup().await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.thumbnails_regenerated, 1);
    assert_eq!(report.indexed, 1);
    assert_eq!(report.failures, 0);

    let listings = query::list_documents(h.store.as_ref(), &h.config.thumbnails, None)
        .await
        .unwrap();
    let mut names: Vec<&str> = listings.iter().map(|l| l.filename.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["arrived.bin", "kept.txt"]);
    assert!(listings.iter().all(|l| l.thumbnail.is_some()));

    let second = reconciler.startup().await.unwrap();
    assert_eq!(second.removed + second.thumbnails_regenerated + second.indexed, 0);
}
