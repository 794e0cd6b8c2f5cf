//! Format-specific preview rendering.
//!
//! Stateless functions that turn a source file into a PNG raster. The
//! variant is chosen purely from the file extension (case-insensitive):
//!
//! | Kind | Extensions | Output |
//! |------|-----------|--------|
//! | [`RenderKind::Page`] | `pdf` | first page on a page-proportioned canvas |
//! | [`RenderKind::Image`] | `png`, `jpg`, `jpeg`, `gif`, `bmp`, `webp` | fit within 400×400 |
//! | [`RenderKind::Text`] | `txt` | first 20 lines on 800×600 |
//! | [`RenderKind::Document`] | `docx` | first 5 non-empty paragraphs on 800×600 |
//! | [`RenderKind::Placeholder`] | anything else | 200×200 `FILE` tile |
//!
//! Nothing here knows about the catalog or about events; failures come back
//! as [`RenderError`] and never panic.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::time::Duration;

use font8x8::{UnicodeFonts, BASIC_FONTS, LATIN_FONTS};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use lopdf::{Object, ObjectId};
use quick_xml::events::Event;

/// Bounding box for resized raster images.
pub const IMAGE_MAX_DIMENSION: u32 = 400;
/// Canvas used for text and rich-document previews.
pub const TEXT_CANVAS: (u32, u32) = (800, 600);
/// Lines of a plain-text file shown in its preview.
pub const TEXT_PREVIEW_LINES: usize = 20;
/// Non-empty paragraphs of a rich document shown in its preview.
pub const DOCUMENT_PREVIEW_PARAGRAPHS: usize = 5;
/// Width of a rendered PDF page; height follows the page's aspect ratio.
pub const PAGE_WIDTH: u32 = 850;
/// Side of the square placeholder tile.
pub const PLACEHOLDER_SIZE: u32 = 200;

const MARGIN: u32 = 10;
const GLYPH_SCALE: u32 = 2;
const GLYPH_SIZE: u32 = 8 * GLYPH_SCALE;
const LINE_HEIGHT: u32 = GLYPH_SIZE + 4;
/// Maximum decompressed bytes read from `word/document.xml` (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// US Letter in points, used when a page carries no readable MediaBox.
const DEFAULT_PAGE_SIZE: (f32, f32) = (612.0, 792.0);

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const BORDER: Rgb<u8> = Rgb([200, 200, 200]);
const PLACEHOLDER_BG: Rgb<u8> = Rgb([240, 240, 240]);

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("PDF render failed: {0}")]
    Pdf(String),

    #[error("DOCX read failed: {0}")]
    Docx(String),

    #[error("render timed out after {0:?}")]
    Timeout(Duration),

    #[error("render task failed: {0}")]
    Join(String),
}

/// Which renderer handles a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderKind {
    Page,
    Image,
    Text,
    Document,
    Placeholder,
}

impl RenderKind {
    pub fn for_filename(filename: &str) -> Self {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "pdf" => RenderKind::Page,
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" => RenderKind::Image,
            "txt" => RenderKind::Text,
            "docx" => RenderKind::Document,
            _ => RenderKind::Placeholder,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RenderKind::Page => "page",
            RenderKind::Image => "image",
            RenderKind::Text => "text",
            RenderKind::Document => "document",
            RenderKind::Placeholder => "placeholder",
        }
    }
}

/// Render `src` with the given renderer and write a PNG to `dst`.
pub fn render(kind: RenderKind, src: &Path, dst: &Path) -> Result<(), RenderError> {
    match kind {
        RenderKind::Page => render_page(src, dst),
        RenderKind::Image => render_image(src, dst),
        RenderKind::Text => render_text(src, dst),
        RenderKind::Document => render_document(src, dst),
        RenderKind::Placeholder => render_placeholder(dst),
    }
}

/// Lowercase, underscore-separated form of a base filename.
///
/// `"My File Name"` → `"my_file_name"`, `"Résumé 2025"` → `"r_sum_2025"`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("file");
    }
    slug
}

// ============ Canvas ============

struct Canvas {
    image: RgbImage,
}

impl Canvas {
    fn new(width: u32, height: u32, background: Rgb<u8>) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, background),
        }
    }

    fn draw_border(&mut self, color: Rgb<u8>) {
        let (w, h) = self.image.dimensions();
        for x in 0..w {
            self.image.put_pixel(x, 0, color);
            self.image.put_pixel(x, h - 1, color);
        }
        for y in 0..h {
            self.image.put_pixel(0, y, color);
            self.image.put_pixel(w - 1, y, color);
        }
    }

    /// Draw one line starting at (x, y); characters past the right edge are clipped.
    fn draw_text(&mut self, x: u32, y: u32, text: &str, color: Rgb<u8>) {
        let (w, h) = self.image.dimensions();
        let mut cursor = x;
        for c in text.chars() {
            if cursor + GLYPH_SIZE > w {
                break;
            }
            let glyph = if c == '\t' {
                None
            } else {
                BASIC_FONTS
                    .get(c)
                    .or_else(|| LATIN_FONTS.get(c))
                    .or_else(|| BASIC_FONTS.get('?'))
            };
            if let Some(rows) = glyph {
                for (row, bits) in rows.iter().enumerate() {
                    for col in 0..8u32 {
                        if bits & (1 << col) == 0 {
                            continue;
                        }
                        let px = cursor + col * GLYPH_SCALE;
                        let py = y + row as u32 * GLYPH_SCALE;
                        for dy in 0..GLYPH_SCALE {
                            for dx in 0..GLYPH_SCALE {
                                if px + dx < w && py + dy < h {
                                    self.image.put_pixel(px + dx, py + dy, color);
                                }
                            }
                        }
                    }
                }
            }
            cursor += GLYPH_SIZE;
        }
    }

    /// Draw lines top-down from the margin until the canvas runs out of room.
    fn draw_lines<S: AsRef<str>>(&mut self, lines: &[S], color: Rgb<u8>) {
        let h = self.image.height();
        for (i, line) in lines.iter().enumerate() {
            let y = MARGIN + i as u32 * LINE_HEIGHT;
            if y + GLYPH_SIZE > h {
                break;
            }
            self.draw_text(MARGIN, y, line.as_ref(), color);
        }
    }

    fn save(self, dst: &Path) -> Result<(), RenderError> {
        self.image.save_with_format(dst, ImageFormat::Png)?;
        Ok(())
    }
}

// ============ Page (PDF) ============

fn render_page(src: &Path, dst: &Path) -> Result<(), RenderError> {
    let doc = lopdf::Document::load(src).map_err(|e| RenderError::Pdf(e.to_string()))?;
    let pages = doc.get_pages();
    let (&page_number, &page_id) = pages
        .iter()
        .next()
        .ok_or_else(|| RenderError::Pdf("document has no pages".to_string()))?;

    let (page_w, page_h) = page_size(&doc, page_id).unwrap_or(DEFAULT_PAGE_SIZE);
    let height = ((PAGE_WIDTH as f32) * page_h / page_w).round() as u32;
    let height = height.clamp(PLACEHOLDER_SIZE, PAGE_WIDTH * 3);

    // Text is best-effort: a page whose fonts cannot be decoded still gets
    // a blank page preview.
    let text = match doc.extract_text(&[page_number]) {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!(path = %src.display(), error = %e, "PDF text extraction failed");
            String::new()
        }
    };
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let mut canvas = Canvas::new(PAGE_WIDTH, height, WHITE);
    canvas.draw_border(BORDER);
    canvas.draw_lines(&lines, BLACK);
    canvas.save(dst)
}

/// MediaBox of a page in points, following `/Parent` for inherited boxes.
fn page_size(doc: &lopdf::Document, page_id: ObjectId) -> Option<(f32, f32)> {
    let mut current = Some(page_id);
    for _ in 0..16 {
        let id = current?;
        let dict = doc.get_dictionary(id).ok()?;
        if let Ok(media_box) = dict.get(b"MediaBox") {
            let media_box = match media_box {
                Object::Reference(r) => doc.get_object(*r).ok()?,
                other => other,
            };
            if let Object::Array(rect) = media_box {
                let nums: Vec<f32> = rect.iter().filter_map(pdf_number).collect();
                if nums.len() == 4 {
                    let w = (nums[2] - nums[0]).abs();
                    let h = (nums[3] - nums[1]).abs();
                    if w > 0.0 && h > 0.0 {
                        return Some((w, h));
                    }
                }
            }
        }
        current = dict.get(b"Parent").and_then(Object::as_reference).ok();
    }
    None
}

fn pdf_number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

// ============ Image ============

fn render_image(src: &Path, dst: &Path) -> Result<(), RenderError> {
    let img = image::open(src)?;
    let img = if img.width() > IMAGE_MAX_DIMENSION || img.height() > IMAGE_MAX_DIMENSION {
        img.thumbnail(IMAGE_MAX_DIMENSION, IMAGE_MAX_DIMENSION)
    } else {
        img
    };
    // PNG cannot carry float samples; normalize to 8-bit RGBA.
    DynamicImage::ImageRgba8(img.to_rgba8()).save_with_format(dst, ImageFormat::Png)?;
    Ok(())
}

// ============ Text ============

/// The lines a plain-text preview shows: the first [`TEXT_PREVIEW_LINES`]
/// lines of the file, trimmed as a block, or `Empty file`.
pub fn text_preview_lines(src: &Path) -> Result<Vec<String>, RenderError> {
    let mut reader = BufReader::new(File::open(src)?);
    let mut raw = Vec::new();
    let mut buf = Vec::new();
    for _ in 0..TEXT_PREVIEW_LINES {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        raw.extend_from_slice(&buf);
    }

    let text = String::from_utf8_lossy(&raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(vec!["Empty file".to_string()]);
    }
    Ok(trimmed
        .lines()
        .take(TEXT_PREVIEW_LINES)
        .map(|l| l.replace('\t', "    "))
        .collect())
}

fn render_text(src: &Path, dst: &Path) -> Result<(), RenderError> {
    let lines = text_preview_lines(src)?;
    let mut canvas = Canvas::new(TEXT_CANVAS.0, TEXT_CANVAS.1, WHITE);
    canvas.draw_lines(&lines, BLACK);
    canvas.save(dst)
}

// ============ Document (DOCX) ============

/// First [`DOCUMENT_PREVIEW_PARAGRAPHS`] non-empty paragraphs of a `.docx`.
pub fn document_preview_paragraphs(src: &Path) -> Result<Vec<String>, RenderError> {
    let mut archive =
        zip::ZipArchive::new(File::open(src)?).map_err(|e| RenderError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| RenderError::Docx("word/document.xml not found".to_string()))?;

    let mut xml = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut xml)?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(RenderError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    collect_paragraphs(&xml, DOCUMENT_PREVIEW_PARAGRAPHS)
}

fn collect_paragraphs(xml: &[u8], limit: usize) -> Result<Vec<String>, RenderError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => current.clear(),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if matches!(e.local_name().as_ref(), b"tab" | b"br") {
                    current.push(' ');
                }
            }
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| RenderError::Docx(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let paragraph = current.trim();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph.to_string());
                        if paragraphs.len() >= limit {
                            break;
                        }
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(RenderError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(paragraphs)
}

fn render_document(src: &Path, dst: &Path) -> Result<(), RenderError> {
    let mut lines = document_preview_paragraphs(src)?;
    if lines.is_empty() {
        lines.push("No text".to_string());
    }
    let mut canvas = Canvas::new(TEXT_CANVAS.0, TEXT_CANVAS.1, WHITE);
    canvas.draw_lines(&lines, BLACK);
    canvas.save(dst)
}

// ============ Placeholder ============

fn render_placeholder(dst: &Path) -> Result<(), RenderError> {
    let label = "FILE";
    let mut canvas = Canvas::new(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE, PLACEHOLDER_BG);
    let x = (PLACEHOLDER_SIZE - label.len() as u32 * GLYPH_SIZE) / 2;
    let y = (PLACEHOLDER_SIZE - GLYPH_SIZE) / 2;
    canvas.draw_text(x, y, label, BLACK);
    canvas.save(dst)
}
