// src/attachments.rs

use lopdf::Document;
use std::path::Path;
use tracing::{info, warn};

use crate::error::AttachmentError;

/// Upper bound on characters taken from any one attachment.
pub const MAX_TEXT_CHARS: usize = 100_000;

const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "csv", "json", "xml", "htm", "html"];

/// Fewer non-whitespace characters than this and a PDF counts as scanned.
const MIN_TEXT_CHARS: usize = 30;

/// Result of attempting to extract text from a PDF.
#[derive(Debug)]
pub enum PdfContent {
    Text(String),
    /// Image-only pages, nothing to read without OCR.
    ScannedImage,
    Error(String),
}

/// Turn an uploaded file into text the draft extractor can read.
///
/// Text-like files and readable PDFs become `File: <name>` followed by
/// their (truncated) contents; anything else becomes a one-line
/// `Uploaded file: <name>` placeholder.
pub fn file_to_text(path: &Path) -> Result<String, AttachmentError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let read = || {
        std::fs::read(path).map_err(|source| AttachmentError::Io {
            path: path.display().to_string(),
            source,
        })
    };

    if TEXT_EXTENSIONS.contains(&extension.as_str()) {
        let bytes = read()?;
        let content = String::from_utf8_lossy(&bytes);
        info!(file = %name, bytes = bytes.len(), "Read text attachment");
        return Ok(format!("File: {name}\n{}", truncate_chars(&content, MAX_TEXT_CHARS)));
    }

    if extension == "pdf" {
        let bytes = read()?;
        return match extract_text_from_pdf(&bytes) {
            PdfContent::Text(text) => Ok(format!("File: {name}\n{}", truncate_chars(&text, MAX_TEXT_CHARS))),
            PdfContent::ScannedImage => Ok(format!("Uploaded file: {name}")),
            PdfContent::Error(reason) => Err(AttachmentError::Pdf {
                path: path.display().to_string(),
                reason,
            }),
        };
    }

    Ok(format!("Uploaded file: {name}"))
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Structural check with lopdf first, then full extraction with pdf-extract.
pub fn extract_text_from_pdf(pdf_bytes: &[u8]) -> PdfContent {
    let doc = match Document::load_mem(pdf_bytes) {
        Ok(d) => d,
        Err(e) => return PdfContent::Error(format!("Failed to parse PDF: {e}")),
    };

    if looks_like_scanned(&doc) {
        info!("PDF structural check: likely scanned / image-only");
        return PdfContent::ScannedImage;
    }

    match pdf_extract::extract_text_from_mem(pdf_bytes) {
        Ok(text) => {
            let meaningful = text.chars().filter(|c| !c.is_whitespace()).count();
            if meaningful < MIN_TEXT_CHARS {
                info!(chars = meaningful, "Extracted text too short, treating as scanned");
                PdfContent::ScannedImage
            } else {
                info!(chars = meaningful, "Text extracted from PDF");
                PdfContent::Text(text)
            }
        }
        Err(e) => {
            warn!(error = %e, "pdf-extract failed, treating as scanned");
            PdfContent::ScannedImage
        }
    }
}

/// A page with XObject images but no Font resources is a scanned page.
/// The document counts as scanned when at least 80% of pages are.
fn looks_like_scanned(doc: &Document) -> bool {
    let pages = doc.get_pages();
    if pages.is_empty() {
        return false;
    }

    let image_only_pages = pages
        .values()
        .filter_map(|id| doc.get_object(*id).ok())
        .filter_map(|obj| obj.as_dict().ok())
        .filter(|page| has_resource(doc, page, b"XObject") && !has_resource(doc, page, b"Font"))
        .count();

    let ratio = image_only_pages as f64 / pages.len() as f64;
    info!(
        total_pages = pages.len(),
        image_only = image_only_pages,
        ratio = format!("{ratio:.2}"),
        "Scanned-page analysis"
    );
    ratio >= 0.8
}

fn has_resource(doc: &Document, page: &lopdf::Dictionary, key: &[u8]) -> bool {
    page.get(b"Resources")
        .ok()
        .and_then(|r| doc.dereference(r).ok())
        .and_then(|(_, resolved)| resolved.as_dict().ok())
        .and_then(|res| res.get(key).ok())
        .and_then(|o| doc.dereference(o).ok())
        .and_then(|(_, resolved)| resolved.as_dict().ok())
        .is_some_and(|dict| !dict.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_file(name: &str, contents: &[u8]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("invoice_drafter_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_text_file_is_prefixed() {
        let path = scratch_file("notes.MD", b"Client: Globex\n- Audit x1 @ 900");
        let text = file_to_text(&path).unwrap();
        assert_eq!(text, "File: notes.MD\nClient: Globex\n- Audit x1 @ 900");
    }

    #[test]
    fn test_text_file_is_truncated() {
        let path = scratch_file("big.txt", "é".repeat(MAX_TEXT_CHARS + 10).as_bytes());
        let text = file_to_text(&path).unwrap();
        let body = text.strip_prefix("File: big.txt\n").unwrap();
        assert_eq!(body.chars().count(), MAX_TEXT_CHARS);
    }

    #[test]
    fn test_other_files_become_placeholders() {
        let path = scratch_file("logo.png", &[0x89, b'P', b'N', b'G']);
        assert_eq!(file_to_text(&path).unwrap(), "Uploaded file: logo.png");
    }

    #[test]
    fn test_garbage_pdf() {
        assert!(matches!(extract_text_from_pdf(b"this is not a pdf"), PdfContent::Error(_)));
        let path = scratch_file("broken.pdf", b"this is not a pdf");
        assert!(matches!(file_to_text(&path), Err(AttachmentError::Pdf { .. })));
    }

    #[test]
    fn test_missing_file() {
        let err = file_to_text(Path::new("/definitely/not/here.txt")).unwrap_err();
        assert!(matches!(err, AttachmentError::Io { .. }));
    }
}
