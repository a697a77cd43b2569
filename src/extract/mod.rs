//! PDF page and text extraction
//!
//! Renders page raster images through pdfium and extracts per-page text,
//! falling back to the `tesseract` CLI for image-only pages. OCR
//! availability is probed once at construction and exposed as a capability
//! flag; a page whose OCR fails is recorded as `ocr-failed` and never fails
//! the whole request.
//!
//! pdfium is not async- or thread-safe, so the library is bound per call on
//! the (single) blocking protocol thread.

use std::path::Path;
use std::process::Command;

use pdfium_render::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Result type for extraction operations
pub type ExtractResult<T> = Result<T, ExtractError>;

/// 144 DPI equivalent for page embedding images (pdfium renders at 72 DPI base).
const PAGE_SCALE: f32 = 2.0;
/// 300 DPI equivalent for OCR input.
const OCR_SCALE: f32 = 300.0 / 72.0;

/// Errors that can occur during PDF extraction
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Cannot open PDF {path}: {error}")]
    Open { path: String, error: String },

    #[error("Failed to render page {page}: {error}")]
    Render { page: usize, error: String },

    #[error("pdfium unavailable: {error}")]
    Pdfium { error: String },

    #[error("IO error: {error}")]
    Io {
        #[from]
        error: std::io::Error,
    },
}

/// Rendered page image paths, in page order.
#[derive(Debug, Clone, Serialize)]
pub struct PageImages {
    pub paths: Vec<String>,
    pub page_count: usize,
}

/// Per-page text with the extraction path that produced it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PageText {
    /// 0-based
    pub page_number: usize,
    pub text: String,
    /// "embedded-text", "ocr", or "ocr-failed"
    pub method: String,
}

pub struct DocumentExtractor {
    has_tesseract: bool,
}

impl DocumentExtractor {
    /// Probe OCR availability once; request handling only consults the flag.
    pub fn new() -> Self {
        let has_tesseract = Command::new("tesseract")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);
        if has_tesseract {
            info!("tesseract found; OCR fallback enabled");
        } else {
            info!("tesseract not found; image-only pages will report empty text");
        }
        Self { has_tesseract }
    }

    pub fn has_tesseract(&self) -> bool {
        self.has_tesseract
    }

    /// Render every page to `output_dir/page_NNNN.png` (zero-padded, 0-based,
    /// page order) at 144 DPI equivalent. Creates the directory if absent.
    pub fn extract_pages(
        &self,
        pdf_path: &str,
        output_dir: &str,
    ) -> ExtractResult<PageImages> {
        std::fs::create_dir_all(output_dir)?;

        let pdfium = bind_pdfium()?;
        let document = pdfium
            .load_pdf_from_file(pdf_path, None)
            .map_err(|e| ExtractError::Open {
                path: pdf_path.to_string(),
                error: e.to_string(),
            })?;

        let render_config = PdfRenderConfig::new().scale_page_by_factor(PAGE_SCALE);
        let mut paths = Vec::new();
        for (page_num, page) in document.pages().iter().enumerate() {
            let bitmap =
                page.render_with_config(&render_config)
                    .map_err(|e| ExtractError::Render {
                        page: page_num,
                        error: e.to_string(),
                    })?;
            let img_path = Path::new(output_dir).join(format!("page_{:04}.png", page_num));
            bitmap
                .as_image()
                .into_rgb8()
                .save(&img_path)
                .map_err(|e| ExtractError::Render {
                    page: page_num,
                    error: e.to_string(),
                })?;
            paths.push(img_path.to_string_lossy().into_owned());
        }

        debug!("rendered {} pages from {}", paths.len(), pdf_path);
        Ok(PageImages {
            page_count: paths.len(),
            paths,
        })
    }

    /// Per-page text: embedded text first, OCR fallback for image-only pages
    /// when available. Per-page OCR failure is isolated and recorded.
    pub fn extract_text(&self, pdf_path: &str) -> ExtractResult<Vec<PageText>> {
        let pdfium = bind_pdfium()?;
        let document = pdfium
            .load_pdf_from_file(pdf_path, None)
            .map_err(|e| ExtractError::Open {
                path: pdf_path.to_string(),
                error: e.to_string(),
            })?;

        let mut pages = Vec::new();
        for (page_num, page) in document.pages().iter().enumerate() {
            let mut text = page
                .text()
                .map(|t| t.all().trim().to_string())
                .unwrap_or_default();
            let mut method = "embedded-text".to_string();

            if text.is_empty() && self.has_tesseract {
                match self.ocr_page(&page) {
                    Ok(ocr_text) => {
                        text = ocr_text;
                        method = "ocr".to_string();
                    }
                    Err(e) => {
                        warn!("OCR failed on page {}: {}", page_num, e);
                        method = "ocr-failed".to_string();
                    }
                }
            }

            pages.push(PageText {
                page_number: page_num,
                text,
                method,
            });
        }

        Ok(pages)
    }

    /// Render one page at OCR resolution to a scratch PNG and run tesseract
    /// over it, capturing stdout.
    fn ocr_page(&self, page: &PdfPage) -> Result<String, String> {
        let bitmap = page
            .render_with_config(&PdfRenderConfig::new().scale_page_by_factor(OCR_SCALE))
            .map_err(|e| e.to_string())?;

        let scratch = tempfile::Builder::new()
            .prefix("ocr_page_")
            .suffix(".png")
            .tempfile()
            .map_err(|e| e.to_string())?;
        bitmap
            .as_image()
            .into_rgb8()
            .save(scratch.path())
            .map_err(|e| e.to_string())?;

        let output = Command::new("tesseract")
            .arg(scratch.path())
            .arg("stdout")
            .output()
            .map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DocumentExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn bind_pdfium() -> ExtractResult<Pdfium> {
    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|e| ExtractError::Pdfium {
            error: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_is_stable() {
        let extractor = DocumentExtractor::new();
        // Whatever the environment provides, the flag must not flap
        assert_eq!(extractor.has_tesseract(), extractor.has_tesseract());
    }

    #[test]
    fn test_unreadable_pdf_is_an_error_not_a_panic() {
        let extractor = DocumentExtractor::new();
        let dir = tempfile::tempdir().unwrap();
        let result = extractor.extract_pages(
            "definitely-missing.pdf",
            dir.path().to_str().unwrap(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_extract_pages_creates_output_dir() {
        let extractor = DocumentExtractor::new();
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/pages");
        // The PDF open fails either way; the directory must exist regardless
        let _ = extractor.extract_pages("missing.pdf", nested.to_str().unwrap());
        assert!(nested.exists());
    }

    #[test]
    fn test_page_text_serializes_with_wire_field_names() {
        let page = PageText {
            page_number: 0,
            text: "hello".to_string(),
            method: "embedded-text".to_string(),
        };
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(value["page_number"], 0);
        assert_eq!(value["method"], "embedded-text");
    }
}
