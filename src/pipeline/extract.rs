//! PDF text extraction via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which is CPU-bound
//! and not async-safe. Every call runs on the blocking thread pool so Tokio
//! worker threads never stall on a large page.
//!
//! ## Why a temp file?
//!
//! A loaded pdfium document borrows its library binding and cannot be held
//! across `.await` points or moved between threads. The session keeps the
//! uploaded bytes in a [`NamedTempFile`] instead and each extraction re-opens
//! it, extracts one page and drops everything before returning.

use crate::error::EngineError;
use crate::pipeline::document::{Document, DocumentKind};
use async_trait::async_trait;
use pdfium_render::prelude::{PdfPageIndex, Pdfium, PdfiumError};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::debug;

/// Bind to pdfium: `PDFIUM_LIB_PATH` when set, otherwise the system library.
pub fn bind_pdfium() -> Result<Pdfium, EngineError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(Path::new(&path))
            .map_err(|e| EngineError::PdfiumBindingFailed(format!("{path}: {e}")))?,
        _ => Pdfium::bind_to_system_library()
            .map_err(|e| EngineError::PdfiumBindingFailed(e.to_string()))?,
    };
    Ok(Pdfium::new(bindings))
}

/// A PDF owned by one session.
pub struct PdfDocument {
    file: Arc<NamedTempFile>,
    pages: usize,
}

impl PdfDocument {
    /// Write `bytes` to a private temp file and count its pages.
    pub async fn open(bytes: Vec<u8>) -> Result<Self, EngineError> {
        let file = tokio::task::spawn_blocking(move || -> Result<NamedTempFile, EngineError> {
            let mut file = NamedTempFile::new()
                .map_err(|e| EngineError::Internal(format!("Failed to create temp file: {e}")))?;
            file.write_all(&bytes)
                .and_then(|_| file.flush())
                .map_err(|e| EngineError::Internal(format!("Failed to write temp file: {e}")))?;
            Ok(file)
        })
        .await
        .map_err(|e| EngineError::Internal(format!("Temp file task panicked: {e}")))??;

        let path = file.path().to_path_buf();
        let pages = run_blocking(move || count_pages_blocking(&path)).await?;
        if pages == 0 {
            return Err(EngineError::DocumentOpen {
                detail: "PDF has no pages".into(),
            });
        }
        Ok(Self {
            file: Arc::new(file),
            pages,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[async_trait]
impl Document for PdfDocument {
    fn kind(&self) -> DocumentKind {
        DocumentKind::Pdf
    }

    fn page_count(&self) -> usize {
        self.pages
    }

    async fn page_text(&self, index: usize) -> Result<String, EngineError> {
        if index >= self.pages {
            return Err(EngineError::PageIndex {
                index,
                total: self.pages,
            });
        }
        // The Arc keeps the temp file alive until the blocking task is done.
        let file = Arc::clone(&self.file);
        let text = run_blocking(move || extract_page_blocking(file.path(), index)).await?;
        debug!("Extracted page {}: {} chars", index + 1, text.len());
        Ok(text)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Internal(format!("Extraction task panicked: {e}")))?
}

fn count_pages_blocking(path: &Path) -> Result<usize, EngineError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| load_error(path, e))?;
    Ok(document.pages().len() as usize)
}

fn extract_page_blocking(path: &Path, index: usize) -> Result<String, EngineError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| load_error(path, e))?;

    let page_err = |detail: String| EngineError::ExtractionFailed {
        page: index + 1,
        detail,
    };
    let page_index: PdfPageIndex = index
        .try_into()
        .map_err(|_| page_err(format!("page index {index} exceeds pdfium's range")))?;
    let pages = document.pages();
    let page = pages
        .get(page_index)
        .map_err(|e| page_err(format!("{:?}", e)))?;
    let text = page.text().map_err(|e| page_err(format!("{:?}", e)))?;
    Ok(text.all())
}

fn load_error(path: &Path, e: PdfiumError) -> EngineError {
    let detail = format!("{:?}", e);
    if detail.to_ascii_lowercase().contains("password") {
        EngineError::DocumentOpen {
            detail: "PDF is password-protected".into(),
        }
    } else {
        debug!("pdfium rejected {}: {}", path.display(), detail);
        EngineError::DocumentOpen {
            detail: format!("malformed PDF: {detail}"),
        }
    }
}
