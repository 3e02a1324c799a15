//! Document reader: open uploaded bytes and extract page text on demand.
//!
//! Two formats are recognised by content, never by file name:
//!
//! * PDF (`%PDF` magic) — handled by [`crate::pipeline::extract::PdfDocument`].
//! * Paged UTF-8 text — pages separated by form feed (`\x0c`), the form
//!   `pdftotext` emits. A file without form feeds is a single page.
//!
//! Page text is extracted on every call. Nothing is cached, so repeated calls
//! for one page cost a full extraction each time.

use crate::error::EngineError;
use crate::pipeline::extract::PdfDocument;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Page separator for paged text.
pub const PAGE_BREAK: char = '\x0c';

/// Format detected when the document was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    PagedText,
}

/// An opened document, exclusively owned by one session.
#[async_trait]
pub trait Document: Send + Sync {
    fn kind(&self) -> DocumentKind;

    /// Number of pages; at least 1 for any opened document.
    fn page_count(&self) -> usize;

    /// Text of the page at 0-based `index`.
    ///
    /// Fails with [`EngineError::PageIndex`] when `index >= page_count()`.
    async fn page_text(&self, index: usize) -> Result<String, EngineError>;
}

/// Open `bytes` as a document, detecting its format.
///
/// Rejects documents larger than `max_bytes`, bytes that are neither PDF nor
/// UTF-8, and documents with no pages.
pub async fn open_document(
    bytes: Vec<u8>,
    max_bytes: usize,
) -> Result<Box<dyn Document>, EngineError> {
    if bytes.len() > max_bytes {
        return Err(EngineError::DocumentTooLarge {
            size: bytes.len(),
            limit: max_bytes,
        });
    }

    let doc: Box<dyn Document> = if bytes.starts_with(b"%PDF") {
        Box::new(PdfDocument::open(bytes).await?)
    } else {
        let text = String::from_utf8(bytes).map_err(|e| EngineError::DocumentOpen {
            detail: format!("not a PDF and not valid UTF-8 text ({e})"),
        })?;
        Box::new(PagedText::new(text)?)
    };

    info!("Opened {:?} document: {} pages", doc.kind(), doc.page_count());
    Ok(doc)
}

/// UTF-8 text split into pages on form feeds.
#[derive(Debug, Clone)]
pub struct PagedText {
    text: String,
    pages: usize,
}

impl PagedText {
    pub fn new(text: String) -> Result<Self, EngineError> {
        let pages = split_pages(&text).count();
        if pages == 0 {
            return Err(EngineError::DocumentOpen {
                detail: "document has no pages".into(),
            });
        }
        Ok(Self { text, pages })
    }
}

#[async_trait]
impl Document for PagedText {
    fn kind(&self) -> DocumentKind {
        DocumentKind::PagedText
    }

    fn page_count(&self) -> usize {
        self.pages
    }

    async fn page_text(&self, index: usize) -> Result<String, EngineError> {
        let text = split_pages(&self.text)
            .nth(index)
            .ok_or(EngineError::PageIndex {
                index,
                total: self.pages,
            })?;
        debug!("Extracted page {}: {} chars", index + 1, text.len());
        Ok(text.to_string())
    }
}

/// Form-feed separated pages. A trailing form feed does not open an empty
/// last page, and an empty input has no pages.
fn split_pages(text: &str) -> impl Iterator<Item = &str> {
    let body = text.strip_suffix(PAGE_BREAK).unwrap_or(text);
    let empty = body.is_empty();
    body.split(PAGE_BREAK).filter(move |_| !empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn form_feeds_split_pages() {
        let doc = open_document(b"one\x0ctwo\x0cthree".to_vec(), 1024)
            .await
            .unwrap();
        assert_eq!(doc.kind(), DocumentKind::PagedText);
        assert_eq!(doc.page_count(), 3);
        assert_eq!(doc.page_text(1).await.unwrap(), "two");
    }

    #[tokio::test]
    async fn trailing_form_feed_is_not_a_page() {
        let doc = PagedText::new("a\x0cb\x0c".into()).unwrap();
        assert_eq!(doc.page_count(), 2);
    }

    #[tokio::test]
    async fn text_without_breaks_is_one_page() {
        let doc = PagedText::new("just one page".into()).unwrap();
        assert_eq!(doc.page_count(), 1);
        assert_eq!(doc.page_text(0).await.unwrap(), "just one page");
    }

    #[tokio::test]
    async fn empty_pages_in_the_middle_are_kept() {
        let doc = PagedText::new("a\x0c\x0cc".into()).unwrap();
        assert_eq!(doc.page_count(), 3);
        assert_eq!(doc.page_text(1).await.unwrap(), "");
    }

    #[tokio::test]
    async fn out_of_range_index_is_page_index_error() {
        let doc = PagedText::new("a\x0cb".into()).unwrap();
        assert!(matches!(
            doc.page_text(2).await,
            Err(EngineError::PageIndex { index: 2, total: 2 })
        ));
    }

    #[tokio::test]
    async fn empty_document_is_rejected() {
        assert!(matches!(
            open_document(Vec::new(), 1024).await,
            Err(EngineError::DocumentOpen { .. })
        ));
        assert!(matches!(
            PagedText::new("\x0c".into()),
            Err(EngineError::DocumentOpen { .. })
        ));
    }

    #[tokio::test]
    async fn binary_garbage_is_rejected() {
        let err = open_document(vec![0xff, 0xfe, 0x00, 0x81], 1024)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::DocumentOpen { .. }));
    }

    #[tokio::test]
    async fn oversized_document_is_rejected() {
        let err = open_document(vec![b'a'; 11], 10).await.err().unwrap();
        assert!(matches!(
            err,
            EngineError::DocumentTooLarge {
                size: 11,
                limit: 10
            }
        ));
    }
}
