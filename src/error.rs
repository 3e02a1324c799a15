//! Error types for the pagewise library.
//!
//! Four error types reflect four distinct failure modes:
//!
//! * [`EngineError`] — returned as `Err` from every [`crate::Engine`]
//!   operation: the request cannot be served (bad document, unknown session,
//!   page out of bounds, transformation failed in single-page mode).
//!
//! * [`TransformError`] — the outcome of one transformation call after the
//!   retry policy has run its course. Wrapped into [`EngineError`] by
//!   single-page processing, degraded to a [`PageError`] by batch and range.
//!
//! * [`PageError`] — **Non-fatal**: a single page failed inside a batch or
//!   range run. Stored in the run's output so callers can inspect partial
//!   success rather than losing the whole run to one bad page.
//!
//! * [`PersistError`] — a result could not be written to the sink. Logged
//!   for page results, since a successful transformation is never rolled
//!   back; surfaced as [`EngineError::Persist`] when saving the chat.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Document errors ───────────────────────────────────────────────────
    /// The bytes are malformed, unreadable, or in an unsupported format.
    #[error("Cannot open document: {detail}")]
    DocumentOpen { detail: String },

    /// The document exceeds the configured upload limit.
    #[error("Document is {size} bytes, over the {limit}-byte limit")]
    DocumentTooLarge { size: usize, limit: usize },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    /// Text extraction was requested for a page outside `[0, page_count)`.
    #[error("Page index {index} is out of range (document has {total} pages)")]
    PageIndex { index: usize, total: usize },

    /// Text extraction failed for a page that exists.
    #[error("Text extraction failed for page {page}: {detail}")]
    ExtractionFailed { page: usize, detail: String },

    // ── Session errors ────────────────────────────────────────────────────
    /// No live session carries this id (never created, closed, or evicted).
    #[error("Session '{session_id}' not found")]
    SessionNotFound { session_id: String },

    /// The store is at capacity even after evicting idle sessions.
    #[error("Too many open sessions (max: {max})")]
    TooManySessions { max: usize },

    /// A 1-based page number outside `[1, total]` was supplied.
    #[error("Page {page} is out of range (document has {total} pages)")]
    InvalidPage { page: usize, total: usize },

    /// A page range violated `1 <= start <= end <= total`.
    #[error("Invalid page range {start}-{end} (document has {total} pages)")]
    InvalidRange {
        start: usize,
        end: usize,
        total: usize,
    },

    /// The cursor has no page to offer.
    #[error("No more pages (document has {total} pages)")]
    NoMorePages { total: usize },

    // ── Chat errors ───────────────────────────────────────────────────────
    /// A chat message was empty or whitespace.
    #[error("No message provided")]
    EmptyMessage,

    /// The chat history could not be saved.
    #[error(transparent)]
    Persist(#[from] PersistError),

    // ── Transformation errors ─────────────────────────────────────────────
    /// The transformation call failed; the cursor was not advanced.
    #[error(transparent)]
    Transformation(#[from] TransformError),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the error was caused by the caller's request (a 4xx in HTTP
    /// terms) rather than by the document, the provider or the host.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::FileNotFound { .. }
                | EngineError::DocumentOpen { .. }
                | EngineError::DocumentTooLarge { .. }
                | EngineError::PageIndex { .. }
                | EngineError::SessionNotFound { .. }
                | EngineError::InvalidPage { .. }
                | EngineError::InvalidRange { .. }
                | EngineError::NoMorePages { .. }
                | EngineError::EmptyMessage
        )
    }
}

/// Failure of one transformation call, after retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    /// Every attempt hit a timeout or connection failure.
    #[error("Transformation timed out after {attempts} attempts: {detail}")]
    Timeout { attempts: u32, detail: String },

    /// The provider rejected the request; not retried.
    #[error("Transformation provider error{}: {message}", status_suffix(.status))]
    Provider {
        status: Option<u16>,
        message: String,
    },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// A non-fatal error for a single page of a batch or range run.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageError {
    /// Transformation timed out after all attempts.
    #[error("Page {page}: transformation timed out after {attempts} attempts: {detail}")]
    Timeout {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// The provider rejected the request.
    #[error("Page {page}: provider error: {detail}")]
    ProviderFailed { page: usize, detail: String },

    /// The page text could not be extracted.
    #[error("Page {page}: text extraction failed: {detail}")]
    ExtractionFailed { page: usize, detail: String },
}

impl PageError {
    /// 1-based page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::Timeout { page, .. }
            | PageError::ProviderFailed { page, .. }
            | PageError::ExtractionFailed { page, .. } => *page,
        }
    }

    pub(crate) fn from_transform(page: usize, err: &TransformError) -> Self {
        match err {
            TransformError::Timeout { attempts, detail } => PageError::Timeout {
                page,
                attempts: *attempts,
                detail: detail.clone(),
            },
            TransformError::Provider { .. } => PageError::ProviderFailed {
                page,
                detail: err.to_string(),
            },
        }
    }
}

/// A result could not be written to the persistence sink.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode or decode record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_page_display() {
        let e = EngineError::InvalidPage { page: 9, total: 5 };
        let msg = e.to_string();
        assert!(msg.contains("Page 9"), "got: {msg}");
        assert!(msg.contains("5 pages"), "got: {msg}");
    }

    #[test]
    fn provider_error_display_with_status() {
        let e = TransformError::Provider {
            status: Some(401),
            message: "invalid key".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("HTTP 401"), "got: {msg}");
        assert!(msg.contains("invalid key"), "got: {msg}");
    }

    #[test]
    fn provider_error_display_without_status() {
        let e = TransformError::Provider {
            status: None,
            message: "quota exceeded".into(),
        };
        assert!(!e.to_string().contains("HTTP"));
    }

    #[test]
    fn transformation_error_is_transparent() {
        let e: EngineError = TransformError::Timeout {
            attempts: 5,
            detail: "connect refused".into(),
        }
        .into();
        assert!(e.to_string().contains("5 attempts"));
        assert!(!e.is_client_error());
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(EngineError::SessionNotFound {
            session_id: "x".into()
        }
        .is_client_error());
        assert!(EngineError::NoMorePages { total: 3 }.is_client_error());
        assert!(EngineError::EmptyMessage.is_client_error());
        assert!(!EngineError::Internal("boom".into()).is_client_error());
    }

    #[test]
    fn page_error_from_timeout_keeps_attempts() {
        let err = TransformError::Timeout {
            attempts: 5,
            detail: "timed out".into(),
        };
        let page = PageError::from_transform(4, &err);
        assert_eq!(page.page(), 4);
        assert!(matches!(page, PageError::Timeout { attempts: 5, .. }));
    }
}
