//! Progress-callback trait for batch and range runs.
//!
//! Inject an [`Arc<dyn RunProgressCallback>`] via
//! [`crate::Engine::with_progress`] to receive events as a multi-page run
//! transforms each page. Single-page processing does not emit events; its
//! return value already is the event.
//!
//! # Example
//!
//! ```rust
//! use pagewise::RunProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counting(AtomicUsize);
//!
//! impl RunProgressCallback for Counting {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, content_len: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Page {}/{} done ({} bytes)", page_num, total_pages, content_len);
//!     }
//! }
//! ```

use std::sync::Arc;

/// Called by the engine while a batch or range run walks its pages.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Implementations must be `Send + Sync`: runs on
/// different sessions execute concurrently and share one callback.
pub trait RunProgressCallback: Send + Sync {
    /// Called once before the first page of a run.
    ///
    /// # Arguments
    /// * `session_id` — session the run belongs to
    /// * `pages`      — upper bound on pages the run will attempt
    fn on_run_start(&self, session_id: &str, pages: usize) {
        let _ = (session_id, pages);
    }

    /// Called just before a page is sent for transformation.
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page is transformed.
    ///
    /// # Arguments
    /// * `page_num`    — 1-indexed page number
    /// * `total_pages` — pages in the document
    /// * `content_len` — byte length of the transformed content
    fn on_page_complete(&self, page_num: usize, total_pages: usize, content_len: usize) {
        let _ = (page_num, total_pages, content_len);
    }

    /// Called when a page fails; the run continues with the next page.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called once after the run stops.
    fn on_run_complete(&self, transformed: usize, failed: usize) {
        let _ = (transformed, failed);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

/// Shared handle stored by [`crate::Engine`].
pub type ProgressCallback = Arc<dyn RunProgressCallback>;
