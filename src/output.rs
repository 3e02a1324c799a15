//! Response types returned by [`crate::Engine`] operations.
//!
//! Every type derives `Serialize` so a transport layer can hand them to its
//! JSON encoder unchanged.

use crate::error::PageError;
use crate::pipeline::document::DocumentKind;
use crate::pipeline::llm::TokenUsage;
use crate::pipeline::persist::PersistedRefs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The page under the cursor, with its freshly extracted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    /// 1-indexed page number (`cursor + 1`).
    pub page_number: usize,
    pub total_pages: usize,
    pub text: String,
}

/// Returned by [`crate::Engine::create_session`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionCreated {
    pub session_id: String,
    pub kind: DocumentKind,
    /// First page of the document; a session always starts on page 1.
    pub page_info: PageInfo,
}

/// Text of the page after the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PagePreview {
    pub page_number: usize,
    pub content: String,
}

/// Cursor position after an advance, skip or jump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CursorMoved {
    /// `None` once the cursor has run off the last page, or when the page
    /// now under the cursor could not be extracted (`is_complete` is false).
    pub page_info: Option<PageInfo>,
    pub is_complete: bool,
}

/// Returned by [`crate::Engine::process_one`].
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedPage {
    /// The page that was transformed.
    pub page_number: usize,
    pub content: String,
    pub usage: TokenUsage,
    /// True when the provider did not report usage and it was estimated.
    pub usage_estimated: bool,
    /// The page now under the cursor, or `None` when the document is done
    /// or that page could not be extracted.
    pub page_info: Option<PageInfo>,
    pub is_complete: bool,
    /// Files written by the sink; `None` if persistence failed.
    pub persisted: Option<PersistedRefs>,
}

/// One successfully transformed page of a batch or range run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContent {
    pub page_number: usize,
    pub content: String,
}

/// Returned by [`crate::Engine::process_batch`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutput {
    pub results: Vec<PageContent>,
    /// Pages that failed; the cursor moved past each of them.
    pub failures: Vec<PageError>,
    pub is_complete: bool,
    /// Consolidated Markdown document for the batch, when one was written.
    pub consolidated: Option<PathBuf>,
}

/// Returned by [`crate::Engine::process_range`].
#[derive(Debug, Clone, Serialize)]
pub struct RangeOutput {
    pub results: Vec<PageContent>,
    /// Per-page files written by the sink, in page order.
    pub output_file_refs: Vec<PersistedRefs>,
    pub failures: Vec<PageError>,
    pub is_complete: bool,
    pub consolidated: Option<PathBuf>,
}

/// Snapshot of a session's traversal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub kind: DocumentKind,
    pub total_pages: usize,
    pub cursor: usize,
    pub is_complete: bool,
    pub active_instruction: String,
    /// Number of pages the cursor has advanced past.
    pub pages_recorded: usize,
    pub pages_transformed: usize,
}

/// Returned by [`crate::Engine::token_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStatus {
    /// May be negative: the quota is advisory, calls are never blocked.
    pub remaining: i64,
    pub max: u64,
    /// `(max - remaining) / max * 100`, rounded to one decimal.
    pub usage_percentage: f64,
    /// Tokens consumed by the most recent calls.
    pub recent_usage: u64,
}

/// Returned by [`crate::Engine::chat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    pub response: String,
    pub usage: TokenUsage,
    pub usage_estimated: bool,
    /// Quota balance after this call.
    pub remaining_tokens: i64,
}

/// Returned by [`crate::Engine::reset_tokens`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenReset {
    pub remaining: i64,
}
