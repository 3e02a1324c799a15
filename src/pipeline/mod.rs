//! Pipeline stages behind every page transformation.
//!
//! Each submodule implements exactly one step, so each is testable on its
//! own and can be swapped (another backend, another sink) without touching
//! the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ document/extract ──▶ llm + retry ──▶ postprocess ──▶ persist
//! (path/URL)  (page text)         (chat model)    (cleanup)       (sink)
//! ```
//!
//! 1. [`input`]    — load a user-supplied path or URL into bytes
//! 2. [`document`] — detect the format and extract one page's text on demand;
//!    [`extract`] does the PDF work in `spawn_blocking` because pdfium is not
//!    async-safe
//! 3. [`llm`]      — drive the chat-completion call; the only stage with
//!    network I/O. [`retry`] holds its attempt/delay policy
//! 4. [`postprocess`] — deterministic cleanup of model quirks
//! 5. [`persist`]  — write page records and consolidated documents

pub mod document;
pub mod extract;
pub mod input;
pub mod llm;
pub mod persist;
pub mod postprocess;
pub mod retry;
