//! # pagewise
//!
//! Walk a multi-page document one page at a time and transform each page's
//! text with a chat model.
//!
//! ## Why sessions?
//!
//! Long documents do not fit in one model call, and a reader rarely wants the
//! whole thing at once. A session keeps a cursor over an uploaded document so
//! a caller can read, skip, jump back and transform pages as it goes, with
//! every transformation persisted and counted against a shared token quota.
//!
//! ## Pipeline Overview
//!
//! ```text
//! bytes (PDF or form-feed paged text)
//!  │
//!  ├─ 1. Open     detect format, count pages            (pipeline::document)
//!  ├─ 2. Extract  text of the page under the cursor     (pdfium, spawn_blocking)
//!  ├─ 3. Model    chat completion with bounded retry    (pipeline::llm)
//!  ├─ 4. Polish   strip fences, normalise whitespace    (pipeline::postprocess)
//!  ├─ 5. Persist  JSON record + Markdown per page       (pipeline::persist)
//!  └─ 6. Account  charge tokens to the usage counter    (usage)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagewise::{Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::builder()
//!         .api_key(std::env::var("OPENAI_API_KEY")?)
//!         .model("gpt-4.1-mini")
//!         .build()?;
//!     let engine = Engine::new(config)?;
//!
//!     let created = engine.create_session(std::fs::read("book.pdf")?).await?;
//!     let page = engine.process_one(&created.session_id, None).await?;
//!     println!("{}", page.content);
//!
//!     let batch = engine
//!         .process_batch(&created.session_id, Some("Summarise in three bullets."), None)
//!         .await?;
//!     eprintln!("{} pages, complete: {}", batch.results.len(), batch.is_complete);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pagewise` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pagewise = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod session;
pub mod usage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use chat::{ChatMessage, ChatRole, MAX_CHAT_HISTORY};
pub use config::{EngineConfig, EngineConfigBuilder, MAX_BATCH_PAGES};
pub use engine::Engine;
pub use error::{EngineError, PageError, PersistError, TransformError};
pub use output::{
    BatchOutput, ChatReply, CursorMoved, PageContent, PageInfo, PagePreview, ProcessedPage,
    RangeOutput, SessionCreated, SessionSummary, TokenReset, TokenStatus,
};
pub use pipeline::document::DocumentKind;
pub use pipeline::llm::{
    BackendError, CompletionBackend, CompletionRequest, CompletionResponse, OpenAiCompatBackend,
    TokenUsage,
};
pub use pipeline::persist::{FsSink, PersistedPage, PersistedRefs, ResultSink};
pub use pipeline::retry::{Backoff, RetryPolicy, Sleeper};
pub use progress::{NoopProgressCallback, ProgressCallback, RunProgressCallback};
pub use prompts::{InstructionPreset, PromptLibrary, CHAT_INSTRUCTION, DEFAULT_INSTRUCTION};
pub use session::{PageOutcome, PageRecord};
pub use usage::UsageCounter;
