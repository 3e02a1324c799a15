//! The pagination controller.
//!
//! [`Engine`] owns the session store, the shared usage counter, the
//! transformation client and the result sink, and exposes the per-session
//! state machine on top of them:
//!
//! ```text
//!            advance / skip / process_one / batch / range
//!   ACTIVE ─────────────────────────────────────────────▶ DONE
//! (cursor < total)                                 (cursor == total)
//!      ▲                                                 │
//!      └──────────────────────── jump ───────────────────┘
//! ```
//!
//! Every operation holds the session's lock from its first read to its last
//! write, so two requests on one session never interleave a read-then-write
//! of the cursor. Requests on different sessions proceed in parallel.
//!
//! ## Failure handling
//!
//! * `process_one` surfaces a failed transformation and leaves the cursor
//!   on the page, so the caller can retry it.
//! * `process_batch` and `process_range` record a failed page, move past it
//!   and carry on; the failures are returned alongside the successes.
//! * Persistence is best-effort in every mode: a sink error is logged and the
//!   transformed content is still returned.
//! * Once the cursor has moved, a page that cannot be extracted no longer
//!   fails the call; the result carries no `page_info` and the error is
//!   logged.
//!
//! ## Chat
//!
//! [`Engine::chat`] sends free-form messages through the same transformer,
//! charged to the same quota. The last twenty turns are kept in memory and
//! [`Engine::save_chat`] writes them through the sink.

use crate::chat::{ChatHistory, ChatMessage, ChatRole, EMPTY_REPLY};
use crate::config::{EngineConfig, MAX_BATCH_PAGES};
use crate::error::{EngineError, PageError};
use crate::output::{
    BatchOutput, ChatReply, CursorMoved, PageContent, PageInfo, PagePreview, ProcessedPage,
    RangeOutput, SessionCreated, SessionSummary, TokenReset, TokenStatus,
};
use crate::pipeline::document::{open_document, Document};
use crate::pipeline::llm::{CompletionBackend, OpenAiCompatBackend, Transformation, Transformer};
use crate::pipeline::persist::{FsSink, PersistedPage, PersistedRefs, ResultSink};
use crate::pipeline::retry::RetryPolicy;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::prompts::CHAT_INSTRUCTION;
use crate::session::{PageOutcome, Session, SessionStore};
use crate::usage::UsageCounter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session-based pagination and transformation engine.
pub struct Engine {
    config: EngineConfig,
    store: Arc<SessionStore>,
    usage: Arc<UsageCounter>,
    backend: Arc<dyn CompletionBackend>,
    transformer: Transformer,
    sink: Arc<dyn ResultSink>,
    progress: ProgressCallback,
    chat: ChatHistory,
}

/// Pages touched by one batch or range run.
#[derive(Default)]
struct RunOutcome {
    results: Vec<PageContent>,
    refs: Vec<PersistedRefs>,
    failures: Vec<PageError>,
}

impl Engine {
    /// Engine talking to the configured OpenAI-compatible endpoint and
    /// persisting under `config.output_dir`.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let backend = OpenAiCompatBackend::new(
            &config.api_base_url,
            config.api_key.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        let sink = FsSink::new(config.output_dir.clone());
        Ok(Self::with_backend(config, Arc::new(backend), Arc::new(sink)))
    }

    /// Engine with an explicit backend and sink.
    pub fn with_backend(
        config: EngineConfig,
        backend: Arc<dyn CompletionBackend>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let store = Arc::new(SessionStore::new(
            config.session_idle_timeout(),
            config.max_sessions,
        ));
        let usage = Arc::new(UsageCounter::new(config.token_quota));
        let transformer = build_transformer(&config, &backend, config.retry_policy(), &usage);
        Self {
            config,
            store,
            usage,
            backend,
            transformer,
            sink,
            progress: Arc::new(NoopProgressCallback),
            chat: ChatHistory::default(),
        }
    }

    /// Replace the retry policy, e.g. with one whose sleeper records delays.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.transformer = build_transformer(&self.config, &self.backend, retry, &self.usage);
        self
    }

    /// Receive per-page events from batch and range runs.
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn usage(&self) -> &Arc<UsageCounter> {
        &self.usage
    }

    /// Evict idle sessions in the background every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        self.store.spawn_sweeper(interval)
    }

    // ── Session lifecycle ────────────────────────────────────────────────

    /// Open `bytes` as a document and start a session on its first page.
    pub async fn create_session(&self, bytes: Vec<u8>) -> Result<SessionCreated, EngineError> {
        let document = open_document(bytes, self.config.max_document_bytes).await?;
        self.open_session(document).await
    }

    /// Start a session on an already opened document.
    ///
    /// The session is discarded again if its first page cannot be extracted.
    pub async fn open_session(
        &self,
        document: Box<dyn Document>,
    ) -> Result<SessionCreated, EngineError> {
        let kind = document.kind();
        let session_id = self
            .store
            .create(document, self.config.default_instruction.clone())?;

        let first_page = {
            let handle = self.store.get(&session_id)?;
            let session = handle.lock().await;
            session.page_info().await
        };
        let page_info = match first_page {
            Ok(Some(info)) => info,
            Ok(None) => {
                self.store.remove(&session_id);
                return Err(EngineError::Internal("new session has no pages".into()));
            }
            Err(e) => {
                self.store.remove(&session_id);
                return Err(e);
            }
        };

        Ok(SessionCreated {
            session_id,
            kind,
            page_info,
        })
    }

    /// Drop a session and release its document.
    pub fn close_session(&self, session_id: &str) -> Result<(), EngineError> {
        if self.store.remove(session_id) {
            Ok(())
        } else {
            Err(EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })
        }
    }

    pub async fn session_summary(&self, session_id: &str) -> Result<SessionSummary, EngineError> {
        let handle = self.store.get(session_id)?;
        let session = handle.lock().await;
        Ok(session.summary())
    }

    /// Replace the instruction used when a call does not name one.
    pub async fn set_instruction(
        &self,
        session_id: &str,
        instruction: impl Into<String>,
    ) -> Result<(), EngineError> {
        let instruction = instruction.into();
        if instruction.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "instruction must not be empty".into(),
            ));
        }
        let handle = self.store.get(session_id)?;
        let mut session = handle.lock().await;
        session.set_instruction(instruction);
        info!(session_id = %session_id, "Updated session instruction");
        Ok(())
    }

    // ── Cursor movement ──────────────────────────────────────────────────

    /// Text of the page after the one under the cursor, without moving.
    pub async fn preview_next(&self, session_id: &str) -> Result<PagePreview, EngineError> {
        let handle = self.store.get(session_id)?;
        let session = handle.lock().await;
        let next = session.cursor() + 1;
        if next >= session.total_pages() {
            return Err(EngineError::NoMorePages {
                total: session.total_pages(),
            });
        }
        Ok(PagePreview {
            page_number: next + 1,
            content: session.page_text(next).await?,
        })
    }

    /// The page under the cursor, or `None` once the session is done.
    pub async fn next_page_info(&self, session_id: &str) -> Result<Option<PageInfo>, EngineError> {
        let handle = self.store.get(session_id)?;
        let session = handle.lock().await;
        session.page_info().await
    }

    /// Move past the page under the cursor. A no-op once the session is done.
    pub async fn advance(&self, session_id: &str) -> Result<CursorMoved, EngineError> {
        let handle = self.store.get(session_id)?;
        let mut session = handle.lock().await;
        session.record_and_advance(PageOutcome::Skipped);
        Ok(cursor_moved(&session).await)
    }

    /// Move past the page under the cursor without transforming it.
    pub async fn skip(&self, session_id: &str) -> Result<CursorMoved, EngineError> {
        let handle = self.store.get(session_id)?;
        let mut session = handle.lock().await;
        if !session.is_complete() {
            debug!(session_id = %session_id, "Skipped page {}", session.cursor() + 1);
        }
        session.record_and_advance(PageOutcome::Skipped);
        Ok(cursor_moved(&session).await)
    }

    /// Put the cursor on 1-based `page_number`. Backward jumps are allowed.
    ///
    /// The target page is extracted before the cursor moves, so a failed
    /// extraction leaves the cursor where it was.
    pub async fn jump(
        &self,
        session_id: &str,
        page_number: usize,
    ) -> Result<CursorMoved, EngineError> {
        let handle = self.store.get(session_id)?;
        let mut session = handle.lock().await;
        session.check_page(page_number)?;
        let text = session.page_text(page_number - 1).await?;
        session.jump(page_number)?;
        debug!(session_id = %session_id, "Jumped to page {}", page_number);
        Ok(CursorMoved {
            page_info: Some(PageInfo {
                page_number,
                total_pages: session.total_pages(),
                text,
            }),
            is_complete: session.is_complete(),
        })
    }

    // ── Transformation ───────────────────────────────────────────────────

    /// Transform the page under the cursor and move past it.
    ///
    /// `instruction` overrides the session's active instruction for this
    /// call only. On failure the cursor stays on the page.
    pub async fn process_one(
        &self,
        session_id: &str,
        instruction: Option<&str>,
    ) -> Result<ProcessedPage, EngineError> {
        let handle = self.store.get(session_id)?;
        let mut session = handle.lock().await;
        if session.is_complete() {
            return Err(EngineError::NoMorePages {
                total: session.total_pages(),
            });
        }

        let instruction = resolve_instruction(&session, instruction);
        let page_number = session.cursor() + 1;
        let transformation = self
            .transform_page(&session, session.cursor(), &instruction)
            .await?;

        session.record_and_advance(PageOutcome::Transformed {
            content: transformation.content.clone(),
            usage: transformation.usage,
        });
        let persisted = self
            .persist_page(session_id, page_number, &instruction, &transformation.content)
            .await;

        Ok(ProcessedPage {
            page_number,
            content: transformation.content,
            usage: transformation.usage,
            usage_estimated: transformation.usage_estimated,
            page_info: next_page_after_commit(&session).await,
            is_complete: session.is_complete(),
            persisted,
        })
    }

    /// Transform up to `limit` pages from the cursor (default: the configured
    /// batch limit, never more than 10), stopping early at the last page.
    pub async fn process_batch(
        &self,
        session_id: &str,
        instruction: Option<&str>,
        limit: Option<usize>,
    ) -> Result<BatchOutput, EngineError> {
        let limit = limit
            .unwrap_or(self.config.batch_limit)
            .clamp(1, MAX_BATCH_PAGES);

        let handle = self.store.get(session_id)?;
        let mut session = handle.lock().await;
        let instruction = resolve_instruction(&session, instruction);
        let first_page = session.cursor() + 1;
        let end = (session.cursor() + limit).min(session.total_pages());

        let run = self.run_pages(&mut session, &instruction, end).await;
        let consolidated = self
            .persist_consolidated(session_id, &run.results, first_page, end)
            .await;

        info!(
            session_id = %session_id,
            "Batch done: {} transformed, {} failed",
            run.results.len(),
            run.failures.len()
        );
        Ok(BatchOutput {
            results: run.results,
            failures: run.failures,
            is_complete: session.is_complete(),
            consolidated,
        })
    }

    /// Transform pages `start..=end` (1-based), repositioning the cursor to
    /// `start` first. Afterwards the cursor sits just past `end`.
    pub async fn process_range(
        &self,
        session_id: &str,
        start: usize,
        end: usize,
        instruction: Option<&str>,
    ) -> Result<RangeOutput, EngineError> {
        let handle = self.store.get(session_id)?;
        let mut session = handle.lock().await;
        let total = session.total_pages();
        for page in [start, end] {
            if page == 0 || page > total {
                return Err(EngineError::InvalidPage { page, total });
            }
        }
        if start > end {
            return Err(EngineError::InvalidRange { start, end, total });
        }

        let instruction = resolve_instruction(&session, instruction);
        session.jump(start)?;
        info!(session_id = %session_id, "Processing pages {}-{} of {}", start, end, total);

        let run = self.run_pages(&mut session, &instruction, end).await;
        let consolidated = self
            .persist_consolidated(session_id, &run.results, start, end)
            .await;

        info!(
            session_id = %session_id,
            "Range {}-{} done: {} transformed, {} failed",
            start,
            end,
            run.results.len(),
            run.failures.len()
        );
        Ok(RangeOutput {
            results: run.results,
            output_file_refs: run.refs,
            failures: run.failures,
            is_complete: session.is_complete(),
            consolidated,
        })
    }

    // ── Chat ─────────────────────────────────────────────────────────────

    /// Send a free-form message through the transformer and record the
    /// exchange. Charged to the shared token quota like any page.
    pub async fn chat(&self, message: &str) -> Result<ChatReply, EngineError> {
        if message.trim().is_empty() {
            return Err(EngineError::EmptyMessage);
        }

        let t = self.transformer.transform(message, CHAT_INSTRUCTION).await?;
        let response = if t.content.trim().is_empty() {
            warn!("Empty chat response from provider");
            EMPTY_REPLY.to_string()
        } else {
            t.content
        };

        self.chat.push_exchange(
            ChatMessage::new(ChatRole::User, message, t.usage.prompt_tokens),
            ChatMessage::new(ChatRole::Assistant, response.clone(), t.usage.completion_tokens),
        );
        info!("Chat history updated ({} messages)", self.chat.len());

        Ok(ChatReply {
            response,
            usage: t.usage,
            usage_estimated: t.usage_estimated,
            remaining_tokens: self.usage.remaining(),
        })
    }

    /// The most recent chat turns, oldest first.
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.chat.snapshot()
    }

    /// Write the chat history through the result sink.
    pub async fn save_chat(&self) -> Result<PathBuf, EngineError> {
        let messages = self.chat.snapshot();
        let path = self.sink.persist_chat(&messages).await?;
        info!("Saved {} chat messages to {}", messages.len(), path.display());
        Ok(path)
    }

    // ── Usage ────────────────────────────────────────────────────────────

    pub fn token_status(&self) -> TokenStatus {
        self.usage.status()
    }

    /// Restore the token balance to the configured quota.
    pub fn reset_tokens(&self) -> TokenReset {
        TokenReset {
            remaining: self.usage.reset(),
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Extract page `index` and transform it.
    async fn transform_page(
        &self,
        session: &Session,
        index: usize,
        instruction: &str,
    ) -> Result<Transformation, EngineError> {
        let text = session.page_text(index).await?;
        let start = Instant::now();
        let transformation = self.transformer.transform(&text, instruction).await?;
        debug!(
            session_id = %session.id(),
            "Page {} transformed in {:?} ({} attempts)",
            index + 1,
            start.elapsed(),
            transformation.attempts
        );
        Ok(transformation)
    }

    /// Transform pages from the cursor until it reaches `end` (exclusive
    /// 0-based index). Failed pages are recorded and moved past.
    async fn run_pages(&self, session: &mut Session, instruction: &str, end: usize) -> RunOutcome {
        let total = session.total_pages();
        let mut run = RunOutcome::default();
        self.progress
            .on_run_start(session.id(), end.saturating_sub(session.cursor()));

        while session.cursor() < end {
            let index = session.cursor();
            let page_number = index + 1;
            self.progress.on_page_start(page_number, total);

            match self.transform_page(session, index, instruction).await {
                Ok(t) => {
                    session.record_and_advance(PageOutcome::Transformed {
                        content: t.content.clone(),
                        usage: t.usage,
                    });
                    if let Some(refs) = self
                        .persist_page(session.id(), page_number, instruction, &t.content)
                        .await
                    {
                        run.refs.push(refs);
                    }
                    self.progress
                        .on_page_complete(page_number, total, t.content.len());
                    run.results.push(PageContent {
                        page_number,
                        content: t.content,
                    });
                }
                Err(e) => {
                    let page_error = match e {
                        EngineError::Transformation(ref te) => {
                            PageError::from_transform(page_number, te)
                        }
                        other => PageError::ExtractionFailed {
                            page: page_number,
                            detail: other.to_string(),
                        },
                    };
                    warn!(session_id = %session.id(), "{}", page_error);
                    let message = page_error.to_string();
                    self.progress.on_page_error(page_number, total, &message);
                    session.record_and_advance(PageOutcome::Failed { message });
                    run.failures.push(page_error);
                }
            }
        }

        self.progress
            .on_run_complete(run.results.len(), run.failures.len());
        run
    }

    async fn persist_page(
        &self,
        session_id: &str,
        page_number: usize,
        instruction: &str,
        content: &str,
    ) -> Option<PersistedRefs> {
        let record = PersistedPage::new(session_id, page_number, instruction, content);
        match self.sink.persist(&record).await {
            Ok(refs) => Some(refs),
            Err(e) => {
                warn!(session_id = %session_id, "Failed to persist page {}: {}", page_number, e);
                None
            }
        }
    }

    async fn persist_consolidated(
        &self,
        session_id: &str,
        pages: &[PageContent],
        first: usize,
        last: usize,
    ) -> Option<PathBuf> {
        if pages.is_empty() {
            return None;
        }
        match self
            .sink
            .persist_consolidated(session_id, pages, first, last)
            .await
        {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    "Failed to persist pages {}-{}: {}", first, last, e
                );
                None
            }
        }
    }
}

fn build_transformer(
    config: &EngineConfig,
    backend: &Arc<dyn CompletionBackend>,
    retry: RetryPolicy,
    usage: &Arc<UsageCounter>,
) -> Transformer {
    Transformer::new(
        Arc::clone(backend),
        retry,
        Arc::clone(usage),
        config.generation_params(),
    )
    .with_clean_output(config.clean_output)
}

/// An explicit, non-blank instruction wins over the session's active one.
fn resolve_instruction(session: &Session, explicit: Option<&str>) -> String {
    match explicit {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        _ => session.active_instruction().to_string(),
    }
}

async fn cursor_moved(session: &Session) -> CursorMoved {
    CursorMoved {
        page_info: next_page_after_commit(session).await,
        is_complete: session.is_complete(),
    }
}

/// The page under the cursor once a move has been committed. An extraction
/// failure cannot undo the move, so it is logged and reported as `None`;
/// [`Engine::next_page_info`] surfaces the error itself.
async fn next_page_after_commit(session: &Session) -> Option<PageInfo> {
    match session.page_info().await {
        Ok(info) => info,
        Err(e) => {
            warn!(
                session_id = %session.id(),
                "Cannot extract page {}: {}",
                session.cursor() + 1,
                e
            );
            None
        }
    }
}
