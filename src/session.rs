//! Sessions and the store that owns them.
//!
//! A [`Session`] is one document's traversal state: the document handle, a
//! 0-based cursor and the ordered record of every page the cursor has moved
//! past. The [`SessionStore`] maps opaque ids to sessions, each behind its own
//! async mutex so two requests on one session serialise while requests on
//! different sessions run independently.
//!
//! Sessions are destroyed by an explicit [`SessionStore::remove`] or by idle
//! eviction. A session whose lock handle is held by a running operation is
//! never evicted.

use crate::error::EngineError;
use crate::output::{PageInfo, SessionSummary};
use crate::pipeline::document::{Document, DocumentKind};
use crate::pipeline::llm::TokenUsage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

// ── Page records ─────────────────────────────────────────────────────────────

/// What happened to a page the cursor moved past.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PageOutcome {
    Transformed { content: String, usage: TokenUsage },
    Skipped,
    Failed { message: String },
}

/// One entry of a session's accumulated results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageRecord {
    pub page_number: usize,
    #[serde(flatten)]
    pub outcome: PageOutcome,
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Traversal state of one uploaded document.
pub struct Session {
    id: String,
    document: Box<dyn Document>,
    total_pages: usize,
    cursor: usize,
    active_instruction: String,
    results: Vec<PageRecord>,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: String, document: Box<dyn Document>, instruction: String) -> Self {
        let total_pages = document.page_count();
        Self {
            id,
            document,
            total_pages,
            cursor: 0,
            active_instruction: instruction,
            results: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> DocumentKind {
        self.document.kind()
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// 0-based index of the next page to process.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// DONE state: no page left under the cursor.
    pub fn is_complete(&self) -> bool {
        self.cursor >= self.total_pages
    }

    pub fn active_instruction(&self) -> &str {
        &self.active_instruction
    }

    pub fn set_instruction(&mut self, instruction: String) {
        self.active_instruction = instruction;
    }

    pub fn results(&self) -> &[PageRecord] {
        &self.results
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Freshly extracted text of the page at 0-based `index`.
    pub async fn page_text(&self, index: usize) -> Result<String, EngineError> {
        self.document.page_text(index).await
    }

    /// The page under the cursor, or `None` once the session is DONE.
    pub async fn page_info(&self) -> Result<Option<PageInfo>, EngineError> {
        if self.is_complete() {
            return Ok(None);
        }
        Ok(Some(PageInfo {
            page_number: self.cursor + 1,
            total_pages: self.total_pages,
            text: self.page_text(self.cursor).await?,
        }))
    }

    /// Record `outcome` for the page under the cursor and move past it.
    ///
    /// Does nothing on a DONE session, so the cursor never exceeds
    /// `total_pages` and every record matches one page moved past.
    pub fn record_and_advance(&mut self, outcome: PageOutcome) {
        if self.is_complete() {
            return;
        }
        self.results.push(PageRecord {
            page_number: self.cursor + 1,
            outcome,
        });
        self.cursor += 1;
    }

    /// Fails with [`EngineError::InvalidPage`] unless `1 <= page_number <= total`.
    pub fn check_page(&self, page_number: usize) -> Result<(), EngineError> {
        if page_number == 0 || page_number > self.total_pages {
            return Err(EngineError::InvalidPage {
                page: page_number,
                total: self.total_pages,
            });
        }
        Ok(())
    }

    /// Move the cursor onto 1-based `page_number`, backward or forward.
    pub fn jump(&mut self, page_number: usize) -> Result<(), EngineError> {
        self.check_page(page_number)?;
        self.cursor = page_number - 1;
        Ok(())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            kind: self.kind(),
            total_pages: self.total_pages,
            cursor: self.cursor,
            is_complete: self.is_complete(),
            active_instruction: self.active_instruction.clone(),
            pages_recorded: self.results.len(),
            pages_transformed: self
                .results
                .iter()
                .filter(|r| matches!(r.outcome, PageOutcome::Transformed { .. }))
                .count(),
        }
    }
}

// ── Session store ────────────────────────────────────────────────────────────

/// Shared handle to one session. Holding it marks the session as in use.
pub type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

struct Entry {
    session: SessionHandle,
    last_access: parking_lot::Mutex<Instant>,
}

impl Entry {
    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn is_idle(&self, timeout: Duration) -> bool {
        Arc::strong_count(&self.session) == 1 && self.last_access.lock().elapsed() >= timeout
    }
}

/// Live sessions indexed by id.
pub struct SessionStore {
    sessions: parking_lot::RwLock<HashMap<String, Arc<Entry>>>,
    idle_timeout: Duration,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: parking_lot::RwLock::new(HashMap::new()),
            idle_timeout,
            max_sessions: max_sessions.max(1),
        }
    }

    /// Register a new session for `document` and return its id.
    ///
    /// Idle sessions are evicted first; fails with
    /// [`EngineError::TooManySessions`] if the store is still full.
    pub fn create(
        &self,
        document: Box<dyn Document>,
        instruction: String,
    ) -> Result<String, EngineError> {
        self.evict_idle();

        let id = Uuid::new_v4().to_string();
        let pages = document.page_count();
        let entry = Arc::new(Entry {
            session: Arc::new(tokio::sync::Mutex::new(Session::new(
                id.clone(),
                document,
                instruction,
            ))),
            last_access: parking_lot::Mutex::new(Instant::now()),
        });

        {
            let mut sessions = self.sessions.write();
            if sessions.len() >= self.max_sessions {
                return Err(EngineError::TooManySessions {
                    max: self.max_sessions,
                });
            }
            sessions.insert(id.clone(), entry);
        }

        info!(session_id = %id, pages, "Created session");
        Ok(id)
    }

    /// Look a session up and refresh its idle clock.
    pub fn get(&self, session_id: &str) -> Result<SessionHandle, EngineError> {
        let sessions = self.sessions.read();
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        entry.touch();
        Ok(Arc::clone(&entry.session))
    }

    /// Drop a session. Returns whether it existed.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id).is_some();
        if removed {
            info!(session_id = %session_id, "Closed session");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// Remove sessions idle for at least the idle timeout and not in use.
    /// Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|id, entry| {
            let idle = entry.is_idle(self.idle_timeout);
            if idle {
                debug!(session_id = %id, "Evicting idle session");
            }
            !idle
        });
        let count = before - sessions.len();
        if count > 0 {
            info!(count, "Evicted idle sessions");
        }
        count
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` until the store
    /// is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.evict_idle();
                    }
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::document::PagedText;

    fn doc(pages: &[&str]) -> Box<dyn Document> {
        Box::new(PagedText::new(pages.join("\x0c")).unwrap())
    }

    fn session(pages: &[&str]) -> Session {
        Session::new("s".into(), doc(pages), "notes".into())
    }

    #[test]
    fn advance_records_and_stops_at_total() {
        let mut s = session(&["a", "b"]);
        s.record_and_advance(PageOutcome::Skipped);
        s.record_and_advance(PageOutcome::Skipped);
        s.record_and_advance(PageOutcome::Skipped);
        assert_eq!(s.cursor(), 2);
        assert!(s.is_complete());
        assert_eq!(s.results().len(), 2);
        assert_eq!(s.results()[1].page_number, 2);
    }

    #[test]
    fn jump_validates_bounds_and_leaves_done() {
        let mut s = session(&["a", "b", "c"]);
        s.record_and_advance(PageOutcome::Skipped);
        s.record_and_advance(PageOutcome::Skipped);
        s.record_and_advance(PageOutcome::Skipped);
        assert!(s.is_complete());

        s.jump(1).unwrap();
        assert_eq!(s.cursor(), 0);
        assert!(!s.is_complete());
        assert_eq!(s.results().len(), 3);

        assert!(matches!(
            s.jump(0),
            Err(EngineError::InvalidPage { page: 0, total: 3 })
        ));
        assert!(matches!(
            s.jump(4),
            Err(EngineError::InvalidPage { page: 4, total: 3 })
        ));
    }

    #[tokio::test]
    async fn page_info_is_none_when_done() {
        let mut s = session(&["only"]);
        let info = s.page_info().await.unwrap().unwrap();
        assert_eq!(info.page_number, 1);
        assert_eq!(info.text, "only");
        s.record_and_advance(PageOutcome::Skipped);
        assert!(s.page_info().await.unwrap().is_none());
    }

    #[test]
    fn summary_counts_transformed_pages() {
        let mut s = session(&["a", "b", "c"]);
        s.record_and_advance(PageOutcome::Transformed {
            content: "A".into(),
            usage: TokenUsage::default(),
        });
        s.record_and_advance(PageOutcome::Failed {
            message: "timeout".into(),
        });
        let summary = s.summary();
        assert_eq!(summary.cursor, 2);
        assert_eq!(summary.pages_recorded, 2);
        assert_eq!(summary.pages_transformed, 1);
        assert!(!summary.is_complete);
    }

    #[test]
    fn record_serialises_flat_with_status_tag() {
        let record = PageRecord {
            page_number: 2,
            outcome: PageOutcome::Skipped,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, serde_json::json!({"page_number": 2, "status": "skipped"}));
    }

    #[tokio::test]
    async fn store_create_get_remove() {
        let store = SessionStore::new(Duration::from_secs(60), 4);
        let id = store.create(doc(&["a"]), "notes".into()).unwrap();
        assert!(Uuid::parse_str(&id).is_ok());

        let handle = store.get(&id).unwrap();
        assert_eq!(handle.lock().await.total_pages(), 1);
        drop(handle);

        assert!(store.remove(&id));
        assert!(!store.remove(&id));
        assert!(matches!(
            store.get(&id),
            Err(EngineError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn ids_are_unique() {
        let store = SessionStore::new(Duration::from_secs(60), 16);
        let a = store.create(doc(&["a"]), "p".into()).unwrap();
        let b = store.create(doc(&["a"]), "p".into()).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn idle_sessions_are_evicted_unless_in_use() {
        let store = SessionStore::new(Duration::ZERO, 16);
        let busy = store.create(doc(&["a"]), "p".into()).unwrap();
        let handle = store.get(&busy).unwrap();
        // Creating runs an eviction pass; the held session survives it.
        let idle = store.create(doc(&["a"]), "p".into()).unwrap();
        assert!(store.contains(&busy));

        assert_eq!(store.evict_idle(), 1);
        assert!(store.contains(&busy));
        assert!(!store.contains(&idle));

        drop(handle);
        assert_eq!(store.evict_idle(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn cap_is_enforced_after_eviction() {
        let store = SessionStore::new(Duration::from_secs(3600), 2);
        store.create(doc(&["a"]), "p".into()).unwrap();
        store.create(doc(&["a"]), "p".into()).unwrap();
        assert!(matches!(
            store.create(doc(&["a"]), "p".into()),
            Err(EngineError::TooManySessions { max: 2 })
        ));

        let evicting = SessionStore::new(Duration::ZERO, 1);
        evicting.create(doc(&["a"]), "p".into()).unwrap();
        assert!(evicting.create(doc(&["a"]), "p".into()).is_ok());
    }

    #[tokio::test]
    async fn sweeper_stops_when_store_is_dropped() {
        let store = Arc::new(SessionStore::new(Duration::ZERO, 4));
        store.create(doc(&["a"]), "p".into()).unwrap();
        let sweeper = store.spawn_sweeper(Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());

        drop(store);
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
    }
}
