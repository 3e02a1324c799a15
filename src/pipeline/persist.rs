//! Result persistence: write transformed pages where callers can find them.
//!
//! The engine hands every successful transformation to a [`ResultSink`].
//! Persistence is best-effort: a sink error is logged by the engine and the
//! transformation is still returned to the caller.
//!
//! ## FsSink layout
//!
//! ```text
//! {output_dir}/{session_id}_page_0003.json   record with prompt and timestamp
//! {output_dir}/{session_id}_page_0003.md     "## Page 3" + content
//! {output_dir}/{session_id}_pages_2-5.md     consolidated batch/range output
//! {output_dir}/{YYYY-MM-DD}_chat.md          chat history, one file per day
//! ```
//!
//! Every file is written to a `.tmp` sibling and renamed into place, so a
//! reader never sees a half-written file.

use crate::chat::{render_chat, ChatMessage};
use crate::error::PersistError;
use crate::output::PageContent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One transformed page as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPage {
    pub session_id: String,
    pub page_number: usize,
    /// Instruction the page was transformed with.
    pub prompt: String,
    pub content: String,
    pub processed_at: DateTime<Utc>,
}

impl PersistedPage {
    pub fn new(
        session_id: impl Into<String>,
        page_number: usize,
        prompt: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            page_number,
            prompt: prompt.into(),
            content: content.into(),
            processed_at: Utc::now(),
        }
    }
}

/// Where a persisted page ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRefs {
    /// The JSON record.
    pub record: PathBuf,
    /// The rendered Markdown page.
    pub document: PathBuf,
}

/// Destination for transformation results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Store one transformed page.
    async fn persist(&self, page: &PersistedPage) -> Result<PersistedRefs, PersistError>;

    /// Store the pages of one batch or range run as a single document.
    async fn persist_consolidated(
        &self,
        session_id: &str,
        pages: &[PageContent],
        first: usize,
        last: usize,
    ) -> Result<PathBuf, PersistError>;

    /// Store the current chat history as one document.
    async fn persist_chat(&self, messages: &[ChatMessage]) -> Result<PathBuf, PersistError>;
}

/// Writes results as files under one directory.
#[derive(Debug, Clone)]
pub struct FsSink {
    root: PathBuf,
}

impl FsSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn page_stem(&self, session_id: &str, page_number: usize) -> PathBuf {
        self.root
            .join(format!("{}_page_{:04}", session_id, page_number))
    }
}

#[async_trait]
impl ResultSink for FsSink {
    async fn persist(&self, page: &PersistedPage) -> Result<PersistedRefs, PersistError> {
        let stem = self.page_stem(&page.session_id, page.page_number);
        let record = stem.with_extension("json");
        let document = stem.with_extension("md");

        write_atomic(&record, &serde_json::to_vec_pretty(page)?).await?;
        write_atomic(&document, render_page(page.page_number, &page.content).as_bytes()).await?;

        debug!(
            "Persisted page {} of session {} to {}",
            page.page_number,
            page.session_id,
            document.display()
        );
        Ok(PersistedRefs { record, document })
    }

    async fn persist_consolidated(
        &self,
        session_id: &str,
        pages: &[PageContent],
        first: usize,
        last: usize,
    ) -> Result<PathBuf, PersistError> {
        let path = self
            .root
            .join(format!("{}_pages_{}-{}.md", session_id, first, last));
        let body = pages
            .iter()
            .map(|p| render_page(p.page_number, &p.content))
            .collect::<Vec<_>>()
            .join("\n");
        write_atomic(&path, body.as_bytes()).await?;
        debug!("Consolidated {} pages into {}", pages.len(), path.display());
        Ok(path)
    }

    async fn persist_chat(&self, messages: &[ChatMessage]) -> Result<PathBuf, PersistError> {
        let path = self
            .root
            .join(format!("{}_chat.md", Utc::now().format("%Y-%m-%d")));
        write_atomic(&path, render_chat(messages).as_bytes()).await?;
        debug!("Saved {} chat messages to {}", messages.len(), path.display());
        Ok(path)
    }
}

fn render_page(page_number: usize, content: &str) -> String {
    format!("## Page {}\n\n{}\n", page_number, content.trim_end())
}

/// Write to `{path}.tmp`, then rename over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let write_err = |source| PersistError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persist_writes_record_and_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path().join("outputs"));
        let page = PersistedPage::new("abc", 3, "summarise", "# Three");

        let refs = sink.persist(&page).await.unwrap();
        assert!(refs.record.ends_with("abc_page_0003.json"));
        assert!(refs.document.ends_with("abc_page_0003.md"));

        let stored: PersistedPage =
            serde_json::from_slice(&std::fs::read(&refs.record).unwrap()).unwrap();
        assert_eq!(stored, page);
        assert_eq!(
            std::fs::read_to_string(&refs.document).unwrap(),
            "## Page 3\n\n# Three\n"
        );
    }

    #[tokio::test]
    async fn record_timestamp_is_rfc3339() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path());
        let refs = sink
            .persist(&PersistedPage::new("s", 1, "p", "c"))
            .await
            .unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&refs.record).unwrap()).unwrap();
        let ts = raw["processed_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok(), "got: {ts}");
    }

    #[tokio::test]
    async fn consolidated_document_lists_pages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path());
        let pages = vec![
            PageContent {
                page_number: 2,
                content: "two".into(),
            },
            PageContent {
                page_number: 3,
                content: "three".into(),
            },
        ];

        let path = sink.persist_consolidated("s", &pages, 2, 3).await.unwrap();
        assert!(path.ends_with("s_pages_2-3.md"));
        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body, "## Page 2\n\ntwo\n\n## Page 3\n\nthree\n");
    }

    #[tokio::test]
    async fn chat_is_saved_under_todays_date() {
        use crate::chat::ChatRole;

        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path());
        let messages = vec![
            ChatMessage::new(ChatRole::User, "hello", 1),
            ChatMessage::new(ChatRole::Assistant, "hi there", 2),
        ];

        let day = |t: DateTime<Utc>| format!("{}_chat.md", t.format("%Y-%m-%d"));
        let before = day(Utc::now());
        let path = sink.persist_chat(&messages).await.unwrap();
        let after = day(Utc::now());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name == before || name == after, "got: {name}");
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("hello"));
        assert!(body.contains("hi there"));
    }

    #[tokio::test]
    async fn no_tmp_files_are_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsSink::new(dir.path());
        sink.persist(&PersistedPage::new("s", 1, "p", "c"))
            .await
            .unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn unwritable_root_is_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let sink = FsSink::new(blocker.join("sub"));
        assert!(matches!(
            sink.persist(&PersistedPage::new("s", 1, "p", "c")).await,
            Err(PersistError::Write { .. })
        ));
    }
}
