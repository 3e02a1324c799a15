//! Instructions sent as the system message of every transformation.
//!
//! A session starts with [`DEFAULT_INSTRUCTION`] (or the configured
//! override). Callers pick other instructions per call, from the built-in
//! presets, or from a user preset file managed by [`PromptLibrary`].

use crate::error::PersistError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Instruction a new session starts with.
pub const DEFAULT_INSTRUCTION: &str = "Please convert this text into detailed markdown notes \
with headings, key points, and additional notes.";

/// System message for free-form chat.
pub const CHAT_INSTRUCTION: &str =
    "You are a friendly AI assistant. Please respond concisely and professionally.";

/// A named, reusable instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionPreset {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub prompt: String,
}

/// Presets that ship with the crate. Ids 1–99 are reserved for them.
pub fn builtin_presets() -> Vec<InstructionPreset> {
    vec![
        InstructionPreset {
            id: 1,
            name: "notes".into(),
            description: "Structured markdown notes".into(),
            prompt: DEFAULT_INSTRUCTION.into(),
        },
        InstructionPreset {
            id: 2,
            name: "concepts".into(),
            description: "Key concepts and definitions".into(),
            prompt: "Extract every key concept and definition from the text and list them \
in markdown, each with a short explanation."
                .into(),
        },
        InstructionPreset {
            id: 3,
            name: "summary".into(),
            description: "Key information and main points".into(),
            prompt: "Analyse the following text, extract the key information and summarise \
the main points in markdown."
                .into(),
        },
    ]
}

const FIRST_USER_ID: u32 = 100;

/// Built-in presets plus user presets stored as a JSON array in one file.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    path: PathBuf,
}

impl PromptLibrary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every preset, built-ins first. A missing user file means no user presets.
    pub async fn all(&self) -> Result<Vec<InstructionPreset>, PersistError> {
        let mut presets = builtin_presets();
        presets.extend(self.user_presets().await?);
        Ok(presets)
    }

    /// Look a preset up by name (case-insensitive) or numeric id.
    pub async fn find(&self, key: &str) -> Result<Option<InstructionPreset>, PersistError> {
        let key = key.trim();
        let id = key.parse::<u32>().ok();
        Ok(self
            .all()
            .await?
            .into_iter()
            .find(|p| Some(p.id) == id || p.name.eq_ignore_ascii_case(key)))
    }

    /// Append a user preset and return it with its assigned id.
    pub async fn add(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Result<InstructionPreset, PersistError> {
        let mut user = self.user_presets().await?;
        let id = user
            .iter()
            .map(|p| p.id + 1)
            .max()
            .unwrap_or(FIRST_USER_ID)
            .max(FIRST_USER_ID);
        let preset = InstructionPreset {
            id,
            name: name.into(),
            description: description.into(),
            prompt: prompt.into(),
        };
        user.push(preset.clone());

        let json = serde_json::to_vec_pretty(&user)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PersistError::Write {
                        path: parent.to_path_buf(),
                        source: e,
                    })?;
            }
        }
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| PersistError::Write {
                path: self.path.clone(),
                source: e,
            })?;
        debug!("Added preset '{}' (id {})", preset.name, preset.id);
        Ok(preset)
    }

    async fn user_presets(&self) -> Result<Vec<InstructionPreset>, PersistError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(PersistError::Read {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}
