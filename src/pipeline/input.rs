//! Input resolution: load a user-supplied path or URL into memory.
//!
//! Sessions are created from bytes, so the CLI needs one step that turns
//! `notes.pdf` or `https://host/paper.pdf` into a byte buffer. Format
//! detection happens later in [`crate::pipeline::document::open_document`].

use crate::error::EngineError;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Bytes loaded from a path or URL, with a display name.
#[derive(Debug, Clone)]
pub struct LoadedInput {
    /// File name from the path or the last URL segment.
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Load a local file or download an HTTP(S) URL.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<LoadedInput, EngineError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(input).await
    }
}

async fn read_local(path_str: &str) -> Result<LoadedInput, EngineError> {
    let path = PathBuf::from(path_str);
    let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => EngineError::PermissionDenied {
            path: path.clone(),
        },
        _ => EngineError::FileNotFound { path: path.clone() },
    })?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path_str.to_string());
    debug!("Read {} bytes from {}", bytes.len(), path.display());
    Ok(LoadedInput { name, bytes })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<LoadedInput, EngineError> {
    info!("Downloading document from: {}", url);

    let failed = |reason: String| EngineError::DownloadFailed {
        url: url.to_string(),
        reason,
    };
    let classify = |e: reqwest::Error| {
        if e.is_timeout() {
            EngineError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(classify)?;
    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(classify)?.to_vec();
    info!("Downloaded {} bytes", bytes.len());
    Ok(LoadedInput {
        name: filename_from_url(url),
        bytes,
    })
}

/// Last path segment of the URL, or `downloaded` when it has none.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_owned))
        })
        .filter(|last| !last.is_empty())
        .unwrap_or_else(|| "downloaded".to_string())
}
