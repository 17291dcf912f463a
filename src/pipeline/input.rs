//! Input resolution: turn a user-supplied path or URL into a local PDF file.
//!
//! pdfium opens documents from the file system, so URLs are downloaded into
//! a `TempDir` owned by the returned [`ResolvedInput`]; the directory is
//! removed when the value is dropped. The `%PDF` magic is checked up front
//! so a mistyped answer-key path fails with a readable error instead of a
//! pdfium crash.

use crate::error::Exam2JsonError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Which of the two input documents an operation is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// The exam booklet with the questions.
    Exam,
    /// The separate document listing the correct option per question.
    AnswerKey,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Exam => f.write_str("exam"),
            DocumentKind::AnswerKey => f.write_str("answer key"),
        }
    }
}

/// A document ready for pdfium.
pub enum ResolvedInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was a URL; the temp dir lives as long as this value.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` (path or HTTP/HTTPS URL) to a readable local PDF.
pub async fn resolve_document(
    input: &str,
    kind: DocumentKind,
    timeout_secs: u64,
) -> Result<ResolvedInput, Exam2JsonError> {
    if input.trim().is_empty() {
        return Err(Exam2JsonError::InvalidInput {
            input: input.to_string(),
        });
    }
    let resolved = if is_url(input) {
        download(input, timeout_secs).await?
    } else {
        ResolvedInput::Local(PathBuf::from(input))
    };
    check_pdf(resolved.path(), kind)?;
    debug!("Resolved {} PDF: {}", kind, resolved.path().display());
    Ok(resolved)
}

/// Verify the file exists, is readable and starts with `%PDF`.
fn check_pdf(path: &Path, kind: DocumentKind) -> Result<(), Exam2JsonError> {
    use std::io::Read;

    if !path.exists() {
        return Err(Exam2JsonError::FileNotFound {
            kind,
            path: path.to_path_buf(),
        });
    }

    let mut file = std::fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            Exam2JsonError::PermissionDenied {
                path: path.to_path_buf(),
            }
        } else {
            Exam2JsonError::FileNotFound {
                kind,
                path: path.to_path_buf(),
            }
        }
    })?;

    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) if &magic == b"%PDF" => Ok(()),
        _ => Err(Exam2JsonError::NotAPdf {
            kind,
            path: path.to_path_buf(),
            magic,
        }),
    }
}

async fn download(url: &str, timeout_secs: u64) -> Result<ResolvedInput, Exam2JsonError> {
    info!("Downloading PDF from: {}", url);

    let failed = |reason: String| Exam2JsonError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            Exam2JsonError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    let temp_dir = TempDir::new()
        .map_err(|e| Exam2JsonError::Internal(format!("Failed to create temp dir: {e}")))?;
    let path = temp_dir.path().join("download.pdf");
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| Exam2JsonError::Internal(format!("Failed to write download: {e}")))?;

    info!("Downloaded {} bytes to {}", bytes.len(), path.display());
    Ok(ResolvedInput::Downloaded {
        path,
        _temp_dir: temp_dir,
    })
}
