//! Input resolution: normalise a user-supplied path or URL to a local PDF.
//!
//! pdfium opens files by path, so URL inputs are downloaded into a
//! [`TempDir`] that lives as long as the [`ResolvedInput`]. The `%PDF` magic
//! is checked before anything else touches the file, which turns "wrong file"
//! into a clean input error instead of a parser failure deep inside a stage.

use crate::error::Pdf2KbError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// The resolved input: either a local path or a downloaded temp file.
pub enum ResolvedInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was a URL; the PDF was downloaded to a temp directory that is
    /// removed when this value drops.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    /// Path to the PDF file regardless of how it was resolved.
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }

    /// File name recorded as the document's `source_name`.
    pub fn source_name(&self) -> String {
        self.path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string())
    }

    /// Read the whole file, e.g. to derive the content-addressed id.
    pub async fn read_bytes(&self) -> Result<Vec<u8>, Pdf2KbError> {
        let path = self.path();
        tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => Pdf2KbError::PermissionDenied {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::NotFound => Pdf2KbError::FileNotFound {
                path: path.to_path_buf(),
            },
            _ => Pdf2KbError::Internal(format!("read {}: {e}", path.display())),
        })
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to a local PDF file path.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, Pdf2KbError> {
    if input.trim().is_empty() {
        return Err(Pdf2KbError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input)
    }
}

/// Validate existence, readability and PDF magic bytes of a local file.
fn resolve_local(path_str: &str) -> Result<ResolvedInput, Pdf2KbError> {
    let path = PathBuf::from(path_str);

    if !path.is_file() {
        return Err(Pdf2KbError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            use std::io::Read;
            let mut magic = [0u8; 4];
            match f.read_exact(&mut magic) {
                Ok(()) if &magic == b"%PDF" => {}
                Ok(()) => return Err(Pdf2KbError::NotAPdf { path, magic }),
                Err(_) => {
                    return Err(Pdf2KbError::CorruptPdf {
                        path,
                        detail: "file is shorter than a PDF header".into(),
                    })
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(Pdf2KbError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(Pdf2KbError::FileNotFound { path });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

/// Download a URL to a temporary directory and return the path.
async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, Pdf2KbError> {
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Pdf2KbError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            Pdf2KbError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            Pdf2KbError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(Pdf2KbError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let filename = filename_from_url(url);
    let temp_dir = TempDir::new().map_err(|e| Pdf2KbError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| Pdf2KbError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    if bytes.len() < 4 {
        return Err(Pdf2KbError::CorruptPdf {
            path: file_path,
            detail: format!("download is only {} bytes", bytes.len()),
        });
    }
    if &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        return Err(Pdf2KbError::NotAPdf {
            path: file_path,
            magic,
        });
    }

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| Pdf2KbError::Internal(format!("Failed to write temp file: {}", e)))?;

    info!("Downloaded to: {}", file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL if it looks like a file name.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded.pdf".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_comes_from_last_segment() {
        assert_eq!(filename_from_url("https://x.org/a/b/manual.pdf"), "manual.pdf");
        assert_eq!(filename_from_url("https://x.org/download"), "downloaded.pdf");
    }

    #[tokio::test]
    async fn local_pdf_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("ok.pdf");
        std::fs::write(&p, b"%PDF-1.7\n...").unwrap();
        let r = resolve_input(p.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(r.source_name(), "ok.pdf");
        assert_eq!(r.read_bytes().await.unwrap(), b"%PDF-1.7\n...");
    }

    #[tokio::test]
    async fn non_pdf_is_rejected_with_magic() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("notes.txt");
        std::fs::write(&p, b"hello world").unwrap();
        match resolve_input(p.to_str().unwrap(), 5).await {
            Err(Pdf2KbError::NotAPdf { magic, .. }) => assert_eq!(&magic, b"hell"),
            other => panic!("expected NotAPdf, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn missing_and_empty_inputs() {
        let err = resolve_input("/definitely/not/here.pdf", 5).await.err().unwrap();
        assert!(matches!(err, Pdf2KbError::FileNotFound { .. }));
        let err = resolve_input("  ", 5).await.err().unwrap();
        assert!(matches!(err, Pdf2KbError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn truncated_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("tiny.pdf");
        std::fs::write(&p, b"%P").unwrap();
        let err = resolve_input(p.to_str().unwrap(), 5).await.err().unwrap();
        assert!(matches!(err, Pdf2KbError::CorruptPdf { .. }));
    }
}
