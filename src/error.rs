//! Error types for the edgequake-pdf2kb library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Pdf2KbError`]: **Fatal**: the pipeline cannot proceed at all
//!   (unreadable input, corrupt PDF, provider not configured, schema store
//!   I/O). Returned as `Err(Pdf2KbError)` from the top-level entry points.
//!
//! * [`UnitError`]: **Non-fatal**: a single page, media item or chapter
//!   failed (transient API error, implausible LLM output) while every other
//!   unit is fine. Unit errors are rendered into the owning stage's notes in
//!   the schema so consumers can judge completeness; they never abort the
//!   document.

use crate::pipeline::llm::LlmCallError;
use crate::pipeline::retry::Exhausted;
use crate::schema::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdf2kb library.
#[derive(Debug, Error)]
pub enum Pdf2KbError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}\nTry repairing with: qpdf --decrypt input.pdf output.pdf")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// The document opened but contains no pages.
    #[error("PDF '{path}' has no pages")]
    EmptyDocument { path: PathBuf },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDFium is normally downloaded automatically on first run.\n\
If the auto-download failed, you can:\n\
  • Check your internet connection and try again.\n\
  • Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Schema store errors ───────────────────────────────────────────────
    /// No schema exists for the document id.
    #[error("No schema stored for document '{document_id}'")]
    SchemaNotFound { document_id: String },

    /// The stored schema could not be decoded.
    #[error("Schema for document '{document_id}' is unreadable: {detail}")]
    SchemaCorrupt { document_id: String, detail: String },

    /// Reading or writing the schema store failed.
    #[error("Schema store I/O failed for '{path}': {source}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stage body failed in a way that is not attributable to one unit.
    #[error("Stage '{stage}' failed: {detail}")]
    StageFailed { stage: Stage, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Pdf2KbError {
    /// `true` for permanent input problems: retrying cannot help and the
    /// document is marked failed at the extraction stage.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Pdf2KbError::FileNotFound { .. }
                | Pdf2KbError::PermissionDenied { .. }
                | Pdf2KbError::InvalidInput { .. }
                | Pdf2KbError::DownloadFailed { .. }
                | Pdf2KbError::DownloadTimeout { .. }
                | Pdf2KbError::NotAPdf { .. }
                | Pdf2KbError::CorruptPdf { .. }
                | Pdf2KbError::PasswordRequired { .. }
                | Pdf2KbError::WrongPassword { .. }
                | Pdf2KbError::EmptyDocument { .. }
        )
    }

    pub(crate) fn store_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Pdf2KbError::StoreIo {
            path: path.into(),
            source,
        }
    }
}

/// A non-fatal error for a single unit of work.
///
/// Rendered with `Display` into the owning stage's notes. The stage itself
/// continues with every other unit.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum UnitError {
    /// Page extraction failed after retries.
    #[error("page {page}: extraction failed after {attempts} attempt(s): {detail}")]
    PageExtraction {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// LLM call failed after retries.
    #[error("{unit}: LLM call failed after {attempts} attempt(s): {detail}")]
    LlmFailed {
        unit: String,
        attempts: u32,
        detail: String,
    },

    /// LLM answered, but the answer failed validation even after the
    /// stricter retry.
    #[error("{unit}: LLM output rejected: {detail}")]
    Rejected { unit: String, detail: String },

    /// A media blob could not be read back from the store.
    #[error("{unit}: media blob unreadable: {detail}")]
    MediaUnreadable { unit: String, detail: String },
}

impl UnitError {
    /// An LLM call for `unit` that failed after its retries.
    pub fn llm(unit: impl Into<String>, exhausted: &Exhausted<LlmCallError>) -> Self {
        UnitError::LlmFailed {
            unit: unit.into(),
            attempts: exhausted.attempts,
            detail: exhausted.last.to_string(),
        }
    }
}
