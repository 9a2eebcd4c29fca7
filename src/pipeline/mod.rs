//! Pipeline stages.
//!
//! Each stage module exposes one `run` function that reads a snapshot of the
//! [`DocumentRecord`], does its work, and commits the fields it owns through
//! [`SchemaStore::commit`] in a single atomic write. Stages never share
//! in-memory state; everything flows through the store.
//!
//! ## Data Flow
//!
//! ```text
//!                 ┌─▶ repair ──▶ structure ──▶ chunking ──▶ enrich
//! input ─▶ extract┤                               ▲
//!                 └─▶ media ──────────────────────┘
//! ```
//!
//! Support modules:
//!
//! * [`input`]: canonicalise the user-supplied path or URL to a local file
//! * [`parser`]: the parsing-library boundary and its pdfium implementation
//! * [`encode`]: PNG encoding and base64 `ImageData` for vision calls
//! * [`llm`]: the completion boundary, concurrency gate, usage meter
//! * [`retry`]: the single backoff policy every external call uses
//! * [`postprocess`]: deterministic cleanup of LLM answers
//! * [`fallback`]: deterministic paragraph/list splitter

pub mod chunking;
pub mod encode;
pub mod enrich;
pub mod extract;
pub mod fallback;
pub mod input;
pub mod llm;
pub mod media;
pub mod parser;
pub mod postprocess;
pub mod repair;
pub mod retry;
pub mod structure;

use crate::config::PipelineConfig;
use crate::error::Pdf2KbError;
use crate::progress::ProgressCallback;
use crate::prompts;
use crate::schema::{prefix_digest, DocumentRecord, FullText, Stage};
use crate::store::SchemaStore;
use llm::LlmClient;
use parser::PdfParser;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a stage body needs, shared by all stages of one run.
pub struct StageContext {
    pub document_id: String,
    pub pdf_path: PathBuf,
    pub store: Arc<SchemaStore>,
    pub parser: Arc<dyn PdfParser>,
    /// `None` when no LLM stage was pending at start-up.
    pub llm: Option<Arc<LlmClient>>,
    pub config: PipelineConfig,
    pub progress: ProgressCallback,
}

impl StageContext {
    pub fn llm(&self) -> Result<&LlmClient, Pdf2KbError> {
        self.llm
            .as_deref()
            .ok_or_else(|| Pdf2KbError::Internal("LLM client not initialised".into()))
    }
}

/// Rebuild the shared prompt prefix from a snapshot and check it against the
/// digest the structure stage stored.
pub(crate) fn shared_prefix(
    snapshot: &DocumentRecord,
    stage: Stage,
) -> Result<(FullText, String), Pdf2KbError> {
    let full = snapshot.full_text();
    let prefix = prompts::document_prefix(&full.text);
    let digest = prefix_digest(&prefix);
    match snapshot.prefix_digest.as_deref() {
        Some(stored) if stored == digest => Ok((full, prefix)),
        Some(_) => Err(Pdf2KbError::StageFailed {
            stage,
            detail: "shared prompt prefix differs from the one the outline was built on; \
                     rerun from the structure stage"
                .into(),
        }),
        None => Err(Pdf2KbError::StageFailed {
            stage,
            detail: "no prompt-prefix digest stored by the structure stage".into(),
        }),
    }
}
