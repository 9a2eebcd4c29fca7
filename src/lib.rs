//! # edgequake-pdf2kb
//!
//! Turn PDF documents into an LLM-enriched knowledge-base schema: cleaned
//! page text, a chapter outline, semantic chunks, image and table
//! descriptions, chapter summaries and hypothetical questions.
//!
//! ## Why this crate?
//!
//! Retrieval quality depends on chunk boundaries that follow the document's
//! meaning, not a fixed window. Getting there takes several model passes over
//! large documents, and those passes fail: providers time out, rate-limit,
//! and occasionally answer with garbage. This crate splits the work into
//! stages with declared dependencies, persists every stage result atomically,
//! and resumes exactly where a crashed run stopped. Stages that send the full
//! document share one byte-identical prompt prefix so provider-side prompt
//! caching pays for the document text once.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Extraction         per-page text, images, tables (CPU pool)
//!  ├─ 2. Repair             per-page OCR cleanup (LLM)        ┐ concurrent
//!  ├─ 3. Media description  per-image / per-table (vision)    ┘
//!  ├─ 4. Structure          chapter outline with verbatim anchors
//!  ├─ 5. Chunking           per-chapter semantic units + media placement
//!  └─ 6. Chapter questions  summaries + derived questions
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2kb::{run, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::builder().store_dir("kb_store").resume(true).build()?;
//!     let report = run("manual.pdf", &config).await?;
//!     println!("{} chunks", report.record.text_chunks.len());
//!     eprintln!("{:?}, {} LLM calls", report.outcome, report.stats.llm.calls);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `cli`     | on      | Enables the `pdf2kb` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `bundled` | off     | Embeds the pdfium library in the binary |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod schema;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{Pdf2KbError, UnitError};
pub use orchestrator::{run, run_sync, status};
pub use output::{exit_code_for_error, Outcome, PipelineReport, PipelineStats};
pub use pipeline::llm::{Completion, CompletionRequest, CompletionService, LlmCallError, LlmUsage};
pub use pipeline::parser::{ImageBlob, PageBlob, ParseError, PdfParser, TableBlob};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use schema::{
    Chunk, ChunkBody, DocumentRecord, Question, Stage, StageState, StageStatus,
};
pub use store::SchemaStore;
