//! Pipeline entry points and the stage scheduler.
//!
//! ## Scheduling
//!
//! Stages start as soon as their dependencies allow. The scheduler keeps the
//! running stages in a `FuturesUnordered`; whenever one of them settles it
//! reloads the record, asks it for the stages whose dependencies are now
//! satisfied ([`DocumentRecord::runnable_stages`]) and starts those that are
//! not already running. After extraction, repair and media description
//! overlap, and structure starts as soon as repair commits, while media
//! description may still be running. Each stage starts at most once per
//! invocation, so the loop ends when nothing is in flight.
//!
//! A stage is marked `running` before its body starts. A process that dies
//! mid-stage leaves that marker behind, and the next `--resume` run resets
//! the stage and starts it from scratch.

use crate::config::PipelineConfig;
use crate::error::Pdf2KbError;
use crate::output::{PipelineReport, PipelineStats};
use crate::pipeline::llm::LlmClient;
use crate::pipeline::parser::{PdfParser, PdfiumParser};
use crate::pipeline::{chunking, enrich, extract, input, media, repair, structure, StageContext};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::schema::{document_id_for, DocumentRecord, Stage, StageState};
use crate::store::SchemaStore;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Run every pending stage for a PDF file or URL.
///
/// This is the primary entry point for the library.
///
/// # Returns
/// `Ok(PipelineReport)` whenever the record could be driven to a terminal
/// state, including degraded outcomes (check `report.outcome`).
///
/// # Errors
/// Returns `Err(Pdf2KbError)` for fatal errors:
/// - the input cannot be read or is not a PDF
/// - the PDF cannot be opened (corrupt, encrypted); the record then shows
///   extraction as failed
/// - no LLM provider could be configured
/// - the schema store cannot be read or written
pub async fn run(
    input_str: impl AsRef<str>,
    config: &PipelineConfig,
) -> Result<PipelineReport, Pdf2KbError> {
    let total_start = Instant::now();
    let input_str = input_str.as_ref();
    info!("Starting pipeline: {}", input_str);

    // ── Step 1: Resolve input and identify the document ──────────────────
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let document_id = document_id_for(&resolved.read_bytes().await?);
    info!("Document id: {}", document_id);

    // ── Step 2: Load or create the record ────────────────────────────────
    let store = Arc::new(SchemaStore::open(&config.store_dir)?);
    let record = prepare_record(&store, &document_id, &resolved.source_name(), config).await?;
    store.save(&record).await?;

    let pending: Vec<Stage> = Stage::ALL
        .into_iter()
        .filter(|s| !record.status(*s).is_terminal())
        .collect();
    let progress: ProgressCallback = config
        .progress_callback
        .clone()
        .unwrap_or_else(|| Arc::new(NoopProgressCallback));
    progress.on_pipeline_start(&document_id, &pending);

    // ── Step 3: Build the stage context ──────────────────────────────────
    let llm = if pending.iter().any(|s| s.uses_llm()) {
        Some(Arc::new(LlmClient::from_config(config)?))
    } else {
        None
    };
    let parser: Arc<dyn PdfParser> = match &config.parser {
        Some(p) => Arc::clone(p),
        None => Arc::new(PdfiumParser::new(config.min_image_px)),
    };
    let ctx = StageContext {
        document_id: document_id.clone(),
        pdf_path: resolved.path().to_path_buf(),
        store: Arc::clone(&store),
        parser,
        llm: llm.clone(),
        config: config.clone(),
        progress: Arc::clone(&progress),
    };

    // ── Step 4: Run stages as their dependencies settle ──────────────────
    let mut stats = PipelineStats::default();
    let mut fatal = None;
    let mut started: HashSet<Stage> = HashSet::new();
    let mut in_flight = FuturesUnordered::new();
    loop {
        // After a fatal error nothing new starts; in-flight stages still settle.
        if fatal.is_none() {
            let snapshot = Arc::new(store.load(&document_id).await?);
            for stage in snapshot.runnable_stages() {
                if started.insert(stage) {
                    debug!("Scheduling stage {}", stage);
                    let ctx = &ctx;
                    let snapshot = Arc::clone(&snapshot);
                    in_flight.push(async move { run_stage(ctx, stage, &snapshot).await });
                }
            }
        }

        let Some(outcome) = in_flight.next().await else {
            break;
        };
        match outcome {
            Ok((stage, elapsed_ms)) => {
                stats.stages_run.push(stage);
                stats.stage_durations_ms.insert(stage, elapsed_ms);
            }
            Err(e) => {
                fatal.get_or_insert(e);
            }
        }
    }

    // ── Step 5: Report ───────────────────────────────────────────────────
    let final_record = store.load(&document_id).await?;
    progress.on_pipeline_complete(final_record.is_complete(), final_record.is_degraded());
    if let Some(e) = fatal {
        return Err(e);
    }

    stats.llm = llm.map(|l| l.usage()).unwrap_or_default();
    stats.total_duration_ms = total_start.elapsed().as_millis() as u64;
    let report = PipelineReport::new(final_record, store.schema_path(&document_id), stats);
    info!(
        "Pipeline finished: {:?}, {}% complete, {} LLM call(s), {}ms",
        report.outcome,
        report.record.completion_percentage,
        report.stats.llm.calls,
        report.stats.total_duration_ms
    );
    if !report.blocked.is_empty() {
        warn!(
            "Blocked stages: {}",
            report.blocked.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        );
    }
    Ok(report)
}

/// Synchronous wrapper around [`run`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_sync(
    input_str: impl AsRef<str>,
    config: &PipelineConfig,
) -> Result<PipelineReport, Pdf2KbError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Pdf2KbError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(run(input_str, config))
}

/// Load the stored record for a PDF without running anything.
///
/// Does not require an LLM provider or API key.
pub async fn status(
    input_str: impl AsRef<str>,
    config: &PipelineConfig,
) -> Result<DocumentRecord, Pdf2KbError> {
    let resolved = input::resolve_input(input_str.as_ref(), config.download_timeout_secs).await?;
    let document_id = document_id_for(&resolved.read_bytes().await?);
    SchemaStore::open(&config.store_dir)?.load(&document_id).await
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Continue the stored record (resume or rerun) or start a fresh one.
async fn prepare_record(
    store: &SchemaStore,
    document_id: &str,
    source_name: &str,
    config: &PipelineConfig,
) -> Result<DocumentRecord, Pdf2KbError> {
    let continue_stored = config.resume || config.rerun_from.is_some();
    let mut record = if continue_stored && store.exists(document_id) {
        let mut record = store.load(document_id).await?;
        let again = record.prepare_resume();
        info!(
            "Resuming at {}%{}",
            record.completion_percentage,
            if again.is_empty() {
                String::new()
            } else {
                format!(
                    "; rescheduled: {}",
                    again.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                )
            }
        );
        record
    } else {
        if store.exists(document_id) {
            info!("Discarding stored record for {}", document_id);
            store.delete(document_id).await?;
        }
        DocumentRecord::new(document_id, source_name)
    };

    if let Some(stage) = config.rerun_from {
        let reset = record.reset_from(stage);
        info!(
            "Re-running from {}: {}",
            stage,
            reset.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        );
    }
    Ok(record)
}

/// Run one stage body and make sure its outcome is recorded.
///
/// Returns `Err` only when the whole run must stop: an input error (after
/// recording the stage as failed) or a store failure.
async fn run_stage(
    ctx: &StageContext,
    stage: Stage,
    snapshot: &DocumentRecord,
) -> Result<(Stage, u64), Pdf2KbError> {
    let start = Instant::now();
    ctx.store
        .set_state(&ctx.document_id, stage, StageState::running())
        .await?;
    info!("Stage {} started", stage);

    let result = match stage {
        Stage::Extraction => extract::run(ctx).await,
        Stage::Repair => repair::run(ctx, snapshot).await,
        Stage::MediaDescription => media::run(ctx, snapshot).await,
        Stage::Structure => structure::run(ctx, snapshot).await,
        Stage::Chunking => chunking::run(ctx, snapshot).await,
        Stage::ChapterQuestions => enrich::run(ctx, snapshot).await,
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(state) => {
            info!(
                "Stage {} {}{} in {}ms",
                stage,
                state.status,
                if state.degraded { " (degraded)" } else { "" },
                elapsed_ms
            );
            ctx.progress.on_stage_complete(stage, &state);
            Ok((stage, elapsed_ms))
        }
        Err(e) => {
            warn!("Stage {} failed: {}", stage, e);
            let state = StageState::failed(e.to_string());
            ctx.store
                .set_state(&ctx.document_id, stage, state.clone())
                .await?;
            ctx.progress.on_stage_complete(stage, &state);
            if e.is_input_error() || matches!(e, Pdf2KbError::StoreIo { .. }) {
                Err(e)
            } else {
                Ok((stage, elapsed_ms))
            }
        }
    }
}
