//! CLI binary for edgequake-pdf2kb.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, renders stage progress and maps the outcome to an exit
//! code: 0 complete, 2 degraded, 3 input error, 1 anything else.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2kb::{
    exit_code_for_error, run, status, DocumentRecord, Outcome, Pdf2KbError, PipelineConfig,
    PipelineProgressCallback, PipelineReport, ProgressCallback, Stage, StageState, StageStatus,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One live bar per running stage. Stages overlap (repair and media
/// description run side by side), so bars live in a [`MultiProgress`].
struct CliProgressCallback {
    multi: MultiProgress,
    bars: Mutex<HashMap<Stage, ProgressBar>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        })
    }

    fn println(&self, line: String) {
        if self.multi.println(&line).is_err() {
            eprintln!("{line}");
        }
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_pipeline_start(&self, document_id: &str, pending: &[Stage]) {
        let msg = if pending.is_empty() {
            format!("Document {document_id}: nothing left to run")
        } else {
            format!(
                "Document {document_id}: {} stage(s) to run",
                pending.len()
            )
        };
        self.println(format!("{} {}", cyan("◆"), bold(&msg)));
    }

    fn on_stage_start(&self, stage: Stage, units: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold:<18} [{bar:36.green/238}] {pos:>4}/{len:<4} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        let bar = self.multi.add(ProgressBar::new(units as u64));
        bar.set_style(style);
        bar.set_prefix(stage.as_str().to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        self.bars.lock().unwrap().insert(stage, bar);
    }

    fn on_unit_complete(&self, stage: Stage, unit: &str) {
        if let Some(bar) = self.bars.lock().unwrap().get(&stage) {
            bar.set_message(unit.to_string());
            bar.inc(1);
        }
    }

    fn on_unit_error(&self, stage: Stage, unit: &str, error: &str) {
        // Truncate very long error messages to keep output tidy.
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.println(format!(
            "  {} {:<18} {:<14} {}",
            yellow("⚠"),
            stage.as_str(),
            unit,
            dim(&msg)
        ));
        if let Some(bar) = self.bars.lock().unwrap().get(&stage) {
            bar.inc(1);
        }
    }

    fn on_stage_complete(&self, stage: Stage, state: &StageState) {
        if let Some(bar) = self.bars.lock().unwrap().remove(&stage) {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
        let (mark, label) = match state.status {
            StageStatus::Done if state.degraded => (yellow("⚠"), "done, degraded".to_string()),
            StageStatus::Done => (green("✓"), "done".to_string()),
            StageStatus::Skipped => (
                dim("–"),
                format!("skipped ({})", state.reason.as_deref().unwrap_or("")),
            ),
            StageStatus::Failed => (
                red("✗"),
                format!("failed: {}", state.reason.as_deref().unwrap_or("")),
            ),
            other => (dim("·"), other.to_string()),
        };
        self.println(format!("  {} {:<18} {}", mark, stage.as_str(), label));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Build the knowledge-base schema (stored under ./kb_store/<id>/schema.json)
  pdf2kb manual.pdf

  # Continue an interrupted run; finished stages are not repeated
  pdf2kb --resume manual.pdf

  # Redo chunking and everything after it
  pdf2kb --rerun chunking manual.pdf

  # Show stage status of the stored record (no API key needed)
  pdf2kb --status manual.pdf

  # Separate vision model, shared request budget
  pdf2kb --model gpt-4.1-mini --vision-model gpt-4.1 --rpm 300 manual.pdf

  # From URL, JSON report on stdout
  pdf2kb --json https://arxiv.org/pdf/1706.03762

STAGES:
  extraction          page text, images, tables
  repair              after extraction
  media_description   after extraction
  structure           after repair
  chunking            after structure; waits for media_description to settle
  chapter_questions   after chunking

EXIT CODES:
  0  every stage completed
  2  finished degraded (a stage failed, fell back, or is blocked)
  3  input error (missing file, not a PDF, corrupt or encrypted PDF)
  1  any other error

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium (skips auto-download)
  PDFIUM_AUTO_CACHE_DIR   Override the default pdfium cache directory
"#;

/// Turn PDF files and URLs into an LLM-enriched knowledge-base schema.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2kb",
    version,
    about = "Turn PDF files and URLs into a resumable, LLM-enriched knowledge-base schema",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Root directory of the schema store.
    #[arg(long, env = "PDF2KB_STORE_DIR", default_value = "kb_store")]
    store_dir: PathBuf,

    /// Continue the stored record for this document instead of starting over.
    #[arg(long, env = "PDF2KB_RESUME")]
    resume: bool,

    /// Reset this stage and all stages after it, keep the rest.
    #[arg(long, value_name = "STAGE", value_parser = parse_stage)]
    rerun: Option<Stage>,

    /// Print the stage status of the stored record and exit.
    #[arg(long)]
    status: bool,

    /// Text model ID (e.g. gpt-4.1-nano, gpt-4.1-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Vision model ID for image description. Defaults to the text model.
    #[arg(long, env = "PDF2KB_VISION_MODEL")]
    vision_model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Concurrent LLM calls across all stages.
    #[arg(short, long, env = "PDF2KB_CONCURRENCY", default_value_t = 8)]
    concurrency: usize,

    /// Concurrent chapter requests during chunking.
    #[arg(long, env = "PDF2KB_CHUNKING_CONCURRENCY", default_value_t = 3)]
    chunking_concurrency: usize,

    /// Shared LLM request budget per minute.
    #[arg(long, env = "PDF2KB_RPM")]
    rpm: Option<u32>,

    /// Extraction worker threads. Default: available cores minus one.
    #[arg(long, env = "PDF2KB_WORKERS")]
    workers: Option<usize>,

    /// Max LLM output tokens per call.
    #[arg(long, env = "PDF2KB_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDF2KB_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per LLM call on transient failure.
    #[arg(long, env = "PDF2KB_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "PDF2KB_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF2KB_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Skip chapter summaries and derived questions.
    #[arg(long, env = "PDF2KB_NO_ENRICH")]
    no_enrich: bool,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2KB_PASSWORD")]
    password: Option<String>,

    /// Print the run report and the final record as JSON on stdout.
    #[arg(long, env = "PDF2KB_JSON")]
    json: bool,

    /// Disable progress bars.
    #[arg(long, env = "PDF2KB_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2KB_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2KB_QUIET")]
    quiet: bool,
}

fn parse_stage(s: &str) -> std::result::Result<Stage, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run_cli(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", red("✘"), e);
            let code = e
                .downcast_ref::<Pdf2KbError>()
                .map(exit_code_for_error)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

async fn run_cli(cli: Cli) -> Result<u8> {
    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bars are active;
    // the bars provide all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.status;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Status mode (no PDF engine, no provider) ─────────────────────────
    if cli.status {
        let config = PipelineConfig::builder()
            .store_dir(&cli.store_dir)
            .download_timeout_secs(cli.download_timeout)
            .build()
            .context("Invalid configuration")?;
        let record = status(&cli.input, &config)
            .await
            .context("Failed to load stored record")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&record).context("Failed to serialise record")?
            );
        } else {
            print_status(&record);
        }
        return Ok(0);
    }

    ensure_pdf_engine(cli.quiet)?;

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Run pipeline ─────────────────────────────────────────────────────
    let report = run(&cli.input, &config).await.context("Pipeline failed")?;

    if cli.json {
        let out = serde_json::json!({ "report": &report, "record": &report.record });
        println!(
            "{}",
            serde_json::to_string_pretty(&out).context("Failed to serialise report")?
        );
    } else if !cli.quiet {
        print_summary(&report);
    }
    Ok(report.exit_code() as u8)
}

/// Make sure the pdfium shared library is available before any stage needs it.
fn ensure_pdf_engine(quiet: bool) -> Result<()> {
    // When compiled with `--features bundled`, the pdfium shared library was
    // embedded at compile time. We just extract it (if needed) and continue.
    #[cfg(feature = "bundled")]
    {
        let _ = quiet;
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_bundled())
            .context("Failed to extract bundled PDFium engine")?;
    }

    #[cfg(not(feature = "bundled"))]
    if !pdfium_auto::is_pdfium_cached() {
        if !quiet {
            let dl_bar = ProgressBar::new(0);
            dl_bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.cyan} {prefix:.bold}  \
                     [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  ")
                .tick_strings(TICKS),
            );
            dl_bar.set_prefix("PDF engine");
            dl_bar.set_message("Connecting…");
            dl_bar.enable_steady_tick(Duration::from_millis(80));

            let bar = dl_bar.clone();
            tokio::task::block_in_place(|| {
                pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
                    if let Some(t) = total {
                        if bar.length().unwrap_or(0) != t {
                            bar.set_length(t);
                        }
                    }
                    bar.set_position(downloaded);
                }))
            })
            .context("Failed to download PDFium engine")?;

            dl_bar.finish_with_message("ready ✓");
        } else {
            tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
                .context("Failed to download PDFium engine")?;
        }
    }
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .store_dir(&cli.store_dir)
        .resume(cli.resume)
        .llm_concurrency(cli.concurrency)
        .chunking_concurrency(cli.chunking_concurrency)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .download_timeout_secs(cli.download_timeout)
        .enrich(!cli.no_enrich);

    if let Some(stage) = cli.rerun {
        builder = builder.rerun_from(stage);
    }
    if let Some(rpm) = cli.rpm {
        builder = builder.requests_per_minute(rpm);
    }
    if let Some(n) = cli.workers {
        builder = builder.extraction_workers(n);
    }
    if let Some(ref m) = cli.model {
        builder = builder.model(m);
    }
    if let Some(ref m) = cli.vision_model {
        builder = builder.vision_model(m);
    }
    if let Some(ref p) = cli.provider {
        builder = builder.provider_name(p);
    }
    if let Some(ref p) = cli.password {
        builder = builder.password(p);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(report: &PipelineReport) {
    let r = &report.record;
    let mark = match report.outcome {
        Outcome::Complete => green("✔"),
        Outcome::Degraded => yellow("⚠"),
    };
    eprintln!(
        "{}  {} pages  {} chapters  {} text / {} image / {} table chunks  {} questions",
        mark,
        r.pages.len(),
        r.chapters.len(),
        r.text_chunks.len(),
        r.image_chunks.len(),
        r.table_chunks.len(),
        r.derived_questions.len(),
    );
    eprintln!("   {}", bold(&report.schema_path.display().to_string()));
    if !report.blocked.is_empty() {
        eprintln!(
            "   {} {}",
            red("blocked:"),
            report
                .blocked
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    let llm = &report.stats.llm;
    eprintln!(
        "   {} calls ({} retries)  {} tokens in  /  {} tokens out  —  {}ms total",
        llm.calls,
        llm.retries,
        dim(&llm.input_tokens.to_string()),
        dim(&llm.output_tokens.to_string()),
        report.stats.total_duration_ms,
    );
}

fn print_status(record: &DocumentRecord) {
    println!("Document:     {}", record.document_id);
    println!("Source:       {}", record.source_name);
    println!("Pages:        {}", record.page_count);
    println!("Completion:   {}%", record.completion_percentage);
    let blocked = record.blocked_stages();
    for stage in Stage::ALL {
        let state = record.state(stage);
        let mut line = format!("  {:<18} {}", stage.as_str(), state.status);
        if state.degraded {
            line.push_str(" (degraded)");
        }
        if blocked.contains(&stage) {
            line.push_str(" (blocked)");
        }
        if let Some(ref reason) = state.reason {
            line.push_str(&format!(": {reason}"));
        }
        println!("{line}");
        for note in &state.notes {
            println!("      {}", dim(note));
        }
    }
}
