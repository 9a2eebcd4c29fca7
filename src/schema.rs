//! The document record ("final schema") and its stage state machine.
//!
//! One [`DocumentRecord`] exists per source PDF. Every pipeline stage owns a
//! fixed set of fields (see [`Stage`]) and only ever replaces those fields
//! wholesale, so a stage can be re-run from scratch after a crash without
//! leaving stale data behind.
//!
//! The record deliberately carries no timestamps, durations or token counts:
//! two runs over the same input with the same deterministic stage logic
//! serialise to byte-identical JSON, whether or not one of them was resumed.
//! Run statistics live in [`crate::output::PipelineStats`] instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Version of the on-disk schema layout.
pub const SCHEMA_VERSION: u32 = 1;

// ── Stages ───────────────────────────────────────────────────────────────

/// A unit of pipeline work with declared inputs, outputs and dependencies.
///
/// Variant order is the topological order of the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Per-page text and media extraction. Owns `page_count`, `pages`,
    /// `page_failures`.
    Extraction,
    /// Per-page OCR/formatting repair. Owns `pages[*].cleaned_text`.
    Repair,
    /// Per-item image/table description. Owns `image_chunks`, `table_chunks`.
    MediaDescription,
    /// Outline detection. Owns `chapters`, `prefix_digest`.
    Structure,
    /// Per-chapter semantic chunking. Owns `text_chunks` and the chapter
    /// placement of media chunks.
    Chunking,
    /// Chapter summaries and derived questions. Owns `chapters[*].summary`,
    /// `derived_questions`.
    ChapterQuestions,
}

impl Stage {
    /// Every stage, in topological order.
    pub const ALL: [Stage; 6] = [
        Stage::Extraction,
        Stage::Repair,
        Stage::MediaDescription,
        Stage::Structure,
        Stage::Chunking,
        Stage::ChapterQuestions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Repair => "repair",
            Stage::MediaDescription => "media_description",
            Stage::Structure => "structure",
            Stage::Chunking => "chunking",
            Stage::ChapterQuestions => "chapter_questions",
        }
    }

    /// Stages that must be `done` before this one may start.
    pub fn requires(self) -> &'static [Stage] {
        match self {
            Stage::Extraction => &[],
            Stage::Repair | Stage::MediaDescription => &[Stage::Extraction],
            Stage::Structure => &[Stage::Repair],
            Stage::Chunking => &[Stage::Structure],
            Stage::ChapterQuestions => &[Stage::Chunking],
        }
    }

    /// Stages that must be terminal (in any outcome) before this one may
    /// start. Chunking places media chunks into chapters, so it waits for
    /// media description to settle, but a media failure does not block it.
    pub fn waits_for(self) -> &'static [Stage] {
        match self {
            Stage::Chunking => &[Stage::MediaDescription],
            _ => &[],
        }
    }

    /// `true` if this stage calls the LLM service.
    pub fn uses_llm(self) -> bool {
        !matches!(self, Stage::Extraction)
    }

    /// This stage plus every stage that transitively requires or waits for it,
    /// in topological order.
    pub fn with_dependents(self) -> Vec<Stage> {
        let mut out = vec![self];
        for stage in Stage::ALL {
            if out.contains(&stage) {
                continue;
            }
            let depends = stage
                .requires()
                .iter()
                .chain(stage.waits_for())
                .any(|d| out.contains(d));
            if depends {
                out.push(stage);
            }
        }
        out.sort();
        out
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalised.as_str() {
            "extraction" | "extract" => Ok(Stage::Extraction),
            "repair" => Ok(Stage::Repair),
            "media_description" | "media" => Ok(Stage::MediaDescription),
            "structure" => Ok(Stage::Structure),
            "chunking" | "chunk" => Ok(Stage::Chunking),
            "chapter_questions" | "questions" | "enrich" => Ok(Stage::ChapterQuestions),
            other => Err(format!(
                "unknown stage '{other}' (expected one of: {})",
                Stage::ALL.map(Stage::as_str).join(", ")
            )),
        }
    }
}

/// Lifecycle of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    /// Set when the stage starts. A record found with a `running` stage was
    /// interrupted; the stage is rescheduled from scratch.
    Running,
    Done,
    Failed,
    /// Nothing to do (e.g. a document without images skips media description).
    Skipped,
}

impl StageStatus {
    /// `done`, `failed` and `skipped` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, StageStatus::Done | StageStatus::Failed | StageStatus::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Done => "done",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        })
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Status of one stage plus its human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,

    /// The stage completed but some of its units fell back to a degraded
    /// path (raw-text passthrough, deterministic splitter, caption-only media).
    #[serde(default, skip_serializing_if = "is_false")]
    pub degraded: bool,

    /// Why the stage failed or was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Per-unit failures, discarded anchors and fallbacks, in unit order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl StageState {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn running() -> Self {
        Self {
            status: StageStatus::Running,
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            status: StageStatus::Done,
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skipped,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_notes(mut self, notes: Vec<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn degraded_if(mut self, degraded: bool) -> Self {
        self.degraded = degraded;
        self
    }
}

// ── Records ──────────────────────────────────────────────────────────────

/// Reference from a page to a media blob persisted next to the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Stable id, e.g. `p0003-img0` or `p0003-tbl1`.
    pub media_id: String,
    pub kind: MediaKind,
    /// Path relative to the document's store directory.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Page-local text surrounding the blob, used as description context.
    pub context_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Table,
}

impl MediaKind {
    pub fn id_tag(self) -> &'static str {
        match self {
            MediaKind::Image => "img",
            MediaKind::Table => "tbl",
        }
    }
}

/// One source page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    /// 1-based.
    pub page_number: usize,
    pub raw_text: String,
    /// `None` until the repair stage has run.
    pub cleaned_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<MediaRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<MediaRef>,
}

impl PageRecord {
    /// Repaired text if available, else the raw extraction.
    pub fn best_text(&self) -> &str {
        self.cleaned_text.as_deref().unwrap_or(&self.raw_text)
    }

    pub fn media(&self) -> impl Iterator<Item = &MediaRef> {
        self.images.iter().chain(self.tables.iter())
    }
}

/// A page that could not be extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFailure {
    pub page_number: usize,
    pub reason: String,
}

/// One entry of the document outline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRecord {
    /// Hierarchical id, e.g. `2.1`. The front-matter chapter is `0`.
    pub chapter_id: String,
    pub title: String,
    pub level: u8,
    /// Verbatim substring of the full text found at `start_offset`.
    pub anchor_text: String,
    /// Byte offset into the full text.
    pub start_offset: usize,
    /// Exclusive byte offset into the full text.
    pub end_offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Where a text chunk's boundaries came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOrigin {
    Llm,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDetail {
    pub origin: ChunkOrigin,
    /// Media chunks the chunker attached to this text unit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDetail {
    pub media_id: String,
    pub page_number: usize,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Short search summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Detailed description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Engineering detail for technical content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engineering_note: Option<String>,
    /// `false` when `content` is the caption fallback.
    pub described: bool,
    /// Text chunk this media item was merged with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<String>,
}

/// Variant-specific chunk fields, discriminated by `chunk_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "chunk_type", rename_all = "snake_case")]
pub enum ChunkBody {
    Paragraph(TextDetail),
    ListItem(TextDetail),
    ImageDesc(MediaDetail),
    TableDesc(MediaDetail),
}

impl ChunkBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChunkBody::Paragraph(_) => "paragraph",
            ChunkBody::ListItem(_) => "list_item",
            ChunkBody::ImageDesc(_) => "image_desc",
            ChunkBody::TableDesc(_) => "table_desc",
        }
    }

    pub fn text_detail(&self) -> Option<&TextDetail> {
        match self {
            ChunkBody::Paragraph(d) | ChunkBody::ListItem(d) => Some(d),
            _ => None,
        }
    }

    pub fn text_detail_mut(&mut self) -> Option<&mut TextDetail> {
        match self {
            ChunkBody::Paragraph(d) | ChunkBody::ListItem(d) => Some(d),
            _ => None,
        }
    }

    pub fn media_detail(&self) -> Option<&MediaDetail> {
        match self {
            ChunkBody::ImageDesc(d) | ChunkBody::TableDesc(d) => Some(d),
            _ => None,
        }
    }

    pub fn media_detail_mut(&mut self) -> Option<&mut MediaDetail> {
        match self {
            ChunkBody::ImageDesc(d) | ChunkBody::TableDesc(d) => Some(d),
            _ => None,
        }
    }
}

/// The minimal retrievable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique within the document. Never reused for different content.
    pub chunk_id: String,
    pub content: String,
    #[serde(flatten)]
    pub body: ChunkBody,
    /// `None` only for media chunks before chunking has placed them.
    pub belongs_to_chapter: Option<String>,
    /// Dense, zero-based position within the chapter, counted separately
    /// for each collection: the first text, image and table chunk of a
    /// chapter all have index 0. Media chunks relate to the text through
    /// `attached_to`. `None` until placed.
    pub sequence_index: Option<usize>,
}

/// A hypothetical question that widens retrieval recall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub question_id: String,
    pub text: String,
    pub chapter_id: String,
    /// Set for chunk-level questions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
}

/// The full text the structure and chunking stages operate on, with the
/// byte offset at which each contributing page starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullText {
    pub text: String,
    /// `(page_number, start_offset)` in page order.
    pub page_starts: Vec<(usize, usize)>,
}

impl FullText {
    /// Separator between consecutive non-empty pages.
    pub const PAGE_JOIN: &'static str = "\n\n";

    /// Offset at which `page_number` starts, or the start of the next page
    /// that contributed text.
    pub fn page_offset(&self, page_number: usize) -> usize {
        self.page_starts
            .iter()
            .find(|(p, _)| *p >= page_number)
            .map(|(_, off)| *off)
            .unwrap_or(self.text.len())
    }
}

/// The root aggregate for one source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub schema_version: u32,
    pub document_id: String,
    pub source_name: String,
    pub page_count: usize,
    pub stage_status: BTreeMap<Stage, StageState>,
    /// Derived from `stage_status`; not authoritative.
    pub completion_percentage: u8,
    pub pages: Vec<PageRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub page_failures: Vec<PageFailure>,
    /// BLAKE3 of the shared prompt prefix used by the structure stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_digest: Option<String>,
    pub chapters: Vec<ChapterRecord>,
    pub text_chunks: Vec<Chunk>,
    pub image_chunks: Vec<Chunk>,
    pub table_chunks: Vec<Chunk>,
    pub derived_questions: Vec<Question>,
}

impl DocumentRecord {
    /// An empty record with every stage pending.
    pub fn new(document_id: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            document_id: document_id.into(),
            source_name: source_name.into(),
            page_count: 0,
            stage_status: Stage::ALL
                .iter()
                .map(|s| (*s, StageState::pending()))
                .collect(),
            completion_percentage: 0,
            pages: Vec::new(),
            page_failures: Vec::new(),
            prefix_digest: None,
            chapters: Vec::new(),
            text_chunks: Vec::new(),
            image_chunks: Vec::new(),
            table_chunks: Vec::new(),
            derived_questions: Vec::new(),
        }
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.state(stage).status
    }

    pub fn state(&self, stage: Stage) -> &StageState {
        static PENDING: StageState = StageState {
            status: StageStatus::Pending,
            degraded: false,
            reason: None,
            notes: Vec::new(),
        };
        self.stage_status.get(&stage).unwrap_or(&PENDING)
    }

    pub fn set_state(&mut self, stage: Stage, state: StageState) {
        self.stage_status.insert(stage, state);
        self.refresh_completion();
    }

    /// Stages that may start now: not yet terminal, every required stage
    /// `done`, every awaited stage terminal.
    pub fn runnable_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| !self.status(*s).is_terminal())
            .filter(|s| s.requires().iter().all(|d| self.status(*d) == StageStatus::Done))
            .filter(|s| s.waits_for().iter().all(|d| self.status(*d).is_terminal()))
            .collect()
    }

    /// Pending stages that can never start because a dependency failed or
    /// was skipped.
    pub fn blocked_stages(&self) -> Vec<Stage> {
        let mut blocked: Vec<Stage> = Vec::new();
        for stage in Stage::ALL {
            if self.status(stage).is_terminal() {
                continue;
            }
            let hard = stage.requires().iter().any(|d| {
                matches!(self.status(*d), StageStatus::Failed | StageStatus::Skipped)
                    || blocked.contains(d)
            });
            let soft = stage.waits_for().iter().any(|d| blocked.contains(d));
            if hard || soft {
                blocked.push(stage);
            }
        }
        blocked
    }

    /// Every stage `done` or `skipped`.
    pub fn is_complete(&self) -> bool {
        Stage::ALL
            .iter()
            .all(|s| matches!(self.status(*s), StageStatus::Done | StageStatus::Skipped))
    }

    /// Terminal but not fully successful: a stage failed, fell back, or is
    /// blocked behind a failure.
    pub fn is_degraded(&self) -> bool {
        self.stage_status
            .values()
            .any(|st| st.status == StageStatus::Failed || st.degraded)
            || !self.blocked_stages().is_empty()
    }

    /// Recompute `completion_percentage` from the stage map.
    pub fn refresh_completion(&mut self) {
        let settled = Stage::ALL
            .iter()
            .filter(|s| self.status(**s).is_terminal())
            .count();
        self.completion_percentage = (settled * 100 / Stage::ALL.len()) as u8;
    }

    /// Concatenate the best available text of every page in page order.
    /// Pages are trimmed and empty pages contribute nothing.
    pub fn full_text(&self) -> FullText {
        let mut text = String::new();
        let mut page_starts = Vec::with_capacity(self.pages.len());
        for page in &self.pages {
            let body = page.best_text().trim();
            if body.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push_str(FullText::PAGE_JOIN);
            }
            page_starts.push((page.page_number, text.len()));
            text.push_str(body);
        }
        FullText { text, page_starts }
    }

    /// Every media reference across all pages, images first per page.
    pub fn media_refs(&self) -> impl Iterator<Item = (usize, &MediaRef)> {
        self.pages
            .iter()
            .flat_map(|p| p.media().map(move |m| (p.page_number, m)))
    }

    /// Media chunks of both kinds, images first.
    pub fn media_chunks_mut(&mut self) -> impl Iterator<Item = &mut Chunk> {
        self.image_chunks.iter_mut().chain(self.table_chunks.iter_mut())
    }

    /// Clear the fields a stage owns.
    pub fn clear_outputs(&mut self, stage: Stage) {
        match stage {
            Stage::Extraction => {
                self.page_count = 0;
                self.pages.clear();
                self.page_failures.clear();
            }
            Stage::Repair => {
                for page in &mut self.pages {
                    page.cleaned_text = None;
                }
            }
            Stage::MediaDescription => {
                self.image_chunks.clear();
                self.table_chunks.clear();
            }
            Stage::Structure => {
                self.chapters.clear();
                self.prefix_digest = None;
            }
            Stage::Chunking => {
                self.text_chunks.clear();
                for chunk in self.media_chunks_mut() {
                    chunk.belongs_to_chapter = None;
                    chunk.sequence_index = None;
                    if let Some(detail) = chunk.body.media_detail_mut() {
                        detail.attached_to = None;
                    }
                }
            }
            Stage::ChapterQuestions => {
                for chapter in &mut self.chapters {
                    chapter.summary = None;
                }
                self.derived_questions.clear();
            }
        }
    }

    /// Reset `stage` and everything downstream of it to `pending`, clearing
    /// their outputs. Returns the stages that were reset.
    pub fn reset_from(&mut self, stage: Stage) -> Vec<Stage> {
        let stages = stage.with_dependents();
        // Downstream first so chunking releases media placement before the
        // media chunks themselves go away.
        for s in stages.iter().rev() {
            self.clear_outputs(*s);
            self.stage_status.insert(*s, StageState::pending());
        }
        self.refresh_completion();
        stages
    }

    /// Prepare a stored record for another run: interrupted stages go back
    /// to `pending`, failed stages are reset together with their dependents.
    /// Returns the stages that will run again.
    pub fn prepare_resume(&mut self) -> Vec<Stage> {
        let mut rescheduled = Vec::new();
        for stage in Stage::ALL {
            match self.status(stage) {
                StageStatus::Running => {
                    self.stage_status.insert(stage, StageState::pending());
                    rescheduled.push(stage);
                }
                StageStatus::Failed => {
                    for s in self.reset_from(stage) {
                        if !rescheduled.contains(&s) {
                            rescheduled.push(s);
                        }
                    }
                }
                _ => {}
            }
        }
        self.refresh_completion();
        rescheduled.sort();
        rescheduled
    }
}

/// Content-addressed document id: the first 16 hex chars of the BLAKE3
/// digest of the source bytes.
pub fn document_id_for(bytes: &[u8]) -> String {
    let hex = blake3::hash(bytes).to_hex();
    hex.as_str()[..16].to_string()
}

/// Full BLAKE3 hex digest of a prompt prefix.
pub fn prefix_digest(prefix: &str) -> String {
    blake3::hash(prefix.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: usize, raw: &str, cleaned: Option<&str>) -> PageRecord {
        PageRecord {
            page_number: n,
            raw_text: raw.into(),
            cleaned_text: cleaned.map(String::from),
            images: vec![],
            tables: vec![],
        }
    }

    #[test]
    fn new_record_has_every_stage_pending() {
        let r = DocumentRecord::new("abc", "doc.pdf");
        assert_eq!(r.stage_status.len(), 6);
        assert!(r.stage_status.values().all(|s| s.status == StageStatus::Pending));
        assert_eq!(r.runnable_stages(), vec![Stage::Extraction]);
        assert_eq!(r.completion_percentage, 0);
    }

    #[test]
    fn repair_and_media_become_runnable_together() {
        let mut r = DocumentRecord::new("abc", "doc.pdf");
        r.set_state(Stage::Extraction, StageState::done());
        assert_eq!(
            r.runnable_stages(),
            vec![Stage::Repair, Stage::MediaDescription]
        );
    }

    #[test]
    fn chunking_waits_for_media_to_settle() {
        let mut r = DocumentRecord::new("abc", "doc.pdf");
        r.set_state(Stage::Extraction, StageState::done());
        r.set_state(Stage::Repair, StageState::done());
        r.set_state(Stage::Structure, StageState::done());
        assert!(!r.runnable_stages().contains(&Stage::Chunking));

        r.set_state(Stage::MediaDescription, StageState::failed("outage"));
        assert!(r.runnable_stages().contains(&Stage::Chunking));
        assert!(r.blocked_stages().is_empty());
    }

    #[test]
    fn failed_requirement_blocks_transitively() {
        let mut r = DocumentRecord::new("abc", "doc.pdf");
        r.set_state(Stage::Extraction, StageState::failed("corrupt"));
        assert!(r.runnable_stages().is_empty());
        assert_eq!(
            r.blocked_stages(),
            vec![
                Stage::Repair,
                Stage::MediaDescription,
                Stage::Structure,
                Stage::Chunking,
                Stage::ChapterQuestions
            ]
        );
        assert!(r.is_degraded());
        assert!(!r.is_complete());
    }

    #[test]
    fn skipped_counts_as_complete() {
        let mut r = DocumentRecord::new("abc", "doc.pdf");
        for s in Stage::ALL {
            r.set_state(s, StageState::done());
        }
        r.set_state(Stage::MediaDescription, StageState::skipped("no media"));
        assert!(r.is_complete());
        assert!(!r.is_degraded());
        assert_eq!(r.completion_percentage, 100);
    }

    #[test]
    fn degraded_flag_marks_document_degraded() {
        let mut r = DocumentRecord::new("abc", "doc.pdf");
        for s in Stage::ALL {
            r.set_state(s, StageState::done());
        }
        r.set_state(Stage::Chunking, StageState::done().degraded_if(true));
        assert!(r.is_complete());
        assert!(r.is_degraded());
    }

    #[test]
    fn with_dependents_follows_both_edge_kinds() {
        assert_eq!(
            Stage::MediaDescription.with_dependents(),
            vec![
                Stage::MediaDescription,
                Stage::Chunking,
                Stage::ChapterQuestions
            ]
        );
        assert_eq!(Stage::Extraction.with_dependents(), Stage::ALL.to_vec());
        assert_eq!(
            Stage::ChapterQuestions.with_dependents(),
            vec![Stage::ChapterQuestions]
        );
    }

    #[test]
    fn reset_from_clears_owned_fields() {
        let mut r = DocumentRecord::new("abc", "doc.pdf");
        for s in Stage::ALL {
            r.set_state(s, StageState::done());
        }
        r.pages.push(page(1, "raw", Some("clean")));
        r.prefix_digest = Some("d".into());
        r.derived_questions.push(Question {
            question_id: "q-1-001".into(),
            text: "why?".into(),
            chapter_id: "1".into(),
            chunk_id: None,
        });

        let reset = r.reset_from(Stage::Repair);
        assert_eq!(
            reset,
            vec![
                Stage::Repair,
                Stage::Structure,
                Stage::Chunking,
                Stage::ChapterQuestions
            ]
        );
        assert_eq!(r.pages[0].cleaned_text, None);
        assert_eq!(r.pages[0].raw_text, "raw");
        assert!(r.prefix_digest.is_none());
        assert!(r.derived_questions.is_empty());
        assert_eq!(r.status(Stage::MediaDescription), StageStatus::Done);
        assert_eq!(r.status(Stage::Structure), StageStatus::Pending);
    }

    #[test]
    fn prepare_resume_reschedules_running_and_failed() {
        let mut r = DocumentRecord::new("abc", "doc.pdf");
        r.set_state(Stage::Extraction, StageState::done());
        r.set_state(Stage::Repair, StageState::running());
        r.set_state(Stage::MediaDescription, StageState::failed("outage"));
        let again = r.prepare_resume();
        assert_eq!(
            again,
            vec![
                Stage::Repair,
                Stage::MediaDescription,
                Stage::Chunking,
                Stage::ChapterQuestions
            ]
        );
        assert_eq!(r.status(Stage::Extraction), StageStatus::Done);
        assert_eq!(r.status(Stage::Repair), StageStatus::Pending);
    }

    #[test]
    fn full_text_skips_empty_pages_and_records_offsets() {
        let mut r = DocumentRecord::new("abc", "doc.pdf");
        r.pages = vec![
            page(1, "  Intro  ", None),
            page(2, "   ", None),
            page(3, "raw three", Some("Three")),
        ];
        let ft = r.full_text();
        assert_eq!(ft.text, "Intro\n\nThree");
        assert_eq!(ft.page_starts, vec![(1, 0), (3, 7)]);
        assert_eq!(ft.page_offset(2), 7);
        assert_eq!(ft.page_offset(9), ft.text.len());
    }

    #[test]
    fn stage_keys_serialise_in_pipeline_order() {
        let r = DocumentRecord::new("abc", "doc.pdf");
        let json = serde_json::to_string(&r.stage_status).unwrap();
        let extraction = json.find("extraction").unwrap();
        let questions = json.find("chapter_questions").unwrap();
        assert!(extraction < questions);
        assert!(json.contains("\"media_description\":{\"status\":\"pending\"}"));
    }

    #[test]
    fn chunk_type_is_a_flat_discriminant() {
        let chunk = Chunk {
            chunk_id: "c1-0000".into(),
            content: "Hello".into(),
            body: ChunkBody::ListItem(TextDetail {
                origin: ChunkOrigin::Fallback,
                media_refs: vec![],
            }),
            belongs_to_chapter: Some("1".into()),
            sequence_index: Some(0),
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["chunk_type"], "list_item");
        assert_eq!(value["origin"], "fallback");
        let back: Chunk = serde_json::from_value(value).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn unknown_chunk_type_is_rejected() {
        let json = r#"{"chunk_id":"x","content":"y","chunk_type":"poem",
            "origin":"llm","belongs_to_chapter":null,"sequence_index":null}"#;
        assert!(serde_json::from_str::<Chunk>(json).is_err());
    }

    #[test]
    fn stage_parses_aliases() {
        assert_eq!("media".parse::<Stage>().unwrap(), Stage::MediaDescription);
        assert_eq!(
            "chapter-questions".parse::<Stage>().unwrap(),
            Stage::ChapterQuestions
        );
        assert!("bogus".parse::<Stage>().is_err());
    }

    #[test]
    fn document_id_is_stable_and_short() {
        let a = document_id_for(b"%PDF-1.7 hello");
        let b = document_id_for(b"%PDF-1.7 hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, document_id_for(b"%PDF-1.7 other"));
    }
}
