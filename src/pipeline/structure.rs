//! Structure stage: derive the chapter outline from the full document text.
//!
//! The model sees the shared document prefix as its system message and
//! returns chapter titles with verbatim anchors. Anchors are located in the
//! full text; those that cannot be found are dropped and noted. Chapters
//! span from their anchor to the next one, so together they tile the whole
//! text. Text before the first anchor becomes a "Front matter" chapter `0`.
//!
//! When no usable outline comes back the document becomes a single chapter
//! and the stage is marked degraded.

use crate::error::{Pdf2KbError, UnitError};
use crate::pipeline::llm::CompletionRequest;
use crate::pipeline::postprocess::parse_structured;
use crate::pipeline::StageContext;
use crate::prompts::{document_prefix, outline_task};
use crate::schema::{prefix_digest, ChapterRecord, DocumentRecord, Stage, StageState};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Deepest outline level kept; deeper headings are folded into level 3.
const MAX_LEVEL: u8 = 3;
/// Longest anchor synthesised for the front-matter and whole-document
/// chapters.
const SYNTH_ANCHOR_CHARS: usize = 80;

#[derive(Debug, Clone, Deserialize)]
pub struct OutlineAnswer {
    pub chapters: Vec<OutlineEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutlineEntry {
    pub title: String,
    #[serde(default = "default_level")]
    pub level: u8,
    pub anchor: String,
}

fn default_level() -> u8 {
    1
}

pub async fn run(ctx: &StageContext, snapshot: &DocumentRecord) -> Result<StageState, Pdf2KbError> {
    let full = snapshot.full_text();
    let prefix = document_prefix(&full.text);
    let digest = prefix_digest(&prefix);
    ctx.progress.on_stage_start(Stage::Structure, 1);

    let mut notes = Vec::new();
    let outline = if full.text.trim().is_empty() {
        notes.push("document has no text".to_string());
        None
    } else {
        request_outline(ctx, &prefix, &mut notes).await?
    };

    let title = document_title(&snapshot.source_name);
    let (chapters, degraded) = match outline {
        Some(entries) => {
            let (chapters, dropped) = resolve_outline(&full.text, &entries);
            notes.extend(dropped);
            if chapters.is_empty() {
                notes.push("no outline anchor could be located; using a single chapter".into());
                (vec![single_chapter(&full.text, &title)], true)
            } else {
                (chapters, false)
            }
        }
        None => (vec![single_chapter(&full.text, &title)], true),
    };

    info!(
        "Structure: {} chapter(s){}",
        chapters.len(),
        if degraded { " (fallback outline)" } else { "" }
    );
    ctx.progress.on_unit_complete(Stage::Structure, "outline");

    let state = StageState::done().degraded_if(degraded).with_notes(notes);
    let committed = state.clone();
    ctx.store
        .commit(&ctx.document_id, Stage::Structure, move |r| {
            r.chapters = chapters;
            r.prefix_digest = Some(digest);
            Ok(state)
        })
        .await?;
    Ok(committed)
}

/// Ask for the outline, retrying once with a stricter prompt on an
/// unparseable answer. `None` means no usable outline.
async fn request_outline(
    ctx: &StageContext,
    prefix: &str,
    notes: &mut Vec<String>,
) -> Result<Option<Vec<OutlineEntry>>, Pdf2KbError> {
    let llm = ctx.llm()?;
    let mut rejection = String::new();
    for strict in [false, true] {
        let request = CompletionRequest::text(prefix, outline_task(strict)).structured();
        let answer = match llm.complete("outline", &request).await {
            Ok(c) => c,
            Err(e) => {
                let unit = UnitError::llm("outline", &e);
                warn!("{}", unit);
                notes.push(unit.to_string());
                return Ok(None);
            }
        };
        match parse_structured::<OutlineAnswer>(&answer.text) {
            Ok(outline) if !outline.chapters.is_empty() => return Ok(Some(outline.chapters)),
            Ok(_) => rejection = "outline has no chapters".into(),
            Err(e) => rejection = e,
        }
        debug!("Outline answer rejected (strict={}): {}", strict, rejection);
    }
    let unit = UnitError::Rejected {
        unit: "outline".into(),
        detail: rejection,
    };
    warn!("{}", unit);
    notes.push(unit.to_string());
    Ok(None)
}

/// Locate outline anchors in `text` and turn them into contiguous chapters.
///
/// Each anchor is searched verbatim, first after the previously accepted
/// anchor, then anywhere not already claimed. Returns the chapters and one
/// note per dropped entry.
pub fn resolve_outline(text: &str, entries: &[OutlineEntry]) -> (Vec<ChapterRecord>, Vec<String>) {
    let mut located: Vec<(usize, &OutlineEntry, &str)> = Vec::new();
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut notes = Vec::new();
    let mut cursor = 0usize;

    for entry in entries {
        let anchor = entry.anchor.trim();
        if anchor.is_empty() {
            notes.push(format!("chapter '{}': empty anchor; dropped", entry.title));
            continue;
        }
        let after_cursor = text
            .get(cursor..)
            .and_then(|tail| {
                tail.match_indices(anchor)
                    .map(|(i, _)| cursor + i)
                    .find(|i| !claimed.contains(i))
            });
        let found = after_cursor.or_else(|| {
            text.match_indices(anchor)
                .map(|(i, _)| i)
                .find(|i| !claimed.contains(i))
        });
        match found {
            Some(offset) => {
                claimed.insert(offset);
                cursor = offset + anchor.len();
                located.push((offset, entry, anchor));
            }
            None => notes.push(format!(
                "chapter '{}': anchor '{}' not found verbatim; dropped",
                entry.title, anchor
            )),
        }
    }

    if located.is_empty() {
        return (Vec::new(), notes);
    }
    located.sort_by_key(|(offset, ..)| *offset);

    let mut chapters = Vec::with_capacity(located.len() + 1);
    let first = located[0].0;
    if first > 0 && !text[..first].trim().is_empty() {
        chapters.push(ChapterRecord {
            chapter_id: "0".into(),
            title: "Front matter".into(),
            level: 1,
            anchor_text: leading_anchor(text),
            start_offset: 0,
            end_offset: first,
            summary: None,
        });
    }

    let mut counters = [0usize; MAX_LEVEL as usize];
    let mut prev_level = 0u8;
    for (i, (offset, entry, anchor)) in located.iter().enumerate() {
        let level = entry.level.clamp(1, MAX_LEVEL).min(prev_level + 1);
        prev_level = level;
        let depth = level as usize;
        counters[depth - 1] += 1;
        for c in counters.iter_mut().skip(depth) {
            *c = 0;
        }
        let chapter_id = counters[..depth]
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(".");

        // Text between the front matter and a leading anchor at a non-zero
        // offset that is only whitespace is absorbed by the first chapter.
        let start_offset = if i == 0 && chapters.is_empty() { 0 } else { *offset };
        let end_offset = located.get(i + 1).map(|(o, ..)| *o).unwrap_or(text.len());
        let title = entry.title.trim();
        chapters.push(ChapterRecord {
            chapter_id,
            title: if title.is_empty() { anchor.to_string() } else { title.to_string() },
            level,
            anchor_text: if start_offset == *offset {
                anchor.to_string()
            } else {
                leading_anchor(text)
            },
            start_offset,
            end_offset,
            summary: None,
        });
    }
    (chapters, notes)
}

/// The whole document as chapter `1`.
pub fn single_chapter(text: &str, title: &str) -> ChapterRecord {
    ChapterRecord {
        chapter_id: "1".into(),
        title: title.to_string(),
        level: 1,
        anchor_text: leading_anchor(text),
        start_offset: 0,
        end_offset: text.len(),
        summary: None,
    }
}

/// First line of `text`, truncated on a char boundary.
fn leading_anchor(text: &str) -> String {
    text.lines()
        .next()
        .unwrap_or("")
        .chars()
        .take(SYNTH_ANCHOR_CHARS)
        .collect()
}

fn document_title(source_name: &str) -> String {
    let stem = std::path::Path::new(source_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if stem.is_empty() {
        "Document".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, level: u8, anchor: &str) -> OutlineEntry {
        OutlineEntry {
            title: title.into(),
            level,
            anchor: anchor.into(),
        }
    }

    const TEXT: &str = "Title page\n\n1 Introduction\nIntro body.\n\n1.1 Scope\nScope body.\n\n2 Design\nDesign body.";

    #[test]
    fn chapters_tile_the_text_with_front_matter() {
        let entries = vec![
            entry("Introduction", 1, "1 Introduction"),
            entry("Scope", 2, "1.1 Scope"),
            entry("Design", 1, "2 Design"),
        ];
        let (chapters, notes) = resolve_outline(TEXT, &entries);
        assert!(notes.is_empty());
        let ids: Vec<&str> = chapters.iter().map(|c| c.chapter_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "1.1", "2"]);
        assert_eq!(chapters[0].title, "Front matter");
        assert_eq!(chapters[0].start_offset, 0);
        for pair in chapters.windows(2) {
            assert_eq!(pair[0].end_offset, pair[1].start_offset);
        }
        assert_eq!(chapters.last().unwrap().end_offset, TEXT.len());
        for c in &chapters {
            assert_eq!(&TEXT[c.start_offset..c.start_offset + c.anchor_text.len()], c.anchor_text);
        }
    }

    #[test]
    fn missing_anchor_is_dropped_with_a_note() {
        let entries = vec![
            entry("Introduction", 1, "1 Introduction"),
            entry("Ghost", 1, "9 Nowhere"),
            entry("Design", 1, "2 Design"),
        ];
        let (chapters, notes) = resolve_outline(TEXT, &entries);
        assert_eq!(chapters.len(), 3);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("Ghost"));
        assert_eq!(chapters[2].chapter_id, "2");
    }

    #[test]
    fn repeated_anchor_claims_the_next_occurrence() {
        let text = "Overview\nA\n\nOverview\nB";
        let entries = vec![entry("First", 1, "Overview"), entry("Second", 1, "Overview")];
        let (chapters, _) = resolve_outline(text, &entries);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].start_offset, 0);
        assert_eq!(chapters[1].start_offset, 12);
    }

    #[test]
    fn levels_cannot_skip_depth() {
        let text = "A head\nx\n\nB head\ny";
        let entries = vec![entry("A", 3, "A head"), entry("B", 2, "B head")];
        let (chapters, _) = resolve_outline(text, &entries);
        assert_eq!(chapters[0].level, 1);
        assert_eq!(chapters[0].chapter_id, "1");
        assert_eq!(chapters[1].level, 2);
        assert_eq!(chapters[1].chapter_id, "1.1");
    }

    #[test]
    fn no_located_anchor_yields_nothing() {
        let (chapters, notes) = resolve_outline(TEXT, &[entry("X", 1, "missing")]);
        assert!(chapters.is_empty());
        assert_eq!(notes.len(), 1);
    }

    #[test]
    fn single_chapter_covers_everything() {
        let c = single_chapter(TEXT, "manual");
        assert_eq!(c.chapter_id, "1");
        assert_eq!(c.end_offset, TEXT.len());
        assert_eq!(c.anchor_text, "Title page");
        assert_eq!(document_title("pump-manual.pdf"), "pump-manual");
    }
}
