//! Repair stage: per-page OCR and formatting cleanup.
//!
//! Each non-empty page is sent to the text model with the raw extraction.
//! The answer goes through [`clean_page_text`] and a plausibility check: an
//! answer whose non-whitespace length falls below
//! `repair_min_ratio × raw` is treated as a silent truncation and retried
//! once with a stricter prompt. If that also fails, or the call itself is
//! exhausted, the raw text is kept and the stage is marked degraded.

use crate::error::{Pdf2KbError, UnitError};
use crate::pipeline::llm::{CompletionRequest, LlmClient};
use crate::pipeline::postprocess::{clean_page_text, content_len};
use crate::pipeline::StageContext;
use crate::prompts::{repair_user, REPAIR_STRICT_SYSTEM, REPAIR_SYSTEM};
use crate::schema::{DocumentRecord, Stage, StageState};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use tracing::{debug, info, warn};

struct Repaired {
    text: String,
    note: Option<String>,
}

pub async fn run(ctx: &StageContext, snapshot: &DocumentRecord) -> Result<StageState, Pdf2KbError> {
    let llm = ctx.llm()?;
    let pages: Vec<(usize, String)> = snapshot
        .pages
        .iter()
        .map(|p| (p.page_number, p.raw_text.clone()))
        .collect();

    ctx.progress.on_stage_start(Stage::Repair, pages.len());
    info!("Repairing {} pages", pages.len());

    let mut results: Vec<(usize, Repaired)> = stream::iter(pages)
        .map(|(n, raw)| async move {
            let repaired = repair_page(ctx, llm, n, &raw).await;
            let unit = format!("page {n}");
            match &repaired.note {
                None => ctx.progress.on_unit_complete(Stage::Repair, &unit),
                Some(note) => ctx.progress.on_unit_error(Stage::Repair, &unit, note),
            }
            (n, repaired)
        })
        .buffer_unordered(ctx.config.llm_concurrency.max(1))
        .collect()
        .await;
    results.sort_by_key(|(n, _)| *n);

    let notes: Vec<String> = results.iter().filter_map(|(_, r)| r.note.clone()).collect();
    let cleaned: HashMap<usize, String> = results.into_iter().map(|(n, r)| (n, r.text)).collect();
    let state = StageState::done()
        .degraded_if(!notes.is_empty())
        .with_notes(notes);

    let committed = state.clone();
    ctx.store
        .commit(&ctx.document_id, Stage::Repair, move |r| {
            for page in &mut r.pages {
                page.cleaned_text = cleaned.get(&page.page_number).cloned();
            }
            Ok(state)
        })
        .await?;
    Ok(committed)
}

async fn repair_page(
    ctx: &StageContext,
    llm: &LlmClient,
    page_number: usize,
    raw: &str,
) -> Repaired {
    if raw.trim().is_empty() {
        return Repaired {
            text: String::new(),
            note: None,
        };
    }

    let label = format!("repair page {page_number}");
    let raw_len = content_len(raw);
    let min_len = min_repaired_len(raw_len, ctx.config.repair_min_ratio);

    for system in [REPAIR_SYSTEM, REPAIR_STRICT_SYSTEM] {
        let request = CompletionRequest::text(system, repair_user(page_number, raw));
        let answer = match llm.complete(&label, &request).await {
            Ok(c) => c,
            Err(e) => {
                let unit = UnitError::llm(format!("page {page_number}"), &e);
                warn!("{}; keeping raw text", unit);
                return Repaired {
                    text: raw.to_string(),
                    note: Some(format!("{unit}; kept raw text")),
                };
            }
        };

        let cleaned = clean_page_text(&answer.text);
        let len = content_len(&cleaned);
        if is_plausible(len, min_len) {
            return Repaired {
                text: cleaned,
                note: None,
            };
        }
        debug!(
            "Page {}: repaired text has {} of {} chars, below {}",
            page_number, len, raw_len, min_len
        );
    }

    let unit = UnitError::Rejected {
        unit: format!("page {page_number}"),
        detail: "repaired text implausibly short twice".into(),
    };
    warn!("{}; keeping raw text", unit);
    Repaired {
        text: raw.to_string(),
        note: Some(format!("{unit}; kept raw text")),
    }
}

/// Smallest acceptable non-whitespace length for a repaired page.
fn min_repaired_len(raw_len: usize, ratio: f32) -> usize {
    (raw_len as f32 * ratio).floor() as usize
}

fn is_plausible(len: usize, min_len: usize) -> bool {
    len > 0 && len >= min_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_answers_are_implausible() {
        let raw = "Body text of page 2.";
        let min_len = min_repaired_len(content_len(raw), 0.5);
        assert_eq!(min_len, 8);
        assert!(!is_plausible(content_len(&clean_page_text("x")), min_len));
        assert!(is_plausible(content_len(&clean_page_text(raw)), min_len));
    }

    #[test]
    fn empty_answer_is_never_plausible() {
        assert!(!is_plausible(0, 0));
        assert!(is_plausible(1, 0));
    }
}
