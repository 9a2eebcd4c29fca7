//! Chapter enrichment: a summary per chapter plus hypothetical questions at
//! chapter and chunk level.
//!
//! One call per chapter that has text chunks, sharing the document prefix
//! with structure and chunking. Questions are numbered per chapter,
//! chapter-level first, then chunk-level in chunk order, regardless of the
//! order the model listed them in.

use crate::error::{Pdf2KbError, UnitError};
use crate::pipeline::llm::{CompletionRequest, LlmClient};
use crate::pipeline::postprocess::parse_structured;
use crate::pipeline::{shared_prefix, StageContext};
use crate::prompts::enrich_task;
use crate::schema::{ChapterRecord, Chunk, DocumentRecord, Question, Stage, StageState};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct EnrichAnswer {
    summary: String,
    #[serde(default)]
    chapter_questions: Vec<String>,
    #[serde(default)]
    chunk_questions: Vec<ChunkQuestions>,
}

#[derive(Debug, Deserialize)]
struct ChunkQuestions {
    chunk_id: String,
    #[serde(default)]
    questions: Vec<String>,
}

struct Enriched {
    summary: String,
    questions: Vec<Question>,
}

pub async fn run(ctx: &StageContext, snapshot: &DocumentRecord) -> Result<StageState, Pdf2KbError> {
    if !ctx.config.enrich {
        return commit_skipped(ctx, "chapter enrichment disabled").await;
    }

    let (_, prefix) = shared_prefix(snapshot, Stage::ChapterQuestions)?;
    let work: Vec<(&ChapterRecord, Vec<&Chunk>)> = snapshot
        .chapters
        .iter()
        .map(|chapter| {
            let mut chunks: Vec<&Chunk> = snapshot
                .text_chunks
                .iter()
                .filter(|c| c.belongs_to_chapter.as_deref() == Some(chapter.chapter_id.as_str()))
                .collect();
            chunks.sort_by_key(|c| c.sequence_index);
            (chapter, chunks)
        })
        .filter(|(_, chunks)| !chunks.is_empty())
        .collect();

    if work.is_empty() {
        return commit_skipped(ctx, "no text chunks to enrich").await;
    }

    let llm = ctx.llm()?;
    let total = work.len();
    ctx.progress.on_stage_start(Stage::ChapterQuestions, total);
    info!("Enriching {} chapter(s)", total);

    let mut results: Vec<(usize, String, Result<Enriched, UnitError>)> =
        stream::iter(0..work.len())
            .map(|idx| {
                let (chapter, chunks) = (work[idx].0, &work[idx].1);
                let prefix = prefix.as_str();
                async move {
                    let result = enrich_chapter(ctx, llm, prefix, chapter, chunks).await;
                    let unit = format!("chapter {}", chapter.chapter_id);
                    match &result {
                        Ok(_) => ctx.progress.on_unit_complete(Stage::ChapterQuestions, &unit),
                        Err(e) => ctx.progress.on_unit_error(
                            Stage::ChapterQuestions,
                            &unit,
                            &e.to_string(),
                        ),
                    }
                    (idx, chapter.chapter_id.clone(), result)
                }
            })
            .buffer_unordered(ctx.config.llm_concurrency.max(1))
            .collect()
            .await;
    results.sort_by_key(|(idx, ..)| *idx);

    let mut summaries: HashMap<String, String> = HashMap::new();
    let mut questions = Vec::new();
    let mut notes = Vec::new();
    for (_, chapter_id, result) in results {
        match result {
            Ok(enriched) => {
                summaries.insert(chapter_id, enriched.summary);
                questions.extend(enriched.questions);
            }
            Err(e) => {
                warn!("{}", e);
                notes.push(e.to_string());
            }
        }
    }

    let failed = notes.len();
    let state = if failed == total {
        StageState::failed(format!("enrichment failed for all {total} chapter(s)")).with_notes(notes)
    } else {
        StageState::done().degraded_if(failed > 0).with_notes(notes)
    };
    info!(
        "Enrichment: {}/{} chapter(s), {} question(s)",
        total - failed,
        total,
        questions.len()
    );

    let committed = state.clone();
    ctx.store
        .commit(&ctx.document_id, Stage::ChapterQuestions, move |r| {
            for chapter in &mut r.chapters {
                chapter.summary = summaries.get(&chapter.chapter_id).cloned();
            }
            r.derived_questions = questions;
            Ok(state)
        })
        .await?;
    Ok(committed)
}

async fn commit_skipped(ctx: &StageContext, reason: &str) -> Result<StageState, Pdf2KbError> {
    info!("Skipping chapter enrichment: {}", reason);
    let state = StageState::skipped(reason);
    let committed = state.clone();
    ctx.store
        .commit(&ctx.document_id, Stage::ChapterQuestions, move |r| {
            r.clear_outputs(Stage::ChapterQuestions);
            Ok(state)
        })
        .await?;
    Ok(committed)
}

async fn enrich_chapter(
    ctx: &StageContext,
    llm: &LlmClient,
    prefix: &str,
    chapter: &ChapterRecord,
    chunks: &[&Chunk],
) -> Result<Enriched, UnitError> {
    let unit = format!("chapter {}", chapter.chapter_id);
    let request = CompletionRequest::text(
        prefix,
        enrich_task(
            chapter,
            chunks,
            ctx.config.chapter_questions,
            ctx.config.chunk_questions,
        ),
    )
    .structured();

    let answer = llm
        .complete(&format!("enrich {unit}"), &request)
        .await
        .map_err(|e| UnitError::llm(unit.clone(), &e))?;
    let parsed: EnrichAnswer =
        parse_structured(&answer.text).map_err(|detail| UnitError::Rejected {
            unit: unit.clone(),
            detail,
        })?;

    let summary = parsed.summary.trim().to_string();
    if summary.is_empty() {
        return Err(UnitError::Rejected {
            unit,
            detail: "empty summary".into(),
        });
    }
    Ok(Enriched {
        summary,
        questions: number_questions(
            chapter,
            chunks,
            parsed,
            ctx.config.chapter_questions,
            ctx.config.chunk_questions,
        ),
    })
}

/// Assign `q-<chapter>-NNN` ids, capping counts and dropping blank questions
/// and questions for chunks outside the chapter.
fn number_questions(
    chapter: &ChapterRecord,
    chunks: &[&Chunk],
    answer: EnrichAnswer,
    chapter_cap: usize,
    chunk_cap: usize,
) -> Vec<Question> {
    let mut by_chunk: HashMap<String, Vec<String>> = HashMap::new();
    for entry in answer.chunk_questions {
        by_chunk
            .entry(entry.chunk_id.trim().to_string())
            .or_default()
            .extend(entry.questions);
    }

    let clean = |qs: Vec<String>, cap: usize| -> Vec<String> {
        qs.into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .take(cap)
            .collect()
    };

    let mut texts: Vec<(String, Option<String>)> = clean(answer.chapter_questions, chapter_cap)
        .into_iter()
        .map(|q| (q, None))
        .collect();
    for chunk in chunks {
        if let Some(qs) = by_chunk.remove(&chunk.chunk_id) {
            texts.extend(
                clean(qs, chunk_cap)
                    .into_iter()
                    .map(|q| (q, Some(chunk.chunk_id.clone()))),
            );
        }
    }

    texts
        .into_iter()
        .enumerate()
        .map(|(n, (text, chunk_id))| Question {
            question_id: format!("q-{}-{:03}", chapter.chapter_id, n + 1),
            text,
            chapter_id: chapter.chapter_id.clone(),
            chunk_id,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ChunkBody, ChunkOrigin, TextDetail};

    fn chapter() -> ChapterRecord {
        ChapterRecord {
            chapter_id: "1.2".into(),
            title: "Seals".into(),
            level: 2,
            anchor_text: "1.2 Seals".into(),
            start_offset: 0,
            end_offset: 10,
            summary: None,
        }
    }

    fn chunk(id: &str, seq: usize) -> Chunk {
        Chunk {
            chunk_id: id.into(),
            content: "text".into(),
            body: ChunkBody::Paragraph(TextDetail {
                origin: ChunkOrigin::Llm,
                media_refs: vec![],
            }),
            belongs_to_chapter: Some("1.2".into()),
            sequence_index: Some(seq),
        }
    }

    #[test]
    fn questions_are_numbered_in_chunk_order_and_capped() {
        let a = chunk("c1.2-0000", 0);
        let b = chunk("c1.2-0001", 1);
        let answer: EnrichAnswer = serde_json::from_str(
            r#"{"summary":"S","chapter_questions":["Q1"," ","Q2","Q3"],
                "chunk_questions":[
                  {"chunk_id":"c1.2-0001","questions":["B1"]},
                  {"chunk_id":"c9-0000","questions":["X"]},
                  {"chunk_id":"c1.2-0000","questions":["A1","A2","A3"]}]}"#,
        )
        .unwrap();
        let qs = number_questions(&chapter(), &[&a, &b], answer, 2, 2);
        let got: Vec<(&str, &str, Option<&str>)> = qs
            .iter()
            .map(|q| (q.question_id.as_str(), q.text.as_str(), q.chunk_id.as_deref()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("q-1.2-001", "Q1", None),
                ("q-1.2-002", "Q2", None),
                ("q-1.2-003", "A1", Some("c1.2-0000")),
                ("q-1.2-004", "A2", Some("c1.2-0000")),
                ("q-1.2-005", "B1", Some("c1.2-0001")),
            ]
        );
    }
}
