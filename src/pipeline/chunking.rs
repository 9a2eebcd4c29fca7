//! Chunking stage: split every chapter into retrieval units and place media.
//!
//! Each chapter is one call with the shared document prefix as system
//! message and the chapter span in the user message. An answer is accepted
//! when every unit is non-empty with a known type and the units' combined
//! non-whitespace length is within `chunk_length_tolerance` of the span's.
//! A rejected answer gets one stricter retry; after that (or when the call
//! is exhausted) the chapter goes through the deterministic splitter in
//! [`crate::pipeline::fallback`] and the stage is marked degraded.
//!
//! Media chunks produced by the media stage are assigned to the chapter that
//! contains their caption (or their page start), sequenced per chapter, and
//! attached to a text chunk: the one the model listed them under, otherwise
//! the one whose span contains their position.

use crate::error::{Pdf2KbError, UnitError};
use crate::pipeline::fallback::{self, PieceKind};
use crate::pipeline::llm::{CompletionRequest, LlmClient};
use crate::pipeline::postprocess::{content_len, parse_structured};
use crate::pipeline::{shared_prefix, StageContext};
use crate::prompts::chunk_task;
use crate::schema::{
    ChapterRecord, Chunk, ChunkBody, ChunkOrigin, DocumentRecord, FullText, MediaRef, Stage,
    StageState, TextDetail,
};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct ChunkAnswer {
    chunks: Vec<ChunkUnit>,
}

#[derive(Debug, Deserialize)]
struct ChunkUnit {
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
    text: String,
    #[serde(default)]
    media: Vec<String>,
}

fn default_kind() -> String {
    "paragraph".into()
}

/// A validated text unit with its absolute byte range when known.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Unit {
    kind: PieceKind,
    text: String,
    span: Option<(usize, usize)>,
    media: Vec<String>,
}

struct ChapterChunks {
    units: Vec<Unit>,
    origin: ChunkOrigin,
    note: Option<String>,
}

/// A media item located in the full text.
#[derive(Debug, Clone)]
struct PlacedMedia {
    media: MediaRef,
    offset: usize,
}

struct MediaPlacement {
    chapter_id: String,
    attached_to: Option<String>,
}

pub async fn run(ctx: &StageContext, snapshot: &DocumentRecord) -> Result<StageState, Pdf2KbError> {
    let llm = ctx.llm()?;
    let (full, prefix) = shared_prefix(snapshot, Stage::Chunking)?;
    let chapters = &snapshot.chapters;
    if chapters.is_empty() {
        return Err(Pdf2KbError::StageFailed {
            stage: Stage::Chunking,
            detail: "outline has no chapters".into(),
        });
    }

    let media_by_chapter = place_media(snapshot, &full, chapters);

    ctx.progress.on_stage_start(Stage::Chunking, chapters.len());
    info!(
        "Chunking {} chapter(s), {} at a time",
        chapters.len(),
        ctx.config.chunking_concurrency
    );

    let mut results: Vec<(usize, ChapterChunks)> = stream::iter(0..chapters.len())
        .map(|i| {
            let chapter = &chapters[i];
            let media = &media_by_chapter[i];
            let full_text = full.text.as_str();
            let prefix = prefix.as_str();
            async move {
                let result = chunk_chapter(ctx, llm, prefix, full_text, chapter, media).await;
                let unit = format!("chapter {}", chapter.chapter_id);
                match &result.note {
                    None => ctx.progress.on_unit_complete(Stage::Chunking, &unit),
                    Some(note) => ctx.progress.on_unit_error(Stage::Chunking, &unit, note),
                }
                (i, result)
            }
        })
        .buffer_unordered(ctx.config.chunking_concurrency.max(1))
        .collect()
        .await;
    results.sort_by_key(|(i, _)| *i);

    let mut text_chunks = Vec::new();
    let mut placements: HashMap<String, MediaPlacement> = HashMap::new();
    let mut notes = Vec::new();
    let mut fallbacks = 0usize;
    for (i, result) in results {
        let chapter = &chapters[i];
        if result.origin == ChunkOrigin::Fallback {
            fallbacks += 1;
        }
        notes.extend(result.note);
        let (chunks, chapter_placements) =
            assemble_chapter(chapter, result.units, result.origin, &media_by_chapter[i]);
        text_chunks.extend(chunks);
        placements.extend(chapter_placements);
    }

    info!(
        "Chunking: {} text chunk(s), {} media placed, {} chapter(s) via fallback",
        text_chunks.len(),
        placements.len(),
        fallbacks
    );

    let state = StageState::done()
        .degraded_if(fallbacks > 0)
        .with_notes(notes);
    let committed = state.clone();
    ctx.store
        .commit(&ctx.document_id, Stage::Chunking, move |r| {
            r.text_chunks = text_chunks;
            apply_placements(&mut r.image_chunks, &placements);
            apply_placements(&mut r.table_chunks, &placements);
            Ok(state)
        })
        .await?;
    Ok(committed)
}

async fn chunk_chapter(
    ctx: &StageContext,
    llm: &LlmClient,
    prefix: &str,
    full_text: &str,
    chapter: &ChapterRecord,
    media: &[PlacedMedia],
) -> ChapterChunks {
    let span = full_text
        .get(chapter.start_offset..chapter.end_offset)
        .unwrap_or("");
    if content_len(span) == 0 {
        return ChapterChunks {
            units: Vec::new(),
            origin: ChunkOrigin::Llm,
            note: None,
        };
    }

    let refs: Vec<&MediaRef> = media.iter().map(|m| &m.media).collect();
    let known: HashSet<&str> = refs.iter().map(|m| m.media_id.as_str()).collect();
    let label = format!("chunk chapter {}", chapter.chapter_id);

    let failure = 'attempts: {
        let mut rejection = String::new();
        for strict in [false, true] {
            let request =
                CompletionRequest::text(prefix, chunk_task(chapter, span, &refs, strict)).structured();
            let answer = match llm.complete(&label, &request).await {
                Ok(c) => c,
                Err(e) => break 'attempts UnitError::llm(format!("chapter {}", chapter.chapter_id), &e),
            };
            let validated = parse_structured::<ChunkAnswer>(&answer.text).and_then(|a| {
                validate(a, span, chapter.start_offset, &known, ctx.config.chunk_length_tolerance)
            });
            match validated {
                Ok(units) => {
                    return ChapterChunks {
                        units,
                        origin: ChunkOrigin::Llm,
                        note: None,
                    }
                }
                Err(detail) => {
                    debug!("{}: answer rejected (strict={}): {}", label, strict, detail);
                    rejection = detail;
                }
            }
        }
        UnitError::Rejected {
            unit: format!("chapter {}", chapter.chapter_id),
            detail: rejection,
        }
    };

    warn!("{}; using deterministic splitter", failure);
    ChapterChunks {
        units: fallback_units(span, chapter.start_offset, ctx.config.fallback_max_chunk_chars),
        origin: ChunkOrigin::Fallback,
        note: Some(format!("{failure}; used deterministic splitter")),
    }
}

/// Check a parsed answer against the chapter span and locate each unit.
fn validate(
    answer: ChunkAnswer,
    span: &str,
    span_start: usize,
    known_media: &HashSet<&str>,
    tolerance: f32,
) -> Result<Vec<Unit>, String> {
    if answer.chunks.is_empty() {
        return Err("no chunks".into());
    }

    let mut units = Vec::with_capacity(answer.chunks.len());
    let mut seen_media: HashSet<String> = HashSet::new();
    let mut cursor = 0usize;
    let mut total = 0usize;
    for (i, unit) in answer.chunks.into_iter().enumerate() {
        let text = unit.text.trim();
        if text.is_empty() {
            return Err(format!("chunk {i} is empty"));
        }
        let kind = match unit.kind.trim() {
            "paragraph" => PieceKind::Paragraph,
            "list_item" => PieceKind::ListItem,
            other => return Err(format!("chunk {i} has unknown type '{other}'")),
        };
        total += content_len(text);

        let span_range = span.get(cursor..).and_then(|tail| tail.find(text)).map(|at| {
            let start = cursor + at;
            cursor = start + text.len();
            (span_start + start, span_start + cursor)
        });

        let media = unit
            .media
            .into_iter()
            .filter(|id| known_media.contains(id.as_str()) && seen_media.insert(id.clone()))
            .collect();

        units.push(Unit {
            kind,
            text: text.to_string(),
            span: span_range,
            media,
        });
    }

    let expected = content_len(span);
    let diff = total.abs_diff(expected) as f32;
    if diff > tolerance * expected as f32 {
        return Err(format!(
            "chunks cover {total} non-whitespace chars, chapter has {expected}"
        ));
    }
    Ok(units)
}

/// Deterministic units that tile the span exactly.
fn fallback_units(span: &str, span_start: usize, max_bytes: usize) -> Vec<Unit> {
    fallback::split(span, max_bytes)
        .into_iter()
        .map(|p| Unit {
            kind: p.kind,
            text: span[p.start..p.end].to_string(),
            span: Some((span_start + p.start, span_start + p.end)),
            media: Vec::new(),
        })
        .collect()
}

/// Build the chapter's text chunks and decide where its media go.
fn assemble_chapter(
    chapter: &ChapterRecord,
    units: Vec<Unit>,
    origin: ChunkOrigin,
    media: &[PlacedMedia],
) -> (Vec<Chunk>, Vec<(String, MediaPlacement)>) {
    let chunk_ids: Vec<String> = (0..units.len())
        .map(|seq| format!("c{}-{:04}", chapter.chapter_id, seq))
        .collect();

    let mut attached: HashMap<String, usize> = HashMap::new();
    for (idx, unit) in units.iter().enumerate() {
        for id in &unit.media {
            attached.entry(id.clone()).or_insert(idx);
        }
    }
    for m in media {
        if attached.contains_key(&m.media.media_id) {
            continue;
        }
        let containing = units.iter().position(|u| {
            u.span
                .is_some_and(|(start, end)| start <= m.offset && m.offset < end)
        });
        if let Some(idx) = containing {
            attached.insert(m.media.media_id.clone(), idx);
        }
    }

    let mut media_refs: Vec<Vec<String>> = vec![Vec::new(); units.len()];
    for m in media {
        if let Some(idx) = attached.get(&m.media.media_id) {
            media_refs[*idx].push(m.media.media_id.clone());
        }
    }

    let chunks = units
        .into_iter()
        .zip(media_refs)
        .enumerate()
        .map(|(seq, (unit, refs))| {
            let detail = TextDetail {
                origin,
                media_refs: refs,
            };
            Chunk {
                chunk_id: chunk_ids[seq].clone(),
                content: unit.text,
                body: match unit.kind {
                    PieceKind::Paragraph => ChunkBody::Paragraph(detail),
                    PieceKind::ListItem => ChunkBody::ListItem(detail),
                },
                belongs_to_chapter: Some(chapter.chapter_id.clone()),
                sequence_index: Some(seq),
            }
        })
        .collect();

    let placements = media
        .iter()
        .map(|m| {
            (
                m.media.media_id.clone(),
                MediaPlacement {
                    chapter_id: chapter.chapter_id.clone(),
                    attached_to: attached
                        .get(&m.media.media_id)
                        .map(|idx| chunk_ids[*idx].clone()),
                },
            )
        })
        .collect();
    (chunks, placements)
}

/// Group the media that have chunks by the chapter containing them.
fn place_media(
    snapshot: &DocumentRecord,
    full: &FullText,
    chapters: &[ChapterRecord],
) -> Vec<Vec<PlacedMedia>> {
    let with_chunks: HashSet<&str> = snapshot
        .image_chunks
        .iter()
        .chain(&snapshot.table_chunks)
        .map(|c| c.chunk_id.as_str())
        .collect();

    let mut by_chapter: Vec<Vec<PlacedMedia>> = vec![Vec::new(); chapters.len()];
    for (page, media) in snapshot.media_refs() {
        if !with_chunks.contains(media.media_id.as_str()) {
            continue;
        }
        let offset = media_offset(full, page, media);
        let idx = chapters
            .iter()
            .rposition(|c| c.start_offset <= offset)
            .unwrap_or(0);
        by_chapter[idx].push(PlacedMedia {
            media: media.clone(),
            offset,
        });
    }
    for list in &mut by_chapter {
        list.sort_by_key(|m| m.offset);
    }
    by_chapter
}

/// Caption position within the media's page, else the page start.
fn media_offset(full: &FullText, page: usize, media: &MediaRef) -> usize {
    let page_start = full.page_offset(page);
    let page_end = full
        .page_starts
        .iter()
        .find(|(p, _)| *p > page)
        .map(|(_, off)| *off)
        .unwrap_or(full.text.len());
    media
        .caption
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .and_then(|caption| {
            full.text
                .get(page_start..page_end)
                .and_then(|page_text| page_text.find(caption))
        })
        .map(|at| page_start + at)
        .unwrap_or(page_start)
}

/// Set chapter, dense per-chapter sequence and attachment on media chunks.
/// Called once per collection, so image and table sequences start at 0
/// independently of each other and of the text chunks.
fn apply_placements(chunks: &mut [Chunk], placements: &HashMap<String, MediaPlacement>) {
    let mut next_seq: HashMap<String, usize> = HashMap::new();
    for chunk in chunks.iter_mut() {
        let Some(placement) = placements.get(&chunk.chunk_id) else {
            continue;
        };
        let seq = next_seq.entry(placement.chapter_id.clone()).or_insert(0);
        chunk.belongs_to_chapter = Some(placement.chapter_id.clone());
        chunk.sequence_index = Some(*seq);
        *seq += 1;
        if let Some(detail) = chunk.body.media_detail_mut() {
            detail.attached_to = placement.attached_to.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MediaKind;

    fn chapter(id: &str, start: usize, end: usize) -> ChapterRecord {
        ChapterRecord {
            chapter_id: id.into(),
            title: format!("Chapter {id}"),
            level: 1,
            anchor_text: String::new(),
            start_offset: start,
            end_offset: end,
            summary: None,
        }
    }

    fn unit(kind: &str, text: &str, media: &[&str]) -> ChunkUnit {
        ChunkUnit {
            kind: kind.into(),
            text: text.into(),
            media: media.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn placed(id: &str, offset: usize) -> PlacedMedia {
        PlacedMedia {
            media: MediaRef {
                media_id: id.into(),
                kind: MediaKind::Image,
                path: format!("media/{id}.png"),
                caption: None,
                context_text: String::new(),
            },
            offset,
        }
    }

    const SPAN: &str = "Pumps move fluid.\n\n- Check seals\n- Check bearings";

    #[test]
    fn faithful_answer_is_accepted_and_located() {
        let known: HashSet<&str> = ["p0001-img0"].into_iter().collect();
        let answer = ChunkAnswer {
            chunks: vec![
                unit("paragraph", "Pumps move fluid.", &["p0001-img0", "bogus"]),
                unit("list_item", "- Check seals", &[]),
                unit("list_item", "- Check bearings", &[]),
            ],
        };
        let units = validate(answer, SPAN, 100, &known, 0.15).unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].span, Some((100, 117)));
        assert_eq!(units[0].media, vec!["p0001-img0".to_string()]);
        assert_eq!(units[2].kind, PieceKind::ListItem);
    }

    #[test]
    fn truncated_answer_is_rejected() {
        let answer = ChunkAnswer {
            chunks: vec![unit("paragraph", "Pumps move fluid.", &[])],
        };
        let err = validate(answer, SPAN, 0, &HashSet::new(), 0.15).unwrap_err();
        assert!(err.contains("non-whitespace"));
    }

    #[test]
    fn unknown_type_and_empty_text_are_rejected() {
        let answer = ChunkAnswer {
            chunks: vec![unit("poem", SPAN, &[])],
        };
        assert!(validate(answer, SPAN, 0, &HashSet::new(), 0.15).is_err());
        let answer = ChunkAnswer {
            chunks: vec![unit("paragraph", "  ", &[])],
        };
        assert!(validate(answer, SPAN, 0, &HashSet::new(), 0.15).is_err());
        let answer = ChunkAnswer { chunks: vec![] };
        assert!(validate(answer, SPAN, 0, &HashSet::new(), 0.15).is_err());
    }

    #[test]
    fn fallback_units_tile_the_span() {
        let units = fallback_units(SPAN, 10, 1500);
        let joined: String = units.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(joined, SPAN);
        assert_eq!(units[0].span.unwrap().0, 10);
        assert_eq!(units.last().unwrap().span.unwrap().1, 10 + SPAN.len());
    }

    #[test]
    fn media_attach_by_listing_then_by_position() {
        let ch = chapter("2", 0, SPAN.len());
        let units = fallback_units(SPAN, 0, 1500);
        let mut units_with_listing = units.clone();
        units_with_listing[2].media = vec!["p0001-img0".into()];
        let media = vec![placed("p0001-img0", 0), placed("p0001-img1", 20)];

        let (chunks, placements) =
            assemble_chapter(&ch, units_with_listing, ChunkOrigin::Fallback, &media);
        assert_eq!(chunks[0].chunk_id, "c2-0000");
        assert_eq!(chunks[2].sequence_index, Some(2));
        let by_id: HashMap<_, _> = placements.into_iter().collect();
        assert_eq!(by_id["p0001-img0"].attached_to.as_deref(), Some("c2-0002"));
        assert_eq!(by_id["p0001-img1"].attached_to.as_deref(), Some("c2-0001"));
        assert_eq!(
            chunks[1].body.text_detail().unwrap().media_refs,
            vec!["p0001-img1".to_string()]
        );
    }

    #[test]
    fn media_sequences_are_dense_per_chapter() {
        use crate::schema::MediaDetail;
        let mk = |id: &str| Chunk {
            chunk_id: id.into(),
            content: id.into(),
            body: ChunkBody::ImageDesc(MediaDetail {
                media_id: id.into(),
                page_number: 1,
                path: String::new(),
                caption: None,
                summary: None,
                detail: None,
                engineering_note: None,
                described: false,
                attached_to: None,
            }),
            belongs_to_chapter: None,
            sequence_index: None,
        };
        let mut chunks = vec![mk("a"), mk("b"), mk("c")];
        let mut placements = HashMap::new();
        for (id, ch) in [("a", "1"), ("b", "2"), ("c", "1")] {
            placements.insert(
                id.to_string(),
                MediaPlacement {
                    chapter_id: ch.into(),
                    attached_to: None,
                },
            );
        }
        apply_placements(&mut chunks, &placements);
        assert_eq!(chunks[0].sequence_index, Some(0));
        assert_eq!(chunks[1].sequence_index, Some(0));
        assert_eq!(chunks[2].sequence_index, Some(1));
        assert_eq!(chunks[2].belongs_to_chapter.as_deref(), Some("1"));
    }

    #[test]
    fn caption_offset_is_searched_within_its_page() {
        let full = FullText {
            text: "Page one text\n\nIntro. Figure 2: Rotor shown here".into(),
            page_starts: vec![(1, 0), (2, 15)],
        };
        let mut m = placed("p0002-img0", 0).media;
        m.caption = Some("Figure 2: Rotor".into());
        assert_eq!(media_offset(&full, 2, &m), 22);
        m.caption = Some("nowhere".into());
        assert_eq!(media_offset(&full, 2, &m), 15);
        m.caption = Some("Page one".into());
        assert_eq!(media_offset(&full, 2, &m), 15);
    }
}
