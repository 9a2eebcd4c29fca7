//! Media description stage: one chunk per extracted image or table.
//!
//! Images go to the vision model with their PNG attached; tables go to the
//! text model as markdown. Both get the text of their page as context. Every media
//! item yields a chunk even when its call fails: the chunk then carries the
//! caption (or a positional label) as content and `described: false`.
//!
//! Chapter placement is left to the chunking stage.

use crate::error::{Pdf2KbError, UnitError};
use crate::pipeline::encode::image_data_from_png;
use crate::pipeline::llm::{CompletionRequest, LlmClient};
use crate::pipeline::postprocess::parse_structured;
use crate::pipeline::StageContext;
use crate::prompts::{image_task, table_task, MEDIA_SYSTEM};
use crate::schema::{
    Chunk, ChunkBody, DocumentRecord, MediaDetail, MediaKind, MediaRef, Stage, StageState,
};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct MediaAnswer {
    summary: String,
    #[serde(default)]
    detail: String,
    #[serde(default)]
    engineering_note: String,
}

struct Description {
    summary: String,
    detail: Option<String>,
    engineering_note: Option<String>,
}

pub async fn run(ctx: &StageContext, snapshot: &DocumentRecord) -> Result<StageState, Pdf2KbError> {
    let items: Vec<(usize, MediaRef)> = snapshot
        .media_refs()
        .map(|(page, m)| (page, m.clone()))
        .collect();

    if items.is_empty() {
        info!("No images or tables; skipping media description");
        let state = StageState::skipped("document has no images or tables");
        let committed = state.clone();
        ctx.store
            .commit(&ctx.document_id, Stage::MediaDescription, move |r| {
                r.image_chunks.clear();
                r.table_chunks.clear();
                Ok(state)
            })
            .await?;
        return Ok(committed);
    }

    let llm = ctx.llm()?;
    let total = items.len();
    ctx.progress.on_stage_start(Stage::MediaDescription, total);
    info!("Describing {} media item(s)", total);

    let mut results: Vec<(usize, usize, MediaRef, Result<Description, UnitError>)> =
        stream::iter(items.into_iter().enumerate())
            .map(|(idx, (page, media))| async move {
                let result = describe(ctx, llm, page, &media).await;
                match &result {
                    Ok(_) => ctx
                        .progress
                        .on_unit_complete(Stage::MediaDescription, &media.media_id),
                    Err(e) => ctx.progress.on_unit_error(
                        Stage::MediaDescription,
                        &media.media_id,
                        &e.to_string(),
                    ),
                }
                (idx, page, media, result)
            })
            .buffer_unordered(ctx.config.llm_concurrency.max(1))
            .collect()
            .await;
    results.sort_by_key(|(idx, ..)| *idx);

    let mut image_chunks = Vec::new();
    let mut table_chunks = Vec::new();
    let mut notes = Vec::new();
    for (_, page, media, result) in results {
        let description = match result {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("{}; using caption fallback", e);
                notes.push(e.to_string());
                None
            }
        };
        let table_markdown = match (media.kind, &description) {
            (MediaKind::Table, None) => ctx
                .store
                .read_media(&ctx.document_id, &media.path)
                .await
                .ok()
                .map(|b| String::from_utf8_lossy(&b).into_owned()),
            _ => None,
        };
        let chunk = media_chunk(page, &media, description, table_markdown.as_deref());
        match media.kind {
            MediaKind::Image => image_chunks.push(chunk),
            MediaKind::Table => table_chunks.push(chunk),
        }
    }

    let failed = notes.len();
    let state = if failed == total {
        StageState::failed(format!("all {total} media descriptions failed")).with_notes(notes)
    } else {
        StageState::done().degraded_if(failed > 0).with_notes(notes)
    };
    info!(
        "Media description: {}/{} described",
        total - failed,
        total
    );

    let committed = state.clone();
    ctx.store
        .commit(&ctx.document_id, Stage::MediaDescription, move |r| {
            r.image_chunks = image_chunks;
            r.table_chunks = table_chunks;
            Ok(state)
        })
        .await?;
    Ok(committed)
}

async fn describe(
    ctx: &StageContext,
    llm: &LlmClient,
    page: usize,
    media: &MediaRef,
) -> Result<Description, UnitError> {
    let bytes = ctx
        .store
        .read_media(&ctx.document_id, &media.path)
        .await
        .map_err(|e| UnitError::MediaUnreadable {
            unit: media.media_id.clone(),
            detail: e.to_string(),
        })?;

    let max_context = ctx.config.media_context_chars;
    let request = match media.kind {
        MediaKind::Image => CompletionRequest::text(MEDIA_SYSTEM, image_task(media, page, max_context))
            .with_image(image_data_from_png(&bytes)),
        MediaKind::Table => {
            let markdown = String::from_utf8_lossy(&bytes);
            CompletionRequest::text(MEDIA_SYSTEM, table_task(media, page, &markdown, max_context))
        }
    }
    .structured();

    let label = format!("describe {}", media.media_id);
    let answer = llm
        .complete(&label, &request)
        .await
        .map_err(|e| UnitError::llm(media.media_id.clone(), &e))?;

    let parsed: MediaAnswer =
        parse_structured(&answer.text).map_err(|detail| UnitError::Rejected {
            unit: media.media_id.clone(),
            detail,
        })?;
    let summary = parsed.summary.trim().to_string();
    if summary.is_empty() {
        return Err(UnitError::Rejected {
            unit: media.media_id.clone(),
            detail: "empty summary".into(),
        });
    }
    Ok(Description {
        summary,
        detail: non_empty(parsed.detail),
        engineering_note: non_empty(parsed.engineering_note),
    })
}

fn non_empty(s: String) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_string())
}

/// Build the chunk for one media item, described or not.
fn media_chunk(
    page: usize,
    media: &MediaRef,
    description: Option<Description>,
    table_markdown: Option<&str>,
) -> Chunk {
    let described = description.is_some();
    let (content, summary, detail, engineering_note) = match description {
        Some(d) => {
            let content = match &d.detail {
                Some(detail) => format!("{}\n\n{}", d.summary, detail),
                None => d.summary.clone(),
            };
            (content, Some(d.summary), d.detail, d.engineering_note)
        }
        None => (fallback_content(page, media, table_markdown), None, None, None),
    };

    let detail = MediaDetail {
        media_id: media.media_id.clone(),
        page_number: page,
        path: media.path.clone(),
        caption: media.caption.clone(),
        summary,
        detail,
        engineering_note,
        described,
        attached_to: None,
    };
    Chunk {
        chunk_id: media.media_id.clone(),
        content,
        body: match media.kind {
            MediaKind::Image => ChunkBody::ImageDesc(detail),
            MediaKind::Table => ChunkBody::TableDesc(detail),
        },
        belongs_to_chapter: None,
        sequence_index: None,
    }
}

fn fallback_content(page: usize, media: &MediaRef, table_markdown: Option<&str>) -> String {
    let label = media.caption.clone().unwrap_or_else(|| match media.kind {
        MediaKind::Image => format!("Image on page {page}"),
        MediaKind::Table => format!("Table on page {page}"),
    });
    match table_markdown {
        Some(md) if !md.trim().is_empty() => format!("{label}\n\n{}", md.trim()),
        _ => label,
    }
}
