//! Extraction stage: parse every page on a CPU-bounded worker pool.
//!
//! The pool size comes from [`PipelineConfig::extraction_workers`]
//! (available cores minus a reserved margin). Each page is parsed in
//! `spawn_blocking` because pdfium is synchronous; transient failures are
//! retried through the extraction retry policy, and a page that still fails
//! is recorded in `page_failures` while the rest of the document proceeds.
//!
//! Media blobs are written to the store before the commit. Until the commit
//! lands nothing in the schema references them.
//!
//! [`PipelineConfig::extraction_workers`]: crate::config::PipelineConfig::extraction_workers

use crate::error::{Pdf2KbError, UnitError};
use crate::pipeline::parser::{PageBlob, ParseError};
use crate::pipeline::retry::Exhausted;
use crate::pipeline::StageContext;
use crate::schema::{MediaKind, MediaRef, PageFailure, PageRecord, Stage, StageState};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub async fn run(ctx: &StageContext) -> Result<StageState, Pdf2KbError> {
    let page_count = {
        let parser = Arc::clone(&ctx.parser);
        let path = ctx.pdf_path.clone();
        let password = ctx.config.password.clone();
        tokio::task::spawn_blocking(move || parser.page_count(&path, password.as_deref()))
            .await
            .map_err(|e| Pdf2KbError::Internal(format!("page count task panicked: {e}")))??
    };

    let workers = ctx.config.extraction_workers();
    info!(
        "Extracting {} pages with {} worker(s)",
        page_count, workers
    );
    ctx.progress.on_stage_start(Stage::Extraction, page_count);

    let mut results: Vec<(usize, Result<PageBlob, Exhausted<ParseError>>)> =
        stream::iter(1..=page_count)
            .map(|n| async move {
                let result = extract_page(ctx, n).await;
                match &result {
                    Ok(_) => ctx.progress.on_unit_complete(Stage::Extraction, &format!("page {n}")),
                    Err(e) => ctx.progress.on_unit_error(
                        Stage::Extraction,
                        &format!("page {n}"),
                        &e.last.to_string(),
                    ),
                }
                (n, result)
            })
            .buffer_unordered(workers)
            .collect()
            .await;
    results.sort_by_key(|(n, _)| *n);

    let mut pages = Vec::with_capacity(page_count);
    let mut failures = Vec::new();
    let mut notes = Vec::new();
    for (n, result) in results {
        match result {
            Ok(blob) => pages.push(persist_page(ctx, blob).await?),
            Err(e) => {
                let unit = UnitError::PageExtraction {
                    page: n,
                    attempts: e.attempts,
                    detail: e.last.to_string(),
                };
                warn!("{}", unit);
                failures.push(PageFailure {
                    page_number: n,
                    reason: e.last.to_string(),
                });
                notes.push(unit.to_string());
            }
        }
    }

    let state = if pages.is_empty() {
        StageState::failed(format!("none of the {page_count} pages could be extracted"))
            .with_notes(notes)
    } else {
        StageState::done()
            .degraded_if(!failures.is_empty())
            .with_notes(notes)
    };
    info!(
        "Extraction: {}/{} pages, {} failed",
        pages.len(),
        page_count,
        failures.len()
    );

    let committed = state.clone();
    ctx.store
        .commit(&ctx.document_id, Stage::Extraction, move |r| {
            r.page_count = page_count;
            r.pages = pages;
            r.page_failures = failures;
            Ok(state)
        })
        .await?;
    Ok(committed)
}

async fn extract_page(ctx: &StageContext, page_number: usize) -> Result<PageBlob, Exhausted<ParseError>> {
    let policy = ctx.config.extraction_retry_policy();
    policy
        .run(
            &format!("page {page_number}"),
            |_| {
                let parser = Arc::clone(&ctx.parser);
                let path = ctx.pdf_path.clone();
                let password = ctx.config.password.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        parser.parse_page(&path, password.as_deref(), page_number)
                    })
                    .await
                    .unwrap_or_else(|e| Err(ParseError::Page(format!("parser panicked: {e}"))))
                }
            },
            ParseError::is_transient,
        )
        .await
}

/// Write the page's blobs to the media directory and build its record.
async fn persist_page(ctx: &StageContext, blob: PageBlob) -> Result<PageRecord, Pdf2KbError> {
    let n = blob.page_number;
    let mut images = Vec::with_capacity(blob.images.len());
    for (i, image) in blob.images.into_iter().enumerate() {
        let media_id = media_id(n, MediaKind::Image, i);
        let path = ctx
            .store
            .write_media(&ctx.document_id, &format!("{media_id}.png"), image.png)
            .await?;
        images.push(MediaRef {
            media_id,
            kind: MediaKind::Image,
            path,
            caption: image.caption,
            context_text: image.context_text,
        });
    }

    let mut tables = Vec::with_capacity(blob.tables.len());
    for (i, table) in blob.tables.into_iter().enumerate() {
        let media_id = media_id(n, MediaKind::Table, i);
        let path = ctx
            .store
            .write_media(&ctx.document_id, &format!("{media_id}.md"), table.markdown.into_bytes())
            .await?;
        tables.push(MediaRef {
            media_id,
            kind: MediaKind::Table,
            path,
            caption: table.caption,
            context_text: table.context_text,
        });
    }

    debug!(
        "Page {}: {} chars, {} image(s), {} table(s)",
        n,
        blob.text.len(),
        images.len(),
        tables.len()
    );

    Ok(PageRecord {
        page_number: n,
        raw_text: blob.text,
        cleaned_text: None,
        images,
        tables,
    })
}

/// `p0003-img0`, `p0003-tbl1`.
pub fn media_id(page_number: usize, kind: MediaKind, index: usize) -> String {
    format!("p{:04}-{}{}", page_number, kind.id_tag(), index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_ids_are_page_coded() {
        assert_eq!(media_id(3, MediaKind::Image, 0), "p0003-img0");
        assert_eq!(media_id(12, MediaKind::Table, 2), "p0012-tbl2");
    }
}
