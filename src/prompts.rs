//! Prompt text for every LLM-calling stage.
//!
//! All wording lives here so stages only deal with request plumbing and
//! validation.
//!
//! ## The shared document prefix
//!
//! Structure, chunking and chapter enrichment all send
//! [`document_prefix`] as their system message, byte for byte. Providers that
//! cache prompt prefixes then bill the full document text once and serve
//! every later per-chapter call from cache. Anything that varies per call
//! (chapter span, media list, task wording) therefore goes into the user
//! message, never into the prefix.
//!
//! Each user message starts with a `## Task:` line naming the request kind.

use crate::schema::{ChapterRecord, Chunk, MediaRef};

/// Header of the shared prefix, before the document text.
const PREFIX_HEADER: &str = r#"You are a document analyst preparing a technical document for a retrieval knowledge base.
The complete document text is given below between <document> tags. Later instructions refer to
byte-exact excerpts of it; never paraphrase text you are asked to quote."#;

/// Build the shared, cache-friendly system prefix for a document.
pub fn document_prefix(full_text: &str) -> String {
    format!("{PREFIX_HEADER}\n\n<document>\n{full_text}\n</document>")
}

// ── Repair ───────────────────────────────────────────────────────────────

pub const REPAIR_SYSTEM: &str = r#"You repair text extracted from one PDF page.

Fix OCR artefacts (broken words, hyphenation at line ends, mis-recognised characters), stray
whitespace and broken line wrapping. Keep headings, list markers and table rows on their own lines.

You must NOT summarise, reorder, translate or omit anything. Every sentence of the input must
appear in the output. Output ONLY the repaired text, without commentary or code fences."#;

/// Stricter variant used after an implausibly short answer.
pub const REPAIR_STRICT_SYSTEM: &str = r#"You repair text extracted from one PDF page.

Your previous answer dropped content. This time copy the input through COMPLETELY, changing only
characters that are clearly OCR errors and whitespace that is clearly broken. The output must be
about as long as the input. Output ONLY the repaired text, without commentary or code fences."#;

pub fn repair_user(page_number: usize, raw_text: &str) -> String {
    format!("## Task: repair page\nPage {page_number} raw text:\n\n{raw_text}")
}

// ── Structure ────────────────────────────────────────────────────────────

pub fn outline_task(strict: bool) -> String {
    let mut s = String::from(
        r#"## Task: outline
List the chapters and sections of the document in reading order.

Return JSON: {"chapters": [{"title": "...", "level": 1, "anchor": "..."}]}
- level: 1 for chapters, 2 for sections, 3 for subsections.
- anchor: the first 5 to 12 words of the heading line, copied EXACTLY from the document text,
  including punctuation and numbering. The anchor is searched verbatim."#,
    );
    if strict {
        s.push_str(
            "\n\nYour previous answer was not valid JSON in this shape. Return only the JSON object.",
        );
    }
    s
}

// ── Chunking ─────────────────────────────────────────────────────────────

pub fn chunk_task(chapter: &ChapterRecord, span: &str, media: &[&MediaRef], strict: bool) -> String {
    let mut s = format!(
        r#"## Task: chunk chapter
Chapter {id} "{title}".

Split the chapter text below into minimal self-contained retrieval units, in order.
Return JSON: {{"chunks": [{{"type": "paragraph", "text": "...", "media": []}}]}}
- type: "paragraph" or "list_item".
- text: a contiguous excerpt of the chapter text, copied verbatim. Together the chunks must cover
  the whole chapter text with no gaps and no overlaps.
- media: ids of figures or tables from the list below that belong with this unit (a figure and the
  paragraph introducing it go together). Each id at most once.
"#,
        id = chapter.chapter_id,
        title = chapter.title,
    );
    if media.is_empty() {
        s.push_str("\nMedia in this chapter: none\n");
    } else {
        s.push_str("\nMedia in this chapter:\n");
        for m in media {
            let caption = m.caption.as_deref().unwrap_or("(no caption)");
            s.push_str(&format!("- {}: {}\n", m.media_id, caption));
        }
    }
    if strict {
        s.push_str(
            "\nYour previous answer was rejected: chunks must be verbatim and cover the full text. \
             Return only the JSON object.\n",
        );
    }
    s.push_str("\n<chapter_text>\n");
    s.push_str(span);
    s.push_str("\n</chapter_text>");
    s
}

// ── Media ────────────────────────────────────────────────────────────────

pub const MEDIA_SYSTEM: &str = r#"You describe figures and tables from technical documents for a search index.

Return JSON: {"summary": "...", "detail": "...", "engineering_note": "..."}
- summary: one sentence a searcher would match against.
- detail: a thorough description of what is shown, including values, labels and trends.
- engineering_note: technical specifics (units, tolerances, part numbers) or "" if none."#;

pub fn image_task(media: &MediaRef, page_number: usize, max_context: Option<usize>) -> String {
    format!(
        "## Task: describe image\nImage {} on page {}.\nCaption: {}\n\nSurrounding page text:\n{}",
        media.media_id,
        page_number,
        media.caption.as_deref().unwrap_or("(none)"),
        media_context(media, max_context)
    )
}

pub fn table_task(
    media: &MediaRef,
    page_number: usize,
    table_markdown: &str,
    max_context: Option<usize>,
) -> String {
    format!(
        "## Task: describe table\nTable {} on page {}.\nCaption: {}\n\n{}\n\nSurrounding page text:\n{}",
        media.media_id,
        page_number,
        media.caption.as_deref().unwrap_or("(none)"),
        table_markdown,
        media_context(media, max_context)
    )
}

/// The page text sent with a media item: all of it, or at most `max_chars`
/// chars centred on the caption (page start when there is none).
fn media_context(media: &MediaRef, max_chars: Option<usize>) -> String {
    let text = media.context_text.as_str();
    let Some(max_chars) = max_chars else {
        return text.to_string();
    };
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let center = media
        .caption
        .as_deref()
        .and_then(|c| text.find(c))
        .unwrap_or(0);
    let start_char = text[..center].chars().count().saturating_sub(max_chars / 2);
    text.chars().skip(start_char).take(max_chars).collect()
}

// ── Chapter enrichment ───────────────────────────────────────────────────

pub fn enrich_task(
    chapter: &ChapterRecord,
    chunks: &[&Chunk],
    chapter_questions: usize,
    chunk_questions: usize,
) -> String {
    let mut s = format!(
        r#"## Task: summarise chapter
Chapter {id} "{title}".

Return JSON: {{"summary": "...", "chapter_questions": ["..."], "chunk_questions": [{{"chunk_id": "...", "questions": ["..."]}}]}}
- summary: 3 to 6 sentences condensing the chapter.
- chapter_questions: up to {cq} questions a reader could answer from this chapter.
- chunk_questions: for each chunk below, up to {kq} questions it answers.

Chunks:
"#,
        id = chapter.chapter_id,
        title = chapter.title,
        cq = chapter_questions,
        kq = chunk_questions,
    );
    for chunk in chunks {
        s.push_str(&format!("[{}] {}\n", chunk.chunk_id, chunk.content));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MediaKind;

    fn chapter() -> ChapterRecord {
        ChapterRecord {
            chapter_id: "2.1".into(),
            title: "Pumps".into(),
            level: 2,
            anchor_text: "2.1 Pumps".into(),
            start_offset: 0,
            end_offset: 10,
            summary: None,
        }
    }

    #[test]
    fn prefix_embeds_text_verbatim() {
        let p = document_prefix("Alpha\n\nBeta");
        assert!(p.contains("<document>\nAlpha\n\nBeta\n</document>"));
        assert_eq!(p, document_prefix("Alpha\n\nBeta"));
    }

    #[test]
    fn tasks_carry_their_tag() {
        assert!(outline_task(false).starts_with("## Task: outline"));
        assert!(outline_task(true).contains("previous answer"));
        assert!(repair_user(3, "x").starts_with("## Task: repair page\nPage 3"));
        let m = MediaRef {
            media_id: "p0001-img0".into(),
            kind: MediaKind::Image,
            path: "media/p0001-img0.png".into(),
            caption: Some("Figure 1: Rotor".into()),
            context_text: "ctx".into(),
        };
        let t = chunk_task(&chapter(), "body", &[&m], false);
        assert!(t.starts_with("## Task: chunk chapter"));
        assert!(t.contains("- p0001-img0: Figure 1: Rotor"));
        assert!(t.ends_with("<chapter_text>\nbody\n</chapter_text>"));
        assert!(image_task(&m, 1, None).starts_with("## Task: describe image"));
        assert!(table_task(&m, 1, "| a |", None).starts_with("## Task: describe table"));
        assert!(enrich_task(&chapter(), &[], 3, 2).starts_with("## Task: summarise chapter"));
    }

    #[test]
    fn media_context_is_sent_whole_unless_capped() {
        let page = format!("{}Figure 1: Rotor{}", "α".repeat(500), "β".repeat(500));
        let m = MediaRef {
            media_id: "p0002-img0".into(),
            kind: MediaKind::Image,
            path: "media/p0002-img0.png".into(),
            caption: Some("Figure 1: Rotor".into()),
            context_text: page.clone(),
        };
        assert!(image_task(&m, 2, None).ends_with(&page));

        let capped = media_context(&m, Some(40));
        assert_eq!(capped.chars().count(), 40);
        assert!(capped.contains("Figure 1: Rotor"));
        assert_eq!(media_context(&m, Some(10_000)), page);
    }
}
