//! Parsing-library boundary: page text plus image and table blobs.
//!
//! The pipeline only sees [`PdfParser`]: how many pages a file has, and one
//! [`PageBlob`] per page. Pages are parsed one at a time so the extraction
//! stage can fan them out over its worker pool and retry them individually.
//!
//! [`PdfiumParser`] is the production implementation. pdfium gives us page
//! text and embedded bitmaps; tables and captions are recovered from the text
//! with layout heuristics:
//!
//! * a **table** is a run of at least three consecutive lines that split into
//!   the same number (≥ 2) of short cells on tabs or runs of two or more
//!   spaces. The run is rewritten as a GFM table.
//! * a **caption** is a line starting with `Figure n` / `Fig. n` / `Table n`.
//!   Figure captions are matched to images in reading order; a table caption
//!   is the nearest caption line directly above (or below) the run.

use crate::error::Pdf2KbError;
use crate::pipeline::encode::encode_png;
use once_cell::sync::{Lazy, OnceCell};
use pdfium_render::prelude::*;
use regex::Regex;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// An embedded bitmap, PNG-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlob {
    pub png: Vec<u8>,
    pub caption: Option<String>,
    pub context_text: String,
}

/// A table recovered from page text, as GFM Markdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBlob {
    pub markdown: String,
    pub caption: Option<String>,
    pub context_text: String,
}

/// Everything extracted from one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageBlob {
    /// 1-based.
    pub page_number: usize,
    pub text: String,
    pub images: Vec<ImageBlob>,
    pub tables: Vec<TableBlob>,
}

/// Why a single page could not be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Resource contention and similar; worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// The page itself is broken.
    #[error("{0}")]
    Page(String),
}

impl ParseError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ParseError::Transient(_))
    }
}

/// The parsing library as the pipeline sees it. Implementations are called
/// from blocking worker threads.
pub trait PdfParser: Send + Sync {
    /// Open the document and count its pages. Failing here is a permanent
    /// input error.
    fn page_count(&self, path: &Path, password: Option<&str>) -> Result<usize, Pdf2KbError>;

    /// Extract one page (1-based).
    fn parse_page(
        &self,
        path: &Path,
        password: Option<&str>,
        page_number: usize,
    ) -> Result<PageBlob, ParseError>;
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// [`PdfParser`] over pdfium, bound lazily on first use.
pub struct PdfiumParser {
    pdfium: OnceCell<Pdfium>,
    min_image_px: u32,
}

impl PdfiumParser {
    pub fn new(min_image_px: u32) -> Self {
        Self {
            pdfium: OnceCell::new(),
            min_image_px,
        }
    }

    fn pdfium(&self) -> Result<&Pdfium, Pdf2KbError> {
        self.pdfium.get_or_try_init(|| {
            pdfium_auto::bind_pdfium_silent()
                .map_err(|e| Pdf2KbError::PdfiumBindingFailed(e.to_string()))
        })
    }

    fn open<'a>(
        pdfium: &'a Pdfium,
        path: &Path,
        password: Option<&'a str>,
    ) -> Result<PdfDocument<'a>, Pdf2KbError> {
        pdfium.load_pdf_from_file(path, password).map_err(|e| {
            let err_str = format!("{:?}", e);
            if err_str.contains("Password") || err_str.contains("password") {
                if password.is_some() {
                    Pdf2KbError::WrongPassword {
                        path: path.to_path_buf(),
                    }
                } else {
                    Pdf2KbError::PasswordRequired {
                        path: path.to_path_buf(),
                    }
                }
            } else {
                Pdf2KbError::CorruptPdf {
                    path: path.to_path_buf(),
                    detail: err_str,
                }
            }
        })
    }
}

impl PdfParser for PdfiumParser {
    fn page_count(&self, path: &Path, password: Option<&str>) -> Result<usize, Pdf2KbError> {
        let pdfium = self.pdfium()?;
        let document = Self::open(pdfium, path, password)?;
        let count = document.pages().len() as usize;
        if count == 0 {
            return Err(Pdf2KbError::EmptyDocument {
                path: path.to_path_buf(),
            });
        }
        Ok(count)
    }

    fn parse_page(
        &self,
        path: &Path,
        password: Option<&str>,
        page_number: usize,
    ) -> Result<PageBlob, ParseError> {
        let pdfium = self
            .pdfium()
            .map_err(|e| ParseError::Transient(e.to_string()))?;
        let document =
            Self::open(pdfium, path, password).map_err(|e| ParseError::Transient(e.to_string()))?;
        let index = u16::try_from(page_number.saturating_sub(1))
            .map_err(|_| ParseError::Page(format!("page {page_number} out of range")))?;
        let page = document
            .pages()
            .get(index)
            .map_err(|e| ParseError::Page(format!("{:?}", e)))?;

        let raw = page
            .text()
            .map_err(|e| ParseError::Page(format!("text layer unreadable: {:?}", e)))?
            .all();
        let text = normalise_page_text(&raw);

        let mut bitmaps = Vec::new();
        for object in page.objects().iter() {
            let Some(image_object) = object.as_image_object() else {
                continue;
            };
            match image_object.get_raw_image() {
                Ok(img) if img.width() >= self.min_image_px && img.height() >= self.min_image_px => {
                    match encode_png(&img) {
                        Ok(png) => bitmaps.push(png),
                        Err(e) => debug!("Page {}: image not encodable: {}", page_number, e),
                    }
                }
                Ok(img) => debug!(
                    "Page {}: skipping {}x{} image below size threshold",
                    page_number,
                    img.width(),
                    img.height()
                ),
                Err(e) => debug!("Page {}: image not decodable: {:?}", page_number, e),
            }
        }

        Ok(assemble_page(page_number, text, bitmaps))
    }
}

/// Attach captions to raw page parts. Every media item carries the full page
/// text as its context.
pub fn assemble_page(page_number: usize, text: String, bitmaps: Vec<Vec<u8>>) -> PageBlob {
    let figure_captions = figure_captions(&text);
    let images = bitmaps
        .into_iter()
        .enumerate()
        .map(|(i, png)| ImageBlob {
            png,
            caption: figure_captions.get(i).map(|(_, c)| c.clone()),
            context_text: text.clone(),
        })
        .collect();

    let tables = detect_tables(&text)
        .into_iter()
        .map(|t| TableBlob {
            context_text: text.clone(),
            markdown: t.markdown,
            caption: t.caption,
        })
        .collect();

    PageBlob {
        page_number,
        text,
        images,
        tables,
    }
}

/// CRLF → LF, trailing whitespace per line, outer blank lines removed.
pub fn normalise_page_text(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_matches('\n')
        .to_string()
}

// ── Heuristics ───────────────────────────────────────────────────────────

static RE_FIGURE_CAPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*(?:Figure|Fig\.|FIGURE|图)[ \t]*\d+.*$").unwrap());

static RE_TABLE_CAPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[ \t]*(?:Table|Tab\.|TABLE|表)[ \t]*\d+").unwrap());

static RE_CELL_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\t+|\s{2,}").unwrap());

const MAX_CELL_CHARS: usize = 40;
const MIN_TABLE_ROWS: usize = 3;

/// Figure caption lines with their byte offsets, in reading order.
fn figure_captions(text: &str) -> Vec<(usize, String)> {
    RE_FIGURE_CAPTION
        .find_iter(text)
        .map(|m| (m.start(), m.as_str().trim().to_string()))
        .collect()
}

/// A table found in page text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedTable {
    pub markdown: String,
    pub caption: Option<String>,
    /// Byte offset of the first row in the page text.
    pub offset: usize,
}

fn split_cells(line: &str) -> Vec<String> {
    RE_CELL_SPLIT
        .split(line.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().replace('|', "\\|"))
        .collect()
}

fn row_shape(line: &str) -> Option<usize> {
    let cells = split_cells(line);
    let ok = cells.len() >= 2 && cells.iter().all(|c| c.chars().count() <= MAX_CELL_CHARS);
    ok.then_some(cells.len())
}

/// Find column-aligned runs of lines and render them as GFM tables.
pub fn detect_tables(text: &str) -> Vec<DetectedTable> {
    let mut lines: Vec<(usize, &str)> = Vec::new();
    let mut offset = 0;
    for line in text.split('\n') {
        lines.push((offset, line));
        offset += line.len() + 1;
    }

    let mut tables = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let Some(cols) = row_shape(lines[i].1) else {
            i += 1;
            continue;
        };
        let start = i;
        let mut end = i + 1;
        while end < lines.len() && row_shape(lines[end].1) == Some(cols) {
            end += 1;
        }
        if end - start >= MIN_TABLE_ROWS {
            let rows: Vec<Vec<String>> = lines[start..end].iter().map(|(_, l)| split_cells(l)).collect();
            tables.push(DetectedTable {
                markdown: to_gfm(&rows),
                caption: table_caption(&lines, start, end),
                offset: lines[start].0,
            });
            i = end;
        } else {
            i = start + 1;
        }
    }
    tables
}

fn table_caption(lines: &[(usize, &str)], start: usize, end: usize) -> Option<String> {
    let above = (start.saturating_sub(2)..start).rev();
    let below = end..(end + 2).min(lines.len());
    above
        .chain(below)
        .map(|i| lines[i].1)
        .find(|l| RE_TABLE_CAPTION.is_match(l))
        .map(|l| l.trim().to_string())
}

fn to_gfm(rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    for (i, row) in rows.iter().enumerate() {
        out.push_str("| ");
        out.push_str(&row.join(" | "));
        out.push_str(" |\n");
        if i == 0 {
            out.push('|');
            for _ in row {
                out.push_str(" --- |");
            }
            out.push('\n');
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "Pump performance\n\
Table 2: Rated values\n\
Model    Flow    Head\n\
P-100    12 m3/h    30 m\n\
P-200    25 m3/h    42 m\n\
The pumps above are centrifugal.\n\
Figure 4: Impeller cross-section\n\
End of page.";

    #[test]
    fn detects_aligned_rows_as_table() {
        let tables = detect_tables(PAGE);
        assert_eq!(tables.len(), 1);
        let t = &tables[0];
        assert_eq!(t.caption.as_deref(), Some("Table 2: Rated values"));
        assert_eq!(
            t.markdown,
            "| Model | Flow | Head |\n| --- | --- | --- |\n| P-100 | 12 m3/h | 30 m |\n| P-200 | 25 m3/h | 42 m |"
        );
        assert_eq!(&PAGE[t.offset..t.offset + 5], "Model");
    }

    #[test]
    fn prose_is_not_a_table() {
        let text = "This is a sentence.\nAnother  one with  a double space.\nThird line.";
        assert!(detect_tables(text).is_empty());
    }

    #[test]
    fn captions_attach_to_images_in_order() {
        let blob = assemble_page(7, PAGE.to_string(), vec![vec![1], vec![2]]);
        assert_eq!(blob.page_number, 7);
        assert_eq!(blob.images.len(), 2);
        assert_eq!(
            blob.images[0].caption.as_deref(),
            Some("Figure 4: Impeller cross-section")
        );
        assert_eq!(blob.images[0].context_text, PAGE);
        assert_eq!(blob.images[1].caption, None);
        assert_eq!(blob.tables.len(), 1);
    }

    #[test]
    fn media_context_is_the_whole_page() {
        let mut text = String::from("Figure 1: Valve\n");
        text.push_str(&"torque spec 12 Nm. ".repeat(200));
        text.push_str("\nA    B\nC    D\nE    F");
        let blob = assemble_page(1, text.clone(), vec![vec![1]]);
        assert_eq!(blob.images[0].context_text, text);
        assert_eq!(blob.tables.len(), 1);
        assert_eq!(blob.tables[0].context_text, text);
    }

    #[test]
    fn normalise_trims_lines_and_edges() {
        assert_eq!(normalise_page_text("\r\n a  \r\nb\t\n\n"), " a\nb");
    }

    #[test]
    fn pipes_in_cells_are_escaped() {
        let text = "a|b    c    d\ne    f    g\nh    i    j";
        let t = detect_tables(text);
        assert_eq!(t.len(), 1);
        assert!(t[0].markdown.starts_with("| a\\|b | c | d |"));
    }
}
