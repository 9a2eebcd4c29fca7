//! Deterministic paragraph/list splitter used when LLM chunking fails.
//!
//! Pieces are contiguous byte ranges that tile the input exactly:
//! concatenating `&text[p.start..p.end]` over all pieces reproduces `text`.
//! Boundaries are blank lines and list-item starts; pieces longer than the
//! configured maximum are cut at sentence ends, or at a char boundary when a
//! sentence runs past the limit.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\n\s*").unwrap());

static RE_LIST_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:[-*•‣◦▪]|\d{1,3}[.)]|[a-zA-Z][.)])[ \t]+\S").unwrap()
});

static RE_SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?。！？][)\]'\x22]?\s+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceKind {
    Paragraph,
    ListItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub start: usize,
    pub end: usize,
    pub kind: PieceKind,
}

/// Split `text` into pieces of at most `max_bytes` (unless a single char is
/// longer). Returns no pieces for empty input.
pub fn split(text: &str, max_bytes: usize) -> Vec<Piece> {
    if text.is_empty() {
        return Vec::new();
    }
    let max_bytes = max_bytes.max(1);

    let mut bounds: Vec<usize> = vec![0, text.len()];
    bounds.extend(RE_PARAGRAPH_BREAK.find_iter(text).map(|m| m.end()));
    bounds.extend(RE_LIST_START.find_iter(text).map(|m| m.start()));
    bounds.sort_unstable();
    bounds.dedup();

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for pair in bounds.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        if start == end {
            continue;
        }
        let blank = text[start..end].trim().is_empty();
        match ranges.last_mut() {
            Some(last) if blank => last.1 = end,
            _ => ranges.push((start, end)),
        }
    }
    // A leading whitespace-only range merges forward.
    if ranges.len() > 1 && text[ranges[0].0..ranges[0].1].trim().is_empty() {
        let first = ranges.remove(0);
        ranges[0].0 = first.0;
    }

    let mut pieces = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        let kind = if RE_LIST_START
            .find(&text[start..end])
            .is_some_and(|m| m.start() == 0)
        {
            PieceKind::ListItem
        } else {
            PieceKind::Paragraph
        };
        for (s, e) in cut_long(text, start, end, max_bytes) {
            pieces.push(Piece {
                start: s,
                end: e,
                kind: if s == start { kind } else { PieceKind::Paragraph },
            });
        }
    }
    pieces
}

/// Cut `text[start..end]` into ranges of at most `max_bytes`.
fn cut_long(text: &str, start: usize, end: usize, max_bytes: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut pos = start;
    while end - pos > max_bytes {
        let limit = floor_char_boundary(text, pos + max_bytes);
        let window = &text[pos..limit];
        let sentence_cut = RE_SENTENCE_END
            .find_iter(window)
            .map(|m| pos + m.end())
            .filter(|c| *c > pos && *c < end)
            .last();
        let cut = match sentence_cut {
            Some(c) => c,
            None if limit > pos => limit,
            // A single char wider than the limit.
            None => ceil_char_boundary(text, pos + 1),
        };
        out.push((pos, cut));
        pos = cut;
    }
    if pos < end {
        out.push((pos, end));
    }
    out
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i.min(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rebuild(text: &str, pieces: &[Piece]) -> String {
        pieces.iter().map(|p| &text[p.start..p.end]).collect()
    }

    #[test]
    fn paragraphs_and_lists_tile_the_input() {
        let text = "Intro paragraph\nwrapped line.\n\n- first item\n- second item\n\nClosing words.";
        let pieces = split(text, 1000);
        assert_eq!(rebuild(text, &pieces), text);
        let kinds: Vec<PieceKind> = pieces.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PieceKind::Paragraph,
                PieceKind::ListItem,
                PieceKind::ListItem,
                PieceKind::Paragraph
            ]
        );
        assert!(text[pieces[1].start..pieces[1].end].starts_with("- first item"));
    }

    #[test]
    fn numbered_items_are_list_items() {
        let text = "Steps:\n1. Open valve\n2. Start pump";
        let pieces = split(text, 1000);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[1].kind, PieceKind::ListItem);
        assert_eq!(rebuild(text, &pieces), text);
    }

    #[test]
    fn long_paragraphs_cut_at_sentence_ends() {
        let text = "One sentence here. Another sentence there. A third one follows.";
        let pieces = split(text, 25);
        assert_eq!(rebuild(text, &pieces), text);
        assert!(pieces.len() >= 3);
        assert_eq!(&text[pieces[0].start..pieces[0].end], "One sentence here. ");
        assert!(pieces.iter().all(|p| p.end - p.start <= 25));
    }

    #[test]
    fn unbroken_text_cuts_on_char_boundaries() {
        let text = "ééééééééééééééééééééé";
        let pieces = split(text, 5);
        assert_eq!(rebuild(text, &pieces), text);
        assert!(pieces.iter().all(|p| text.is_char_boundary(p.start)));
    }

    #[test]
    fn splitting_is_deterministic() {
        let text = "A.\n\nB.\n\n* c\n* d\n\nE f g h. I j k l.";
        assert_eq!(split(text, 8), split(text, 8));
        assert!(split("", 10).is_empty());
    }
}
