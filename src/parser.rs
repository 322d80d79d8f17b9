//! Layout-aware PDF parsing.
//!
//! Turns a PDF byte stream into an ordered list of [`Block`]s tagged as
//! heading, paragraph or table row, each with its 1-based page number.
//!
//! Text comes from `pdf-extract`, one string per page. Each page is then:
//!
//! 1. **Reflowed** when it looks like two-column legal text (a consistent
//!    whitespace gutter on most lines): the left column is read top to
//!    bottom before the right one.
//! 2. **Segmented** line by line. Headings (`PART IV`, `Chapter 3`,
//!    `10. Charge of income tax`, short upper-case lines) and table rows are
//!    emitted as their own blocks. Clause markers such as `(1)`, `(a)` or
//!    `10.` always open a new paragraph, so clause numbering survives even
//!    when the extractor glues lines together.
//!
//! Parsing is CPU-bound and synchronous; the batch processor runs it on the
//! blocking pool under a timeout.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::ParseError;
use crate::models::{Block, BlockKind, ParsedDocument};

static PART_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:PART|Part|CHAPTER|Chapter|DIVISION|Division|SCHEDULE|Schedule)\s+[IVXLC0-9]+[A-Z]?\b")
        .expect("part heading regex is valid")
});
static NUMBERED_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+(?:\.\d+)*[A-Z]?\.?\s+[A-Z][A-Za-z0-9 ,'()&/-]{2,90}$")
        .expect("numbered title regex is valid")
});
static CLAUSE_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\(\d+[A-Z]?\)|\([a-z]{1,4}\)|\d+[A-Z]?\.(?:\s|—|-)|\d+[)]\s|[•●▪*-]\s)")
        .expect("clause regex is valid")
});
static MONEY_OR_PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:S?\$\s?\d[\d,]*(?:\.\d+)?|\d+(?:\.\d+)?\s?%)").expect("amount regex is valid")
});
static WIDE_GAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\S(\s{3,})\S").expect("gap regex is valid"));

/// Minimum gutter width (in spaces) separating two text columns.
const GUTTER_MIN: usize = 4;

/// Parse a PDF held in memory.
pub fn parse_pdf(bytes: &[u8]) -> Result<ParsedDocument, ParseError> {
    // pdf-extract panics on some malformed inputs; treat that as unreadable.
    let extracted = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes))
        .map_err(|_| ParseError::Invalid("PDF extractor aborted".to_string()))?;
    let pages = extracted.map_err(|e| ParseError::Invalid(e.to_string()))?;
    parse_pages(&pages)
}

/// Segment already-extracted page texts into blocks.
pub fn parse_pages(pages: &[String]) -> Result<ParsedDocument, ParseError> {
    let mut blocks = Vec::new();
    for (i, page) in pages.iter().enumerate() {
        let lines = reflow_columns(page);
        segment_page((i + 1) as u32, &lines, &mut blocks);
    }

    if blocks.is_empty() {
        return Err(ParseError::NoText);
    }

    Ok(ParsedDocument {
        page_count: pages.len() as u32,
        blocks,
    })
}

/// Reorder a two-column page into reading order. Single-column pages are
/// returned line for line.
fn reflow_columns(page: &str) -> Vec<String> {
    let lines: Vec<&str> = page.lines().map(|l| l.trim_end()).collect();
    let Some(gutter) = detect_gutter(&lines) else {
        return lines.iter().map(|l| l.to_string()).collect();
    };

    let mut left = Vec::with_capacity(lines.len());
    let mut right = Vec::with_capacity(lines.len());
    for line in &lines {
        let chars: Vec<char> = line.chars().collect();
        if chars.len() <= gutter {
            left.push(line.trim().to_string());
            continue;
        }
        let (l, r) = chars.split_at(gutter);
        let l: String = l.iter().collect();
        let r: String = r.iter().collect();
        if l.trim().is_empty() {
            right.push(r.trim().to_string());
        } else if l.ends_with(' ') || r.starts_with(' ') {
            left.push(l.trim().to_string());
            right.push(r.trim().to_string());
        } else {
            // A word crosses the gutter position: spanning line, keep whole.
            left.push(line.trim().to_string());
        }
    }

    left.push(String::new());
    left.extend(right);
    left
}

/// Find the character column where a right-hand text column starts.
///
/// Requires at least four lines, 60% of non-empty lines split at the same
/// column (±2), and prose (several words) on both sides.
fn detect_gutter(lines: &[&str]) -> Option<usize> {
    let non_empty: Vec<&str> = lines.iter().copied().filter(|l| !l.trim().is_empty()).collect();
    if non_empty.len() < 4 {
        return None;
    }

    let mut starts: Vec<usize> = Vec::new();
    for line in &non_empty {
        let gaps: Vec<_> = WIDE_GAP_RE.captures_iter(line).collect();
        if gaps.len() != 1 {
            continue;
        }
        let Some(gap) = gaps[0].get(1) else { continue };
        if gap.as_str().len() < GUTTER_MIN {
            continue;
        }
        let (lhs, rhs) = (&line[..gap.start()], &line[gap.end()..]);
        if lhs.split_whitespace().count() < 3 || rhs.split_whitespace().count() < 3 {
            continue;
        }
        starts.push(line[..gap.end()].chars().count());
    }

    if starts.is_empty() {
        return None;
    }
    starts.sort_unstable();
    let median = starts[starts.len() / 2];
    let aligned = starts.iter().filter(|s| s.abs_diff(median) <= 2).count();
    if aligned * 10 < non_empty.len() * 6 {
        return None;
    }
    // Split just before the earliest aligned right-column start.
    starts
        .iter()
        .copied()
        .filter(|s| s.abs_diff(median) <= 2)
        .min()
}

fn segment_page(page: u32, lines: &[String], blocks: &mut Vec<Block>) {
    let mut paragraph = String::new();

    let flush = |paragraph: &mut String, blocks: &mut Vec<Block>| {
        let text = paragraph.trim();
        if !text.is_empty() {
            blocks.push(Block {
                page,
                kind: BlockKind::Paragraph,
                text: text.to_string(),
            });
        }
        paragraph.clear();
    };

    for raw in lines {
        let line = raw.trim();
        if line.is_empty() {
            flush(&mut paragraph, blocks);
            continue;
        }

        if is_heading(line) {
            flush(&mut paragraph, blocks);
            blocks.push(Block {
                page,
                kind: BlockKind::Heading,
                text: collapse_spaces(line),
            });
            continue;
        }

        if let Some(row) = table_row(line) {
            flush(&mut paragraph, blocks);
            blocks.push(Block {
                page,
                kind: BlockKind::TableRow,
                text: row,
            });
            continue;
        }

        if CLAUSE_START_RE.is_match(line) {
            flush(&mut paragraph, blocks);
        }
        append_line(&mut paragraph, line);
    }
    flush(&mut paragraph, blocks);
}

/// Join a wrapped line onto a paragraph, re-joining hyphenated words.
fn append_line(paragraph: &mut String, line: &str) {
    let line = collapse_spaces(line);
    if paragraph.is_empty() {
        paragraph.push_str(&line);
        return;
    }
    let hyphenated = paragraph.ends_with('-')
        && paragraph
            .chars()
            .rev()
            .nth(1)
            .is_some_and(|c| c.is_alphabetic())
        && line.chars().next().is_some_and(|c| c.is_lowercase());
    if hyphenated {
        paragraph.pop();
    } else {
        paragraph.push(' ');
    }
    paragraph.push_str(&line);
}

fn collapse_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn is_heading(line: &str) -> bool {
    if line.chars().count() > 100 {
        return false;
    }
    if PART_HEADING_RE.is_match(line) {
        return true;
    }
    let ends_like_sentence = line.ends_with('.') || line.ends_with(';') || line.ends_with(',');
    if !ends_like_sentence
        && NUMBERED_TITLE_RE.is_match(line)
        && line.split_whitespace().count() <= 12
    {
        return true;
    }
    is_upper_case_title(line)
}

fn is_upper_case_title(line: &str) -> bool {
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 4 || line.chars().count() > 80 {
        return false;
    }
    if MONEY_OR_PERCENT_RE.is_match(line) {
        return false;
    }
    letters.iter().all(|c| c.is_uppercase())
}

const MAX_CELL_WORDS: usize = 6;

/// Recognise a table row and normalise its cells to `a | b | c`.
fn table_row(line: &str) -> Option<String> {
    if line.matches('|').count() >= 2 {
        let cells: Vec<&str> = line
            .split('|')
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect();
        return (!cells.is_empty()).then(|| cells.join(" | "));
    }

    // Justified prose also has double-space gaps, so whitespace cells only
    // count as a row when the cells are short and one of them is purely a
    // figure (every token carries a digit).
    let cells: Vec<&str> = line
        .split("  ")
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect();
    let short_cells = cells.iter().all(|c| c.split_whitespace().count() <= MAX_CELL_WORDS);
    let figure_cell = cells.iter().any(|c| {
        c.split_whitespace()
            .all(|t| t.chars().any(|ch| ch.is_ascii_digit()))
    });
    if cells.len() >= 3 && short_cells && figure_cell {
        return Some(cells.join(" | "));
    }

    let amounts = MONEY_OR_PERCENT_RE.find_iter(line).count();
    let words = line.split_whitespace().count();
    let sentence = line.ends_with('.') || line.ends_with(';');
    if amounts >= 2 && words <= 8 && !sentence {
        return Some(collapse_spaces(line));
    }
    None
}
