//! Structure-aware chunking of parsed documents.
//!
//! The chunker works on the parser's blocks rather than raw text:
//!
//! - A heading opens a section. Headings that follow each other with no body
//!   in between are chained (`PART III / 10. Charge of income tax`, last two
//!   kept) and the chain is prefixed to every chunk of the section.
//! - Paragraph blocks (one clause each) and runs of table rows are the
//!   packing units. Units are packed greedily up to the size budget, so
//!   chunk boundaries fall between clauses.
//! - A unit larger than the budget is split at sentence boundaries; a single
//!   sentence larger than the budget is split at whitespace.
//! - A section whose body is shorter than `min_chars` is folded into the
//!   following section instead of producing a fragment.
//! - Consecutive chunks of one section carry a bounded overlap: the tail of
//!   the previous chunk's body, cut at a word boundary.
//!
//! Sizes are measured in bytes of UTF-8 text. A chunk's full text (heading
//! prefix, overlap and body) never exceeds `max_chars`.
//!
//! Chunk IDs derive from the document fingerprint and chunk index, so the
//! same input always yields identical chunks.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::{BlockKind, Chunk, ParsedDocument};

#[derive(Debug, Clone, Copy)]
struct Unit {
    start: usize,
    end: usize,
    page_start: u32,
    page_end: u32,
}

impl Unit {
    fn len(&self) -> usize {
        self.end - self.start
    }

    fn join(&self, other: &Unit) -> Unit {
        Unit {
            start: self.start,
            end: other.end,
            page_start: self.page_start.min(other.page_start),
            page_end: self.page_end.max(other.page_end),
        }
    }
}

#[derive(Debug)]
struct Section {
    heading: Option<String>,
    units: Vec<Unit>,
}

/// The document's parsed text: block texts separated by blank lines, with
/// the byte span of every block.
pub fn document_text(doc: &ParsedDocument) -> (String, Vec<(usize, usize)>) {
    let mut text = String::new();
    let mut spans = Vec::with_capacity(doc.blocks.len());
    for (i, block) in doc.blocks.iter().enumerate() {
        if i > 0 {
            text.push_str("\n\n");
        }
        let start = text.len();
        text.push_str(&block.text);
        spans.push((start, text.len()));
    }
    (text, spans)
}

/// Split a parsed document into ordered chunks.
pub fn chunk_document(
    document_id: &str,
    fingerprint: &str,
    doc: &ParsedDocument,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let (text, spans) = document_text(doc);
    let sections = build_sections(doc, &spans, config);

    let mut chunks = Vec::new();
    for section in &sections {
        let prefix = section
            .heading
            .as_deref()
            .map(|h| truncate_at_boundary(h, config.max_chars / 4));
        let prefix_len = prefix.as_ref().map(|p| p.len() + 1).unwrap_or(0);
        let overlap_reserve = if config.overlap_chars > 0 {
            config.overlap_chars + 1
        } else {
            0
        };
        let budget = config
            .max_chars
            .saturating_sub(prefix_len + overlap_reserve)
            .max(1);

        let units = split_oversized(&text, &section.units, budget);
        let groups = pack(&units, budget);

        for (k, group) in groups.iter().enumerate() {
            let mut out = String::with_capacity(config.max_chars);
            if let Some(p) = &prefix {
                out.push_str(p);
                out.push('\n');
            }
            if k > 0 && config.overlap_chars > 0 {
                let prev = &groups[k - 1];
                let tail = overlap_tail(&text[prev.start..prev.end], config.overlap_chars);
                if !tail.is_empty() {
                    out.push_str(tail);
                    out.push(' ');
                }
            }
            out.push_str(&text[group.start..group.end]);

            let index = chunks.len() as i64;
            chunks.push(make_chunk(
                document_id,
                fingerprint,
                index,
                out,
                group,
                section.heading.clone(),
            ));
        }
    }

    chunks
}

fn build_sections(
    doc: &ParsedDocument,
    spans: &[(usize, usize)],
    config: &ChunkingConfig,
) -> Vec<Section> {
    let has_body = doc.blocks.iter().any(|b| b.kind != BlockKind::Heading);
    let table_run_limit = config.max_chars / 3;

    let mut sections: Vec<Section> = Vec::new();
    let mut current = Section {
        heading: None,
        units: Vec::new(),
    };
    let mut in_table = false;

    for (block, &(start, end)) in doc.blocks.iter().zip(spans) {
        let unit = Unit {
            start,
            end,
            page_start: block.page,
            page_end: block.page,
        };

        if block.kind == BlockKind::Heading && has_body {
            in_table = false;
            if current.units.is_empty() {
                current.heading = Some(chain_heading(current.heading.take(), &block.text));
            } else {
                let heading = Some(block.text.clone());
                sections.push(std::mem::replace(
                    &mut current,
                    Section {
                        heading,
                        units: Vec::new(),
                    },
                ));
            }
            continue;
        }

        let is_row = block.kind == BlockKind::TableRow;
        if is_row && in_table {
            if let Some(last) = current.units.last_mut() {
                if unit.end - last.start <= table_run_limit {
                    *last = last.join(&unit);
                    continue;
                }
            }
        }
        in_table = is_row;
        current.units.push(unit);
    }
    if !current.units.is_empty() {
        sections.push(current);
    }

    fold_small_sections(sections, config.min_chars)
}

fn chain_heading(previous: Option<String>, next: &str) -> String {
    match previous {
        None => next.to_string(),
        Some(prev) => {
            let last = prev.rsplit(" / ").next().unwrap_or(&prev);
            format!("{} / {}", last, next)
        }
    }
}

/// Fold sections whose body is shorter than `min_chars` into the next one.
fn fold_small_sections(sections: Vec<Section>, min_chars: usize) -> Vec<Section> {
    let mut out: Vec<Section> = Vec::with_capacity(sections.len());
    let mut carry: Option<Section> = None;
    let total = sections.len();

    for (i, mut section) in sections.into_iter().enumerate() {
        if let Some(prev) = carry.take() {
            section.heading = match (prev.heading, section.heading) {
                (Some(a), Some(b)) => Some(format!("{} / {}", a, b)),
                (a, b) => a.or(b),
            };
            let mut units = prev.units;
            units.extend(section.units);
            section.units = units;
        }

        let body: usize = match (section.units.first(), section.units.last()) {
            (Some(first), Some(last)) => last.end - first.start,
            _ => 0,
        };
        if body < min_chars && i + 1 < total {
            carry = Some(section);
        } else {
            out.push(section);
        }
    }
    out
}

fn split_oversized(text: &str, units: &[Unit], budget: usize) -> Vec<Unit> {
    let mut out = Vec::with_capacity(units.len());
    for unit in units {
        if unit.len() <= budget {
            out.push(*unit);
            continue;
        }

        let mut pieces: Vec<(usize, usize)> = Vec::new();
        for (s, e) in sentence_ranges(text, unit.start, unit.end) {
            if e - s > budget {
                pieces.extend(word_ranges(text, s, e, budget));
            } else {
                pieces.push((s, e));
            }
        }

        // Re-pack sentences so each sub-unit is as full as the budget allows.
        let mut current: Option<(usize, usize)> = None;
        for (s, e) in pieces {
            current = match current {
                Some((cs, _)) if e - cs <= budget => Some((cs, e)),
                Some(done) => {
                    out.push(Unit {
                        start: done.0,
                        end: done.1,
                        ..*unit
                    });
                    Some((s, e))
                }
                None => Some((s, e)),
            };
        }
        if let Some((s, e)) = current {
            out.push(Unit {
                start: s,
                end: e,
                ..*unit
            });
        }
    }
    out
}

/// Sentence spans inside `text[start..end]`. A sentence ends at `.`, `;`,
/// `?` or `!` followed by a space and an upper-case letter or `(`.
fn sentence_ranges(text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let slice = &text[start..end];
    let chars: Vec<(usize, char)> = slice.char_indices().collect();
    let mut out = Vec::new();
    let mut sentence_start = 0;

    for i in 0..chars.len().saturating_sub(2) {
        let (_, c) = chars[i];
        if !matches!(c, '.' | ';' | '?' | '!') {
            continue;
        }
        let (space_pos, space) = chars[i + 1];
        let (next_pos, next) = chars[i + 2];
        if space == ' ' && (next.is_uppercase() || next == '(') {
            out.push((start + sentence_start, start + space_pos));
            sentence_start = next_pos;
        }
    }
    if sentence_start < slice.len() {
        out.push((start + sentence_start, end));
    }
    out
}

/// Greedy whitespace split of `text[start..end]` into spans of at most
/// `budget` bytes. Words longer than the budget are cut.
fn word_ranges(text: &str, start: usize, end: usize, budget: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut cursor = start;
    while cursor < end {
        if end - cursor <= budget {
            out.push((cursor, end));
            break;
        }
        let mut limit = cursor + budget;
        while !text.is_char_boundary(limit) {
            limit -= 1;
        }
        match text[cursor..limit].rfind(char::is_whitespace) {
            Some(p) if p > 0 => {
                out.push((cursor, cursor + p));
                cursor += p + 1;
            }
            _ => {
                if limit == cursor {
                    // Budget smaller than one character; take the character.
                    limit = cursor + text[cursor..].chars().next().map_or(1, char::len_utf8);
                }
                out.push((cursor, limit));
                cursor = limit;
            }
        }
    }
    out
}

fn pack(units: &[Unit], budget: usize) -> Vec<Unit> {
    let mut groups: Vec<Unit> = Vec::new();
    for unit in units {
        match groups.last_mut() {
            Some(last) if unit.end - last.start <= budget => *last = last.join(unit),
            _ => groups.push(*unit),
        }
    }
    groups
}

/// Last `max` bytes of `body`, starting at a word boundary.
fn overlap_tail(body: &str, max: usize) -> &str {
    if body.len() <= max {
        return "";
    }
    let mut from = body.len() - max;
    while !body.is_char_boundary(from) {
        from += 1;
    }
    match body[from..].find(char::is_whitespace) {
        Some(p) => body[from + p..].trim_start(),
        None => "",
    }
}

fn truncate_at_boundary(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].trim_end().to_string()
}

fn make_chunk(
    document_id: &str,
    fingerprint: &str,
    index: i64,
    text: String,
    group: &Unit,
    section: Option<String>,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let short = &fingerprint[..fingerprint.len().min(16)];
    Chunk {
        id: format!("{}-{}-{:04}", document_id, short, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        text,
        span_start: group.start,
        span_end: group.end,
        page_start: group.page_start,
        page_end: group.page_end,
        section,
        hash,
    }
}
