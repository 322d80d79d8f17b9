//! Document-level metadata from the leading blocks of a parsed document.
//!
//! Every field is optional. Nothing here fails: a PDF with no recognisable
//! title falls back to its file name, and one without a year simply has none.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::models::{BlockKind, ParsedDocument};

static ACT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][A-Za-z&'-]*(?:\s+(?:[A-Z][A-Za-z&'()-]*|and|of|the|for|on))*\s+Act)\b(?:\s+(\d{4}))?")
        .expect("act name regex is valid")
});
static YA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:YA|Year\s+of\s+Assessment)\s*(\d{4})\b").expect("YA regex is valid")
});
static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19[4-9]\d|20\d{2})\b").expect("year regex is valid"));
static FILENAME_YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(199\d|20[0-3]\d)").expect("file year regex is valid"));
static LAST_UPDATED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:last\s+)?(?:updated|revised|published|issued)\s*(?:on|:)?\s*(\d{1,2}\s+[A-Za-z]+\s+\d{4}|[A-Za-z]+\s+\d{4}|\d{4}-\d{2}-\d{2})",
    )
    .expect("updated regex is valid")
});
static SUPERSEDES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bsupersedes?\s+(?:the\s+)?([^.\n]{5,120})").expect("supersedes regex is valid")
});
static CIRCULAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bcircular\s+no\.?\s*([A-Z0-9][A-Z0-9/.-]*)").expect("circular regex is valid")
});
static FORM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:Form\s+([A-Z]{1,4}(?:-[A-Z])?\d{0,3}[A-Z]?)\b|(IR8A|IR8S|IR21|GST F5|GST F7))")
        .expect("form regex is valid")
});
static BOILERPLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:page\s+\d+|\d+$|version\s|informal consolidation|singapore statutes online|table of contents|contents$|arrangement of sections|published by)")
        .expect("boilerplate regex is valid")
});

/// Ordered tax category patterns; a document may match several.
static CATEGORY_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("income", r"(?i)\b(?:income tax|chargeable income|employment income)\b"),
        ("gst", r"(?i)\b(?:goods and services tax|GST)\b"),
        ("property", r"(?i)\b(?:property tax|annual value)\b"),
        ("corporate", r"(?i)\b(?:corporate income tax|companies|company)\b"),
        ("stamp_duty", r"(?i)\b(?:stamp duty|ABSD|BSD)\b"),
        ("withholding", r"(?i)\b(?:withholding tax|non-resident)\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("category regex is valid")))
    .collect()
});

const LEADING_ARTICLES: &[&str] = &[
    "A", "An", "The", "This", "That", "Such", "Said", "Under", "In", "Of",
];

/// Signals extracted from a document's opening blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedMetadata {
    pub title: Option<String>,
    pub act_name: Option<String>,
    pub year: Option<i32>,
    pub years_of_assessment: Vec<i32>,
    pub circular_number: Option<String>,
    pub form_id: Option<String>,
    pub last_updated: Option<String>,
    pub supersedes: Option<String>,
    pub tax_categories: Vec<String>,
}

impl ExtractedMetadata {
    pub fn title_or_unknown(&self) -> String {
        self.title.clone().unwrap_or_else(|| "unknown".to_string())
    }
}

pub fn extract_metadata(
    doc: &ParsedDocument,
    file_name: &str,
    sample_blocks: usize,
) -> ExtractedMetadata {
    let sample = doc.sample_text(sample_blocks);

    let title = find_title(doc, sample_blocks).or_else(|| title_from_file_name(file_name));
    let (act_name, act_year) = find_act_name(&sample);

    let mut years_of_assessment: Vec<i32> = YA_RE
        .captures_iter(&sample)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect();
    years_of_assessment.sort_unstable();
    years_of_assessment.dedup();

    let year = act_year
        .or_else(|| years_of_assessment.first().copied())
        .or_else(|| first_year(&sample))
        .or_else(|| {
            FILENAME_YEAR_RE
                .captures(file_name)
                .and_then(|c| c.get(1)?.as_str().parse().ok())
        });

    let tax_categories = CATEGORY_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(&sample))
        .map(|(name, _)| name.to_string())
        .collect();

    ExtractedMetadata {
        title,
        act_name,
        year,
        years_of_assessment,
        circular_number: capture(&CIRCULAR_RE, &sample),
        form_id: FORM_RE.captures(&sample).and_then(|c| {
            c.get(1)
                .or_else(|| c.get(2))
                .map(|m| m.as_str().to_string())
        }),
        last_updated: capture(&LAST_UPDATED_RE, &sample),
        supersedes: capture(&SUPERSEDES_RE, &sample).map(|s| s.trim().to_string()),
        tax_categories,
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// First heading-like line that is not page furniture. Headings win over
/// paragraphs; a short opening paragraph is the fallback.
fn find_title(doc: &ParsedDocument, sample_blocks: usize) -> Option<String> {
    let usable = |text: &str| {
        let len = text.chars().count();
        (5..=150).contains(&len)
            && !BOILERPLATE_RE.is_match(text)
            && text.chars().any(|c| c.is_alphabetic())
    };

    let sample = doc.blocks.iter().take(sample_blocks);
    sample
        .clone()
        .find(|b| b.kind == BlockKind::Heading && usable(&b.text))
        .or_else(|| sample.clone().find(|b| usable(&b.text)))
        .map(|b| b.text.clone())
}

fn title_from_file_name(file_name: &str) -> Option<String> {
    let stem = Path::new(file_name).file_stem()?.to_string_lossy().to_string();
    let words: Vec<String> = stem
        .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect();
    (!words.is_empty()).then(|| words.join(" "))
}

fn find_act_name(sample: &str) -> (Option<String>, Option<i32>) {
    for caps in ACT_NAME_RE.captures_iter(sample) {
        let Some(name) = caps.get(1) else { continue };
        let mut words: Vec<&str> = name.as_str().split_whitespace().collect();
        while words.len() > 1 && LEADING_ARTICLES.contains(&words[0]) {
            words.remove(0);
        }
        // Need at least one word before "Act".
        if words.len() < 2 {
            continue;
        }
        let year = caps.get(2).and_then(|y| y.as_str().parse().ok());
        let name = match year {
            Some(y) => format!("{} {}", words.join(" "), y),
            None => words.join(" "),
        };
        return (Some(name), year);
    }
    (None, None)
}

fn first_year(sample: &str) -> Option<i32> {
    YEAR_RE
        .captures_iter(sample)
        .filter_map(|c| c.get(1)?.as_str().parse::<i32>().ok())
        .find(|y| (1947..=2100).contains(y))
}
