//! Query understanding: intent, sub-questions, expansion and fact keys.
//!
//! [`classify_and_expand`] is pure and deterministic. It never rewrites the
//! question itself; expansion only adds retrieval terms.
//!
//! Intent priority is multi-part, then procedural, then factual-numeric,
//! then conceptual. A question resolves to a structured-fact key only
//! through [`FACT_RULES`], an ordered table where every term group must
//! match; the first matching rule wins.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::error::QueryError;
use crate::models::QueryIntent;

const STOPWORDS: &[&str] = &[
    "a", "about", "am", "an", "and", "any", "are", "as", "at", "be", "been", "by", "can", "could",
    "did", "do", "does", "for", "from", "had", "has", "have", "how", "i", "if", "in", "into", "is",
    "it", "its", "many", "may", "me", "much", "my", "no", "not", "of", "on", "or", "our", "over",
    "per", "shall", "should", "so", "than", "that", "the", "their", "then", "there", "these",
    "this", "those", "to", "under", "was", "we", "were", "what", "when", "where", "which", "who",
    "whom", "why", "will", "with", "would", "you", "your",
];

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("gst", "goods and services tax"),
    ("ya", "year of assessment"),
    ("iras", "inland revenue authority of singapore"),
    ("cpf", "central provident fund"),
    ("srs", "supplementary retirement scheme"),
    ("absd", "additional buyer stamp duty"),
    ("bsd", "buyer stamp duty"),
    ("noa", "notice of assessment"),
    ("cit", "corporate income tax"),
];

const SYNONYMS: &[(&str, &[&str])] = &[
    ("rate", &["tax rate", "percentage"]),
    ("deadline", &["due date", "filing date"]),
    ("relief", &["rebate", "deduction"]),
    ("deduction", &["deductible", "allowable expense"]),
    ("income", &["earnings", "remuneration"]),
    ("salary", &["employment income"]),
    ("company", &["corporate"]),
    ("resident", &["tax resident"]),
    ("foreign", &["overseas"]),
    ("property", &["annual value"]),
    ("submit", &["file"]),
    ("file", &["filing", "submit"]),
    ("register", &["registration"]),
    ("exempt", &["exemption"]),
    ("maximum", &["cap", "limit"]),
];

static SPLIT_AND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+and\s+(what|when|where|which|who|how|why|is|are|do|does|can)\b")
        .expect("split regex is valid")
});
static PROCEDURAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:how (?:do|can|should|does|to)|steps?|procedure|process for|apply for|register for|what should i do)\b")
        .expect("procedural regex is valid")
});
static NUMERIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:rates?|how much|how many|amount|threshold|percentage|percent|limit|cap|deadline|due date|when is|how long|calculate|compute)\b|\d|%|\$")
        .expect("numeric regex is valid")
});
static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(20\d{2})\b").expect("year regex is valid"));

static CATEGORIES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("income", r"(?i)\b(?:income tax|personal tax|salary|employment)\b"),
        ("gst", r"(?i)\b(?:gst|goods and services)\b"),
        ("property", r"(?i)\b(?:property tax|annual value|owner[- ]occupied)\b"),
        ("corporate", r"(?i)\b(?:corporate|company|companies)\b"),
        ("stamp_duty", r"(?i)\b(?:stamp duty|absd|bsd)\b"),
        ("withholding", r"(?i)\b(?:withholding|non-?resident)\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("category regex is valid")))
    .collect()
});

const ENTITY_TERMS: &[&str] = &[
    "gst", "income tax", "property tax", "stamp duty", "corporate", "withholding",
    "nonresident", "resident", "relief", "rebate", "deduction", "cpf", "iras", "director",
    "dividend", "rental", "form",
];

/// A structured-fact key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FactKey {
    pub topic: &'static str,
    pub subkey: &'static str,
}

pub struct FactRule {
    pub key: FactKey,
    /// Every group must have at least one term present.
    pub groups: &'static [&'static [&'static str]],
}

const fn rule(
    topic: &'static str,
    subkey: &'static str,
    groups: &'static [&'static [&'static str]],
) -> FactRule {
    FactRule {
        key: FactKey { topic, subkey },
        groups,
    }
}

/// Terms match whole words of the lowercased question, with "non-resident"
/// folded to "nonresident". Plural forms are listed explicitly.
pub const FACT_RULES: &[FactRule] = &[
    rule(
        "non_resident_rate",
        "director_fee",
        &[&["nonresident", "nonresidents"], &["director", "directors"]],
    ),
    rule(
        "non_resident_rate",
        "employment_income",
        &[&["nonresident", "nonresidents"], &["employment", "salary", "wage", "wages", "employed"]],
    ),
    rule(
        "non_resident_rate",
        "other_income",
        &[&["nonresident", "nonresidents"], &["rate", "rates", "tax", "percent"]],
    ),
    rule(
        "gst",
        "registration_threshold",
        &[&["gst", "goods and services tax"], &["threshold", "register", "registration"]],
    ),
    rule(
        "gst",
        "standard_rate",
        &[&["gst", "goods and services tax"], &["rate", "rates", "percent", "how much"]],
    ),
    rule(
        "filing_deadline",
        "corporate_form_c",
        &[
            &["deadline", "due", "when"],
            &["corporate", "company", "form c"],
            &["file", "filing", "submit"],
        ],
    ),
    rule(
        "filing_deadline",
        "individual_efiling",
        &[&["deadline", "due date", "when"], &["file", "filing", "submit", "return"]],
    ),
    rule(
        "corporate_rate",
        "standard",
        &[&["corporate", "company"], &["rate", "rates", "tax rate"]],
    ),
    rule("resident_top_rate", "rate", &[&["top", "highest", "maximum"], &["rate"]]),
    rule("relief", "earned_income", &[&["earned income"], &["relief"]]),
    rule("relief", "personal_cap", &[&["relief", "reliefs"], &["cap", "limit"]]),
    rule("residency", "min_days", &[&["resident", "residency"], &["days"]]),
];

#[derive(Debug, Clone, Serialize)]
pub struct EnhancedQuery {
    pub original: String,
    pub intent: QueryIntent,
    pub keywords: Vec<String>,
    /// Keywords followed by abbreviation and synonym expansions, deduplicated.
    pub expanded_terms: Vec<String>,
    /// Independent sub-questions in original order; one entry for a simple
    /// question.
    pub sub_questions: Vec<String>,
    pub fact_key: Option<FactKey>,
    /// Last 20xx year mentioned.
    pub as_of_year: Option<i32>,
    pub categories: Vec<String>,
    pub confidence: f64,
}

impl EnhancedQuery {
    /// Suggested number of chunks to retrieve for this intent.
    pub fn retrieval_depth(&self) -> usize {
        match self.intent {
            QueryIntent::FactualNumeric => 7,
            QueryIntent::Procedural => 8,
            QueryIntent::Conceptual | QueryIntent::MultiPart => 5,
        }
    }
}

pub fn classify_and_expand(question: &str) -> Result<EnhancedQuery, QueryError> {
    let question = question.trim();
    if !question.chars().any(|c| c.is_alphanumeric()) {
        return Err(QueryError::EmptyQuestion);
    }

    let sub_questions = split_questions(question);
    let keywords = content_words(question);
    let fact_key = if sub_questions.len() > 1 {
        None
    } else {
        resolve_fact_key(question)
    };

    let intent = if sub_questions.len() > 1 {
        QueryIntent::MultiPart
    } else if PROCEDURAL_RE.is_match(question) {
        QueryIntent::Procedural
    } else if fact_key.is_some() || NUMERIC_RE.is_match(question) {
        QueryIntent::FactualNumeric
    } else {
        QueryIntent::Conceptual
    };

    let categories: Vec<String> = CATEGORIES
        .iter()
        .filter(|(_, re)| re.is_match(question))
        .map(|(name, _)| name.to_string())
        .collect();

    let as_of_year = YEAR_RE
        .captures_iter(question)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .last();

    let words = folded_words(question);
    let entities = ENTITY_TERMS.iter().filter(|t| has_term(&words, t)).count()
        + YEAR_RE.find_iter(question).count();

    let mut confidence = 0.5;
    if intent != QueryIntent::Conceptual {
        confidence += 0.1;
    }
    if !categories.is_empty() {
        confidence += 0.15;
    }
    confidence += (0.05 * entities as f64).min(0.2);
    if keywords.len() >= 3 {
        confidence += 0.1;
    }

    Ok(EnhancedQuery {
        original: question.to_string(),
        intent,
        expanded_terms: expand(&keywords),
        keywords,
        sub_questions,
        fact_key,
        as_of_year,
        categories,
        confidence: f64::min(confidence, 1.0),
    })
}

/// Lowercased alphanumeric words of at least two characters, minus
/// stopwords, in order of appearance.
pub fn content_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 2 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Keywords, then expansions in table order, without duplicates.
pub fn expand(keywords: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |term: &str| {
        if !out.iter().any(|t| t == term) {
            out.push(term.to_string());
        }
    };
    for k in keywords {
        push(k);
    }
    for k in keywords {
        for (abbr, full) in ABBREVIATIONS {
            if k == abbr {
                push(full);
            }
        }
        for (word, synonyms) in SYNONYMS {
            if k == word {
                for s in *synonyms {
                    push(s);
                }
            }
        }
    }
    out
}

/// Split on `?`, newlines, `;` and on " and " before an interrogative.
pub fn split_questions(question: &str) -> Vec<String> {
    let mut raw = Vec::new();
    let mut current = String::new();
    for c in question.chars() {
        match c {
            '?' => {
                current.push('?');
                raw.push(std::mem::take(&mut current));
            }
            '\n' | ';' => raw.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    raw.push(current);

    let mut parts = Vec::new();
    for piece in raw {
        let piece = piece.trim();
        if !piece.chars().any(|c| c.is_alphanumeric()) {
            continue;
        }
        let asked = piece.ends_with('?');
        let mut rest = piece;
        while let Some(caps) = SPLIT_AND_RE.captures(rest) {
            let (Some(whole), Some(word)) = (caps.get(0), caps.get(1)) else {
                break;
            };
            let head = rest[..whole.start()].trim();
            if head.chars().any(|c| c.is_alphanumeric()) {
                parts.push(finish(head, asked));
            }
            rest = &rest[word.start()..];
        }
        parts.push(finish(rest.trim(), asked));
    }
    parts
}

fn finish(part: &str, asked: bool) -> String {
    let mut chars = part.chars();
    let mut out: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    if asked && !out.ends_with('?') {
        out.push('?');
    }
    out
}

/// Lowercased words with "non-resident" folded to "nonresident".
fn folded_words(question: &str) -> Vec<String> {
    question
        .to_lowercase()
        .replace("non-resident", "nonresident")
        .replace("non resident", "nonresident")
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whole-word match; a multi-word term must appear as a contiguous phrase.
fn has_term(words: &[String], term: &str) -> bool {
    let parts: Vec<&str> = term.split_whitespace().collect();
    !parts.is_empty()
        && words
            .windows(parts.len())
            .any(|window| window.iter().zip(&parts).all(|(w, p)| w == p))
}

pub fn resolve_fact_key(question: &str) -> Option<FactKey> {
    let words = folded_words(question);
    FACT_RULES
        .iter()
        .find(|r| {
            r.groups
                .iter()
                .all(|group| group.iter().any(|term| has_term(&words, term)))
        })
        .map(|r| r.key)
}
