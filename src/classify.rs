//! Rule-based document classification.
//!
//! [`HEURISTICS`] is an ordered list of pure functions. Each looks at one
//! textual signal and may cast a weighted [`Vote`] for a [`DocType`] with a
//! human-readable reason. Votes are summed per type and the winner's
//! confidence is
//!
//! ```text
//! confidence = (best / total) × min(1, best / SATURATION)
//! ```
//!
//! so it is high only when the evidence is both one-sided and strong. A
//! result below the configured minimum is logged as ambiguous and labelled
//! [`DocType::Unknown`]. Ties resolve in [`DocType::LABELS`] order, which
//! keeps the output deterministic.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::metadata::ExtractedMetadata;
use crate::models::DocType;

/// Score at which a single type's evidence counts as conclusive.
const SATURATION: f64 = 4.0;

static ACT_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bact\b(?:\s+\d{4})?\s*$").expect("act title regex is valid"));
static SUBSECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\(\d+[A-Z]?\)\s").expect("subsection regex is valid"));
static PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^PART\s+[IVXLC\d]+").expect("part regex is valid"));
static CIRCULAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bcircular\s+no\b|\biras\s+circular\b").expect("circular regex is valid")
});
static GUIDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\be-?tax\s+guide\b").expect("guide regex is valid"));
static FORM_FIELDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:declaration|signature|please complete|name of|tax reference number|date of birth)\b")
        .expect("form field regex is valid")
});
static ORDER_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bOrder\b(?:\s+\d{4})?\s*$").expect("order regex is valid"));
static SUBSIDIARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bthis order\b|\b(?:rules|regulations)\s+\d{4}\b")
        .expect("subsidiary legislation regex is valid")
});

/// Inputs every heuristic sees.
#[derive(Debug, Clone, Copy)]
pub struct Signals<'a> {
    pub meta: &'a ExtractedMetadata,
    pub sample: &'a str,
    pub file_name: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Vote {
    pub doc_type: DocType,
    pub weight: f64,
    pub reason: String,
}

impl Vote {
    fn new(doc_type: DocType, weight: f64, reason: impl Into<String>) -> Self {
        Self {
            doc_type,
            weight,
            reason: reason.into(),
        }
    }
}

pub type Heuristic = fn(&Signals<'_>) -> Option<Vote>;

pub const HEURISTICS: &[Heuristic] = &[
    act_title,
    subsection_density,
    part_headings,
    circular_marker,
    guide_marker,
    form_marker,
    order_marker,
    file_name_hint,
];

#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub doc_type: DocType,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub ambiguous: bool,
}

pub fn classify(signals: &Signals<'_>, min_confidence: f64) -> Classification {
    let votes: Vec<Vote> = HEURISTICS.iter().filter_map(|h| h(signals)).collect();

    let score = |t: DocType| -> f64 {
        votes
            .iter()
            .filter(|v| v.doc_type == t)
            .map(|v| v.weight)
            .sum()
    };
    let total: f64 = votes.iter().map(|v| v.weight).sum();

    let mut best = (DocType::Unknown, 0.0);
    for t in DocType::LABELS {
        let s = score(t);
        if s > best.1 {
            best = (t, s);
        }
    }

    if best.1 <= 0.0 {
        return Classification {
            doc_type: DocType::Unknown,
            confidence: 0.0,
            reasons: vec!["no classification signals".to_string()],
            ambiguous: true,
        };
    }

    let confidence = (best.1 / total) * (best.1 / SATURATION).min(1.0);
    let mut reasons: Vec<String> = votes
        .iter()
        .filter(|v| v.doc_type == best.0)
        .map(|v| v.reason.clone())
        .collect();

    if confidence < min_confidence {
        tracing::warn!(
            file = signals.file_name,
            candidate = %best.0,
            confidence,
            "classification ambiguous; labelling as unknown"
        );
        reasons.push(format!(
            "ambiguous: best candidate {} at {:.2} is below {:.2}",
            best.0, confidence, min_confidence
        ));
        return Classification {
            doc_type: DocType::Unknown,
            confidence,
            reasons,
            ambiguous: true,
        };
    }

    Classification {
        doc_type: best.0,
        confidence,
        reasons,
        ambiguous: false,
    }
}

pub fn act_title(s: &Signals<'_>) -> Option<Vote> {
    let title = s.meta.title.as_deref()?;
    ACT_TITLE_RE
        .is_match(title.trim())
        .then(|| Vote::new(DocType::Act, 3.0, format!("title names an Act: {}", title)))
}

/// Statutes number their subsections `(1)`, `(2)` at line starts.
pub fn subsection_density(s: &Signals<'_>) -> Option<Vote> {
    let count = SUBSECTION_RE.find_iter(s.sample).count();
    if count < 3 {
        return None;
    }
    let per_k = count as f64 * 1000.0 / s.sample.len().max(1) as f64;
    (per_k >= 1.5).then(|| {
        Vote::new(
            DocType::Act,
            2.0,
            format!("{} numbered subsections ({:.1} per 1000 chars)", count, per_k),
        )
    })
}

pub fn part_headings(s: &Signals<'_>) -> Option<Vote> {
    let count = PART_RE.find_iter(s.sample).count();
    (count > 0).then(|| Vote::new(DocType::Act, 1.0, format!("{} PART headings", count)))
}

pub fn circular_marker(s: &Signals<'_>) -> Option<Vote> {
    if s.meta.circular_number.is_some() || CIRCULAR_RE.is_match(s.sample) {
        let reason = match &s.meta.circular_number {
            Some(n) => format!("Circular No. {}", n),
            None => "IRAS circular marker".to_string(),
        };
        return Some(Vote::new(DocType::Circular, 3.0, reason));
    }
    None
}

pub fn guide_marker(s: &Signals<'_>) -> Option<Vote> {
    GUIDE_RE
        .is_match(s.sample)
        .then(|| Vote::new(DocType::Guide, 3.0, "e-Tax Guide marker"))
}

pub fn form_marker(s: &Signals<'_>) -> Option<Vote> {
    let fields = FORM_FIELDS_RE.find_iter(s.sample).count();
    let mut weight = 0.0;
    let mut reason = Vec::new();
    if let Some(id) = &s.meta.form_id {
        weight += 1.5;
        reason.push(format!("form identifier {}", id));
    }
    if fields >= 2 {
        weight += 1.0;
        reason.push(format!("{} fill-in fields", fields));
    }
    (weight > 0.0 && s.meta.form_id.is_some())
        .then(|| Vote::new(DocType::Form, weight, reason.join(", ")))
}

pub fn order_marker(s: &Signals<'_>) -> Option<Vote> {
    if let Some(title) = s.meta.title.as_deref() {
        if ORDER_TITLE_RE.is_match(title.trim()) {
            return Some(Vote::new(DocType::Order, 3.0, format!("title names an Order: {}", title)));
        }
    }
    SUBSIDIARY_RE
        .is_match(s.sample)
        .then(|| Vote::new(DocType::Order, 1.5, "subsidiary legislation wording"))
}

pub fn file_name_hint(s: &Signals<'_>) -> Option<Vote> {
    let lower = s.file_name.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let hint = |words: &[&str]| tokens.iter().any(|t| words.contains(t));

    let doc_type = if hint(&["act"]) {
        DocType::Act
    } else if hint(&["guide", "etax", "etaxguide"]) {
        DocType::Guide
    } else if hint(&["circular"]) {
        DocType::Circular
    } else if hint(&["form"]) {
        DocType::Form
    } else if hint(&["order", "rules", "regulations"]) {
        DocType::Order
    } else {
        return None;
    };
    Some(Vote::new(doc_type, 1.5, format!("file name '{}'", s.file_name)))
}
