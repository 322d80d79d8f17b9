use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Document category assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Act,
    Guide,
    Circular,
    Form,
    Order,
    Unknown,
}

impl DocType {
    /// Classifiable labels, in tie-break order.
    pub const LABELS: [DocType; 5] = [
        DocType::Act,
        DocType::Guide,
        DocType::Circular,
        DocType::Form,
        DocType::Order,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Act => "act",
            DocType::Guide => "guide",
            DocType::Circular => "circular",
            DocType::Form => "form",
            DocType::Order => "order",
            DocType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "act" => Ok(DocType::Act),
            "guide" => Ok(DocType::Guide),
            "circular" => Ok(DocType::Circular),
            "form" => Ok(DocType::Form),
            "order" => Ok(DocType::Order),
            "unknown" => Ok(DocType::Unknown),
            other => Err(format!("unknown document type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Heading,
    Paragraph,
    TableRow,
}

/// One layout unit of a parsed PDF. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub page: u32,
    pub kind: BlockKind,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedDocument {
    pub page_count: u32,
    pub blocks: Vec<Block>,
}

impl ParsedDocument {
    /// Text of the first `n` blocks joined by newlines.
    pub fn sample_text(&self, n: usize) -> String {
        self.blocks
            .iter()
            .take(n)
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A source file at one content version.
#[derive(Debug, Clone, Serialize)]
pub struct SourceDocument {
    /// Stable logical name, independent of where the file lives.
    pub name: String,
    pub path: String,
    pub fingerprint: String,
    pub byte_len: u64,
    pub page_count: u32,
    pub text: String,
    pub extracted_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_type: DocType,
    pub title: String,
    pub act_name: Option<String>,
    pub year: Option<i32>,
    pub confidence: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub tax_categories: Vec<String>,
    #[serde(default)]
    pub years_of_assessment: Vec<i32>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl DocumentMetadata {
    pub fn unknown() -> Self {
        Self {
            doc_type: DocType::Unknown,
            title: "unknown".to_string(),
            act_name: None,
            year: None,
            confidence: 0.0,
            reasons: Vec::new(),
            tax_categories: Vec::new(),
            years_of_assessment: Vec::new(),
            last_updated: None,
        }
    }
}

/// A retrieval unit. `span_start..span_end` are byte offsets into the
/// owning document's parsed text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub span_start: usize,
    pub span_end: usize,
    pub page_start: u32,
    pub page_end: u32,
    pub section: Option<String>,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    New,
    Unchanged,
    Updated,
    Removed,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::New => "new",
            VersionStatus::Unchanged => "unchanged",
            VersionStatus::Updated => "updated",
            VersionStatus::Removed => "removed",
        }
    }
}

impl FromStr for VersionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(VersionStatus::New),
            "unchanged" => Ok(VersionStatus::Unchanged),
            "updated" => Ok(VersionStatus::Updated),
            "removed" => Ok(VersionStatus::Removed),
            other => Err(format!("unknown version status: {}", other)),
        }
    }
}

/// Ledger entry for one logical document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionRecord {
    pub name: String,
    pub path: String,
    pub fingerprint: String,
    pub prior_fingerprint: Option<String>,
    pub status: VersionStatus,
    pub version: i64,
    pub byte_len: i64,
    pub last_processed: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Number(f64),
    Text(String),
}

impl FactValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FactValue::Number(n) => Some(*n),
            FactValue::Text(_) => None,
        }
    }
}

/// One dated value of a structured tax parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactEntry {
    pub topic: String,
    pub subkey: String,
    pub value: FactValue,
    pub unit: String,
    /// First tax year the value applies to.
    pub effective_from: i32,
    #[serde(default)]
    pub last_verified: Option<String>,
    #[serde(default)]
    pub source_note: String,
}

impl FactEntry {
    /// Human rendering of the value with its unit, e.g. `24%` or `S$20,000`.
    pub fn display_value(&self) -> String {
        match &self.value {
            FactValue::Text(t) => t.clone(),
            FactValue::Number(n) => match self.unit.as_str() {
                "percent" => format!("{}%", format_number(*n)),
                "sgd" => format!("S${}", format_amount(*n)),
                "" => format_number(*n),
                unit => format!("{} {}", format_number(*n), unit),
            },
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        let s = format!("{:.4}", n);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn format_amount(n: f64) -> String {
    let whole = n.trunc() as i64;
    let digits = whole.abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if whole < 0 {
        grouped.insert(0, '-');
    }
    let cents = ((n.fract().abs()) * 100.0).round() as i64;
    if cents > 0 {
        format!("{}.{:02}", grouped, cents)
    } else {
        grouped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    FactualNumeric,
    Conceptual,
    Procedural,
    MultiPart,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::FactualNumeric => "factual_numeric",
            QueryIntent::Conceptual => "conceptual",
            QueryIntent::Procedural => "procedural",
            QueryIntent::MultiPart => "multi_part",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Citation {
    Document {
        document: String,
        title: String,
        page: u32,
        section: Option<String>,
    },
    StructuredFacts {
        topic: String,
        subkey: String,
        effective_from: i32,
    },
}

impl fmt::Display for Citation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Citation::Document {
                document,
                page,
                section,
                ..
            } => match section {
                Some(s) => write!(f, "{}, p. {}, {}", document, page, s),
                None => write!(f, "{}, p. {}", document, page),
            },
            Citation::StructuredFacts {
                topic,
                subkey,
                effective_from,
            } => write!(
                f,
                "structured facts: {}.{} (effective YA {})",
                topic, subkey, effective_from
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

/// Lifecycle of one question through the composer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposeStage {
    Received,
    Classified,
    Retrieved,
    FactAugmented,
    Composed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResult {
    pub question: String,
    pub text: String,
    pub citations: Vec<Citation>,
    pub confidence: Confidence,
    pub score: f64,
    pub intent: QueryIntent,
    /// True when neither facts nor documents supported an answer.
    pub no_answer: bool,
    pub stages: Vec<ComposeStage>,
    /// Per sub-question results of a multi-part question, in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<AnswerResult>,
}
