//! Typed errors at the pipeline seams.
//!
//! Orchestration and the CLI work in `anyhow::Result`; these enums exist where
//! callers branch on the failure kind (batch isolation, fact conflicts, query
//! failures that must not degrade into an empty answer).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("not a readable PDF: {0}")]
    Invalid(String),
    #[error("no extractable text (scanned image without OCR?)")]
    NoText,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: &'static str, secs: u64 },
    #[error("version conflict for '{name}': ledger changed during processing")]
    VersionConflict { name: String },
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug, Error)]
pub enum FactError {
    #[error(
        "fact {topic}.{subkey} already has a different value effective from {effective_from}"
    )]
    Conflict {
        topic: String,
        subkey: String,
        effective_from: i32,
    },
    #[error("fact {topic}.{subkey} is missing effective_from")]
    MissingEffectiveFrom { topic: String, subkey: String },
    #[error("fact store error: {0}")]
    Store(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("question is empty")]
    EmptyQuestion,
    #[error("retrieval backend unavailable: {0}")]
    RetrievalBackendUnavailable(String),
    #[error(transparent)]
    FactStore(#[from] FactError),
    #[error("answer generation failed: {0}")]
    Generation(String),
}
