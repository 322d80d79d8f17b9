//! Storage abstraction for the document index and version ledger.
//!
//! The [`Store`] trait covers everything the batch processor and the
//! retrieval engine need: the version ledger, atomic per-document commits,
//! keyword and vector candidate search, and the embedding cache. Two
//! backends implement it:
//!
//! - [`sqlite::SqliteStore`]: the persistent index (FTS5 + BLOB vectors).
//! - [`memory::InMemoryStore`]: a single-lock in-process store for tests and
//!   library embedding.
//!
//! Both also implement [`FactStore`](crate::facts::FactStore).
//!
//! # Atomicity
//!
//! [`Store::commit_document`] replaces a document's metadata, chunks,
//! vectors and ledger record in one unit of work, guarded by a
//! compare-and-swap on the ledger fingerprint observed before processing.
//! A reader therefore sees either the old version or the new one, never a
//! mix. Only chunks of active documents are ever returned by search.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

use crate::config::RemovedPolicy;
use crate::models::{Chunk, DocType, DocumentMetadata, SourceDocument, VersionRecord};

/// A candidate chunk from keyword or vector search.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub document_id: String,
    /// Backend score: term hits or BM25 for keyword search, cosine
    /// similarity for vector search.
    pub raw_score: f64,
}

/// A chunk joined with the metadata of its document.
#[derive(Debug, Clone, Serialize)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub title: String,
    pub doc_type: DocType,
    pub year: Option<i32>,
    pub confidence: f64,
    /// Ledger timestamp of the document version that produced the chunk.
    pub last_processed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredDocument {
    pub name: String,
    pub path: String,
    pub fingerprint: String,
    pub metadata: DocumentMetadata,
    pub active: bool,
    pub page_count: u32,
    pub chunk_count: i64,
    pub last_processed: i64,
}

/// Vectors for every chunk of a commit, in chunk order.
#[derive(Debug, Clone)]
pub struct EmbeddedChunks {
    pub model: String,
    pub vectors: Vec<Vec<f32>>,
}

/// One fully processed document version, ready to swap into the index.
#[derive(Debug, Clone)]
pub struct DocumentCommit {
    pub source: SourceDocument,
    pub metadata: DocumentMetadata,
    pub chunks: Vec<Chunk>,
    pub embeddings: Option<EmbeddedChunks>,
    pub record: VersionRecord,
    /// Ledger fingerprint observed when processing started (`None` for a
    /// document the ledger has never seen).
    pub expected_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The ledger moved since `expected_fingerprint` was read; nothing was
    /// written.
    Conflict,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IndexCounts {
    pub documents: i64,
    pub active_documents: i64,
    pub chunks: i64,
    pub vectors: i64,
}

/// Abstract index + ledger backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_version`](Store::get_version) | Current ledger record for a logical name |
/// | [`list_versions`](Store::list_versions) | Whole ledger, sorted by name |
/// | [`version_history`](Store::version_history) | Superseded records, oldest first |
/// | [`commit_document`](Store::commit_document) | Atomic CAS swap of one document version |
/// | [`retire_document`](Store::retire_document) | Apply the removed-file policy |
/// | [`keyword_search`](Store::keyword_search) | Term candidates over active chunks |
/// | [`vector_search`](Store::vector_search) | Cosine candidates over active chunks |
/// | [`fetch_chunks`](Store::fetch_chunks) | Hydrate candidates with document metadata |
/// | [`cached_embeddings`](Store::cached_embeddings) | Embedding cache lookup by chunk hash |
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_version(&self, name: &str) -> Result<Option<VersionRecord>>;

    async fn list_versions(&self) -> Result<Vec<VersionRecord>>;

    async fn version_history(&self, name: &str) -> Result<Vec<VersionRecord>>;

    async fn commit_document(&self, commit: &DocumentCommit) -> Result<CommitOutcome>;

    /// Flag a document as removed in the ledger and apply `policy` to its
    /// indexed content.
    async fn retire_document(&self, name: &str, policy: RemovedPolicy, now: i64) -> Result<()>;

    async fn get_document(&self, name: &str) -> Result<Option<StoredDocument>>;

    async fn list_documents(&self) -> Result<Vec<StoredDocument>>;

    /// All chunks of a document in index order, active or not.
    async fn document_chunks(&self, name: &str) -> Result<Vec<Chunk>>;

    async fn keyword_search(&self, terms: &[String], limit: i64) -> Result<Vec<ChunkCandidate>>;

    async fn vector_search(&self, query_vec: &[f32], limit: i64) -> Result<Vec<ChunkCandidate>>;

    /// Chunks by id, restricted to active documents. Unknown ids are skipped.
    async fn fetch_chunks(&self, ids: &[String]) -> Result<Vec<IndexedChunk>>;

    /// Cached vectors for `model`, keyed by chunk hash.
    async fn cached_embeddings(
        &self,
        model: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>>;

    async fn counts(&self) -> Result<IndexCounts>;
}

/// Lowercased term hits in `text`; multi-word terms match as phrases.
pub(crate) fn term_hits(text: &str, terms: &[String]) -> usize {
    let lower = text.to_lowercase();
    terms
        .iter()
        .filter(|t| !t.is_empty() && lower.contains(t.to_lowercase().as_str()))
        .count()
}
