//! In-memory [`Store`] and [`FactStore`] for tests and library use.
//!
//! All state sits behind one `tokio::sync::RwLock`. Mutations take the write
//! lock once and never await while holding it, so every commit is applied
//! whole. Keyword search is a term-hit count; vector search is brute-force
//! cosine similarity.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::RemovedPolicy;
use crate::embedding::cosine_similarity;
use crate::error::FactError;
use crate::facts::{applicable, same_value, FactStore, InsertOutcome};
use crate::models::{
    Chunk, DocumentMetadata, FactEntry, SourceDocument, VersionRecord, VersionStatus,
};

use super::{
    term_hits, ChunkCandidate, CommitOutcome, DocumentCommit, IndexCounts, IndexedChunk, Store,
    StoredDocument,
};

struct DocEntry {
    source: SourceDocument,
    metadata: DocumentMetadata,
    active: bool,
    last_processed: i64,
}

#[derive(Default)]
struct State {
    documents: BTreeMap<String, DocEntry>,
    chunks: BTreeMap<String, Vec<Chunk>>,
    /// chunk id → (document name, vector)
    vectors: HashMap<String, (String, Vec<f32>)>,
    /// (model, chunk hash) → vector
    cache: HashMap<(String, String), Vec<f32>>,
    versions: BTreeMap<String, VersionRecord>,
    history: Vec<VersionRecord>,
    facts: BTreeMap<(String, String), Vec<FactEntry>>,
}

impl State {
    fn is_active(&self, name: &str) -> bool {
        self.documents.get(name).map(|d| d.active).unwrap_or(false)
    }

    fn stored(&self, name: &str, doc: &DocEntry) -> StoredDocument {
        StoredDocument {
            name: name.to_string(),
            path: doc.source.path.clone(),
            fingerprint: doc.source.fingerprint.clone(),
            metadata: doc.metadata.clone(),
            active: doc.active,
            page_count: doc.source.page_count,
            chunk_count: self.chunks.get(name).map(|c| c.len() as i64).unwrap_or(0),
            last_processed: doc.last_processed,
        }
    }

    fn drop_content(&mut self, name: &str) {
        if let Some(old) = self.chunks.remove(name) {
            for c in &old {
                self.vectors.remove(&c.id);
            }
        }
    }
}

/// Process-local index, ledger and fact table.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_version(&self, name: &str) -> Result<Option<VersionRecord>> {
        Ok(self.state.read().await.versions.get(name).cloned())
    }

    async fn list_versions(&self) -> Result<Vec<VersionRecord>> {
        Ok(self.state.read().await.versions.values().cloned().collect())
    }

    async fn version_history(&self, name: &str) -> Result<Vec<VersionRecord>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect())
    }

    async fn commit_document(&self, commit: &DocumentCommit) -> Result<CommitOutcome> {
        let mut state = self.state.write().await;
        let name = &commit.record.name;

        let current = state.versions.get(name).map(|r| r.fingerprint.clone());
        if current != commit.expected_fingerprint {
            return Ok(CommitOutcome::Conflict);
        }

        if let Some(prev) = state.versions.get(name).cloned() {
            state.history.push(prev);
        }
        state.drop_content(name);

        if let Some(embedded) = &commit.embeddings {
            for (chunk, vector) in commit.chunks.iter().zip(&embedded.vectors) {
                state
                    .vectors
                    .insert(chunk.id.clone(), (name.clone(), vector.clone()));
                state.cache.insert(
                    (embedded.model.clone(), chunk.hash.clone()),
                    vector.clone(),
                );
            }
        }
        state.chunks.insert(name.clone(), commit.chunks.clone());
        state.documents.insert(
            name.clone(),
            DocEntry {
                source: commit.source.clone(),
                metadata: commit.metadata.clone(),
                active: true,
                last_processed: commit.record.last_processed,
            },
        );
        state.versions.insert(name.clone(), commit.record.clone());
        Ok(CommitOutcome::Committed)
    }

    async fn retire_document(&self, name: &str, policy: RemovedPolicy, now: i64) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(record) = state.versions.get(name).cloned() else {
            return Ok(());
        };
        state.history.push(record.clone());
        state.versions.insert(
            name.to_string(),
            VersionRecord {
                status: VersionStatus::Removed,
                last_processed: now,
                ..record
            },
        );
        match policy {
            RemovedPolicy::MarkInactive => {
                if let Some(doc) = state.documents.get_mut(name) {
                    doc.active = false;
                }
            }
            RemovedPolicy::Purge => {
                state.drop_content(name);
                state.documents.remove(name);
            }
        }
        Ok(())
    }

    async fn get_document(&self, name: &str) -> Result<Option<StoredDocument>> {
        let state = self.state.read().await;
        Ok(state.documents.get(name).map(|d| state.stored(name, d)))
    }

    async fn list_documents(&self) -> Result<Vec<StoredDocument>> {
        let state = self.state.read().await;
        Ok(state
            .documents
            .iter()
            .map(|(name, d)| state.stored(name, d))
            .collect())
    }

    async fn document_chunks(&self, name: &str) -> Result<Vec<Chunk>> {
        let state = self.state.read().await;
        Ok(state.chunks.get(name).cloned().unwrap_or_default())
    }

    async fn keyword_search(&self, terms: &[String], limit: i64) -> Result<Vec<ChunkCandidate>> {
        let state = self.state.read().await;
        let mut out: Vec<ChunkCandidate> = state
            .chunks
            .iter()
            .filter(|(name, _)| state.is_active(name))
            .flat_map(|(_, chunks)| chunks.iter())
            .filter_map(|c| {
                let hits = term_hits(&c.text, terms);
                (hits > 0).then(|| ChunkCandidate {
                    chunk_id: c.id.clone(),
                    document_id: c.document_id.clone(),
                    raw_score: hits as f64,
                })
            })
            .collect();
        out.sort_by(|a, b| {
            b.raw_score
                .total_cmp(&a.raw_score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn vector_search(&self, query_vec: &[f32], limit: i64) -> Result<Vec<ChunkCandidate>> {
        let state = self.state.read().await;
        let mut out: Vec<ChunkCandidate> = state
            .vectors
            .iter()
            .filter(|(_, (doc, _))| state.is_active(doc))
            .map(|(chunk_id, (doc, v))| ChunkCandidate {
                chunk_id: chunk_id.clone(),
                document_id: doc.clone(),
                raw_score: cosine_similarity(query_vec, v) as f64,
            })
            .collect();
        out.sort_by(|a, b| {
            b.raw_score
                .total_cmp(&a.raw_score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn fetch_chunks(&self, ids: &[String]) -> Result<Vec<IndexedChunk>> {
        let state = self.state.read().await;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let found = state
                .chunks
                .iter()
                .filter(|(name, _)| state.is_active(name))
                .find_map(|(name, chunks)| {
                    chunks.iter().find(|c| &c.id == id).map(|c| (name, c))
                });
            let Some((name, chunk)) = found else { continue };
            let Some(doc) = state.documents.get(name) else { continue };
            out.push(IndexedChunk {
                chunk: chunk.clone(),
                title: doc.metadata.title.clone(),
                doc_type: doc.metadata.doc_type,
                year: doc.metadata.year,
                confidence: doc.metadata.confidence,
                last_processed: doc.last_processed,
            });
        }
        Ok(out)
    }

    async fn cached_embeddings(
        &self,
        model: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let state = self.state.read().await;
        Ok(hashes
            .iter()
            .filter_map(|h| {
                state
                    .cache
                    .get(&(model.to_string(), h.clone()))
                    .map(|v| (h.clone(), v.clone()))
            })
            .collect())
    }

    async fn counts(&self) -> Result<IndexCounts> {
        let state = self.state.read().await;
        Ok(IndexCounts {
            documents: state.documents.len() as i64,
            active_documents: state.documents.values().filter(|d| d.active).count() as i64,
            chunks: state.chunks.values().map(|c| c.len() as i64).sum(),
            vectors: state.vectors.len() as i64,
        })
    }
}

#[async_trait]
impl FactStore for InMemoryStore {
    async fn insert_fact(&self, entry: &FactEntry) -> Result<InsertOutcome, FactError> {
        let mut state = self.state.write().await;
        let versions = state
            .facts
            .entry((entry.topic.clone(), entry.subkey.clone()))
            .or_default();
        if let Some(existing) = versions
            .iter()
            .find(|e| e.effective_from == entry.effective_from)
        {
            if same_value(existing, entry) {
                return Ok(InsertOutcome::Unchanged);
            }
            return Err(FactError::Conflict {
                topic: entry.topic.clone(),
                subkey: entry.subkey.clone(),
                effective_from: entry.effective_from,
            });
        }
        versions.push(entry.clone());
        versions.sort_by_key(|e| e.effective_from);
        Ok(InsertOutcome::Inserted)
    }

    async fn lookup(
        &self,
        topic: &str,
        subkey: &str,
        as_of_year: Option<i32>,
    ) -> Result<Option<FactEntry>, FactError> {
        let state = self.state.read().await;
        Ok(state
            .facts
            .get(&(topic.to_string(), subkey.to_string()))
            .and_then(|versions| applicable(versions, as_of_year))
            .cloned())
    }

    async fn history(&self, topic: &str, subkey: &str) -> Result<Vec<FactEntry>, FactError> {
        let state = self.state.read().await;
        Ok(state
            .facts
            .get(&(topic.to_string(), subkey.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn subkeys(&self, topic: &str) -> Result<Vec<String>, FactError> {
        let state = self.state.read().await;
        Ok(state
            .facts
            .keys()
            .filter(|(t, _)| t == topic)
            .map(|(_, s)| s.clone())
            .collect())
    }
}
