//! Hybrid retrieval over indexed chunks.
//!
//! Candidates come from two channels: keyword search over the expanded
//! query terms, and vector search with the query embedding when an
//! embedding provider is enabled. Each candidate is scored
//!
//! ```text
//! score = (α · max(0, cosine) + (1 - α) · keyword_coverage) · type_weight
//! ```
//!
//! where `keyword_coverage` is the share of query keywords present in the
//! chunk. With embeddings disabled the score is coverage alone. Results are
//! ordered by score, then by document recency, classifier confidence and
//! chunk id, so equal inputs always rank identically.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use serde::Serialize;

use crate::config::{Config, RetrievalConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::QueryError;
use crate::query::{classify_and_expand, EnhancedQuery};
use crate::store::sqlite::SqliteStore;
use crate::store::{term_hits, IndexedChunk, Store};

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    #[serde(flatten)]
    pub hit: IndexedChunk,
    pub score: f64,
    pub keyword_score: f64,
    pub vector_score: f64,
}

pub struct Retriever<'a> {
    store: &'a dyn Store,
    embedder: &'a dyn EmbeddingProvider,
    config: &'a RetrievalConfig,
}

impl<'a> Retriever<'a> {
    pub fn new(
        store: &'a dyn Store,
        embedder: &'a dyn EmbeddingProvider,
        config: &'a RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub async fn search(
        &self,
        query: &EnhancedQuery,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, QueryError> {
        self.search_terms(&query.original, &query.keywords, &query.expanded_terms, k)
            .await
    }

    /// Rank chunks for `text`. `keywords` drive coverage; `expanded` drive
    /// keyword candidate generation.
    pub async fn search_terms(
        &self,
        text: &str,
        keywords: &[String],
        expanded: &[String],
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, QueryError> {
        let limit = self.config.candidate_k;

        let keyword_candidates = if expanded.is_empty() {
            Vec::new()
        } else {
            self.store
                .keyword_search(expanded, limit)
                .await
                .map_err(backend)?
        };

        let mut cosines: HashMap<String, f64> = HashMap::new();
        let mut ids: Vec<String> = keyword_candidates.into_iter().map(|c| c.chunk_id).collect();
        if self.embedder.is_enabled() {
            let query_vec = embedding::embed_query(self.embedder, text)
                .await
                .map_err(backend)?;
            for c in self
                .store
                .vector_search(&query_vec, limit)
                .await
                .map_err(backend)?
            {
                cosines.insert(c.chunk_id.clone(), c.raw_score);
                ids.push(c.chunk_id);
            }
        }
        ids.sort();
        ids.dedup();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let hydrated = self.store.fetch_chunks(&ids).await.map_err(backend)?;
        let alpha = if self.embedder.is_enabled() {
            self.config.hybrid_alpha
        } else {
            0.0
        };

        let mut results: Vec<RetrievedChunk> = hydrated
            .into_iter()
            .map(|hit| {
                let keyword_score = if keywords.is_empty() {
                    0.0
                } else {
                    term_hits(&hit.chunk.text, keywords) as f64 / keywords.len() as f64
                };
                let vector_score = cosines
                    .get(&hit.chunk.id)
                    .copied()
                    .unwrap_or(0.0)
                    .max(0.0);
                let score = (alpha * vector_score + (1.0 - alpha) * keyword_score)
                    * self.config.type_weight(hit.doc_type);
                RetrievedChunk {
                    hit,
                    score,
                    keyword_score,
                    vector_score,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.hit.last_processed.cmp(&a.hit.last_processed))
                .then(b.hit.confidence.total_cmp(&a.hit.confidence))
                .then(a.hit.chunk.id.cmp(&b.hit.chunk.id))
        });
        results.truncate(k);

        tracing::debug!(
            query = text,
            candidates = ids.len(),
            returned = results.len(),
            "retrieval finished"
        );
        Ok(results)
    }
}

fn backend(err: anyhow::Error) -> QueryError {
    QueryError::RetrievalBackendUnavailable(format!("{:#}", err))
}

/// `taxlens search`: rank chunks for a free-text query and print them with
/// provenance, one block per document (best chunk wins).
pub async fn run_search(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let store = SqliteStore::open(config).await?;
    let embedder = embedding::create_provider(&config.embedding)?;
    let enhanced = classify_and_expand(query)?;
    let limit = limit.unwrap_or(config.retrieval.top_k);

    let retriever = Retriever::new(&store, embedder.as_ref(), &config.retrieval);
    let results = retriever
        .search(&enhanced, config.retrieval.candidate_k.max(1) as usize)
        .await?;

    let mut best: BTreeMap<String, &RetrievedChunk> = BTreeMap::new();
    for r in &results {
        best.entry(r.hit.chunk.document_id.clone()).or_insert(r);
    }
    let mut docs: Vec<&RetrievedChunk> = best.into_values().collect();
    docs.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.hit.chunk.document_id.cmp(&b.hit.chunk.document_id))
    });
    docs.truncate(limit);

    if docs.is_empty() {
        println!("No results.");
        store.close().await;
        return Ok(());
    }

    for (i, r) in docs.iter().enumerate() {
        let chunk = &r.hit.chunk;
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            r.score,
            r.hit.doc_type,
            r.hit.title
        );
        println!("    document: {}", chunk.document_id);
        match &chunk.section {
            Some(section) => println!("    page: {}  section: {}", chunk.page_start, section),
            None => println!("    page: {}", chunk.page_start),
        }
        let excerpt: String = chunk.text.chars().take(240).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!();
    }

    store.close().await;
    Ok(())
}
