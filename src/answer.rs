//! Answer composition.
//!
//! Every question moves through a fixed sequence of stages, recorded on the
//! result:
//!
//! ```text
//! Received → Classified → Retrieved → (FactAugmented) → Composed
//! ```
//!
//! Routing rules:
//!
//! | Intent | Fact found | Relevant chunks | Result |
//! |--------|-----------|-----------------|--------|
//! | factual-numeric | yes | any | fact value verbatim, chunks as support |
//! | factual-numeric | no | yes | composed from chunks |
//! | conceptual / procedural | never consulted | yes | composed from chunks |
//! | any | no | no | "No answer found", no citations, confidence `none` |
//!
//! Multi-part questions run the full sequence once per sub-question and are
//! joined under `Question N:` headers. Any backend failure aborts the whole
//! answer; a partial answer is never returned.

use anyhow::Result;

use crate::config::{Config, RetrievalConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::QueryError;
use crate::facts::FactStore;
use crate::generate::{self, fact_sentence, AnswerGenerator};
use crate::models::{AnswerResult, Citation, ComposeStage, Confidence, FactEntry, QueryIntent};
use crate::query::{classify_and_expand, EnhancedQuery};
use crate::search::{RetrievedChunk, Retriever};
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

pub const NO_ANSWER_TEXT: &str =
    "No answer found: neither the structured tax facts nor the indexed documents cover this question.";
const NO_SUPPORT_NOTE: &str = "No supporting passages were found in the indexed documents.";

pub struct Composer<'a> {
    store: &'a dyn Store,
    facts: &'a dyn FactStore,
    embedder: &'a dyn EmbeddingProvider,
    generator: &'a dyn AnswerGenerator,
    config: &'a RetrievalConfig,
}

impl<'a> Composer<'a> {
    pub fn new(
        store: &'a dyn Store,
        facts: &'a dyn FactStore,
        embedder: &'a dyn EmbeddingProvider,
        generator: &'a dyn AnswerGenerator,
        config: &'a RetrievalConfig,
    ) -> Self {
        Self {
            store,
            facts,
            embedder,
            generator,
            config,
        }
    }

    /// Answer `question`. `as_of` overrides any year mentioned in the
    /// question when resolving structured facts.
    pub async fn answer(&self, question: &str, as_of: Option<i32>) -> Result<AnswerResult, QueryError> {
        let enhanced = classify_and_expand(question)?;
        if enhanced.sub_questions.len() < 2 {
            return self.answer_single(enhanced, as_of).await;
        }

        let mut parts = Vec::with_capacity(enhanced.sub_questions.len());
        for sub in &enhanced.sub_questions {
            let sub_query = classify_and_expand(sub)?;
            parts.push(self.answer_single(sub_query, as_of).await?);
        }
        Ok(merge_parts(enhanced, parts))
    }

    async fn answer_single(
        &self,
        query: EnhancedQuery,
        as_of: Option<i32>,
    ) -> Result<AnswerResult, QueryError> {
        let mut stages = vec![ComposeStage::Received, ComposeStage::Classified];

        let k = self.config.top_k.max(query.retrieval_depth());
        let retrieved = Retriever::new(self.store, self.embedder, self.config)
            .search(&query, k)
            .await?;
        stages.push(ComposeStage::Retrieved);

        let fact = match (query.intent, query.fact_key) {
            (QueryIntent::FactualNumeric, Some(key)) => {
                self.facts
                    .lookup(key.topic, key.subkey, as_of.or(query.as_of_year))
                    .await?
            }
            _ => None,
        };
        if fact.is_some() {
            stages.push(ComposeStage::FactAugmented);
        }

        let relevant: Vec<RetrievedChunk> = retrieved
            .into_iter()
            .filter(|r| r.score >= self.config.min_relevance)
            .collect();

        let result = if fact.is_none() && relevant.is_empty() {
            stages.push(ComposeStage::Composed);
            AnswerResult {
                question: query.original,
                text: NO_ANSWER_TEXT.to_string(),
                citations: Vec::new(),
                confidence: Confidence::None,
                score: 0.0,
                intent: query.intent,
                no_answer: true,
                stages,
                parts: Vec::new(),
            }
        } else {
            let text = self.compose_text(&query.original, fact.as_ref(), &relevant).await?;
            stages.push(ComposeStage::Composed);
            let score = relevant.first().map(|r| r.score).unwrap_or(0.0);
            AnswerResult {
                question: query.original,
                text,
                citations: citations(fact.as_ref(), &relevant),
                confidence: confidence(fact.is_some(), &relevant),
                score,
                intent: query.intent,
                no_answer: false,
                stages,
                parts: Vec::new(),
            }
        };

        tracing::info!(
            intent = result.intent.as_str(),
            fact = fact.is_some(),
            chunks = relevant.len(),
            no_answer = result.no_answer,
            "answer composed"
        );
        Ok(result)
    }

    async fn compose_text(
        &self,
        question: &str,
        fact: Option<&FactEntry>,
        relevant: &[RetrievedChunk],
    ) -> Result<String, QueryError> {
        let mut text = self
            .generator
            .phrase(question, fact, relevant)
            .await
            .map_err(|e| QueryError::Generation(format!("{:#}", e)))?;

        if let Some(fact) = fact {
            // The structured value must appear verbatim whatever the generator wrote.
            if !text.contains(&fact.display_value()) {
                text = format!("{}\n{}", fact_sentence(fact), text);
            }
            if relevant.is_empty() {
                text = format!("{}\n{}", text.trim_end(), NO_SUPPORT_NOTE);
            }
        }
        Ok(text.trim().to_string())
    }
}

fn citations(fact: Option<&FactEntry>, relevant: &[RetrievedChunk]) -> Vec<Citation> {
    let mut out = Vec::new();
    if let Some(f) = fact {
        out.push(Citation::StructuredFacts {
            topic: f.topic.clone(),
            subkey: f.subkey.clone(),
            effective_from: f.effective_from,
        });
    }
    for r in relevant {
        let citation = Citation::Document {
            document: r.hit.chunk.document_id.clone(),
            title: r.hit.title.clone(),
            page: r.hit.chunk.page_start,
            section: r.hit.chunk.section.clone(),
        };
        let duplicate = out.iter().any(|c| match (c, &citation) {
            (
                Citation::Document { document, page, .. },
                Citation::Document {
                    document: d2,
                    page: p2,
                    ..
                },
            ) => document == d2 && page == p2,
            _ => false,
        });
        if !duplicate {
            out.push(citation);
        }
    }
    out
}

fn confidence(has_fact: bool, relevant: &[RetrievedChunk]) -> Confidence {
    let top = relevant.first().map(|r| r.score).unwrap_or(0.0);
    match (has_fact, relevant.is_empty()) {
        (true, false) => Confidence::High,
        (true, true) => Confidence::Medium,
        (false, _) if top >= 0.6 => Confidence::High,
        (false, _) if top >= 0.4 => Confidence::Medium,
        (false, _) => Confidence::Low,
    }
}

fn merge_parts(query: EnhancedQuery, parts: Vec<AnswerResult>) -> AnswerResult {
    let text = parts
        .iter()
        .enumerate()
        .map(|(i, p)| format!("Question {}: {}\n{}", i + 1, p.question, p.text))
        .collect::<Vec<_>>()
        .join("\n\n");
    let mut citations: Vec<Citation> = Vec::new();
    for c in parts.iter().flat_map(|p| p.citations.iter()) {
        if !citations.contains(c) {
            citations.push(c.clone());
        }
    }
    let confidence = parts
        .iter()
        .map(|p| p.confidence)
        .min()
        .unwrap_or(Confidence::None);
    let score = parts.iter().map(|p| p.score).fold(f64::INFINITY, f64::min);

    AnswerResult {
        question: query.original,
        text,
        citations,
        confidence,
        score: if score.is_finite() { score } else { 0.0 },
        intent: QueryIntent::MultiPart,
        no_answer: parts.iter().all(|p| p.no_answer),
        stages: vec![
            ComposeStage::Received,
            ComposeStage::Classified,
            ComposeStage::Composed,
        ],
        parts,
    }
}

/// `taxlens ask`: answer one question against the on-disk index and fact
/// table.
pub async fn run_ask(config: &Config, question: &str, as_of: Option<i32>, json: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let embedder = embedding::create_provider(&config.embedding)?;
    let generator = generate::create_generator(&config.generation)?;

    let composer = Composer::new(
        &store,
        &store,
        embedder.as_ref(),
        generator.as_ref(),
        &config.retrieval,
    );
    let result = composer.answer(question, as_of).await;
    store.close().await;
    let result = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("{}", result.text);
    if !result.citations.is_empty() {
        println!();
        println!("Sources:");
        for (i, c) in result.citations.iter().enumerate() {
            println!("  [{}] {}", i + 1, c);
        }
    }
    println!();
    println!("confidence: {:?}", result.confidence);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::DisabledProvider;
    use crate::error::FactError;
    use crate::facts::InsertOutcome;
    use crate::generate::ExtractiveGenerator;
    use crate::models::{
        Chunk, DocType, DocumentMetadata, FactValue, SourceDocument, VersionRecord, VersionStatus,
    };
    use crate::store::memory::InMemoryStore;
    use crate::store::DocumentCommit;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts lookups and delegates to an in-memory table.
    struct SpyFacts {
        inner: InMemoryStore,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl FactStore for SpyFacts {
        async fn insert_fact(&self, entry: &FactEntry) -> Result<InsertOutcome, FactError> {
            self.inner.insert_fact(entry).await
        }
        async fn lookup(
            &self,
            topic: &str,
            subkey: &str,
            as_of_year: Option<i32>,
        ) -> Result<Option<FactEntry>, FactError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup(topic, subkey, as_of_year).await
        }
        async fn history(&self, topic: &str, subkey: &str) -> Result<Vec<FactEntry>, FactError> {
            self.inner.history(topic, subkey).await
        }
        async fn subkeys(&self, topic: &str) -> Result<Vec<String>, FactError> {
            self.inner.subkeys(topic).await
        }
    }

    fn fact(topic: &str, subkey: &str, value: FactValue, unit: &str, from: i32) -> FactEntry {
        FactEntry {
            topic: topic.into(),
            subkey: subkey.into(),
            value,
            unit: unit.into(),
            effective_from: from,
            last_verified: None,
            source_note: String::new(),
        }
    }

    async fn spy() -> SpyFacts {
        let facts = SpyFacts {
            inner: InMemoryStore::new(),
            lookups: AtomicUsize::new(0),
        };
        for entry in [
            fact("gst", "standard_rate", FactValue::Number(8.0), "percent", 2023),
            fact("gst", "standard_rate", FactValue::Number(9.0), "percent", 2024),
            fact(
                "filing_deadline",
                "individual_efiling",
                FactValue::Text("18 April".into()),
                "date",
                2020,
            ),
        ] {
            facts.insert_fact(&entry).await.unwrap();
        }
        facts
    }

    async fn index_guide(store: &InMemoryStore, text: &str) {
        let chunk = Chunk {
            id: "gst-guide#0".into(),
            document_id: "gst-guide".into(),
            chunk_index: 0,
            text: text.into(),
            span_start: 0,
            span_end: text.len(),
            page_start: 2,
            page_end: 2,
            section: Some("Standard rate".into()),
            hash: "h".into(),
        };
        let record = VersionRecord {
            name: "gst-guide".into(),
            path: "/c/gst-guide.pdf".into(),
            fingerprint: "f".into(),
            prior_fingerprint: None,
            status: VersionStatus::New,
            version: 1,
            byte_len: 1,
            last_processed: 1,
        };
        store
            .commit_document(&DocumentCommit {
                source: SourceDocument {
                    name: "gst-guide".into(),
                    path: record.path.clone(),
                    fingerprint: "f".into(),
                    byte_len: 1,
                    page_count: 2,
                    text: text.into(),
                    extracted_at: 1,
                },
                metadata: DocumentMetadata {
                    doc_type: DocType::Guide,
                    title: "GST General Guide".into(),
                    confidence: 0.8,
                    ..DocumentMetadata::unknown()
                },
                chunks: vec![chunk],
                embeddings: None,
                record,
                expected_fingerprint: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn factual_question_uses_fact_verbatim() {
        let store = InMemoryStore::new();
        index_guide(&store, "GST is charged at the standard rate on taxable supplies.").await;
        let facts = spy().await;
        let config = RetrievalConfig::default();
        let composer = Composer::new(&store, &facts, &DisabledProvider, &ExtractiveGenerator, &config);

        let result = composer.answer("What is the GST rate?", None).await.unwrap();
        assert!(result.text.contains("9%"));
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(
            result.citations[0],
            Citation::StructuredFacts {
                topic: "gst".into(),
                subkey: "standard_rate".into(),
                effective_from: 2024
            }
        );
        assert!(matches!(result.citations[1], Citation::Document { page: 2, .. }));
        assert_eq!(
            result.stages,
            vec![
                ComposeStage::Received,
                ComposeStage::Classified,
                ComposeStage::Retrieved,
                ComposeStage::FactAugmented,
                ComposeStage::Composed
            ]
        );

        let older = composer.answer("What was the GST rate in 2023?", None).await.unwrap();
        assert!(older.text.contains("8%"));
        let overridden = composer.answer("What is the GST rate?", Some(2023)).await.unwrap();
        assert!(overridden.text.contains("8%"));
    }

    #[tokio::test]
    async fn conceptual_question_never_consults_facts() {
        let store = InMemoryStore::new();
        index_guide(&store, "GST is a broad-based consumption tax levied on imports and supplies.")
            .await;
        let facts = spy().await;
        let config = RetrievalConfig::default();
        let composer = Composer::new(&store, &facts, &DisabledProvider, &ExtractiveGenerator, &config);

        let result = composer
            .answer("Explain what GST is as a consumption tax", None)
            .await
            .unwrap();
        assert_eq!(result.intent, QueryIntent::Conceptual);
        assert_eq!(facts.lookups.load(Ordering::SeqCst), 0);
        assert!(!result.no_answer);
        assert!(result
            .citations
            .iter()
            .all(|c| matches!(c, Citation::Document { .. })));
    }

    #[tokio::test]
    async fn partial_word_never_triggers_fact_lookup() {
        let store = InMemoryStore::new();
        let facts = spy().await;
        let config = RetrievalConfig::default();
        let composer = Composer::new(&store, &facts, &DisabledProvider, &ExtractiveGenerator, &config);

        let result = composer
            .answer("What does the guide say about corporate governance?", None)
            .await
            .unwrap();
        assert_eq!(facts.lookups.load(Ordering::SeqCst), 0);
        assert!(result
            .citations
            .iter()
            .all(|c| matches!(c, Citation::Document { .. })));
    }

    #[tokio::test]
    async fn no_evidence_is_explicit() {
        let store = InMemoryStore::new();
        let facts = spy().await;
        let config = RetrievalConfig::default();
        let composer = Composer::new(&store, &facts, &DisabledProvider, &ExtractiveGenerator, &config);

        let result = composer
            .answer("What is the treatment of cryptocurrency mining?", None)
            .await
            .unwrap();
        assert!(result.no_answer);
        assert_eq!(result.text, NO_ANSWER_TEXT);
        assert!(result.citations.is_empty());
        assert_eq!(result.confidence, Confidence::None);
    }

    #[tokio::test]
    async fn fact_without_documents_is_medium() {
        let store = InMemoryStore::new();
        let facts = spy().await;
        let config = RetrievalConfig::default();
        let composer = Composer::new(&store, &facts, &DisabledProvider, &ExtractiveGenerator, &config);

        let result = composer.answer("What is the GST rate?", None).await.unwrap();
        assert!(result.text.contains("9%"));
        assert!(result.text.contains(NO_SUPPORT_NOTE));
        assert_eq!(result.confidence, Confidence::Medium);
        assert_eq!(result.citations.len(), 1);
    }

    #[tokio::test]
    async fn multi_part_answers_in_order() {
        let store = InMemoryStore::new();
        let facts = spy().await;
        let config = RetrievalConfig::default();
        let composer = Composer::new(&store, &facts, &DisabledProvider, &ExtractiveGenerator, &config);

        let result = composer
            .answer("What is the GST rate and when is the filing deadline?", None)
            .await
            .unwrap();
        assert_eq!(result.intent, QueryIntent::MultiPart);
        assert_eq!(result.parts.len(), 2);
        let first = result.text.find("Question 1: What is the GST rate?").unwrap();
        let second = result.text.find("Question 2: When is the filing deadline?").unwrap();
        assert!(first < second);
        assert!(result.text.contains("9%"));
        assert!(result.text.contains("18 April"));
        assert_eq!(result.citations.len(), 2);
        assert!(!result.no_answer);
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let store = InMemoryStore::new();
        let facts = spy().await;
        let config = RetrievalConfig::default();
        let composer = Composer::new(&store, &facts, &DisabledProvider, &ExtractiveGenerator, &config);
        assert!(matches!(
            composer.answer("   ", None).await,
            Err(QueryError::EmptyQuestion)
        ));
    }
}
