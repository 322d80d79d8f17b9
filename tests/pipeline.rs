//! End-to-end pipeline tests against an on-disk SQLite index.

mod common;

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taxlens::answer::{Composer, NO_ANSWER_TEXT};
use taxlens::batch::{BatchProcessor, FileStatus, ProcessingReport};
use taxlens::config::RemovedPolicy;
use taxlens::embedding::{DisabledProvider, EmbeddingProvider};
use taxlens::error::FactError;
use taxlens::facts::{import_seed, FactStore, InsertOutcome};
use taxlens::generate::ExtractiveGenerator;
use taxlens::models::{
    Chunk, Citation, Confidence, FactEntry, FactValue, QueryIntent, VersionRecord, VersionStatus,
};
use taxlens::store::sqlite::SqliteStore;
use taxlens::store::{
    ChunkCandidate, CommitOutcome, DocumentCommit, IndexCounts, IndexedChunk, Store,
    StoredDocument,
};
use tempfile::TempDir;

use common::*;

#[tokio::test]
async fn corrupt_file_does_not_stop_the_batch() {
    let tmp = TempDir::new().unwrap();
    let corpus = tmp.path().join("corpus");
    write_corpus(&corpus);
    write_corrupt(&corpus);

    let config = test_config(tmp.path(), RemovedPolicy::MarkInactive, "hash");
    let (store, processor) = processor(&config).await;
    let report = processor.run(&corpus, None).await.unwrap();

    assert_eq!(report.new, 9, "report: {:?}", report.files);
    assert_eq!(report.failed, 1);
    let failed: Vec<_> = report.failures().collect();
    assert!(failed[0].path.ends_with("truncated.pdf"));
    assert!(failed[0].error.as_deref().is_some_and(|e| !e.is_empty()));

    let counts = store.counts().await.unwrap();
    assert_eq!(counts.active_documents, 9);
    assert!(counts.chunks >= 9);
    assert_eq!(counts.vectors, counts.chunks);
    // The failed file never reaches the ledger.
    assert!(store.get_version("broken/truncated").await.unwrap().is_none());
}

#[tokio::test]
async fn second_run_over_unchanged_corpus_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let corpus = tmp.path().join("corpus");
    write_corpus(&corpus);

    let config = test_config(tmp.path(), RemovedPolicy::MarkInactive, "hash");
    let (store, processor) = processor(&config).await;
    processor.run(&corpus, None).await.unwrap();
    let before = store.counts().await.unwrap();
    let ledger_before = store.list_versions().await.unwrap();

    let second = processor.run(&corpus, None).await.unwrap();
    assert_eq!(second.skipped, 9);
    assert_eq!(second.new + second.updated + second.failed + second.removed, 0);

    let after = store.counts().await.unwrap();
    assert_eq!(before.chunks, after.chunks);
    assert_eq!(before.vectors, after.vectors);
    assert_eq!(ledger_before, store.list_versions().await.unwrap());
    assert!(store
        .version_history("guides/gst-general-guide")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn updated_document_replaces_old_chunks() {
    let tmp = TempDir::new().unwrap();
    let corpus = tmp.path().join("corpus");
    write_corpus(&corpus);

    let config = test_config(tmp.path(), RemovedPolicy::MarkInactive, "hash");
    let (store, processor) = processor(&config).await;
    processor.run(&corpus, None).await.unwrap();

    let name = "circulars/circular-2023-07";
    let old_hits = store.keyword_search(&["shipping".to_string()], 10).await.unwrap();
    assert!(old_hits.iter().any(|c| c.document_id == name));

    write_pdf(
        &corpus,
        "circulars/circular-2023-07.pdf",
        &[&[
            "IRAS Circular No. 7 of 2023",
            "Aircraft Leasing Incentive",
            "Issued: 2 January 2024",
            "1 Introduction",
            CIRCULAR_REVISED,
            "Qualifying income derived from the leasing of aircraft is taxed at a concessionary rate.",
        ]],
    );

    let report = processor.run(&corpus, None).await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.skipped, 8);
    let outcome = report.files.iter().find(|f| f.name == name).unwrap();
    assert_eq!(outcome.status, FileStatus::Updated);
    assert!(outcome.changes.contains(&"content_changed".to_string()));
    assert!(outcome.changes.contains(&"version_date_changed".to_string()));

    let stale = store.keyword_search(&["shipping".to_string()], 10).await.unwrap();
    assert!(stale.iter().all(|c| c.document_id != name));
    let fresh = store.keyword_search(&["lessors".to_string()], 10).await.unwrap();
    assert!(fresh.iter().any(|c| c.document_id == name));
    assert!(store
        .document_chunks(name)
        .await
        .unwrap()
        .iter()
        .all(|c| !c.text.contains("shipping")));

    let record = store.get_version(name).await.unwrap().unwrap();
    assert_eq!(record.status, VersionStatus::Updated);
    assert_eq!(record.version, 2);
    let history = store.version_history(name).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(Some(history[0].fingerprint.clone()), record.prior_fingerprint);
}

#[tokio::test]
async fn removed_document_marked_inactive() {
    let tmp = TempDir::new().unwrap();
    let corpus = tmp.path().join("corpus");
    write_corpus(&corpus);

    let config = test_config(tmp.path(), RemovedPolicy::MarkInactive, "hash");
    let (store, processor) = processor(&config).await;
    processor.run(&corpus, None).await.unwrap();

    let name = "orders/income-tax-remission-order";
    fs::remove_file(corpus.join("orders/income-tax-remission-order.pdf")).unwrap();
    let report = processor.run(&corpus, None).await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.skipped, 8);

    let record = store.get_version(name).await.unwrap().unwrap();
    assert_eq!(record.status, VersionStatus::Removed);
    let doc = store.get_document(name).await.unwrap().unwrap();
    assert!(!doc.active);
    assert!(!store.document_chunks(name).await.unwrap().is_empty());
    let hits = store.keyword_search(&["remission".to_string()], 10).await.unwrap();
    assert!(hits.iter().all(|c| c.document_id != name));

    // A third run does not report it again.
    let again = processor.run(&corpus, None).await.unwrap();
    assert_eq!(again.removed, 0);

    // Restoring the file reactivates it.
    write_pdf(
        &corpus,
        "orders/income-tax-remission-order.pdf",
        &[&[
            "INCOME TAX (REMISSION OF TAX) ORDER 2022",
            "2. Remission",
            "The tax payable by a qualifying charity on its rental income is remitted.",
        ]],
    );
    let restored = processor.run(&corpus, None).await.unwrap();
    assert_eq!(restored.updated, 1);
    assert!(store.get_document(name).await.unwrap().unwrap().active);
}

#[tokio::test]
async fn removed_document_purged() {
    let tmp = TempDir::new().unwrap();
    let corpus = tmp.path().join("corpus");
    write_corpus(&corpus);

    let config = test_config(tmp.path(), RemovedPolicy::Purge, "hash");
    let (store, processor) = processor(&config).await;
    processor.run(&corpus, None).await.unwrap();
    let before = store.counts().await.unwrap();

    let name = "orders/income-tax-remission-order";
    let purged_chunks = store.document_chunks(name).await.unwrap().len() as i64;
    fs::remove_file(corpus.join("orders/income-tax-remission-order.pdf")).unwrap();
    let report = processor.run(&corpus, None).await.unwrap();
    assert_eq!(report.removed, 1);

    assert!(store.get_document(name).await.unwrap().is_none());
    assert!(store.document_chunks(name).await.unwrap().is_empty());
    let after = store.counts().await.unwrap();
    assert_eq!(after.documents, before.documents - 1);
    assert_eq!(after.chunks, before.chunks - purged_chunks);
    assert_eq!(after.vectors, after.chunks);
    assert_eq!(
        store.get_version(name).await.unwrap().unwrap().status,
        VersionStatus::Removed
    );
}

#[tokio::test]
async fn pattern_limits_the_batch() {
    let tmp = TempDir::new().unwrap();
    let corpus = tmp.path().join("corpus");
    write_corpus(&corpus);

    let config = test_config(tmp.path(), RemovedPolicy::MarkInactive, "disabled");
    let (store, processor) = processor(&config).await;
    let report = processor.run(&corpus, Some("acts/*.pdf")).await.unwrap();
    assert_eq!(report.new, 2);
    assert_eq!(store.counts().await.unwrap().vectors, 0);
}

#[tokio::test]
async fn pattern_run_leaves_other_documents_alone() {
    let tmp = TempDir::new().unwrap();
    let corpus = tmp.path().join("corpus");
    write_corpus(&corpus);

    let config = test_config(tmp.path(), RemovedPolicy::Purge, "disabled");
    let (store, processor) = processor(&config).await;
    assert_eq!(processor.run(&corpus, None).await.unwrap().new, 9);

    let report = processor.run(&corpus, Some("acts/*.pdf")).await.unwrap();
    assert_eq!(report.skipped, 2);
    assert_eq!(report.removed, 0);
    let counts = store.counts().await.unwrap();
    assert_eq!(counts.documents, 9);
    assert_eq!(counts.active_documents, 9);

    // A file deleted inside the pattern is still retired.
    fs::remove_file(corpus.join("acts/goods-and-services-tax-act.pdf")).unwrap();
    let report = processor.run(&corpus, Some("acts/*.pdf")).await.unwrap();
    assert_eq!(report.removed, 1);
    assert_eq!(report.files.last().unwrap().name, "acts/goods-and-services-tax-act");
    assert_eq!(store.counts().await.unwrap().documents, 8);
}

/// Never answers within the configured embedding timeout.
struct StalledEmbedder;

#[async_trait]
impl EmbeddingProvider for StalledEmbedder {
    fn model_name(&self) -> &str {
        "stalled"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
    }
}

#[tokio::test]
async fn embedding_timeout_fails_the_file_without_committing() {
    let tmp = TempDir::new().unwrap();
    let corpus = tmp.path().join("corpus");
    write_pdf(
        &corpus,
        "guides/gst-general-guide.pdf",
        &[&["GST: General Guide for Businesses", "GST is charged on standard-rated supplies."]],
    );

    let mut config = test_config(tmp.path(), RemovedPolicy::MarkInactive, "hash");
    config.embedding.timeout_secs = 1;
    let store = Arc::new(SqliteStore::open(&config).await.unwrap());
    let processor = BatchProcessor::new(
        Arc::new(config.clone()),
        store.clone(),
        Arc::new(StalledEmbedder),
    );

    let report = processor.run(&corpus, None).await.unwrap();
    assert_eq!(report.failed, 1);
    let failed = &report.files[0];
    assert_eq!(failed.status, FileStatus::Failed);
    assert!(
        failed.error.as_deref().is_some_and(|e| e.contains("embedding timed out")),
        "error: {:?}",
        failed.error
    );
    assert!(store.get_version("guides/gst-general-guide").await.unwrap().is_none());
    let counts = store.counts().await.unwrap();
    assert_eq!(counts.documents, 0);
    assert_eq!(counts.chunks, 0);
}

/// Reports a ledger conflict for the first `conflicts` commits, then
/// delegates to the real store.
struct RacingStore {
    inner: Arc<SqliteStore>,
    conflicts: AtomicUsize,
    attempts: AtomicUsize,
}

impl RacingStore {
    fn new(inner: Arc<SqliteStore>, conflicts: usize) -> Self {
        Self {
            inner,
            conflicts: AtomicUsize::new(conflicts),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Store for RacingStore {
    async fn get_version(&self, name: &str) -> anyhow::Result<Option<VersionRecord>> {
        self.inner.get_version(name).await
    }
    async fn list_versions(&self) -> anyhow::Result<Vec<VersionRecord>> {
        self.inner.list_versions().await
    }
    async fn version_history(&self, name: &str) -> anyhow::Result<Vec<VersionRecord>> {
        self.inner.version_history(name).await
    }
    async fn commit_document(&self, commit: &DocumentCommit) -> anyhow::Result<CommitOutcome> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.conflicts.load(Ordering::SeqCst);
        if left > 0 {
            self.conflicts.store(left - 1, Ordering::SeqCst);
            return Ok(CommitOutcome::Conflict);
        }
        self.inner.commit_document(commit).await
    }
    async fn retire_document(
        &self,
        name: &str,
        policy: RemovedPolicy,
        now: i64,
    ) -> anyhow::Result<()> {
        self.inner.retire_document(name, policy, now).await
    }
    async fn get_document(&self, name: &str) -> anyhow::Result<Option<StoredDocument>> {
        self.inner.get_document(name).await
    }
    async fn list_documents(&self) -> anyhow::Result<Vec<StoredDocument>> {
        self.inner.list_documents().await
    }
    async fn document_chunks(&self, name: &str) -> anyhow::Result<Vec<Chunk>> {
        self.inner.document_chunks(name).await
    }
    async fn keyword_search(
        &self,
        terms: &[String],
        limit: i64,
    ) -> anyhow::Result<Vec<ChunkCandidate>> {
        self.inner.keyword_search(terms, limit).await
    }
    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: i64,
    ) -> anyhow::Result<Vec<ChunkCandidate>> {
        self.inner.vector_search(query_vec, limit).await
    }
    async fn fetch_chunks(&self, ids: &[String]) -> anyhow::Result<Vec<IndexedChunk>> {
        self.inner.fetch_chunks(ids).await
    }
    async fn cached_embeddings(
        &self,
        model: &str,
        hashes: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<f32>>> {
        self.inner.cached_embeddings(model, hashes).await
    }
    async fn counts(&self) -> anyhow::Result<IndexCounts> {
        self.inner.counts().await
    }
}

async fn run_racing(conflicts: usize) -> (TempDir, Arc<RacingStore>, ProcessingReport) {
    let tmp = TempDir::new().unwrap();
    let corpus = tmp.path().join("corpus");
    write_pdf(
        &corpus,
        "acts/income-tax-act.pdf",
        &[&["INCOME TAX ACT 1947", "10. Charge of income tax", "Income tax shall be payable."]],
    );
    let config = test_config(tmp.path(), RemovedPolicy::MarkInactive, "disabled");
    let inner = Arc::new(SqliteStore::open(&config).await.unwrap());
    let store = Arc::new(RacingStore::new(inner, conflicts));
    let processor = BatchProcessor::new(
        Arc::new(config.clone()),
        store.clone(),
        Arc::new(DisabledProvider),
    );
    let report = processor.run(&corpus, None).await.unwrap();
    (tmp, store, report)
}

#[tokio::test]
async fn single_version_conflict_is_retried() {
    let (_tmp, store, report) = run_racing(1).await;
    assert_eq!(report.new, 1, "report: {:?}", report.files);
    assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    assert!(store.get_version("acts/income-tax-act").await.unwrap().is_some());
}

#[tokio::test]
async fn repeated_version_conflict_is_reported() {
    let (_tmp, store, report) = run_racing(2).await;
    assert_eq!(report.failed, 1);
    assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    let failed = report.failures().next().unwrap();
    assert_eq!(failed.name, "acts/income-tax-act");
    assert!(
        failed.error.as_deref().is_some_and(|e| e.contains("version conflict")),
        "error: {:?}",
        failed.error
    );
    assert!(store.get_version("acts/income-tax-act").await.unwrap().is_none());
}

#[tokio::test]
async fn temporal_facts_from_seed() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path(), RemovedPolicy::MarkInactive, "disabled");
    let (store, _) = processor(&config).await;

    let first = import_seed(store.as_ref(), &facts_seed()).await.unwrap();
    assert!(first.inserted > 20);
    let second = import_seed(store.as_ref(), &facts_seed()).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.unchanged, first.inserted);

    let rate = |year: Option<i32>| {
        let store = store.clone();
        async move {
            store
                .lookup("non_resident_rate", "other_income", year)
                .await
                .unwrap()
                .map(|f| f.value)
        }
    };
    assert_eq!(rate(Some(2023)).await, Some(FactValue::Number(22.0)));
    assert_eq!(rate(Some(2024)).await, Some(FactValue::Number(24.0)));
    assert_eq!(rate(None).await, Some(FactValue::Number(24.0)));
    assert_eq!(rate(Some(2000)).await, None);

    let history = store.history("gst", "standard_rate").await.unwrap();
    let years: Vec<i32> = history.iter().map(|f| f.effective_from).collect();
    assert_eq!(years, vec![2007, 2023, 2024]);

    let conflicting = FactEntry {
        topic: "gst".into(),
        subkey: "standard_rate".into(),
        value: FactValue::Number(10.0),
        unit: "percent".into(),
        effective_from: 2024,
        last_verified: None,
        source_note: String::new(),
    };
    assert!(matches!(
        store.insert_fact(&conflicting).await,
        Err(FactError::Conflict { .. })
    ));
    assert_eq!(
        store.insert_fact(&history[2]).await.unwrap(),
        InsertOutcome::Unchanged
    );
}

#[tokio::test]
async fn answers_route_between_facts_and_documents() {
    let tmp = TempDir::new().unwrap();
    let corpus = tmp.path().join("corpus");
    write_corpus(&corpus);

    let config = test_config(tmp.path(), RemovedPolicy::MarkInactive, "disabled");
    let (store, processor) = processor(&config).await;
    processor.run(&corpus, None).await.unwrap();
    import_seed(store.as_ref(), &facts_seed()).await.unwrap();

    let composer = Composer::new(
        store.as_ref(),
        store.as_ref(),
        &DisabledProvider,
        &ExtractiveGenerator,
        &config.retrieval,
    );

    let gst = composer.answer("What is the GST rate?", None).await.unwrap();
    assert_eq!(gst.intent, QueryIntent::FactualNumeric);
    assert!(gst.text.contains("9%"), "{}", gst.text);
    assert!(matches!(
        gst.citations.first(),
        Some(Citation::StructuredFacts { effective_from: 2024, .. })
    ));
    assert!(gst.citations.iter().any(|c| matches!(
        c,
        Citation::Document { document, .. } if document == "guides/gst-general-guide"
    )));
    assert_eq!(gst.confidence, Confidence::High);

    let dated = composer
        .answer("What was the non-resident tax rate in 2023?", None)
        .await
        .unwrap();
    assert!(dated.text.contains("22%"), "{}", dated.text);

    let conceptual = composer
        .answer("Who is considered a tax resident individual?", None)
        .await
        .unwrap();
    assert_eq!(conceptual.intent, QueryIntent::Conceptual);
    assert!(!conceptual.no_answer);
    assert!(conceptual
        .citations
        .iter()
        .all(|c| matches!(c, Citation::Document { .. })));

    let nothing = composer
        .answer("What is the treatment of cryptocurrency mining?", None)
        .await
        .unwrap();
    assert!(nothing.no_answer);
    assert_eq!(nothing.text, NO_ANSWER_TEXT);
    assert!(nothing.citations.is_empty());
    assert_eq!(nothing.confidence, Confidence::None);
}

#[tokio::test]
async fn multi_part_question_answers_each_part() {
    let tmp = TempDir::new().unwrap();
    let corpus = tmp.path().join("corpus");
    write_corpus(&corpus);

    let config = test_config(tmp.path(), RemovedPolicy::MarkInactive, "disabled");
    let (store, processor) = processor(&config).await;
    processor.run(&corpus, None).await.unwrap();
    import_seed(store.as_ref(), &facts_seed()).await.unwrap();

    let composer = Composer::new(
        store.as_ref(),
        store.as_ref(),
        &DisabledProvider,
        &ExtractiveGenerator,
        &config.retrieval,
    );
    let result = composer
        .answer("What is the GST rate and when is the filing deadline?", None)
        .await
        .unwrap();

    assert_eq!(result.intent, QueryIntent::MultiPart);
    assert_eq!(result.parts.len(), 2);
    let q1 = result.text.find("Question 1:").unwrap();
    let q2 = result.text.find("Question 2:").unwrap();
    assert!(q1 < q2);
    assert!(result.text[q1..q2].contains("9%"));
    assert!(result.text[q2..].contains("18 April"));
    assert!(result.citations.iter().any(|c| matches!(
        c,
        Citation::StructuredFacts { topic, .. } if topic == "filing_deadline"
    )));
}
