//! Batch ingestion of a directory of PDFs.
//!
//! Each discovered file runs through the pipeline independently:
//!
//! ```text
//! read → fingerprint → lock(name) → ledger check
//!      → parse (blocking, timed) → metadata → classify → chunk
//!      → embed (timed, cache by chunk hash) → atomic commit (CAS)
//! ```
//!
//! Up to `ingest.max_workers` files are in flight at once. A failing file is
//! recorded in the report and never stops the batch. Files whose fingerprint
//! matches the ledger are skipped without parsing, so a second run over an
//! unchanged directory writes nothing. After all files finish, ledger
//! entries under the root that the run's globs select but that were not
//! found are retired according to `ingest.removed_policy`. A `--pattern`
//! run therefore never retires documents outside its pattern.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use uuid::Uuid;

use crate::chunk::{chunk_document, document_text};
use crate::classify::{classify, Signals};
use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{IngestError, ParseError};
use crate::metadata::extract_metadata;
use crate::models::{Chunk, DocType, DocumentMetadata, SourceDocument, VersionStatus};
use crate::parser::parse_pdf;
use crate::progress::{IngestProgressEvent, NoProgress, ProgressMode, ProgressReporter};
use crate::scan::{discover, FileSelector};
use crate::store::sqlite::SqliteStore;
use crate::store::{CommitOutcome, DocumentCommit, EmbeddedChunks, Store};
use crate::versions::{change_details, fingerprint, logical_name, next_record, DocLocks, VersionDetector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    New,
    Updated,
    Skipped,
    Failed,
    Removed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::New => "new",
            FileStatus::Updated => "updated",
            FileStatus::Skipped => "skipped",
            FileStatus::Failed => "failed",
            FileStatus::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub path: String,
    pub name: String,
    pub status: FileStatus,
    pub chunks: usize,
    pub doc_type: Option<DocType>,
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub run_id: String,
    pub root: String,
    pub new: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub removed: usize,
    /// Sorted by path; removed documents last.
    pub files: Vec<FileOutcome>,
    pub total_ms: u64,
    pub avg_ms: u64,
}

impl ProcessingReport {
    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files.iter().filter(|f| f.status == FileStatus::Failed)
    }
}

/// What a successful pipeline pass produced for one file.
struct Indexed {
    status: FileStatus,
    chunks: usize,
    doc_type: Option<DocType>,
    confidence: Option<f64>,
    changes: Vec<String>,
}

impl Indexed {
    fn skipped() -> Self {
        Self {
            status: FileStatus::Skipped,
            chunks: 0,
            doc_type: None,
            confidence: None,
            changes: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct BatchProcessor {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    locks: DocLocks,
    progress: Arc<dyn ProgressReporter>,
}

impl BatchProcessor {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            config,
            store,
            embedder,
            locks: DocLocks::new(),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Ingest every file under `dir` matching `pattern` (or the configured
    /// include globs).
    pub async fn run(&self, dir: &Path, pattern: Option<&str>) -> Result<ProcessingReport> {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let root = dir
            .canonicalize()
            .with_context(|| format!("ingest root not found: {}", dir.display()))?;
        let root_str = root.display().to_string();

        self.progress.report(IngestProgressEvent::Discovering {
            root: root_str.clone(),
        });
        let includes = match pattern {
            Some(p) => vec![p.to_string()],
            None => self.config.ingest.include_globs.clone(),
        };
        let selector = FileSelector::new(&includes, &self.config.ingest.exclude_globs)?;
        let files = discover(&root, &selector, self.config.ingest.follow_symlinks)?;
        tracing::info!(run_id = %run_id, root = %root_str, files = files.len(), "batch started");

        let seen: HashSet<String> = files.iter().map(|p| logical_name(&root, p)).collect();
        let total = files.len() as u64;

        let semaphore = Arc::new(Semaphore::new(self.config.ingest.max_workers));
        let mut tasks = JoinSet::new();
        for path in files {
            let permit = semaphore.clone().acquire_owned().await?;
            let worker = self.clone();
            let root = root.clone();
            tasks.spawn(async move {
                let outcome = worker.process_file(&root, &path).await;
                drop(permit);
                outcome
            });
        }

        let mut outcomes = Vec::new();
        let mut done = 0u64;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.context("ingest worker panicked")?;
            done += 1;
            self.progress.report(IngestProgressEvent::Processing {
                root: root_str.clone(),
                n: done,
                total,
                file: outcome.path.clone(),
            });
            outcomes.push(outcome);
        }
        outcomes.sort_by(|a, b| a.path.cmp(&b.path));

        let processed = outcomes.len();
        let file_ms: u64 = outcomes.iter().map(|o| o.elapsed_ms).sum();
        outcomes.extend(self.retire_missing(&root, &seen, &selector).await?);

        let count = |s: FileStatus| outcomes.iter().filter(|o| o.status == s).count();
        let report = ProcessingReport {
            run_id,
            root: root_str,
            new: count(FileStatus::New),
            updated: count(FileStatus::Updated),
            skipped: count(FileStatus::Skipped),
            failed: count(FileStatus::Failed),
            removed: count(FileStatus::Removed),
            total_ms: started.elapsed().as_millis() as u64,
            avg_ms: if processed == 0 {
                0
            } else {
                file_ms / processed as u64
            },
            files: outcomes,
        };
        tracing::info!(
            run_id = %report.run_id,
            new = report.new,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            removed = report.removed,
            total_ms = report.total_ms,
            "batch finished"
        );
        Ok(report)
    }

    async fn process_file(&self, root: &Path, path: &Path) -> FileOutcome {
        let started = Instant::now();
        let name = logical_name(root, path);
        let result = self.index_file(&name, path).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let path_str = path.display().to_string();

        match result {
            Ok(indexed) => {
                tracing::info!(
                    file = %path_str,
                    status = indexed.status.as_str(),
                    chunks = indexed.chunks,
                    "indexed"
                );
                FileOutcome {
                    path: path_str,
                    name,
                    status: indexed.status,
                    chunks: indexed.chunks,
                    doc_type: indexed.doc_type,
                    confidence: indexed.confidence,
                    changes: indexed.changes,
                    error: None,
                    elapsed_ms,
                }
            }
            Err(err) => {
                tracing::warn!(file = %path_str, error = %err, "file failed");
                FileOutcome {
                    path: path_str,
                    name,
                    status: FileStatus::Failed,
                    chunks: 0,
                    doc_type: None,
                    confidence: None,
                    changes: Vec::new(),
                    error: Some(err.to_string()),
                    elapsed_ms,
                }
            }
        }
    }

    async fn index_file(&self, name: &str, path: &Path) -> Result<Indexed, IngestError> {
        let bytes = tokio::fs::read(path).await?;
        let fp = fingerprint(&bytes);
        let byte_len = bytes.len() as u64;
        let path_str = path.display().to_string();

        let _guard = self.locks.lock(name).await;
        let detector = VersionDetector::new(self.store.as_ref());
        let mut detection = detector.check(name, &fp).await.map_err(store_err)?;
        if detection.status == VersionStatus::Unchanged {
            return Ok(Indexed::skipped());
        }

        let secs = self.config.ingest.parse_timeout_secs;
        let parsed = match timeout(
            Duration::from_secs(secs),
            tokio::task::spawn_blocking(move || parse_pdf(&bytes)),
        )
        .await
        {
            Err(_) => return Err(IngestError::Timeout { stage: "parse", secs }),
            Ok(Err(join)) => {
                return Err(ParseError::Invalid(format!("parser task failed: {}", join)).into())
            }
            Ok(Ok(parsed)) => parsed?,
        };

        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        let sample_blocks = self.config.metadata.sample_blocks;
        let extracted = extract_metadata(&parsed, &file_name, sample_blocks);
        let sample = parsed.sample_text(sample_blocks);
        let class = classify(
            &Signals {
                meta: &extracted,
                sample: &sample,
                file_name: &file_name,
            },
            self.config.metadata.min_confidence,
        );
        let metadata = DocumentMetadata {
            doc_type: class.doc_type,
            title: extracted.title_or_unknown(),
            act_name: extracted.act_name.clone(),
            year: extracted.year,
            confidence: class.confidence,
            reasons: class.reasons,
            tax_categories: extracted.tax_categories.clone(),
            years_of_assessment: extracted.years_of_assessment.clone(),
            last_updated: extracted.last_updated.clone(),
        };

        let chunks = chunk_document(name, &fp, &parsed, &self.config.chunking);
        let embeddings = self.embed_chunks(&chunks).await?;

        let now = chrono::Utc::now().timestamp();
        let source = SourceDocument {
            name: name.to_string(),
            path: path_str.clone(),
            fingerprint: fp.clone(),
            byte_len,
            page_count: parsed.page_count,
            text: document_text(&parsed).0,
            extracted_at: now,
        };

        for attempt in 0..2 {
            let changes = match &detection.prior {
                Some(prior) if detection.status == VersionStatus::Updated => {
                    let prior_doc = self.store.get_document(name).await.map_err(store_err)?;
                    change_details(
                        prior,
                        prior_doc.as_ref().map(|d| &d.metadata),
                        &fp,
                        byte_len,
                        &metadata,
                    )
                    .0
                }
                _ => Vec::new(),
            };

            let commit = DocumentCommit {
                source: source.clone(),
                metadata: metadata.clone(),
                chunks: chunks.clone(),
                embeddings: embeddings.clone(),
                record: next_record(name, &path_str, &fp, byte_len, &detection, now),
                expected_fingerprint: detection.expected_fingerprint(),
            };

            match self.store.commit_document(&commit).await.map_err(store_err)? {
                CommitOutcome::Committed => {
                    return Ok(Indexed {
                        status: if detection.status == VersionStatus::New {
                            FileStatus::New
                        } else {
                            FileStatus::Updated
                        },
                        chunks: chunks.len(),
                        doc_type: Some(metadata.doc_type),
                        confidence: Some(metadata.confidence),
                        changes,
                    });
                }
                CommitOutcome::Conflict => {
                    tracing::debug!(document = name, attempt, "ledger moved; re-checking");
                    detection = detector.check(name, &fp).await.map_err(store_err)?;
                    if detection.status == VersionStatus::Unchanged {
                        return Ok(Indexed::skipped());
                    }
                }
            }
        }

        Err(IngestError::VersionConflict {
            name: name.to_string(),
        })
    }

    /// Vectors for `chunks` in order, reusing cached vectors by chunk hash.
    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Option<EmbeddedChunks>, IngestError> {
        if !self.embedder.is_enabled() || chunks.is_empty() {
            return Ok(None);
        }
        let model = self.embedder.model_name().to_string();
        let hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();
        let mut vectors: HashMap<String, Vec<f32>> = self
            .store
            .cached_embeddings(&model, &hashes)
            .await
            .map_err(store_err)?;

        let mut missing: Vec<&Chunk> = Vec::new();
        for c in chunks {
            if !vectors.contains_key(&c.hash) && !missing.iter().any(|m| m.hash == c.hash) {
                missing.push(c);
            }
        }

        let secs = self.config.embedding.timeout_secs;
        for batch in missing.chunks(self.config.embedding.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedded = timeout(Duration::from_secs(secs), self.embedder.embed(&texts))
                .await
                .map_err(|_| IngestError::Timeout {
                    stage: "embedding",
                    secs,
                })?
                .map_err(|e| IngestError::Embedding(format!("{:#}", e)))?;
            if embedded.len() != texts.len() {
                return Err(IngestError::Embedding(format!(
                    "provider returned {} vectors for {} texts",
                    embedded.len(),
                    texts.len()
                )));
            }
            for (c, v) in batch.iter().zip(embedded) {
                vectors.insert(c.hash.clone(), v);
            }
        }

        let ordered = chunks
            .iter()
            .map(|c| {
                vectors
                    .get(&c.hash)
                    .cloned()
                    .ok_or_else(|| IngestError::Embedding(format!("no vector for chunk {}", c.id)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(
            chunks = chunks.len(),
            embedded = missing.len(),
            reused = chunks.len() - missing.len(),
            "chunks embedded"
        );
        Ok(Some(EmbeddedChunks {
            model,
            vectors: ordered,
        }))
    }

    async fn retire_missing(
        &self,
        root: &Path,
        seen: &HashSet<String>,
        selector: &FileSelector,
    ) -> Result<Vec<FileOutcome>> {
        let detector = VersionDetector::new(self.store.as_ref());
        let policy = self.config.ingest.removed_policy;
        let mut out = Vec::new();
        for name in detector.detect_removed(seen, root, selector).await? {
            let _guard = self.locks.lock(&name).await;
            let path = self
                .store
                .get_version(&name)
                .await?
                .map(|r| r.path)
                .unwrap_or_default();
            self.store
                .retire_document(&name, policy, chrono::Utc::now().timestamp())
                .await?;
            tracing::info!(document = %name, ?policy, "document removed");
            out.push(FileOutcome {
                path,
                name,
                status: FileStatus::Removed,
                chunks: 0,
                doc_type: None,
                confidence: None,
                changes: Vec::new(),
                error: None,
                elapsed_ms: 0,
            });
        }
        Ok(out)
    }
}

fn store_err(err: anyhow::Error) -> IngestError {
    IngestError::Store(format!("{:#}", err))
}

/// `taxlens ingest`: run a batch over `dir` (or `ingest.root`) and print
/// the report.
pub async fn run_ingest(
    config: &Config,
    dir: Option<PathBuf>,
    pattern: Option<String>,
    progress: ProgressMode,
    json: bool,
) -> Result<()> {
    let dir = dir
        .or_else(|| config.ingest.root.clone())
        .ok_or_else(|| anyhow::anyhow!("no directory given and ingest.root is not set"))?;

    let store = Arc::new(SqliteStore::open(config).await?);
    let embedder = embedding::create_provider(&config.embedding)?;
    let processor = BatchProcessor::new(Arc::new(config.clone()), store.clone(), embedder)
        .with_progress(Arc::from(progress.reporter()));

    let report = tokio::select! {
        report = processor.run(&dir, pattern.as_deref()) => report,
        _ = tokio::signal::ctrl_c() => {
            store.close().await;
            anyhow::bail!("interrupted; documents committed so far are kept");
        }
    };
    store.close().await;
    let report = report?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("ingest {}", report.root);
    println!("  new: {}", report.new);
    println!("  updated: {}", report.updated);
    println!("  skipped: {}", report.skipped);
    println!("  removed: {}", report.removed);
    println!("  failed: {}", report.failed);
    for f in report.failures() {
        println!(
            "    {}: {}",
            f.path,
            f.error.as_deref().unwrap_or("unknown error")
        );
    }
    for f in report.files.iter().filter(|f| !f.changes.is_empty()) {
        println!("  changed {}: {}", f.name, f.changes.join(", "));
    }
    println!("  time: {} ms (avg {} ms/file)", report.total_ms, report.avg_ms);
    println!("ok");
    Ok(())
}
