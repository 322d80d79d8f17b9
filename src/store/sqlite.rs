//! SQLite-backed [`Store`] and [`FactStore`].
//!
//! Chunks are indexed in FTS5 for keyword candidates and their vectors are
//! stored as little-endian `f32` BLOBs (see [`vec_to_blob`]). Vector search
//! is brute-force cosine over the active documents' vectors.
//!
//! Every mutation runs in one transaction that takes the database write
//! lock before reading the ledger, so the fingerprint compare and the
//! chunk swap are atomic with respect to other writers, including other
//! processes sharing the file.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::config::{Config, RemovedPolicy};
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::FactError;
use crate::facts::{same_value, FactStore, InsertOutcome};
use crate::migrate;
use crate::models::{Chunk, DocType, DocumentMetadata, FactEntry, FactValue, VersionRecord};

use super::{
    ChunkCandidate, CommitOutcome, DocumentCommit, IndexCounts, IndexedChunk, Store,
    StoredDocument,
};

const CHUNK_COLUMNS: &str = "c.id, c.document_id, c.chunk_index, c.text, c.span_start, \
     c.span_end, c.page_start, c.page_end, c.section, c.hash";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to the configured database and bring the schema up to date.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn begin_write(&self, name: &str) -> Result<Transaction<'static, Sqlite>> {
        let mut tx = self.pool.begin().await?;
        // A no-op write takes the RESERVED lock up front; reading first and
        // writing later could fail on a stale WAL snapshot.
        sqlx::query("UPDATE versions SET name = name WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

fn version_from_row(row: &SqliteRow) -> Result<VersionRecord> {
    let status: String = row.get("status");
    Ok(VersionRecord {
        name: row.get("name"),
        path: row.get("path"),
        fingerprint: row.get("fingerprint"),
        prior_fingerprint: row.get("prior_fingerprint"),
        status: status.parse().map_err(anyhow::Error::msg)?,
        version: row.get("version"),
        byte_len: row.get("byte_len"),
        last_processed: row.get("last_processed"),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        span_start: row.get::<i64, _>("span_start") as usize,
        span_end: row.get::<i64, _>("span_end") as usize,
        page_start: row.get::<i64, _>("page_start") as u32,
        page_end: row.get::<i64, _>("page_end") as u32,
        section: row.get("section"),
        hash: row.get("hash"),
    }
}

fn document_from_row(row: &SqliteRow) -> Result<StoredDocument> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: DocumentMetadata =
        serde_json::from_str(&metadata_json).context("corrupt document metadata")?;
    Ok(StoredDocument {
        name: row.get("name"),
        path: row.get("path"),
        fingerprint: row.get("fingerprint"),
        metadata,
        active: row.get::<i64, _>("active") != 0,
        page_count: row.get::<i64, _>("page_count") as u32,
        chunk_count: row.get("chunk_count"),
        last_processed: row.get("last_processed"),
    })
}

fn fact_from_row(row: &SqliteRow) -> Result<FactEntry, FactError> {
    let value_json: String = row.get("value_json");
    let value: FactValue =
        serde_json::from_str(&value_json).map_err(|e| FactError::Store(e.to_string()))?;
    Ok(FactEntry {
        topic: row.get("topic"),
        subkey: row.get("subkey"),
        value,
        unit: row.get("unit"),
        effective_from: row.get::<i64, _>("effective_from") as i32,
        last_verified: row.get("last_verified"),
        source_note: row.get("source_note"),
    })
}

/// FTS5 query: each term becomes a quoted phrase, all OR-ed together.
fn fts_query(terms: &[String]) -> Option<String> {
    let phrases: Vec<String> = terms
        .iter()
        .map(|t| {
            t.split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|p| !p.is_empty())
        .map(|p| format!("\"{}\"", p))
        .collect();
    (!phrases.is_empty()).then(|| phrases.join(" OR "))
}

async fn delete_content(tx: &mut Transaction<'static, Sqlite>, name: &str) -> Result<()> {
    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(name)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(name)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(name)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn archive_version(
    tx: &mut Transaction<'static, Sqlite>,
    name: &str,
    superseded_at: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO version_history
            (name, path, fingerprint, prior_fingerprint, status, version, byte_len, last_processed, superseded_at)
        SELECT name, path, fingerprint, prior_fingerprint, status, version, byte_len, last_processed, ?
        FROM versions WHERE name = ?
        "#,
    )
    .bind(superseded_at)
    .bind(name)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_version(&self, name: &str) -> Result<Option<VersionRecord>> {
        let row = sqlx::query("SELECT * FROM versions WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn list_versions(&self) -> Result<Vec<VersionRecord>> {
        let rows = sqlx::query("SELECT * FROM versions ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(version_from_row).collect()
    }

    async fn version_history(&self, name: &str) -> Result<Vec<VersionRecord>> {
        let rows = sqlx::query("SELECT * FROM version_history WHERE name = ? ORDER BY id")
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(version_from_row).collect()
    }

    async fn commit_document(&self, commit: &DocumentCommit) -> Result<CommitOutcome> {
        let record = &commit.record;
        let name = record.name.as_str();
        let mut tx = self.begin_write(name).await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT fingerprint FROM versions WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;
        if current != commit.expected_fingerprint {
            tx.rollback().await?;
            return Ok(CommitOutcome::Conflict);
        }

        archive_version(&mut tx, name, record.last_processed).await?;
        delete_content(&mut tx, name).await?;

        let meta = &commit.metadata;
        sqlx::query(
            r#"
            INSERT INTO documents (name, path, fingerprint, title, doc_type, confidence, year, metadata_json, active, byte_len, page_count, body, extracted_at, last_processed)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                path = excluded.path,
                fingerprint = excluded.fingerprint,
                title = excluded.title,
                doc_type = excluded.doc_type,
                confidence = excluded.confidence,
                year = excluded.year,
                metadata_json = excluded.metadata_json,
                active = 1,
                byte_len = excluded.byte_len,
                page_count = excluded.page_count,
                body = excluded.body,
                extracted_at = excluded.extracted_at,
                last_processed = excluded.last_processed
            "#,
        )
        .bind(name)
        .bind(&commit.source.path)
        .bind(&commit.source.fingerprint)
        .bind(&meta.title)
        .bind(meta.doc_type.as_str())
        .bind(meta.confidence)
        .bind(meta.year.map(i64::from))
        .bind(serde_json::to_string(meta)?)
        .bind(commit.source.byte_len as i64)
        .bind(commit.source.page_count as i64)
        .bind(&commit.source.text)
        .bind(commit.source.extracted_at)
        .bind(record.last_processed)
        .execute(&mut *tx)
        .await?;

        for chunk in &commit.chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, text, span_start, span_end, page_start, page_end, section, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(name)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.span_start as i64)
            .bind(chunk.span_end as i64)
            .bind(chunk.page_start as i64)
            .bind(chunk.page_end as i64)
            .bind(&chunk.section)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(name)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(embedded) = &commit.embeddings {
            for (chunk, vector) in commit.chunks.iter().zip(&embedded.vectors) {
                let blob = vec_to_blob(vector);
                sqlx::query(
                    "INSERT INTO chunk_vectors (chunk_id, document_id, model, dims, embedding) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&chunk.id)
                .bind(name)
                .bind(&embedded.model)
                .bind(vector.len() as i64)
                .bind(&blob)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO embedding_cache (model, hash, dims, embedding) VALUES (?, ?, ?, ?)
                    ON CONFLICT(model, hash) DO NOTHING
                    "#,
                )
                .bind(&embedded.model)
                .bind(&chunk.hash)
                .bind(vector.len() as i64)
                .bind(&blob)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query(
            r#"
            INSERT INTO versions (name, path, fingerprint, prior_fingerprint, status, version, byte_len, last_processed)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                path = excluded.path,
                fingerprint = excluded.fingerprint,
                prior_fingerprint = excluded.prior_fingerprint,
                status = excluded.status,
                version = excluded.version,
                byte_len = excluded.byte_len,
                last_processed = excluded.last_processed
            "#,
        )
        .bind(name)
        .bind(&record.path)
        .bind(&record.fingerprint)
        .bind(&record.prior_fingerprint)
        .bind(record.status.as_str())
        .bind(record.version)
        .bind(record.byte_len)
        .bind(record.last_processed)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn retire_document(&self, name: &str, policy: RemovedPolicy, now: i64) -> Result<()> {
        let mut tx = self.begin_write(name).await?;
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM versions WHERE name = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            tx.rollback().await?;
            return Ok(());
        }

        archive_version(&mut tx, name, now).await?;
        sqlx::query("UPDATE versions SET status = 'removed', last_processed = ? WHERE name = ?")
            .bind(now)
            .bind(name)
            .execute(&mut *tx)
            .await?;

        match policy {
            RemovedPolicy::MarkInactive => {
                sqlx::query("UPDATE documents SET active = 0 WHERE name = ?")
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
            }
            RemovedPolicy::Purge => {
                delete_content(&mut tx, name).await?;
                sqlx::query("DELETE FROM documents WHERE name = ?")
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, name: &str) -> Result<Option<StoredDocument>> {
        let row = sqlx::query(
            r#"
            SELECT d.*, (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.name) AS chunk_count
            FROM documents d WHERE d.name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents(&self) -> Result<Vec<StoredDocument>> {
        let rows = sqlx::query(
            r#"
            SELECT d.*, (SELECT COUNT(*) FROM chunks c WHERE c.document_id = d.name) AS chunk_count
            FROM documents d ORDER BY d.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn document_chunks(&self, name: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks c WHERE c.document_id = ? ORDER BY c.chunk_index",
            CHUNK_COLUMNS
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    async fn keyword_search(&self, terms: &[String], limit: i64) -> Result<Vec<ChunkCandidate>> {
        let Some(query) = fts_query(terms) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
            SELECT chunks_fts.chunk_id AS chunk_id,
                   chunks_fts.document_id AS document_id,
                   bm25(chunks_fts) AS rank
            FROM chunks_fts
            JOIN documents d ON d.name = chunks_fts.document_id
            WHERE chunks_fts MATCH ? AND d.active = 1
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                // BM25 is lower-is-better
                raw_score: -row.get::<f64, _>("rank"),
            })
            .collect())
    }

    async fn vector_search(&self, query_vec: &[f32], limit: i64) -> Result<Vec<ChunkCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.document_id, cv.embedding
            FROM chunk_vectors cv
            JOIN documents d ON d.name = cv.document_id
            WHERE d.active = 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<ChunkCandidate> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ChunkCandidate {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    raw_score: cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64,
                }
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.raw_score
                .total_cmp(&a.raw_score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(limit.max(0) as usize);
        Ok(candidates)
    }

    async fn fetch_chunks(&self, ids: &[String]) -> Result<Vec<IndexedChunk>> {
        let sql = format!(
            r#"
            SELECT {}, d.title AS doc_title, d.doc_type AS doc_type, d.year AS doc_year,
                   d.confidence AS doc_confidence, d.last_processed AS doc_last_processed
            FROM chunks c
            JOIN documents d ON d.name = c.document_id
            WHERE c.id = ? AND d.active = 1
            "#,
            CHUNK_COLUMNS
        );
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(row) = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            else {
                continue;
            };
            let doc_type: String = row.get("doc_type");
            out.push(IndexedChunk {
                chunk: chunk_from_row(&row),
                title: row.get("doc_title"),
                doc_type: doc_type.parse().unwrap_or(DocType::Unknown),
                year: row.get::<Option<i64>, _>("doc_year").map(|y| y as i32),
                confidence: row.get("doc_confidence"),
                last_processed: row.get("doc_last_processed"),
            });
        }
        Ok(out)
    }

    async fn cached_embeddings(
        &self,
        model: &str,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut found = HashMap::new();
        for hash in hashes {
            let blob: Option<Vec<u8>> = sqlx::query_scalar(
                "SELECT embedding FROM embedding_cache WHERE model = ? AND hash = ?",
            )
            .bind(model)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(blob) = blob {
                found.insert(hash.clone(), blob_to_vec(&blob));
            }
        }
        Ok(found)
    }

    async fn counts(&self) -> Result<IndexCounts> {
        let count = |sql: &'static str| {
            let pool = &self.pool;
            async move { sqlx::query_scalar::<_, i64>(sql).fetch_one(pool).await }
        };
        Ok(IndexCounts {
            documents: count("SELECT COUNT(*) FROM documents").await?,
            active_documents: count("SELECT COUNT(*) FROM documents WHERE active = 1").await?,
            chunks: count("SELECT COUNT(*) FROM chunks").await?,
            vectors: count("SELECT COUNT(*) FROM chunk_vectors").await?,
        })
    }
}

fn store_err(e: impl std::fmt::Display) -> FactError {
    FactError::Store(e.to_string())
}

#[async_trait]
impl FactStore for SqliteStore {
    async fn insert_fact(&self, entry: &FactEntry) -> Result<InsertOutcome, FactError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let existing = sqlx::query(
            "SELECT * FROM facts WHERE topic = ? AND subkey = ? AND effective_from = ?",
        )
        .bind(&entry.topic)
        .bind(&entry.subkey)
        .bind(entry.effective_from as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;

        if let Some(row) = existing {
            let existing = fact_from_row(&row)?;
            return if same_value(&existing, entry) {
                Ok(InsertOutcome::Unchanged)
            } else {
                Err(FactError::Conflict {
                    topic: entry.topic.clone(),
                    subkey: entry.subkey.clone(),
                    effective_from: entry.effective_from,
                })
            };
        }

        let value_json = serde_json::to_string(&entry.value).map_err(store_err)?;
        // The primary key turns a concurrent duplicate into an error rather
        // than an overwrite.
        sqlx::query(
            r#"
            INSERT INTO facts (topic, subkey, effective_from, value_json, unit, last_verified, source_note)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.topic)
        .bind(&entry.subkey)
        .bind(entry.effective_from as i64)
        .bind(&value_json)
        .bind(&entry.unit)
        .bind(&entry.last_verified)
        .bind(&entry.source_note)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        Ok(InsertOutcome::Inserted)
    }

    async fn lookup(
        &self,
        topic: &str,
        subkey: &str,
        as_of_year: Option<i32>,
    ) -> Result<Option<FactEntry>, FactError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM facts
            WHERE topic = ? AND subkey = ? AND (? IS NULL OR effective_from <= ?)
            ORDER BY effective_from DESC
            LIMIT 1
            "#,
        )
        .bind(topic)
        .bind(subkey)
        .bind(as_of_year.map(i64::from))
        .bind(as_of_year.map(i64::from))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(fact_from_row).transpose()
    }

    async fn history(&self, topic: &str, subkey: &str) -> Result<Vec<FactEntry>, FactError> {
        let rows = sqlx::query(
            "SELECT * FROM facts WHERE topic = ? AND subkey = ? ORDER BY effective_from",
        )
        .bind(topic)
        .bind(subkey)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(fact_from_row).collect()
    }

    async fn subkeys(&self, topic: &str) -> Result<Vec<String>, FactError> {
        sqlx::query_scalar("SELECT DISTINCT subkey FROM facts WHERE topic = ? ORDER BY subkey")
            .bind(topic)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_query_quotes_phrases() {
        let terms = vec![
            "gst".to_string(),
            "goods and services tax".to_string(),
            "non-resident".to_string(),
            "\"".to_string(),
        ];
        assert_eq!(
            fts_query(&terms).as_deref(),
            Some("\"gst\" OR \"goods and services tax\" OR \"non resident\"")
        );
        assert_eq!(fts_query(&[]), None);
    }
}
