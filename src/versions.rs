//! Content fingerprints and the version ledger.
//!
//! A document is identified by a stable logical name derived from its path
//! relative to the ingest root, so moving the root does not re-ingest the
//! corpus. The ledger itself lives in the [`Store`]; this module decides
//! what a fingerprint means against it.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::Config;
use crate::models::{DocumentMetadata, VersionRecord, VersionStatus};
use crate::scan::FileSelector;
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

/// SHA-256 of the file bytes, lowercase hex.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Relative path without extension, lowercased, whitespace replaced by `-`,
/// always `/`-separated.
pub fn logical_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let stem = relative.with_extension("");
    stem.components()
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect::<Vec<_>>()
        .join("/")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Per-logical-name async locks. Holding the guard serializes every
/// mutation of that document's index entries.
#[derive(Default, Clone)]
pub struct DocLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl DocLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub status: VersionStatus,
    pub prior: Option<VersionRecord>,
}

impl Detection {
    /// Fingerprint the ledger held when the check ran, for the commit CAS.
    pub fn expected_fingerprint(&self) -> Option<String> {
        self.prior.as_ref().map(|r| r.fingerprint.clone())
    }
}

pub struct VersionDetector<'a> {
    store: &'a dyn Store,
}

impl<'a> VersionDetector<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// `new` for an unknown name, `unchanged` when the fingerprint matches a
    /// live record, `updated` otherwise. A removed document that reappears
    /// is `updated` even with identical bytes, so it gets reactivated.
    pub async fn check(&self, name: &str, fingerprint: &str) -> Result<Detection> {
        let prior = self.store.get_version(name).await?;
        let status = match &prior {
            None => VersionStatus::New,
            Some(r) if r.status == VersionStatus::Removed => VersionStatus::Updated,
            Some(r) if r.fingerprint == fingerprint => VersionStatus::Unchanged,
            Some(_) => VersionStatus::Updated,
        };
        Ok(Detection { status, prior })
    }

    /// Ledger names recorded under `root` and selected by `selector` that
    /// were not seen in this run and are not already removed. Entries the
    /// selector excludes were never looked for, so they are left alone.
    pub async fn detect_removed(
        &self,
        seen: &HashSet<String>,
        root: &Path,
        selector: &FileSelector,
    ) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_versions()
            .await?
            .into_iter()
            .filter(|r| r.status != VersionStatus::Removed)
            .filter(|r| {
                Path::new(&r.path)
                    .strip_prefix(root)
                    .is_ok_and(|relative| selector.matches(relative))
            })
            .filter(|r| !seen.contains(&r.name))
            .map(|r| r.name)
            .collect())
    }
}

/// Ledger record that a successful commit of `detection` writes.
pub fn next_record(
    name: &str,
    path: &str,
    fingerprint: &str,
    byte_len: u64,
    detection: &Detection,
    now: i64,
) -> VersionRecord {
    let prior = detection.prior.as_ref();
    VersionRecord {
        name: name.to_string(),
        path: path.to_string(),
        fingerprint: fingerprint.to_string(),
        prior_fingerprint: prior.map(|r| r.fingerprint.clone()),
        status: detection.status,
        version: prior.map(|r| r.version + 1).unwrap_or(1),
        byte_len: byte_len as i64,
        last_processed: now,
    }
}

/// What changed between the prior version and the new one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeDetails(pub Vec<String>);

pub fn change_details(
    prior: &VersionRecord,
    prior_meta: Option<&DocumentMetadata>,
    fingerprint: &str,
    byte_len: u64,
    meta: &DocumentMetadata,
) -> ChangeDetails {
    let mut out = Vec::new();
    if prior.fingerprint != fingerprint {
        out.push("content_changed".to_string());
    }
    let delta = byte_len as i64 - prior.byte_len;
    if delta != 0 {
        out.push(format!("size_changed_by_{}_bytes", delta));
    }
    if let Some(old) = prior_meta {
        if old.last_updated != meta.last_updated {
            out.push("version_date_changed".to_string());
        }
        if old.years_of_assessment != meta.years_of_assessment {
            out.push("year_of_assessment_changed".to_string());
        }
    }
    ChangeDetails(out)
}

/// `taxlens ledger`: print the version ledger, one line per document.
pub async fn run_ledger(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let versions = store.list_versions().await;
    let counts = store.counts().await;
    store.close().await;
    let (versions, counts) = (versions?, counts?);

    if versions.is_empty() {
        println!("Ledger is empty.");
        return Ok(());
    }
    for r in &versions {
        let processed = chrono::DateTime::from_timestamp(r.last_processed, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{:<9} v{:<3} {}  {}  {}",
            r.status.as_str(),
            r.version,
            &r.fingerprint[..r.fingerprint.len().min(12)],
            processed,
            r.name
        );
    }
    println!();
    println!(
        "documents: {} ({} active)  chunks: {}  vectors: {}",
        counts.documents, counts.active_documents, counts.chunks, counts.vectors
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceDocument;
    use crate::store::memory::InMemoryStore;
    use crate::store::{CommitOutcome, DocumentCommit};
    use std::path::PathBuf;

    fn commit_for(name: &str, fp: &str, detection: &Detection) -> DocumentCommit {
        let record = next_record(name, &format!("/corpus/{}.pdf", name), fp, 10, detection, 1);
        DocumentCommit {
            source: SourceDocument {
                name: name.to_string(),
                path: record.path.clone(),
                fingerprint: fp.to_string(),
                byte_len: 10,
                page_count: 1,
                text: String::new(),
                extracted_at: 1,
            },
            metadata: DocumentMetadata::unknown(),
            chunks: Vec::new(),
            embeddings: None,
            record,
            expected_fingerprint: detection.expected_fingerprint(),
        }
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn logical_name_is_relative_and_normalised() {
        let root = PathBuf::from("/data/corpus");
        assert_eq!(
            logical_name(&root, &root.join("Acts/Income Tax Act.PDF")),
            "acts/income-tax-act"
        );
        assert_eq!(
            logical_name(Path::new("/elsewhere"), Path::new("/elsewhere/gst.pdf")),
            "gst"
        );
    }

    #[tokio::test]
    async fn new_unchanged_updated_lifecycle() {
        let store = InMemoryStore::new();
        let detector = VersionDetector::new(&store);

        let first = detector.check("gst", "aaa").await.unwrap();
        assert_eq!(first.status, VersionStatus::New);
        assert_eq!(
            store.commit_document(&commit_for("gst", "aaa", &first)).await.unwrap(),
            CommitOutcome::Committed
        );

        assert_eq!(
            detector.check("gst", "aaa").await.unwrap().status,
            VersionStatus::Unchanged
        );

        let changed = detector.check("gst", "bbb").await.unwrap();
        assert_eq!(changed.status, VersionStatus::Updated);
        let record = next_record("gst", "/corpus/gst.pdf", "bbb", 12, &changed, 2);
        assert_eq!(record.version, 2);
        assert_eq!(record.prior_fingerprint.as_deref(), Some("aaa"));
    }

    #[tokio::test]
    async fn stale_detection_conflicts() {
        let store = InMemoryStore::new();
        let detector = VersionDetector::new(&store);
        let a = detector.check("act", "v1").await.unwrap();
        let b = detector.check("act", "v2").await.unwrap();
        store.commit_document(&commit_for("act", "v1", &a)).await.unwrap();
        assert_eq!(
            store.commit_document(&commit_for("act", "v2", &b)).await.unwrap(),
            CommitOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn removed_names_are_scoped_to_root() {
        let store = InMemoryStore::new();
        let detector = VersionDetector::new(&store);
        for name in ["a", "b"] {
            let d = detector.check(name, "x").await.unwrap();
            store.commit_document(&commit_for(name, "x", &d)).await.unwrap();
        }
        let seen: HashSet<String> = ["a".to_string()].into_iter().collect();
        let all = FileSelector::new(&["**/*.pdf".to_string()], &[]).unwrap();
        assert_eq!(
            detector.detect_removed(&seen, Path::new("/corpus"), &all).await.unwrap(),
            vec!["b".to_string()]
        );
        assert!(detector
            .detect_removed(&seen, Path::new("/other"), &all)
            .await
            .unwrap()
            .is_empty());

        // Names outside the selection were not looked for in this run.
        let only_a = FileSelector::new(&["a.pdf".to_string()], &[]).unwrap();
        assert!(detector
            .detect_removed(&seen, Path::new("/corpus"), &only_a)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn change_details_lists_differences() {
        let prior = VersionRecord {
            name: "g".into(),
            path: "/g.pdf".into(),
            fingerprint: "old".into(),
            prior_fingerprint: None,
            status: VersionStatus::New,
            version: 1,
            byte_len: 100,
            last_processed: 0,
        };
        let old_meta = DocumentMetadata {
            last_updated: Some("1 Jan 2023".into()),
            ..DocumentMetadata::unknown()
        };
        let new_meta = DocumentMetadata {
            last_updated: Some("1 Jan 2024".into()),
            years_of_assessment: vec![2024],
            ..DocumentMetadata::unknown()
        };
        let details = change_details(&prior, Some(&old_meta), "new", 90, &new_meta);
        assert_eq!(
            details.0,
            vec![
                "content_changed",
                "size_changed_by_-10_bytes",
                "version_date_changed",
                "year_of_assessment_changed"
            ]
        );
    }

    #[tokio::test]
    async fn locks_serialize_same_name() {
        let locks = DocLocks::new();
        let guard = locks.lock("x").await;
        let other = locks.clone();
        let pending = tokio::spawn(async move {
            let _g = other.lock("x").await;
        });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());
        drop(guard);
        pending.await.unwrap();
        // Different names never contend.
        let _a = locks.lock("a").await;
        let _b = locks.lock("b").await;
    }
}
