//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults, so a
//! minimal config is just a database path. Use [`load_config`] from the CLI
//! and [`Config::default`] (or struct update syntax) from library code and
//! tests.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::DocType;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub facts: FactsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/taxlens.sqlite"),
            },
            ingest: IngestConfig::default(),
            chunking: ChunkingConfig::default(),
            metadata: MetadataConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            facts: FactsConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// What happens to the index when a previously ingested file disappears.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemovedPolicy {
    /// Keep chunks on disk but exclude them from retrieval.
    #[default]
    MarkInactive,
    /// Delete the document, its chunks and vectors.
    Purge,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_parse_timeout_secs")]
    pub parse_timeout_secs: u64,
    #[serde(default)]
    pub removed_policy: RemovedPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_workers: default_max_workers(),
            parse_timeout_secs: default_parse_timeout_secs(),
            removed_policy: RemovedPolicy::default(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.pdf".to_string()]
}
fn default_max_workers() -> usize {
    4
}
fn default_parse_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            min_chars: default_min_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    1500
}
fn default_min_chars() -> usize {
    200
}
fn default_overlap_chars() -> usize {
    150
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    /// Number of leading blocks inspected by the extractor and classifier.
    #[serde(default = "default_sample_blocks")]
    pub sample_blocks: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            sample_blocks: default_sample_blocks(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_sample_blocks() -> usize {
    60
}
fn default_min_confidence() -> f64 {
    0.35
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,
    /// Per document type score multiplier, e.g. `{ form = 0.85 }`.
    #[serde(default)]
    pub type_weights: HashMap<String, f64>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k: default_candidate_k(),
            top_k: default_top_k(),
            min_relevance: default_min_relevance(),
            type_weights: HashMap::new(),
        }
    }
}

impl RetrievalConfig {
    pub fn type_weight(&self, doc_type: DocType) -> f64 {
        self.type_weights
            .get(doc_type.as_str())
            .copied()
            .unwrap_or(1.0)
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    80
}
fn default_top_k() -> usize {
    6
}
fn default_min_relevance() -> f64 {
    0.25
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            max_retries: default_max_retries(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "extractive".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FactsConfig {
    /// TOML seed file imported by `taxlens init`.
    #[serde(default)]
    pub seed_path: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let chunking = &config.chunking;
    if chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if chunking.min_chars >= chunking.max_chars {
        anyhow::bail!("chunking.min_chars must be smaller than chunking.max_chars");
    }
    if chunking.overlap_chars * 4 > chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be at most a quarter of chunking.max_chars");
    }

    if config.ingest.max_workers == 0 {
        anyhow::bail!("ingest.max_workers must be >= 1");
    }
    if config.ingest.parse_timeout_secs == 0 {
        anyhow::bail!("ingest.parse_timeout_secs must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.metadata.min_confidence) {
        anyhow::bail!("metadata.min_confidence must be in [0.0, 1.0]");
    }

    let retrieval = &config.retrieval;
    if retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&retrieval.min_relevance) {
        anyhow::bail!("retrieval.min_relevance must be in [0.0, 1.0]");
    }
    for (key, weight) in &retrieval.type_weights {
        if key.parse::<DocType>().is_err() {
            anyhow::bail!("retrieval.type_weights: unknown document type '{}'", key);
        }
        if *weight <= 0.0 {
            anyhow::bail!("retrieval.type_weights.{} must be > 0 (got {})", key, weight);
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "extractive" => {}
        "openai" => {
            if config.generation.model.is_none() {
                anyhow::bail!("generation.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be extractive or openai.",
            other
        ),
    }

    Ok(())
}
