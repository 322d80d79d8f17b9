//! Structured tax facts: a temporal table of exact tax parameters.
//!
//! Facts are keyed by `(topic, subkey, effective_from)`. A new rate never
//! replaces an old one; it is a new row with a later `effective_from`, so
//! both "what is the rate" and "what was the rate in 2022" resolve from the
//! same table. Lookups are exact-key only.
//!
//! Seed data is imported from TOML:
//!
//! ```toml
//! [[fact]]
//! topic = "non_resident_rate"
//! subkey = "other_income"
//! value = 24.0
//! unit = "percent"
//! effective_from = 2024
//! last_verified = "2024-03-01"
//! source_note = "IRAS: tax rates for non-resident individuals"
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::Config;
use crate::error::FactError;
use crate::models::{FactEntry, FactValue};
use crate::store::sqlite::SqliteStore;

/// Topic holding the resident progressive brackets. Each subkey is the
/// lower bound of a band in SGD; the value is the marginal rate in percent.
pub const RESIDENT_BRACKETS: &str = "resident_brackets";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An identical entry already existed.
    Unchanged,
}

#[async_trait]
pub trait FactStore: Send + Sync {
    /// Add a dated value. Re-inserting an identical entry is a no-op; a
    /// different value for an existing `(topic, subkey, effective_from)` is
    /// rejected with [`FactError::Conflict`].
    async fn insert_fact(&self, entry: &FactEntry) -> Result<InsertOutcome, FactError>;

    /// The entry with the greatest `effective_from` not after `as_of_year`,
    /// or the latest entry when no year is given. `Ok(None)` when nothing
    /// applies.
    async fn lookup(
        &self,
        topic: &str,
        subkey: &str,
        as_of_year: Option<i32>,
    ) -> Result<Option<FactEntry>, FactError>;

    /// All versions of one key, oldest first.
    async fn history(&self, topic: &str, subkey: &str) -> Result<Vec<FactEntry>, FactError>;

    async fn subkeys(&self, topic: &str) -> Result<Vec<String>, FactError>;
}

/// Pick the applicable entry from versions sorted by `effective_from`.
pub(crate) fn applicable(entries: &[FactEntry], as_of_year: Option<i32>) -> Option<&FactEntry> {
    match as_of_year {
        Some(year) => entries.iter().rev().find(|e| e.effective_from <= year),
        None => entries.last(),
    }
}

/// Two entries for the same key agree when value and unit match.
pub(crate) fn same_value(a: &FactEntry, b: &FactEntry) -> bool {
    a.value == b.value && a.unit == b.unit
}

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default, rename = "fact")]
    facts: Vec<SeedFact>,
}

#[derive(Debug, Deserialize)]
struct SeedFact {
    topic: String,
    subkey: String,
    value: FactValue,
    #[serde(default)]
    unit: String,
    effective_from: Option<i32>,
    #[serde(default)]
    last_verified: Option<String>,
    #[serde(default)]
    source_note: String,
}

impl TryFrom<SeedFact> for FactEntry {
    type Error = FactError;

    fn try_from(seed: SeedFact) -> Result<Self, Self::Error> {
        let effective_from = seed
            .effective_from
            .ok_or_else(|| FactError::MissingEffectiveFrom {
                topic: seed.topic.clone(),
                subkey: seed.subkey.clone(),
            })?;
        Ok(FactEntry {
            topic: seed.topic,
            subkey: seed.subkey,
            value: seed.value,
            unit: seed.unit,
            effective_from,
            last_verified: seed.last_verified,
            source_note: seed.source_note,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub unchanged: usize,
}

/// Parse a seed file. Every entry must carry `effective_from`; one missing
/// tag rejects the whole file.
pub fn parse_seed(content: &str) -> Result<Vec<FactEntry>> {
    let seed: SeedFile = toml::from_str(content).context("invalid facts seed file")?;
    let entries = seed
        .facts
        .into_iter()
        .map(FactEntry::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub async fn import_seed(store: &dyn FactStore, path: &Path) -> Result<ImportSummary> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read facts seed: {}", path.display()))?;
    let entries = parse_seed(&content)?;

    let mut summary = ImportSummary::default();
    for entry in &entries {
        match store.insert_fact(entry).await? {
            InsertOutcome::Inserted => summary.inserted += 1,
            InsertOutcome::Unchanged => summary.unchanged += 1,
        }
    }
    tracing::info!(
        path = %path.display(),
        inserted = summary.inserted,
        unchanged = summary.unchanged,
        "facts imported"
    );
    Ok(summary)
}

#[derive(Debug, Clone, Serialize)]
pub struct BandTax {
    pub lower: f64,
    pub upper: Option<f64>,
    pub rate: f64,
    pub tax: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaxComputation {
    pub chargeable_income: f64,
    pub tax: f64,
    pub marginal_rate: f64,
    pub bands: Vec<BandTax>,
}

/// Resident income tax on `chargeable_income` using the bracket facts in
/// force for `as_of_year`. `Ok(None)` when no brackets are loaded.
pub async fn compute_resident_tax(
    store: &dyn FactStore,
    chargeable_income: f64,
    as_of_year: Option<i32>,
) -> Result<Option<TaxComputation>, FactError> {
    let mut brackets = Vec::new();
    for subkey in store.subkeys(RESIDENT_BRACKETS).await? {
        let Ok(lower) = subkey.parse::<f64>() else {
            tracing::warn!(subkey, "ignoring non-numeric bracket key");
            continue;
        };
        let Some(entry) = store.lookup(RESIDENT_BRACKETS, &subkey, as_of_year).await? else {
            continue;
        };
        if let Some(rate) = entry.value.as_number() {
            brackets.push((lower, rate));
        }
    }
    if brackets.is_empty() {
        return Ok(None);
    }
    brackets.sort_by(|a, b| a.0.total_cmp(&b.0));

    let income = chargeable_income.max(0.0);
    let mut bands = Vec::new();
    let mut total = 0.0;
    let mut marginal_rate = 0.0;
    for (i, &(lower, rate)) in brackets.iter().enumerate() {
        if income <= lower {
            break;
        }
        let upper = brackets.get(i + 1).map(|b| b.0);
        let top = upper.map_or(income, |u| income.min(u));
        let tax = (top - lower) * rate / 100.0;
        total += tax;
        marginal_rate = rate;
        bands.push(BandTax {
            lower,
            upper,
            rate,
            tax,
        });
    }

    Ok(Some(TaxComputation {
        chargeable_income: income,
        tax: (total * 100.0).round() / 100.0,
        marginal_rate,
        bands,
    }))
}

// ============ CLI commands ============

/// `taxlens facts import <file>`
pub async fn run_import(config: &Config, path: &Path) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let summary = import_seed(&store, path).await;
    store.close().await;
    let summary = summary?;
    println!("facts import {}", path.display());
    println!("  inserted: {}", summary.inserted);
    println!("  unchanged: {}", summary.unchanged);
    println!("ok");
    Ok(())
}

/// `taxlens facts get <topic> <subkey> [--as-of YEAR]`
pub async fn run_get(config: &Config, topic: &str, subkey: &str, as_of: Option<i32>) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let found = store.lookup(topic, subkey, as_of).await;
    store.close().await;
    match found? {
        Some(entry) => {
            println!("{}.{} = {}", topic, subkey, entry.display_value());
            println!("  effective from: YA {}", entry.effective_from);
            if let Some(verified) = &entry.last_verified {
                println!("  last verified: {}", verified);
            }
            if !entry.source_note.is_empty() {
                println!("  source: {}", entry.source_note);
            }
        }
        None => println!("No fact for {}.{}.", topic, subkey),
    }
    Ok(())
}

/// `taxlens facts history <topic> <subkey>`
pub async fn run_history(config: &Config, topic: &str, subkey: &str) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let history = store.history(topic, subkey).await;
    store.close().await;
    let history = history?;
    if history.is_empty() {
        println!("No fact for {}.{}.", topic, subkey);
        return Ok(());
    }
    for entry in history {
        println!("YA {}  {}", entry.effective_from, entry.display_value());
    }
    Ok(())
}

/// `taxlens facts tax <income> [--as-of YEAR]`
pub async fn run_tax(config: &Config, income: f64, as_of: Option<i32>) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let computed = compute_resident_tax(&store, income, as_of).await;
    store.close().await;
    let Some(c) = computed? else {
        println!("No resident brackets loaded; run `taxlens facts import` first.");
        return Ok(());
    };
    for band in &c.bands {
        match band.upper {
            Some(upper) => println!(
                "  {:>12.0} - {:>12.0}  {:>5}%  {:>12.2}",
                band.lower, upper, band.rate, band.tax
            ),
            None => println!(
                "  {:>12.0} +               {:>5}%  {:>12.2}",
                band.lower, band.rate, band.tax
            ),
        }
    }
    println!(
        "tax on S${:.0}: S${:.2} (marginal rate {}%)",
        c.chargeable_income, c.tax, c.marginal_rate
    );
    Ok(())
}
