//! # taxlens
//!
//! Ingestion and question answering over Singapore tax documents.
//!
//! taxlens turns a directory of tax PDFs (Acts, e-Tax guides, circulars,
//! forms, subsidiary orders) into a versioned, searchable index, and answers
//! questions by combining that index with a temporal table of exact tax
//! parameters (rates, thresholds, deadlines).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────────────────┐   ┌────────────┐
//! │  PDF dir  │──▶│ parse → metadata → classify  │──▶│   SQLite   │
//! │  (batch)  │   │ → chunk → embed → commit     │   │ FTS5 + vec │
//! └───────────┘   └──────────────────────────────┘   │ ledger     │
//!                                                    │ facts      │
//!                                                    └─────┬──────┘
//!                                                          │
//!   question ──▶ query enhancer ──▶ retrieval + facts ──▶ answer composer
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! taxlens init                                  # create database, import facts seed
//! taxlens ingest ./corpus                       # index PDFs
//! taxlens ask "What is the GST rate?"
//! taxlens facts history gst standard_rate
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors at pipeline seams |
//! | [`parser`] | Layout-aware PDF text extraction |
//! | [`chunk`] | Section-aware chunking |
//! | [`metadata`] | Title, act, year and version signals |
//! | [`classify`] | Document type heuristics |
//! | [`versions`] | Fingerprints and the version ledger |
//! | [`scan`] | Directory discovery |
//! | [`batch`] | Concurrent batch ingestion |
//! | [`facts`] | Temporal structured tax facts |
//! | [`query`] | Intent, sub-questions, expansion, fact keys |
//! | [`search`] | Hybrid retrieval |
//! | [`generate`] | Answer phrasing backends |
//! | [`answer`] | Answer composition |
//! | [`embedding`] | Embedding providers |
//! | [`store`] | Index, ledger and fact storage |
//! | [`progress`] | Ingest progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod batch;
pub mod chunk;
pub mod classify;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod facts;
pub mod generate;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod progress;
pub mod query;
pub mod scan;
pub mod search;
pub mod store;
pub mod versions;
