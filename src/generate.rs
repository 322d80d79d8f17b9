//! Answer phrasing.
//!
//! An [`AnswerGenerator`] turns an already decided answer (an optional fact
//! plus supporting chunks) into prose. It never decides routing or
//! citations; the composer owns those.
//!
//! - **[`ExtractiveGenerator`]**: deterministic, quotes the evidence. Default.
//! - **[`OpenAiGenerator`]**: chat completions, constrained to the supplied
//!   evidence. Requires `OPENAI_API_KEY`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::embedding::post_json_with_retry;
use crate::models::FactEntry;
use crate::search::RetrievedChunk;

const EXCERPT_CHARS: usize = 320;
const MAX_EVIDENCE: usize = 3;

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn phrase(
        &self,
        question: &str,
        fact: Option<&FactEntry>,
        chunks: &[RetrievedChunk],
    ) -> Result<String>;
}

/// "GST standard rate is 9% (effective from YA 2024)."
pub fn fact_sentence(fact: &FactEntry) -> String {
    let label = format!("{} {}", fact.topic, fact.subkey).replace('_', " ");
    let label = label
        .split(' ')
        .map(|w| match w {
            "gst" | "cpf" | "srs" => w.to_uppercase(),
            _ => w.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ");
    let mut chars = label.chars();
    let label: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => label,
    };
    format!(
        "{} is {} (effective from YA {}).",
        label,
        fact.display_value(),
        fact.effective_from
    )
}

fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= EXCERPT_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(EXCERPT_CHARS).collect();
    match cut.rfind(". ") {
        Some(end) if end > EXCERPT_CHARS / 2 => cut[..=end].to_string(),
        _ => format!("{}...", cut.trim_end()),
    }
}

pub struct ExtractiveGenerator;

#[async_trait]
impl AnswerGenerator for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn phrase(
        &self,
        _question: &str,
        fact: Option<&FactEntry>,
        chunks: &[RetrievedChunk],
    ) -> Result<String> {
        let mut lines = Vec::new();
        if let Some(fact) = fact {
            lines.push(fact_sentence(fact));
        }
        for r in chunks.iter().take(MAX_EVIDENCE) {
            lines.push(format!(
                "According to {} (p. {}): {}",
                r.hit.title,
                r.hit.chunk.page_start,
                excerpt(&r.hit.chunk.text)
            ));
        }
        Ok(lines.join("\n"))
    }
}

pub struct OpenAiGenerator {
    config: GenerationConfig,
    model: String,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config: config.clone(),
            model,
            client,
        })
    }
}

fn build_prompt(question: &str, fact: Option<&FactEntry>, chunks: &[RetrievedChunk]) -> String {
    let mut prompt = format!("Question: {}\n\n", question);
    if let Some(fact) = fact {
        prompt.push_str(&format!("Authoritative value: {}\n\n", fact_sentence(fact)));
    }
    prompt.push_str("Evidence:\n");
    for (i, r) in chunks.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] {} (p. {}): {}\n",
            i + 1,
            r.hit.title,
            r.hit.chunk.page_start,
            r.hit.chunk.text
        ));
    }
    prompt
}

#[async_trait]
impl AnswerGenerator for OpenAiGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn phrase(
        &self,
        question: &str,
        fact: Option<&FactEntry>,
        chunks: &[RetrievedChunk],
    ) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                {
                    "role": "system",
                    "content": "Answer Singapore tax questions using only the evidence given. \
                                Quote any authoritative value exactly. Do not invent figures."
                },
                { "role": "user", "content": build_prompt(question, fact, chunks) }
            ],
        });
        let json = post_json_with_retry(
            &self.client,
            "https://api.openai.com/v1/chat/completions",
            Some(&api_key),
            &body,
            self.config.max_retries,
            "OpenAI",
        )
        .await?;

        let content = json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))?;
        Ok(content.trim().to_string())
    }
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn AnswerGenerator>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveGenerator)),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
