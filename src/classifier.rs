// src/classifier.rs

use crate::llm::{LlmClient, ServiceError};
use crate::normalizer::rules::CATEGORIES;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// AI verdict for one free-text description.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Classification {
    #[serde(alias = "canonicalName")]
    pub canonical_name: String,
    pub category: String,
    #[serde(default)]
    pub confidence: f64,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, description: &str) -> Result<Classification, ServiceError>;
}

fn system_prompt() -> String {
    format!(
        r#"You normalize Brazilian grocery receipt descriptions into canonical product names.
Return ONLY valid JSON of the form:
{{"canonicalName": "string", "category": "string", "confidence": number between 0 and 1}}

Rules:
- canonicalName is uppercase, without accents, size or packaging, abbreviations expanded.
- Keep the brand when one is printed.
- category must be one of: {}, OTHER.
- Return ONLY the JSON object, no markdown fences, no commentary."#,
        CATEGORIES.join(", ")
    )
}

/// Classification backed by a chat-completions model.
pub struct LlmClassifier {
    client: LlmClient,
}

impl LlmClassifier {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, description: &str) -> Result<Classification, ServiceError> {
        let mut classification: Classification = self
            .client
            .complete_json(&system_prompt(), format!("Description: {description}"))
            .await?;
        classification.category = classification.category.trim().to_uppercase();
        debug!(
            description = %description,
            canonical = %classification.canonical_name,
            category = %classification.category,
            confidence = classification.confidence,
            "Classified description"
        );
        Ok(classification)
    }
}
