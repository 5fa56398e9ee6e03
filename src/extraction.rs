// src/extraction.rs

use crate::llm::{LlmClient, ServiceError};
use crate::models::{Establishment, ExtractionPayload, LineItem};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::info;

/// The prompt template that instructs the model to extract structured receipt data.
const SYSTEM_PROMPT: &str = r#"You are a grocery receipt (NFC-e / cupom fiscal) extraction assistant.
Given a reference to a scanned receipt, extract its line items and return ONLY valid JSON.

The JSON must match this schema exactly:
{
  "document_kind": "receipt" | "other" | "unreadable",
  "confidence": number between 0 and 1,
  "reason": "string or null",
  "establishment": {"name": "string", "taxId": "string or null"} or null,
  "chaveAcesso": "44-digit NFC-e access key or null",
  "numero": "receipt number as printed or null",
  "dataEmissao": "issue date and time as printed or null",
  "items": [
    {
      "descricao": "string, as printed",
      "quantidade": number,
      "unidade": "string, as printed",
      "valor_unitario": number,
      "valor_total": number
    }
  ]
}

Notes:
- Use "other" when the document does not look like a purchase receipt.
- Use "unreadable" when the document has no machine-readable content (explain in "reason").
- Copy descriptions exactly as printed; do not translate or expand abbreviations.
- Never invent chaveAcesso, numero or dataEmissao; use null when not printed.
- Return ONLY the JSON object, no markdown fences, no commentary."#;

/// How a document reference is classified before extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Image,
    /// NFC-e consultation page reached through the receipt's QR code.
    QrCodeUrl,
    Unsupported(String),
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

impl DocumentFormat {
    pub fn from_reference(reference: &str) -> DocumentFormat {
        let trimmed = reference.trim();
        let is_url = trimmed.starts_with("http://") || trimmed.starts_with("https://");
        let path = trimmed.split(['?', '#']).next().unwrap_or_default();
        // A bare host (`https://nfce.example.gov.br`) has no path segment to inspect.
        let bare_host = is_url && path.matches('/').count() < 3;
        let last_segment = path.rsplit('/').next().unwrap_or_default();
        let extension = match last_segment.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !bare_host => Some(ext.to_ascii_lowercase()),
            _ => None,
        };

        match extension.as_deref() {
            Some("pdf") => DocumentFormat::Pdf,
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => DocumentFormat::Image,
            Some(ext) if is_url && is_page(ext) => DocumentFormat::QrCodeUrl,
            Some(ext) => DocumentFormat::Unsupported(ext.to_string()),
            None if is_url => DocumentFormat::QrCodeUrl,
            None => DocumentFormat::Unsupported(String::from("no extension")),
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, DocumentFormat::Unsupported(_))
    }
}

fn is_page(ext: &str) -> bool {
    matches!(ext, "aspx" | "asp" | "jsp" | "php" | "html" | "htm" | "xhtml" | "faces")
}

static ACCESS_KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{44}\b").unwrap());

/// NFC-e access key embedded in a QR consultation link (`?p=<key>|2|1|..` or `?chNFe=<key>`).
pub fn access_key_from_reference(reference: &str) -> Option<String> {
    let (_, query) = reference.split_once('?')?;
    ACCESS_KEY_RE.find(query).map(|m| m.as_str().to_string())
}

/// Digits of a printed access key, which receipts often group in blocks of four.
pub fn normalize_access_key(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    (digits.len() == 44).then_some(digits)
}

/// Successful extraction as seen by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub payload: ExtractionPayload,
    pub confidence: f64,
    /// `false` when the service doubts the document is a purchase receipt.
    pub looks_like_receipt: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    Extracted(Extraction),
    /// No machine-readable content; retrying will not help.
    Unsupported(String),
}

/// External service turning a document reference into structured line items.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn extract(&self, document_ref: &str) -> Result<ExtractionOutcome, ServiceError>;
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum DocumentKind {
    Receipt,
    Other,
    Unreadable,
}

#[derive(Debug, Deserialize)]
struct ExtractorResponse {
    document_kind: DocumentKind,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    establishment: Option<Establishment>,
    #[serde(default)]
    items: Vec<LineItem>,
    #[serde(rename = "chaveAcesso", default)]
    access_key: Option<String>,
    #[serde(rename = "numero", default)]
    receipt_number: Option<String>,
    #[serde(rename = "dataEmissao", default)]
    issued_at: Option<String>,
}

impl From<ExtractorResponse> for ExtractionOutcome {
    fn from(resp: ExtractorResponse) -> Self {
        if resp.document_kind == DocumentKind::Unreadable {
            return ExtractionOutcome::Unsupported(
                resp.reason
                    .unwrap_or_else(|| "document has no readable content".to_string()),
            );
        }
        ExtractionOutcome::Extracted(Extraction {
            looks_like_receipt: resp.document_kind == DocumentKind::Receipt,
            confidence: resp.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
            payload: ExtractionPayload {
                items: resp.items,
                establishment: resp.establishment,
                access_key: resp.access_key.as_deref().and_then(normalize_access_key),
                receipt_number: resp.receipt_number,
                issued_at: resp.issued_at,
            },
        })
    }
}

/// Extraction backed by a chat-completions model.
pub struct LlmExtractor {
    client: LlmClient,
}

impl LlmExtractor {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExtractionService for LlmExtractor {
    async fn extract(&self, document_ref: &str) -> Result<ExtractionOutcome, ServiceError> {
        if !self.client.health_check().await {
            return Err(ServiceError::Unavailable(format!(
                "extraction model {} not reachable",
                self.client.model()
            )));
        }

        let response: ExtractorResponse = self
            .client
            .complete_json(
                SYSTEM_PROMPT,
                format!("Extract the purchase receipt at this document reference:\n\n{document_ref}"),
            )
            .await?;

        info!(
            kind = ?response.document_kind,
            confidence = ?response.confidence,
            items = response.items.len(),
            "LLM extraction result"
        );
        Ok(response.into())
    }
}

/// Stand-in used when no AI backend is configured: every call fails as unavailable.
pub struct DisabledExtractor;

#[async_trait]
impl ExtractionService for DisabledExtractor {
    async fn extract(&self, _document_ref: &str) -> Result<ExtractionOutcome, ServiceError> {
        Err(ServiceError::Disabled)
    }
}
