// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a scanned receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Pending,
    Extracted,
    Normalized,
    Merged,
    Error,
    Rejected,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Extracted => "extracted",
            ReceiptStatus::Normalized => "normalized",
            ReceiptStatus::Merged => "merged",
            ReceiptStatus::Error => "error",
            ReceiptStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReceiptStatus::Pending),
            "extracted" => Ok(ReceiptStatus::Extracted),
            "normalized" => Ok(ReceiptStatus::Normalized),
            "merged" => Ok(ReceiptStatus::Merged),
            "error" => Ok(ReceiptStatus::Error),
            "rejected" => Ok(ReceiptStatus::Rejected),
            other => Err(other.to_string()),
        }
    }
}

/// A single line as printed on the receipt, straight from the extraction service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(rename = "descricao", alias = "description")]
    pub description: String,
    #[serde(rename = "quantidade", alias = "quantity")]
    pub quantity: f64,
    #[serde(rename = "unidade", alias = "unit", default)]
    pub unit: String,
    #[serde(rename = "valor_unitario", alias = "unit_price")]
    pub unit_price: f64,
    #[serde(rename = "valor_total", alias = "total_price", default)]
    pub total_price: f64,
}

/// Store that issued the receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Establishment {
    pub name: String,
    #[serde(rename = "taxId", alias = "cnpj", default)]
    pub tax_id: Option<String>,
}

/// Structured payload returned by the extraction service, stored verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionPayload {
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub establishment: Option<Establishment>,
    /// 44-digit NFC-e access key (chave de acesso), when printed.
    #[serde(rename = "chaveAcesso", alias = "accessKey", default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(rename = "numero", alias = "receiptNumber", default, skip_serializing_if = "Option::is_none")]
    pub receipt_number: Option<String>,
    /// Issue date and time as printed.
    #[serde(rename = "dataEmissao", alias = "issuedAt", default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub id: i64,
    pub user_id: String,
    pub document_ref: String,
    pub status: ReceiptStatus,
    /// Set while an ambiguous extraction waits for the user to confirm or reject.
    pub awaiting_confirmation: bool,
    pub payload: Option<ExtractionPayload>,
    /// Identity of the purchase itself; `None` when the document carries none.
    pub purchase_key: Option<String>,
    pub attempts: u32,
    pub error_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Canonical units every raw unit token maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "UN")]
    Each,
    #[serde(rename = "KG")]
    Kilogram,
    #[serde(rename = "G")]
    Gram,
    #[serde(rename = "L")]
    Litre,
    #[serde(rename = "ML")]
    Millilitre,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Each => "UN",
            Unit::Kilogram => "KG",
            Unit::Gram => "G",
            Unit::Litre => "L",
            Unit::Millilitre => "ML",
        }
    }

    pub fn parse(s: &str) -> Option<Unit> {
        match s {
            "UN" => Some(Unit::Each),
            "KG" => Some(Unit::Kilogram),
            "G" => Some(Unit::Gram),
            "L" => Some(Unit::Litre),
            "ML" => Some(Unit::Millilitre),
            _ => None,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a normalization result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationSource {
    Cache,
    Rules,
    Classifier,
    /// Classifier unavailable; raw description passed through.
    Fallback,
}

/// Canonical identity of a raw receipt description.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedProduct {
    pub canonical_name: String,
    pub category: String,
    pub unit: Unit,
    pub brand: Option<String>,
    pub size: Option<String>,
    pub source: NormalizationSource,
}

/// A receipt line after normalization and catalog resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedItem {
    pub receipt_id: i64,
    pub line_index: u32,
    pub raw_description: String,
    pub canonical_name: String,
    pub category: String,
    pub unit: Unit,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_price: f64,
    pub product_id: i64,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalProduct {
    pub id: i64,
    pub canonical_name: String,
    pub category: String,
    pub unit: Unit,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InventoryEntry {
    pub id: i64,
    pub user_id: String,
    /// `None` for legacy rows that only carry a product name.
    pub product_id: Option<i64>,
    pub product_name: String,
    pub quantity: f64,
    pub unit_price: Option<f64>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceObservation {
    pub id: i64,
    pub product_id: i64,
    pub receipt_id: Option<i64>,
    pub establishment_name: Option<String>,
    pub establishment_tax_id: Option<String>,
    pub unit_price: f64,
    pub observed_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub line_index: u32,
    pub description: String,
    pub reason: String,
}

/// Result of applying one receipt to the user's inventory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub items_applied: usize,
    pub items_failed: usize,
    pub failures: Vec<ItemFailure>,
    /// Whether the receipt reached `merged` during this call.
    pub merged: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidationReport {
    pub groups_consolidated: usize,
    pub rows_removed: usize,
    pub empty_rows_purged: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub requeued: Vec<i64>,
    pub failed: Vec<i64>,
}
