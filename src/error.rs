// src/error.rs

use crate::models::ReceiptStatus;
use thiserror::Error;

/// Persistence failures from the SQLite store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("payload (de)serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("could not create database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid product name {0:?}")]
    InvalidProductName(String),

    #[error("unknown receipt status {0:?} in database")]
    UnknownStatus(String),
}

/// Errors crossing the pipeline boundary.
///
/// Document-level problems (extraction failure, unsupported format,
/// ambiguous document) are normally reported through
/// [`crate::pipeline::ProcessOutcome`]; the variants exist here so the
/// outcome can carry them and so callers can match on a single taxonomy.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction service failed: {0}")]
    ExtractionFailure(String),

    #[error("unsupported document format: {0}")]
    InsufficientContent(String),

    #[error("document does not look like a purchase receipt")]
    AmbiguousDocument,

    #[error("receipt {receipt_id} is {actual}, expected {expected}")]
    InvalidState {
        receipt_id: i64,
        expected: &'static str,
        actual: ReceiptStatus,
    },

    #[error("{failed} of {total} items failed to merge")]
    PartialMergeFailure { failed: usize, total: usize },

    #[error("receipt {0} not found")]
    ReceiptNotFound(i64),

    #[error("no inventory entry for product {product_id}")]
    InventoryEntryNotFound { product_id: i64 },

    #[error("insufficient stock for product {product_id}: have {available}, requested {requested}")]
    InsufficientStock {
        product_id: i64,
        available: f64,
        requested: f64,
    },

    #[error("invalid quantity {0}")]
    InvalidQuantity(f64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Store(StoreError::Sqlite(e))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type Result<T> = std::result::Result<T, PipelineError>;
