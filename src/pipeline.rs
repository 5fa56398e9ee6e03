// src/pipeline.rs

use crate::classifier::{Classifier, LlmClassifier};
use crate::config::{Config, MaintenanceConfig, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::extraction::{DisabledExtractor, DocumentFormat, ExtractionOutcome, ExtractionService, LlmExtractor};
use crate::llm::LlmClient;
use crate::models::{
    ConsolidationReport, InventoryEntry, MergeReport, NormalizedItem, Receipt, ReceiptStatus,
    RecoveryReport,
};
use crate::normalizer::Normalizer;
use crate::store::{Store, now_unix};
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, warn};

const DUPLICATE_REASON: &str = "duplicate";
const DECLINED_REASON: &str = "declined by user";

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    /// Administrative override: merge even when some items fail.
    pub force: bool,
}

/// Structured result of driving one receipt through the state machine.
///
/// Document-level problems land here instead of in `Err`.
#[derive(Debug)]
pub enum ProcessOutcome {
    Merged(MergeReport),
    /// Some items failed; the receipt stays `normalized` for another try.
    PartialMerge(MergeReport),
    AlreadyMerged,
    AwaitingConfirmation,
    /// Receipt left `pending`; another attempt may succeed.
    Retryable(PipelineError),
    /// Receipt moved to terminal `error`.
    Failed(PipelineError),
    Rejected { reason: String },
}

impl ProcessOutcome {
    /// Why a receipt that is still open did not merge, as an error value.
    pub fn blocking_error(&self) -> Option<PipelineError> {
        match self {
            ProcessOutcome::PartialMerge(report) => Some(PipelineError::PartialMergeFailure {
                failed: report.items_failed,
                total: report.items_applied + report.items_failed,
            }),
            ProcessOutcome::AwaitingConfirmation => Some(PipelineError::AmbiguousDocument),
            _ => None,
        }
    }
}

/// Whether the step loop should look at the receipt again.
enum Step {
    Continue,
    Done(ProcessOutcome),
}

/// Receipt processing state machine over the store and the external services.
///
/// Every step records its result before the next one starts, so an
/// interrupted run resumes from the last completed state.
pub struct Pipeline {
    store: Store,
    extractor: Arc<dyn ExtractionService>,
    normalizer: Normalizer,
    config: PipelineConfig,
    maintenance: MaintenanceConfig,
}

impl Pipeline {
    pub fn new(
        store: Store,
        extractor: Arc<dyn ExtractionService>,
        normalizer: Normalizer,
        config: PipelineConfig,
        maintenance: MaintenanceConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            normalizer,
            config,
            maintenance,
        }
    }

    pub fn from_config(cfg: &Config) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        let store = Store::open(&cfg.db_path)?;
        let (extractor, classifier): (Arc<dyn ExtractionService>, Option<Arc<dyn Classifier>>) =
            match LlmClient::from_config(&cfg.llm)? {
                Some(client) => {
                    let extractor: Arc<dyn ExtractionService> = Arc::new(LlmExtractor::new(client.clone()));
                    let classifier: Arc<dyn Classifier> = Arc::new(LlmClassifier::new(client));
                    (extractor, Some(classifier))
                }
                None => {
                    info!("AI backend disabled, normalization runs on rules only");
                    let extractor: Arc<dyn ExtractionService> = Arc::new(DisabledExtractor);
                    (extractor, None)
                }
            };
        let normalizer = Normalizer::new(classifier, cfg.pipeline.classifier_min_confidence);
        Ok(Self::new(
            store,
            extractor,
            normalizer,
            cfg.pipeline.clone(),
            cfg.maintenance.clone(),
        ))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn submit_receipt(&self, user_id: &str, document_ref: &str) -> Result<i64> {
        let format = DocumentFormat::from_reference(document_ref);
        let id = self.store.create_receipt(user_id, document_ref)?;
        if !format.is_supported() {
            warn!(receipt_id = id, format = ?format, "Submitted document has an unsupported format");
        }
        Ok(id)
    }

    /// Drive a receipt forward until it is merged or needs outside input.
    pub async fn process_receipt(&self, receipt_id: i64, options: ProcessOptions) -> Result<ProcessOutcome> {
        let span = info_span!("receipt", id = receipt_id);
        self.run_steps(receipt_id, options).instrument(span).await
    }

    async fn run_steps(&self, receipt_id: i64, options: ProcessOptions) -> Result<ProcessOutcome> {
        loop {
            let receipt = self.load(receipt_id)?;
            let step = match receipt.status {
                ReceiptStatus::Pending => self.extract_step(&receipt).await?,
                ReceiptStatus::Extracted if receipt.awaiting_confirmation => {
                    Step::Done(ProcessOutcome::AwaitingConfirmation)
                }
                ReceiptStatus::Extracted => self.normalize_step(&receipt).await?,
                ReceiptStatus::Normalized => self.merge_step(&receipt, options.force)?,
                ReceiptStatus::Merged => Step::Done(ProcessOutcome::AlreadyMerged),
                actual @ (ReceiptStatus::Error | ReceiptStatus::Rejected) => {
                    return Err(PipelineError::InvalidState {
                        receipt_id,
                        expected: "pending, extracted or normalized",
                        actual,
                    });
                }
            };
            if let Step::Done(outcome) = step {
                return Ok(outcome);
            }
        }
    }

    /// Resolve an ambiguous extraction: confirm resumes processing, decline rejects.
    pub async fn confirm_ambiguous_receipt(&self, receipt_id: i64, confirmed: bool) -> Result<ProcessOutcome> {
        let receipt = self.load(receipt_id)?;
        if receipt.status != ReceiptStatus::Extracted || !receipt.awaiting_confirmation {
            return Err(PipelineError::InvalidState {
                receipt_id,
                expected: "extracted awaiting confirmation",
                actual: receipt.status,
            });
        }

        if !confirmed {
            self.store.mark_rejected(receipt_id, DECLINED_REASON)?;
            return Ok(ProcessOutcome::Rejected {
                reason: DECLINED_REASON.to_string(),
            });
        }

        self.store.confirm_extraction(receipt_id)?;
        info!(receipt_id, "Ambiguous receipt confirmed by user");
        self.process_receipt(receipt_id, ProcessOptions::default()).await
    }

    pub fn consolidate_inventory_duplicates(&self, user_id: &str) -> Result<ConsolidationReport> {
        let report = self
            .store
            .consolidate_duplicates(user_id, self.maintenance.purge_empty_entries)?;
        info!(
            user = %user_id,
            groups = report.groups_consolidated,
            removed = report.rows_removed,
            purged = report.empty_rows_purged,
            "Inventory consolidated"
        );
        Ok(report)
    }

    /// Sweep receipts with no progress for `stuck_after_secs`.
    ///
    /// Unsupported documents and pending receipts out of attempts become `error`.
    /// Pending receipts are otherwise queued for another extraction, and extracted
    /// ones keep their payload and resume at normalization.
    pub fn recover_stuck_receipts(&self) -> Result<RecoveryReport> {
        let cutoff = now_unix() - self.config.stuck_after().as_secs() as i64;
        let mut report = RecoveryReport::default();

        for receipt in self.store.stuck_receipts(cutoff)? {
            let span = info_span!("recover", id = receipt.id, status = %receipt.status);
            let _guard = span.enter();

            let format = DocumentFormat::from_reference(&receipt.document_ref);
            if let DocumentFormat::Unsupported(ext) = format {
                if self.store.mark_error(receipt.id, &format!("unsupported format: {ext}"))? {
                    report.failed.push(receipt.id);
                }
            } else if receipt.status == ReceiptStatus::Pending
                && receipt.attempts >= self.config.max_extraction_attempts
            {
                let reason = format!("gave up after {} attempts", receipt.attempts);
                if self.store.mark_error(receipt.id, &reason)? {
                    report.failed.push(receipt.id);
                }
            } else if self.store.requeue_receipt(receipt.id)? {
                report.requeued.push(receipt.id);
            }
        }

        info!(
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            "Stuck receipt sweep finished"
        );
        Ok(report)
    }

    /// Manual re-trigger of a receipt in `error`.
    pub fn retry_receipt(&self, receipt_id: i64) -> Result<()> {
        if self.store.reopen_errored_receipt(receipt_id)? {
            return Ok(());
        }
        let receipt = self.load(receipt_id)?;
        Err(PipelineError::InvalidState {
            receipt_id,
            expected: "error",
            actual: receipt.status,
        })
    }

    pub fn consume_stock(&self, user_id: &str, product_id: i64, quantity: f64) -> Result<f64> {
        self.store.consume_stock(user_id, product_id, quantity)
    }

    pub fn inventory(&self, user_id: &str) -> Result<Vec<InventoryEntry>> {
        Ok(self.store.inventory_for_user(user_id)?)
    }

    fn load(&self, receipt_id: i64) -> Result<Receipt> {
        self.store
            .receipt(receipt_id)?
            .ok_or(PipelineError::ReceiptNotFound(receipt_id))
    }

    async fn extract_step(&self, receipt: &Receipt) -> Result<Step> {
        let format = DocumentFormat::from_reference(&receipt.document_ref);
        if let DocumentFormat::Unsupported(ext) = format {
            let reason = format!("unsupported format: {ext}");
            self.store.mark_error(receipt.id, &reason)?;
            return Ok(Step::Done(ProcessOutcome::Failed(PipelineError::InsufficientContent(reason))));
        }

        let extraction = match self.extractor.extract(&receipt.document_ref).await {
            Ok(ExtractionOutcome::Extracted(extraction)) => extraction,
            Ok(ExtractionOutcome::Unsupported(reason)) => {
                self.store.mark_error(receipt.id, &format!("unsupported format: {reason}"))?;
                return Ok(Step::Done(ProcessOutcome::Failed(PipelineError::InsufficientContent(reason))));
            }
            Err(e) => {
                let reason = e.to_string();
                let attempts = self.store.record_extraction_failure(receipt.id, &reason)?;
                if attempts >= self.config.max_extraction_attempts {
                    error!(attempts, error = %reason, "Extraction failed, giving up");
                    self.store
                        .mark_error(receipt.id, &format!("extraction failed after {attempts} attempts: {reason}"))?;
                    return Ok(Step::Done(ProcessOutcome::Failed(PipelineError::ExtractionFailure(reason))));
                }
                warn!(attempts, error = %reason, "Extraction failed, receipt stays pending");
                return Ok(Step::Done(ProcessOutcome::Retryable(PipelineError::ExtractionFailure(reason))));
            }
        };

        let ambiguous = !extraction.looks_like_receipt
            || extraction.confidence < self.config.ambiguity_threshold
            || extraction.payload.items.is_empty();
        if ambiguous {
            info!(
                confidence = extraction.confidence,
                looks_like_receipt = extraction.looks_like_receipt,
                items = extraction.payload.items.len(),
                "Ambiguous document, awaiting user confirmation"
            );
        }

        let purchase_key = Store::purchase_key(&receipt.document_ref, &extraction.payload);
        self.store.record_extraction(
            receipt.id,
            &extraction.payload,
            purchase_key.as_deref(),
            ambiguous,
        )?;
        Ok(Step::Continue)
    }

    async fn normalize_step(&self, receipt: &Receipt) -> Result<Step> {
        let Some(payload) = &receipt.payload else {
            let reason = "extracted receipt has no payload".to_string();
            self.store.mark_error(receipt.id, &reason)?;
            return Ok(Step::Done(ProcessOutcome::Failed(PipelineError::ExtractionFailure(reason))));
        };

        // Receipts without a purchase identifier are never duplicates of each other.
        if let Some(key) = &receipt.purchase_key {
            if let Some(original) = self.store.find_merged_duplicate(&receipt.user_id, key, receipt.id)? {
                warn!(original, "Receipt duplicates one already merged");
                self.store.mark_rejected(receipt.id, DUPLICATE_REASON)?;
                return Ok(Step::Done(ProcessOutcome::Rejected {
                    reason: DUPLICATE_REASON.to_string(),
                }));
            }
        }

        let mut items = Vec::with_capacity(payload.items.len());
        for (line_index, line) in payload.items.iter().enumerate() {
            if line.description.trim().is_empty() {
                let reason = format!("line {line_index} has no description");
                self.store.mark_error(receipt.id, &reason)?;
                return Ok(Step::Done(ProcessOutcome::Failed(PipelineError::InsufficientContent(reason))));
            }

            let span = info_span!("normalize_item", line = line_index, raw = %line.description);
            let product = self
                .normalizer
                .normalize(&self.store, &line.description, &line.unit)
                .instrument(span)
                .await?;
            let product_id =
                self.store
                    .resolve_or_create(&product.canonical_name, &product.category, product.unit)?;

            items.push(NormalizedItem {
                receipt_id: receipt.id,
                line_index: line_index as u32,
                raw_description: line.description.clone(),
                canonical_name: product.canonical_name,
                category: product.category,
                unit: product.unit,
                quantity: line.quantity,
                unit_price: line.unit_price,
                total_price: line.total_price,
                product_id,
                failure_reason: None,
            });
        }

        self.store.record_normalization(receipt.id, &items)?;
        Ok(Step::Continue)
    }

    fn merge_step(&self, receipt: &Receipt, force: bool) -> Result<Step> {
        let report = self.store.merge_receipt_into_inventory(receipt.id, force)?;
        if report.merged {
            Ok(Step::Done(ProcessOutcome::Merged(report)))
        } else {
            warn!(failed = report.items_failed, "Partial merge, receipt stays normalized");
            Ok(Step::Done(ProcessOutcome::PartialMerge(report)))
        }
    }
}
