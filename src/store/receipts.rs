// src/store/receipts.rs

use super::{Store, now_unix};
use crate::error::{StoreError, StoreResult};
use crate::extraction::{access_key_from_reference, normalize_access_key};
use crate::models::{ExtractionPayload, NormalizedItem, Receipt, ReceiptStatus, Unit};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use sha2::{Digest, Sha256};
use tracing::info;

const RECEIPT_COLUMNS: &str = "id, user_id, document_ref, status, awaiting_confirmation, payload,
     purchase_key, attempts, error_reason, created_at, updated_at";

impl Store {
    /// Identity of the purchase behind a document, used to spot the same receipt scanned twice.
    ///
    /// The NFC-e access key wins, whether printed or carried by the QR link. Without one,
    /// the issuer's tax id, receipt number and issue time must all be known. Identical
    /// baskets bought on different days are different purchases, so line items never count.
    pub fn purchase_key(document_ref: &str, payload: &ExtractionPayload) -> Option<String> {
        let access_key = payload
            .access_key
            .as_deref()
            .and_then(normalize_access_key)
            .or_else(|| access_key_from_reference(document_ref));

        let mut hasher = Sha256::new();
        match access_key {
            Some(key) => {
                hasher.update(b"nfce:");
                hasher.update(key.as_bytes());
            }
            None => {
                let tax_id: String = payload
                    .establishment
                    .as_ref()
                    .and_then(|e| e.tax_id.as_deref())?
                    .chars()
                    .filter(char::is_ascii_digit)
                    .collect();
                let number = non_blank(payload.receipt_number.as_deref())?;
                let issued_at = non_blank(payload.issued_at.as_deref())?;
                if tax_id.is_empty() {
                    return None;
                }
                hasher.update(b"receipt:");
                for part in [tax_id.as_str(), number, issued_at] {
                    hasher.update(part.as_bytes());
                    hasher.update([0u8]);
                }
            }
        }
        Some(format!("{:x}", hasher.finalize()))
    }

    pub fn create_receipt(&self, user_id: &str, document_ref: &str) -> StoreResult<i64> {
        let now = now_unix();
        self.conn().execute(
            "INSERT INTO receipts (user_id, document_ref, status, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?3)",
            params![user_id, document_ref, now],
        )?;
        let id = self.conn().last_insert_rowid();
        info!(receipt_id = id, user = %user_id, "Receipt stored");
        Ok(id)
    }

    pub fn receipt(&self, id: i64) -> StoreResult<Option<Receipt>> {
        let sql = format!("SELECT {RECEIPT_COLUMNS} FROM receipts WHERE id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![id], Self::row_to_receipt)
            .optional()?)
    }

    fn row_to_receipt(row: &rusqlite::Row<'_>) -> rusqlite::Result<Receipt> {
        let status: String = row.get(3)?;
        let status = status.parse::<ReceiptStatus>().map_err(|s| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                Type::Text,
                Box::new(StoreError::UnknownStatus(s)),
            )
        })?;
        let payload: Option<String> = row.get(5)?;
        let payload = payload
            .map(|json| serde_json::from_str::<ExtractionPayload>(&json))
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

        Ok(Receipt {
            id: row.get(0)?,
            user_id: row.get(1)?,
            document_ref: row.get(2)?,
            status,
            awaiting_confirmation: row.get(4)?,
            payload,
            purchase_key: row.get(6)?,
            attempts: row.get(7)?,
            error_reason: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    /// Store the extraction payload verbatim and move `pending -> extracted`.
    ///
    /// Returns `false` when the receipt was no longer pending.
    pub fn record_extraction(
        &self,
        id: i64,
        payload: &ExtractionPayload,
        purchase_key: Option<&str>,
        awaiting_confirmation: bool,
    ) -> StoreResult<bool> {
        let json = serde_json::to_string(payload)?;
        let establishment = payload.establishment.as_ref();
        let changed = self.conn().execute(
            "UPDATE receipts
             SET status = 'extracted', payload = ?1, purchase_key = ?2,
                 establishment_name = ?3, establishment_tax_id = ?4,
                 awaiting_confirmation = ?5, error_reason = NULL, updated_at = ?6
             WHERE id = ?7 AND status = 'pending'",
            params![
                json,
                purchase_key,
                establishment.map(|e| e.name.as_str()),
                establishment.and_then(|e| e.tax_id.as_deref()),
                awaiting_confirmation,
                now_unix(),
                id,
            ],
        )?;
        if changed > 0 {
            info!(receipt_id = id, items = payload.items.len(), awaiting_confirmation, "Extraction recorded");
        }
        Ok(changed > 0)
    }

    /// A failed extraction attempt; the receipt stays pending for retry.
    pub fn record_extraction_failure(&self, id: i64, reason: &str) -> StoreResult<u32> {
        self.conn().execute(
            "UPDATE receipts SET attempts = attempts + 1, error_reason = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![reason, now_unix(), id],
        )?;
        Ok(self.conn().query_row(
            "SELECT attempts FROM receipts WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?)
    }

    /// Terminal `error` from any non-terminal state.
    pub fn mark_error(&self, id: i64, reason: &str) -> StoreResult<bool> {
        let changed = self.conn().execute(
            "UPDATE receipts SET status = 'error', awaiting_confirmation = 0,
                 error_reason = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ('pending', 'extracted', 'normalized')",
            params![reason, now_unix(), id],
        )?;
        if changed > 0 {
            info!(receipt_id = id, reason = %reason, "Receipt marked as error");
        }
        Ok(changed > 0)
    }

    /// Terminal `rejected`; extracted data is cleared.
    pub fn mark_rejected(&self, id: i64, reason: &str) -> StoreResult<bool> {
        let tx = rusqlite::Transaction::new_unchecked(self.conn(), TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE receipts SET status = 'rejected', awaiting_confirmation = 0, payload = NULL,
                 establishment_name = NULL, establishment_tax_id = NULL,
                 error_reason = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ('pending', 'extracted', 'normalized')",
            params![reason, now_unix(), id],
        )?;
        if changed > 0 {
            tx.execute("DELETE FROM receipt_items WHERE receipt_id = ?1", params![id])?;
        }
        tx.commit()?;
        if changed > 0 {
            info!(receipt_id = id, reason = %reason, "Receipt rejected");
        }
        Ok(changed > 0)
    }

    /// Clear the confirmation flag on an ambiguous extraction.
    pub fn confirm_extraction(&self, id: i64) -> StoreResult<bool> {
        let changed = self.conn().execute(
            "UPDATE receipts SET awaiting_confirmation = 0, updated_at = ?1
             WHERE id = ?2 AND status = 'extracted' AND awaiting_confirmation = 1",
            params![now_unix(), id],
        )?;
        Ok(changed > 0)
    }

    /// Persist the normalized lines and move `extracted -> normalized` in one transaction.
    pub fn record_normalization(&self, id: i64, items: &[NormalizedItem]) -> StoreResult<bool> {
        let tx = rusqlite::Transaction::new_unchecked(self.conn(), TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE receipts SET status = 'normalized', updated_at = ?1
             WHERE id = ?2 AND status = 'extracted' AND awaiting_confirmation = 0",
            params![now_unix(), id],
        )?;
        if changed == 0 {
            // dropping the transaction rolls it back
            return Ok(false);
        }

        tx.execute("DELETE FROM receipt_items WHERE receipt_id = ?1", params![id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO receipt_items
                    (receipt_id, line_index, raw_description, canonical_name, category, unit,
                     quantity, unit_price, total_price, product_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for item in items {
                stmt.execute(params![
                    id,
                    item.line_index,
                    item.raw_description,
                    item.canonical_name,
                    item.category,
                    item.unit.as_str(),
                    item.quantity,
                    item.unit_price,
                    item.total_price,
                    item.product_id,
                ])?;
            }
        }
        tx.commit()?;
        info!(receipt_id = id, items = items.len(), "Receipt normalized");
        Ok(true)
    }

    pub fn normalized_items(&self, id: i64) -> StoreResult<Vec<NormalizedItem>> {
        super::inventory::normalized_items(self.conn(), id)
    }

    /// Another already-merged receipt of the same user for the same purchase.
    pub fn find_merged_duplicate(
        &self,
        user_id: &str,
        purchase_key: &str,
        exclude_id: i64,
    ) -> StoreResult<Option<i64>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id FROM receipts
                 WHERE user_id = ?1 AND purchase_key = ?2 AND status = 'merged' AND id != ?3
                 ORDER BY id LIMIT 1",
                params![user_id, purchase_key, exclude_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Receipts sitting in `pending`/`extracted` with no progress since `cutoff`.
    ///
    /// Ambiguous extractions waiting on the user are not stuck.
    pub fn stuck_receipts(&self, cutoff: i64) -> StoreResult<Vec<Receipt>> {
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts
             WHERE status IN ('pending', 'extracted') AND awaiting_confirmation = 0
               AND updated_at <= ?1
             ORDER BY updated_at"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![cutoff], Self::row_to_receipt)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Re-queue a stuck receipt at the step it stalled on.
    ///
    /// A pending receipt is charged one extraction attempt. An extracted receipt keeps its
    /// payload and resumes at normalization.
    pub fn requeue_receipt(&self, id: i64) -> StoreResult<bool> {
        let changed = self.conn().execute(
            "UPDATE receipts SET attempts = attempts + (status = 'pending'), updated_at = ?1
             WHERE id = ?2 AND status IN ('pending', 'extracted') AND awaiting_confirmation = 0",
            params![now_unix(), id],
        )?;
        if changed > 0 {
            info!(receipt_id = id, "Stuck receipt re-queued");
        }
        Ok(changed > 0)
    }

    /// Manual re-trigger: `error -> pending` with a fresh attempt budget.
    pub fn reopen_errored_receipt(&self, id: i64) -> StoreResult<bool> {
        let tx = rusqlite::Transaction::new_unchecked(self.conn(), TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE receipts SET status = 'pending', payload = NULL, purchase_key = NULL,
                 establishment_name = NULL, establishment_tax_id = NULL,
                 awaiting_confirmation = 0, attempts = 0, error_reason = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'error'",
            params![now_unix(), id],
        )?;
        if changed > 0 {
            tx.execute("DELETE FROM receipt_items WHERE receipt_id = ?1", params![id])?;
        }
        tx.commit()?;
        if changed > 0 {
            info!(receipt_id = id, "Errored receipt reopened");
        }
        Ok(changed > 0)
    }

    #[cfg(test)]
    pub(crate) fn backdate_receipt(&self, id: i64, updated_at: i64) -> StoreResult<()> {
        self.conn().execute(
            "UPDATE receipts SET updated_at = ?1 WHERE id = ?2",
            params![updated_at, id],
        )?;
        Ok(())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub(super) fn unit_from_sql(idx: usize, raw: String) -> rusqlite::Result<Unit> {
    Unit::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("unknown unit {raw:?}").into())
    })
}
