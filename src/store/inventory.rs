// src/store/inventory.rs

use super::catalog::{self, name_key};
use super::receipts::unit_from_sql;
use super::{Store, now_unix};
use crate::error::{PipelineError, Result, StoreError, StoreResult};
use crate::models::{
    ConsolidationReport, InventoryEntry, ItemFailure, MergeReport, NormalizedItem,
    PriceObservation, ReceiptStatus,
};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::{info, info_span, warn};

/// Quantities at or below this are considered empty stock.
const EMPTY_EPSILON: f64 = 1e-9;

/// Why a single line could not be applied. Never aborts the receipt.
#[derive(Debug, Error)]
enum ItemError {
    #[error("catalog product {0} no longer exists")]
    MissingProduct(i64),
    #[error("catalog product {0} is inactive")]
    InactiveProduct(i64),
    #[error("invalid quantity {0}")]
    InvalidQuantity(f64),
    #[error("invalid unit price {0}")]
    InvalidPrice(f64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for ItemError {
    fn from(e: rusqlite::Error) -> Self {
        ItemError::Store(StoreError::Sqlite(e))
    }
}

pub(super) fn normalized_items(conn: &Connection, receipt_id: i64) -> StoreResult<Vec<NormalizedItem>> {
    let mut stmt = conn.prepare(
        "SELECT receipt_id, line_index, raw_description, canonical_name, category, unit,
                quantity, unit_price, total_price, product_id, failure_reason
         FROM receipt_items
         WHERE receipt_id = ?1
         ORDER BY line_index",
    )?;
    let rows = stmt.query_map(params![receipt_id], |row| {
        Ok(NormalizedItem {
            receipt_id: row.get(0)?,
            line_index: row.get(1)?,
            raw_description: row.get(2)?,
            canonical_name: row.get(3)?,
            category: row.get(4)?,
            unit: unit_from_sql(5, row.get(5)?)?,
            quantity: row.get(6)?,
            unit_price: row.get(7)?,
            total_price: row.get(8)?,
            product_id: row.get(9)?,
            failure_reason: row.get(10)?,
        })
    })?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

struct ReceiptOrigin {
    name: Option<String>,
    tax_id: Option<String>,
}

/// Apply one line: stock increment, price observation and the applied marker.
fn apply_item(
    conn: &Connection,
    user_id: &str,
    origin: &ReceiptOrigin,
    item: &NormalizedItem,
    now: i64,
) -> std::result::Result<(), ItemError> {
    if !item.quantity.is_finite() || item.quantity <= 0.0 {
        return Err(ItemError::InvalidQuantity(item.quantity));
    }
    if !item.unit_price.is_finite() || item.unit_price < 0.0 {
        return Err(ItemError::InvalidPrice(item.unit_price));
    }

    let product = catalog::product(conn, item.product_id)?
        .ok_or(ItemError::MissingProduct(item.product_id))?;
    if !product.active {
        return Err(ItemError::InactiveProduct(product.id));
    }

    // Increment happens inside SQLite, never read-then-write in memory.
    conn.execute(
        "INSERT INTO inventory (user_id, product_id, product_name, quantity, unit_price, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(user_id, product_id) DO UPDATE SET
            quantity = quantity + excluded.quantity,
            unit_price = excluded.unit_price,
            product_name = excluded.product_name,
            updated_at = excluded.updated_at",
        params![
            user_id,
            product.id,
            product.canonical_name,
            item.quantity,
            item.unit_price,
            now
        ],
    )?;

    conn.execute(
        "INSERT INTO price_observations
            (product_id, receipt_id, establishment_name, establishment_tax_id, unit_price, observed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            product.id,
            item.receipt_id,
            origin.name,
            origin.tax_id,
            item.unit_price,
            now
        ],
    )?;

    conn.execute(
        "INSERT INTO merge_applications (receipt_id, line_index, applied_at) VALUES (?1, ?2, ?3)",
        params![item.receipt_id, item.line_index, now],
    )?;

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Identity {
    Product(i64),
    Name(String),
}

struct Row {
    id: i64,
    product_id: Option<i64>,
    quantity: f64,
    unit_price: Option<f64>,
    updated_at: i64,
}

impl Store {
    /// Apply a normalized receipt to its owner's inventory.
    ///
    /// Runs under one write transaction. Each line is applied inside its own
    /// savepoint so a failing line is rolled back alone and counted in
    /// `items_failed`. Lines applied by an earlier partial run are skipped.
    /// The receipt moves to `merged` when nothing failed, or when `force` is set.
    /// A receipt that is already `merged` yields an empty report.
    pub fn merge_receipt_into_inventory(&self, receipt_id: i64, force: bool) -> Result<MergeReport> {
        let mut tx = Transaction::new_unchecked(self.conn(), TransactionBehavior::Immediate)?;

        let (user_id, status, origin) = tx
            .query_row(
                "SELECT user_id, status, establishment_name, establishment_tax_id
                 FROM receipts WHERE id = ?1",
                params![receipt_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        ReceiptOrigin {
                            name: row.get(2)?,
                            tax_id: row.get(3)?,
                        },
                    ))
                },
            )
            .optional()?
            .ok_or(PipelineError::ReceiptNotFound(receipt_id))?;

        let status = status
            .parse::<ReceiptStatus>()
            .map_err(|s| PipelineError::Store(StoreError::UnknownStatus(s)))?;
        match status {
            ReceiptStatus::Merged => {
                info!(receipt_id, "Receipt already merged, nothing to apply");
                return Ok(MergeReport::default());
            }
            ReceiptStatus::Normalized => {}
            actual => {
                return Err(PipelineError::InvalidState {
                    receipt_id,
                    expected: "normalized",
                    actual,
                });
            }
        }

        let items = normalized_items(&tx, receipt_id)?;
        let already_applied: HashSet<u32> = {
            let mut stmt =
                tx.prepare("SELECT line_index FROM merge_applications WHERE receipt_id = ?1")?;
            let rows = stmt.query_map(params![receipt_id], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let now = now_unix();
        let mut report = MergeReport::default();

        for item in &items {
            if already_applied.contains(&item.line_index) {
                continue;
            }
            let span = info_span!("merge_item", line = item.line_index, product = %item.canonical_name);
            let _guard = span.enter();

            let sp = tx.savepoint()?;
            match apply_item(&sp, &user_id, &origin, item, now) {
                Ok(()) => {
                    sp.commit()?;
                    report.items_applied += 1;
                }
                Err(e) => {
                    drop(sp);
                    warn!(error = %e, "Line item failed to merge");
                    report.failures.push(ItemFailure {
                        line_index: item.line_index,
                        description: item.raw_description.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        report.items_failed = report.failures.len();

        tx.execute(
            "UPDATE receipt_items SET failure_reason = NULL WHERE receipt_id = ?1",
            params![receipt_id],
        )?;
        for failure in &report.failures {
            tx.execute(
                "UPDATE receipt_items SET failure_reason = ?1 WHERE receipt_id = ?2 AND line_index = ?3",
                params![failure.reason, receipt_id, failure.line_index],
            )?;
        }

        if report.items_failed == 0 || force {
            let error_reason = (report.items_failed > 0)
                .then(|| format!("forced merge with {} failed items", report.items_failed));
            tx.execute(
                "UPDATE receipts SET status = 'merged', error_reason = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'normalized'",
                params![error_reason, now, receipt_id],
            )?;
            report.merged = true;
        }

        tx.commit()?;
        info!(
            receipt_id,
            applied = report.items_applied,
            failed = report.items_failed,
            merged = report.merged,
            "Merge finished"
        );
        Ok(report)
    }

    /// Collapse inventory rows that refer to the same product into one.
    ///
    /// Rows are grouped by catalog product; name-only rows are matched to the
    /// catalog by canonical name, or grouped by name when the catalog has no
    /// entry. The survivor carries the summed quantity, the most recent price
    /// and the most recent timestamp. Running it again changes nothing.
    pub fn consolidate_duplicates(
        &self,
        user_id: &str,
        purge_empty: bool,
    ) -> StoreResult<ConsolidationReport> {
        let tx = Transaction::new_unchecked(self.conn(), TransactionBehavior::Immediate)?;
        let mut report = ConsolidationReport::default();

        let rows: Vec<(Row, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, product_id, product_name, quantity, unit_price, updated_at
                 FROM inventory WHERE user_id = ?1 ORDER BY id",
            )?;
            let mapped = stmt.query_map(params![user_id], |row| {
                Ok((
                    Row {
                        id: row.get(0)?,
                        product_id: row.get(1)?,
                        quantity: row.get(3)?,
                        unit_price: row.get(4)?,
                        updated_at: row.get(5)?,
                    },
                    row.get::<_, String>(2)?,
                ))
            })?;
            mapped.collect::<std::result::Result<_, _>>()?
        };

        let mut groups: BTreeMap<Identity, Vec<Row>> = BTreeMap::new();
        for (row, name) in rows {
            let identity = match row.product_id {
                Some(id) => Identity::Product(id),
                None => {
                    let key = name_key(&name);
                    let linked: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM products WHERE name_key = ?1",
                            params![key],
                            |r| r.get(0),
                        )
                        .optional()?;
                    linked.map_or(Identity::Name(key), Identity::Product)
                }
            };
            groups.entry(identity).or_default().push(row);
        }

        for (identity, rows) in groups.into_iter().filter(|(_, rows)| rows.len() > 1) {
            let total: f64 = rows.iter().map(|r| r.quantity).sum();
            let latest = rows.iter().map(|r| r.updated_at).max().unwrap_or_default();
            let price = rows
                .iter()
                .filter(|r| r.unit_price.is_some())
                .max_by_key(|r| (r.updated_at, r.id))
                .and_then(|r| r.unit_price);
            // Prefer the row already linked to the catalog, then the most recent one.
            let keeper = rows
                .iter()
                .max_by_key(|r| (r.product_id.is_some(), r.updated_at, r.id))
                .map(|r| r.id)
                .unwrap_or_default();

            for row in rows.iter().filter(|r| r.id != keeper) {
                tx.execute("DELETE FROM inventory WHERE id = ?1", params![row.id])?;
                report.rows_removed += 1;
            }

            let product_id = match identity {
                Identity::Product(id) => Some(id),
                Identity::Name(_) => None,
            };
            tx.execute(
                "UPDATE inventory SET quantity = ?1, unit_price = ?2, updated_at = ?3,
                     product_id = COALESCE(?4, product_id)
                 WHERE id = ?5",
                params![total, price, latest, product_id, keeper],
            )?;
            report.groups_consolidated += 1;
            info!(
                user = %user_id,
                keeper,
                merged_rows = rows.len(),
                quantity = total,
                "Consolidated duplicate inventory rows"
            );
        }

        if purge_empty {
            report.empty_rows_purged = tx.execute(
                "DELETE FROM inventory WHERE user_id = ?1 AND quantity <= ?2",
                params![user_id, EMPTY_EPSILON],
            )?;
        }

        tx.commit()?;
        Ok(report)
    }

    /// Take `quantity` out of stock. Going below zero is rejected, not clamped.
    pub fn consume_stock(&self, user_id: &str, product_id: i64, quantity: f64) -> Result<f64> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(PipelineError::InvalidQuantity(quantity));
        }

        let tx = Transaction::new_unchecked(self.conn(), TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE inventory SET quantity = quantity - ?1, updated_at = ?2
             WHERE user_id = ?3 AND product_id = ?4 AND quantity >= ?1",
            params![quantity, now_unix(), user_id, product_id],
        )?;
        let current: Option<f64> = tx
            .query_row(
                "SELECT quantity FROM inventory WHERE user_id = ?1 AND product_id = ?2",
                params![user_id, product_id],
                |row| row.get(0),
            )
            .optional()?;
        tx.commit()?;

        match (changed, current) {
            (_, None) => Err(PipelineError::InventoryEntryNotFound { product_id }),
            (0, Some(available)) => Err(PipelineError::InsufficientStock {
                product_id,
                available,
                requested: quantity,
            }),
            (_, Some(remaining)) => {
                info!(user = %user_id, product_id, consumed = quantity, remaining, "Stock consumed");
                Ok(remaining)
            }
        }
    }

    /// Rows carried over from before catalog linking: name only, no product reference.
    pub fn import_legacy_entry(
        &self,
        user_id: &str,
        product_name: &str,
        quantity: f64,
        unit_price: Option<f64>,
    ) -> StoreResult<i64> {
        self.conn().execute(
            "INSERT INTO inventory (user_id, product_id, product_name, quantity, unit_price, updated_at)
             VALUES (?1, NULL, ?2, ?3, ?4, ?5)",
            params![user_id, name_key(product_name), quantity, unit_price, now_unix()],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn inventory_for_user(&self, user_id: &str) -> StoreResult<Vec<InventoryEntry>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, user_id, product_id, product_name, quantity, unit_price, updated_at
             FROM inventory WHERE user_id = ?1 ORDER BY product_name, id",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_entry)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn inventory_entry(&self, user_id: &str, product_id: i64) -> StoreResult<Option<InventoryEntry>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, user_id, product_id, product_name, quantity, unit_price, updated_at
                 FROM inventory WHERE user_id = ?1 AND product_id = ?2",
                params![user_id, product_id],
                row_to_entry,
            )
            .optional()?)
    }

    pub fn price_history(&self, product_id: i64) -> StoreResult<Vec<PriceObservation>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, product_id, receipt_id, establishment_name, establishment_tax_id,
                    unit_price, observed_at
             FROM price_observations WHERE product_id = ?1
             ORDER BY observed_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![product_id], |row| {
            Ok(PriceObservation {
                id: row.get(0)?,
                product_id: row.get(1)?,
                receipt_id: row.get(2)?,
                establishment_name: row.get(3)?,
                establishment_tax_id: row.get(4)?,
                unit_price: row.get(5)?,
                observed_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Most recent observed price, optionally restricted to one establishment.
    pub fn latest_price(&self, product_id: i64, establishment_tax_id: Option<&str>) -> StoreResult<Option<f64>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT unit_price FROM price_observations
                 WHERE product_id = ?1 AND (?2 IS NULL OR establishment_tax_id = ?2)
                 ORDER BY observed_at DESC, id DESC LIMIT 1",
                params![product_id, establishment_tax_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<InventoryEntry> {
    Ok(InventoryEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        product_id: row.get(2)?,
        product_name: row.get(3)?,
        quantity: row.get(4)?,
        unit_price: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Establishment, ExtractionPayload, LineItem, Unit};

    /// Build a receipt already at `normalized` with one line per `(name, qty, price)`.
    fn normalized_receipt(store: &Store, user: &str, lines: &[(&str, f64, f64)]) -> (i64, Vec<i64>) {
        let receipt_id = store.create_receipt(user, "nota.pdf").unwrap();
        let payload = ExtractionPayload {
            items: lines
                .iter()
                .map(|(name, qty, price)| LineItem {
                    description: name.to_string(),
                    quantity: *qty,
                    unit: "UN".to_string(),
                    unit_price: *price,
                    total_price: qty * price,
                })
                .collect(),
            establishment: Some(Establishment {
                name: "MERCADO CENTRAL".to_string(),
                tax_id: Some("11222333000144".to_string()),
            }),
            ..Default::default()
        };
        store.record_extraction(receipt_id, &payload, None, false).unwrap();

        let mut product_ids = Vec::new();
        let items: Vec<NormalizedItem> = lines
            .iter()
            .enumerate()
            .map(|(i, (name, qty, price))| {
                let product_id = store.resolve_or_create(name, "GROCERY", Unit::Each).unwrap();
                product_ids.push(product_id);
                NormalizedItem {
                    receipt_id,
                    line_index: i as u32,
                    raw_description: name.to_string(),
                    canonical_name: name_key(name),
                    category: "GROCERY".to_string(),
                    unit: Unit::Each,
                    quantity: *qty,
                    unit_price: *price,
                    total_price: qty * price,
                    product_id,
                    failure_reason: None,
                }
            })
            .collect();
        assert!(store.record_normalization(receipt_id, &items).unwrap());
        (receipt_id, product_ids)
    }

    fn quantity(store: &Store, user: &str, product_id: i64) -> f64 {
        store.inventory_entry(user, product_id).unwrap().unwrap().quantity
    }

    #[test]
    fn test_concurrent_merges_sum_into_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.db");
        let (receipts, product_id) = {
            let store = Store::open(&path).unwrap();
            let receipts: Vec<i64> = (1..=8)
                .map(|n| normalized_receipt(&store, "u1", &[("ARROZ", n as f64, 20.0 + n as f64)]).0)
                .collect();
            let product_id = store.find_product_by_name("ARROZ").unwrap().unwrap().id;
            (receipts, product_id)
        };

        let handles: Vec<_> = receipts
            .iter()
            .map(|&receipt_id| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = Store::open(&path).unwrap();
                    store.merge_receipt_into_inventory(receipt_id, false).unwrap()
                })
            })
            .collect();
        for handle in handles {
            let report = handle.join().unwrap();
            assert_eq!((report.items_applied, report.items_failed), (1, 0));
        }

        let store = Store::open(&path).unwrap();
        let inventory = store.inventory_for_user("u1").unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].product_id, Some(product_id));
        assert_eq!(inventory[0].quantity, 36.0);
        assert_eq!(store.price_history(product_id).unwrap().len(), 8);
        for receipt_id in receipts {
            assert_eq!(store.receipt(receipt_id).unwrap().unwrap().status, ReceiptStatus::Merged);
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let (receipt, products) = normalized_receipt(
            &store,
            "u1",
            &[("TEMPERO VERDE", 1.0, 2.5), ("MILHO VERDE PREDILETO", 2.0, 3.0)],
        );

        let first = store.merge_receipt_into_inventory(receipt, false).unwrap();
        assert_eq!(first.items_applied, 2);
        assert_eq!(first.items_failed, 0);
        assert!(first.merged);

        let second = store.merge_receipt_into_inventory(receipt, false).unwrap();
        assert_eq!(second, MergeReport::default());

        assert_eq!(quantity(&store, "u1", products[0]), 1.0);
        assert_eq!(quantity(&store, "u1", products[1]), 2.0);
        assert_eq!(store.inventory_for_user("u1").unwrap().len(), 2);
        assert_eq!(store.receipt(receipt).unwrap().unwrap().status, ReceiptStatus::Merged);
    }

    #[test]
    fn test_merge_increments_and_takes_latest_price() {
        let store = Store::open_in_memory().unwrap();
        let (first, products) = normalized_receipt(&store, "u1", &[("ARROZ", 2.0, 20.0)]);
        store.merge_receipt_into_inventory(first, false).unwrap();

        let (second, _) = normalized_receipt(&store, "u1", &[("arroz", 3.0, 22.9)]);
        store.merge_receipt_into_inventory(second, false).unwrap();

        let entry = store.inventory_entry("u1", products[0]).unwrap().unwrap();
        assert_eq!(entry.quantity, 5.0);
        assert_eq!(entry.unit_price, Some(22.9));
        assert_eq!(store.price_history(products[0]).unwrap().len(), 2);
        assert_eq!(store.latest_price(products[0], Some("11222333000144")).unwrap(), Some(22.9));
        assert_eq!(store.latest_price(products[0], Some("99")).unwrap(), None);
    }

    #[test]
    fn test_failing_item_is_isolated_and_retry_applies_only_the_rest() {
        let store = Store::open_in_memory().unwrap();
        let (receipt, products) = normalized_receipt(
            &store,
            "u1",
            &[
                ("ARROZ", 1.0, 20.0),
                ("FEIJAO", 1.0, 8.0),
                ("CAFE", 1.0, 15.0),
                ("ACUCAR", 1.0, 4.0),
                ("OLEO", 1.0, 7.0),
            ],
        );
        store.deactivate_product(products[2]).unwrap();

        let report = store.merge_receipt_into_inventory(receipt, false).unwrap();
        assert_eq!(report.items_applied, 4);
        assert_eq!(report.items_failed, 1);
        assert_eq!(report.failures[0].line_index, 2);
        assert!(!report.merged);
        assert_eq!(store.receipt(receipt).unwrap().unwrap().status, ReceiptStatus::Normalized);
        assert!(store.inventory_entry("u1", products[2]).unwrap().is_none());
        assert_eq!(store.inventory_for_user("u1").unwrap().len(), 4);
        let items = store.normalized_items(receipt).unwrap();
        assert!(items[2].failure_reason.as_deref().unwrap().contains("inactive"));

        // Retrying must not double-count the four applied lines.
        let retry = store.merge_receipt_into_inventory(receipt, false).unwrap();
        assert_eq!(retry.items_applied, 0);
        assert_eq!(retry.items_failed, 1);
        assert_eq!(quantity(&store, "u1", products[0]), 1.0);

        let forced = store.merge_receipt_into_inventory(receipt, true).unwrap();
        assert!(forced.merged);
        assert_eq!(forced.items_failed, 1);
        let receipt = store.receipt(receipt).unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Merged);
        assert!(receipt.error_reason.unwrap().contains("1 failed"));
    }

    #[test]
    fn test_merge_rejects_receipt_in_wrong_state() {
        let store = Store::open_in_memory().unwrap();
        let receipt = store.create_receipt("u1", "nota.pdf").unwrap();
        let err = store.merge_receipt_into_inventory(receipt, false).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidState { actual: ReceiptStatus::Pending, .. }
        ));
        assert_eq!(store.receipt(receipt).unwrap().unwrap().status, ReceiptStatus::Pending);

        let err = store.merge_receipt_into_inventory(receipt + 1, false).unwrap_err();
        assert!(matches!(err, PipelineError::ReceiptNotFound(_)));
    }

    #[test]
    fn test_consolidation_conserves_quantity() {
        let store = Store::open_in_memory().unwrap();
        store.import_legacy_entry("u1", "FEIJÃO", 1.5, Some(7.0)).unwrap();
        store.import_legacy_entry("u1", "feijão", 2.0, Some(7.5)).unwrap();
        store.import_legacy_entry("u1", "CAFE", 1.0, None).unwrap();
        store.import_legacy_entry("u2", "FEIJÃO", 4.0, None).unwrap();

        let report = store.consolidate_duplicates("u1", false).unwrap();
        assert_eq!(report.groups_consolidated, 1);
        assert_eq!(report.rows_removed, 1);

        let rows = store.inventory_for_user("u1").unwrap();
        assert_eq!(rows.len(), 2);
        let feijao = rows.iter().find(|r| r.product_name == "FEIJÃO").unwrap();
        assert_eq!(feijao.quantity, 3.5);
        assert_eq!(feijao.unit_price, Some(7.5));
        assert_eq!(store.inventory_for_user("u2").unwrap()[0].quantity, 4.0);

        let again = store.consolidate_duplicates("u1", false).unwrap();
        assert_eq!(again, ConsolidationReport::default());
        assert_eq!(store.inventory_for_user("u1").unwrap().len(), 2);
    }

    #[test]
    fn test_consolidation_links_legacy_rows_to_catalog_entry() {
        let store = Store::open_in_memory().unwrap();
        let (receipt, products) = normalized_receipt(&store, "u1", &[("ARROZ", 2.0, 20.0)]);
        store.merge_receipt_into_inventory(receipt, false).unwrap();
        store.import_legacy_entry("u1", "arroz", 1.0, Some(18.0)).unwrap();
        store.import_legacy_entry("u1", "MACARRAO", 0.0, None).unwrap();

        let report = store.consolidate_duplicates("u1", true).unwrap();
        assert_eq!(report.groups_consolidated, 1);
        assert_eq!(report.empty_rows_purged, 1);

        let rows = store.inventory_for_user("u1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].product_id, Some(products[0]));
        assert_eq!(rows[0].quantity, 3.0);
    }

    #[test]
    fn test_consume_stock_rejects_going_below_zero() {
        let store = Store::open_in_memory().unwrap();
        let (receipt, products) = normalized_receipt(&store, "u1", &[("LEITE", 2.0, 5.0)]);
        store.merge_receipt_into_inventory(receipt, false).unwrap();

        assert_eq!(store.consume_stock("u1", products[0], 0.5).unwrap(), 1.5);
        let err = store.consume_stock("u1", products[0], 2.0).unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientStock { available, .. } if available == 1.5));
        assert_eq!(quantity(&store, "u1", products[0]), 1.5);

        assert!(matches!(
            store.consume_stock("u2", products[0], 1.0).unwrap_err(),
            PipelineError::InventoryEntryNotFound { .. }
        ));
        assert!(matches!(
            store.consume_stock("u1", products[0], -1.0).unwrap_err(),
            PipelineError::InvalidQuantity(_)
        ));
    }
}
